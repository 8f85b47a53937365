use std::{future::Future, time::Duration};

use futures::{channel::oneshot, FutureExt};
use smol::Task;
use util::ForegroundExecutor;

/// Runs the most recently scheduled callback once `delay` has passed without
/// another call to [`DebouncedDelay::fire_new`].
pub struct DebouncedDelay {
    task: Option<Task<()>>,
    cancel_channel: Option<oneshot::Sender<()>>,
}

impl Default for DebouncedDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl DebouncedDelay {
    pub fn new() -> DebouncedDelay {
        DebouncedDelay {
            task: None,
            cancel_channel: None,
        }
    }

    pub fn fire_new<F, Fut>(&mut self, delay: Duration, executor: &ForegroundExecutor, func: F)
    where
        F: 'static + FnOnce() -> Fut,
        Fut: 'static + Future<Output = ()>,
    {
        if let Some(channel) = self.cancel_channel.take() {
            _ = channel.send(());
        }

        let (sender, mut receiver) = oneshot::channel::<()>();
        self.cancel_channel = Some(sender);

        let previous_task = self.task.take();
        let mut timer = executor.timer(delay).fuse();
        self.task = Some(executor.spawn(async move {
            if let Some(previous_task) = previous_task {
                previous_task.await;
            }

            futures::select_biased! {
                _ = receiver => return,
                _ = timer => {}
            }

            func().await;
        }));
    }
}
