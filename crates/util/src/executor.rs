use smol::{LocalExecutor, Task, Timer};
use std::{future::Future, rc::Rc, time::Duration};

/// A single-threaded executor that every component of a debugger instance
/// shares. Tasks spawned here may hold `!Send` state and are only polled
/// while the executor is being driven by [`ForegroundExecutor::block_on`] or
/// [`ForegroundExecutor::run_until_parked`].
#[derive(Clone)]
pub struct ForegroundExecutor {
    executor: Rc<LocalExecutor<'static>>,
}

impl Default for ForegroundExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundExecutor {
    pub fn new() -> Self {
        Self {
            executor: Rc::new(LocalExecutor::new()),
        }
    }

    pub fn spawn<R: 'static>(&self, future: impl Future<Output = R> + 'static) -> Task<R> {
        self.executor.spawn(future)
    }

    pub fn timer(&self, duration: Duration) -> Timer {
        Timer::after(duration)
    }

    /// Drives `future` to completion, polling spawned tasks while it is pending.
    pub fn block_on<R>(&self, future: impl Future<Output = R>) -> R {
        smol::block_on(self.executor.run(future))
    }

    /// Runs spawned tasks until none of them can make progress.
    pub fn run_until_parked(&self) {
        while self.executor.try_tick() {}
    }
}
