pub mod executor;

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

pub use executor::ForegroundExecutor;

pub trait ResultExt<E> {
    type Ok;

    fn log_err(self) -> Option<Self::Ok>;
    fn warn_on_err(self) -> Option<Self::Ok>;
}

impl<T, E> ResultExt<E> for Result<T, E>
where
    E: Debug,
{
    type Ok = T;

    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                log::error!("{}:{}: {:?}", caller.file(), caller.line(), error);
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                log::warn!("{}:{}: {:?}", caller.file(), caller.line(), error);
                None
            }
        }
    }
}

pub trait TryFutureExt {
    fn log_err(self) -> LogErrorFuture<Self>
    where
        Self: Sized;

    fn warn_on_err(self) -> LogErrorFuture<Self>
    where
        Self: Sized;
}

impl<F, T, E> TryFutureExt for F
where
    F: Future<Output = Result<T, E>>,
    E: Debug,
{
    fn log_err(self) -> LogErrorFuture<Self> {
        LogErrorFuture {
            future: Box::pin(self),
            level: log::Level::Error,
        }
    }

    fn warn_on_err(self) -> LogErrorFuture<Self> {
        LogErrorFuture {
            future: Box::pin(self),
            level: log::Level::Warn,
        }
    }
}

#[must_use]
pub struct LogErrorFuture<F> {
    future: Pin<Box<F>>,
    level: log::Level,
}

impl<F, T, E> Future for LogErrorFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: Debug,
{
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let level = self.level;
        match self.future.as_mut().poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Some(value)),
            Poll::Ready(Err(error)) => {
                log::log!(level, "{:?}", error);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub trait PostInc {
    fn post_inc(&mut self) -> Self;
}

macro_rules! impl_post_inc {
    ($($ty:ty),*) => {
        $(
            impl PostInc for $ty {
                fn post_inc(&mut self) -> Self {
                    let prev = *self;
                    *self += 1;
                    prev
                }
            }
        )*
    };
}

impl_post_inc!(u32, u64, usize);

/// Fans a value out to every live subscriber. Subscribers whose receiver was
/// dropped are pruned on the next emit.
pub struct EventEmitter<T> {
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventEmitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: T) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    #[test]
    fn test_post_inc() {
        let mut id = 7u32;
        assert_eq!(id.post_inc(), 7);
        assert_eq!(id, 8);
    }

    #[test]
    fn test_emitter_prunes_dropped_subscribers() {
        let emitter = EventEmitter::<u32>::new();
        let mut kept = emitter.subscribe();
        let dropped = emitter.subscribe();
        drop(dropped);

        emitter.emit(1);
        emitter.emit(2);
        assert_eq!(emitter.subscriber_count(), 1);

        let received = smol::block_on(async {
            vec![kept.next().await.unwrap(), kept.next().await.unwrap()]
        });
        assert_eq!(received, vec![1, 2]);
    }

    #[test]
    fn test_log_err_future() {
        let ok = smol::block_on(async { Ok::<_, &str>(3) }.log_err());
        assert_eq!(ok, Some(3));
        let err = smol::block_on(async { Err::<u32, _>("boom") }.log_err());
        assert_eq!(err, None);
    }
}
