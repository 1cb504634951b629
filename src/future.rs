//! Completion handles for asynchronous session operations.
//!
//! A [`Completion`] resolves once the loop thread has finished the operation
//! it stands for: a registration, or a write whose bytes have been handed to
//! the transport. It can be awaited from async code or waited on from a
//! blocking thread.

use crate::error::Error;
use futures::channel::oneshot;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Handle resolved when a write has been flushed.
pub type WriteFuture = Completion<()>;

/// One-shot completion handle.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited or waited on"]
pub struct Completion<T = ()> {
    state: State<T>,
}

#[derive(Debug)]
enum State<T> {
    Pending(oneshot::Receiver<Result<T, Error>>),
    Done(Option<Result<T, Error>>),
}

impl<T> Completion<T> {
    /// Creates a pending completion and the sender that resolves it.
    pub(crate) fn pending() -> (CompletionSender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            CompletionSender { sender: tx },
            Self {
                state: State::Pending(rx),
            },
        )
    }

    /// Creates an already resolved completion.
    pub(crate) fn ready(result: Result<T, Error>) -> Self {
        Self {
            state: State::Done(Some(result)),
        }
    }

    /// Blocks the calling thread until the completion resolves.
    ///
    /// Never call this on the loop thread that has to resolve it.
    pub fn wait(self) -> Result<T, Error>
    where
        T: Unpin,
    {
        futures::executor::block_on(self)
    }

    /// Returns the result if the completion already resolved.
    pub fn try_take(&mut self) -> Option<Result<T, Error>> {
        match &mut self.state {
            State::Pending(rx) => match rx.try_recv() {
                Ok(Some(result)) => {
                    self.state = State::Done(None);
                    Some(result)
                }
                Ok(None) => None,
                Err(oneshot::Canceled) => {
                    self.state = State::Done(None);
                    Some(Err(Error::Cancelled))
                }
            },
            State::Done(result) => result.take(),
        }
    }
}

impl<T> Future for Completion<T>
where
    T: Unpin,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            State::Pending(rx) => match rx.poll_unpin(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
            State::Done(result) => Poll::Ready(result.take().unwrap_or(Err(Error::Cancelled))),
        }
    }
}

/// Resolving side of a [`Completion`]. Dropping it cancels the completion.
#[derive(Debug)]
pub(crate) struct CompletionSender<T = ()> {
    sender: oneshot::Sender<Result<T, Error>>,
}

impl<T> CompletionSender<T> {
    pub(crate) fn complete(self, result: Result<T, Error>) {
        // The caller may have dropped its handle; nothing to report then.
        let _ = self.sender.send(result);
    }
}

/// Tracks write completions by byte threshold.
///
/// Each handle waits for the counter value reached after its bytes were
/// submitted. Thresholds are pushed in non-decreasing order, so handles
/// resolve front to back, each exactly once.
#[derive(Debug, Default)]
pub(crate) struct Completions {
    pending: VecDeque<(u64, CompletionSender)>,
}

impl Completions {
    pub(crate) fn add(&mut self, threshold: u64) -> WriteFuture {
        debug_assert!(
            self.pending.back().map_or(true, |(last, _)| *last <= threshold),
            "thresholds must not decrease"
        );
        let (sender, future) = Completion::pending();
        self.pending.push_back((threshold, sender));
        future
    }

    /// Resolves every handle whose threshold is at or below `counter`.
    /// Returns the number of resolved handles.
    pub(crate) fn complete(&mut self, counter: u64) -> usize {
        let mut count = 0;
        while self
            .pending
            .front()
            .is_some_and(|(threshold, _)| *threshold <= counter)
        {
            if let Some((_, sender)) = self.pending.pop_front() {
                sender.complete(Ok(()));
                count += 1;
            }
        }
        count
    }

    /// Fails every pending handle with the error produced by `error`.
    pub(crate) fn fail_all(&mut self, error: impl Fn() -> Error) {
        for (_, sender) in self.pending.drain(..) {
            sender.complete(Err(error()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completions_resolve_in_threshold_order() {
        let mut completions = Completions::default();
        let mut first = completions.add(10);
        let mut second = completions.add(25);

        assert_eq!(completions.complete(9), 0);
        assert!(first.try_take().is_none());

        assert_eq!(completions.complete(24), 1);
        assert!(matches!(first.try_take(), Some(Ok(()))));
        assert!(second.try_take().is_none());

        assert_eq!(completions.complete(100), 1);
        assert!(completions.is_empty());
        assert!(matches!(second.wait(), Ok(())));
    }

    #[test]
    fn test_fail_all_and_dropped_sender() {
        let mut completions = Completions::default();
        let pending = completions.add(5);
        completions.fail_all(|| Error::SessionClosed { id: 3 });
        assert_eq!(completions.len(), 0);
        assert!(matches!(pending.wait(), Err(Error::SessionClosed { id: 3 })));

        let (sender, completion) = Completion::<()>::pending();
        drop(sender);
        assert!(matches!(completion.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_wait_blocks_until_resolved_from_another_thread() {
        let (sender, completion) = Completion::<String>::pending();
        let resolver = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            sender.complete(Ok("registered".to_string()));
        });
        assert_eq!(completion.wait().unwrap(), "registered");
        resolver.join().unwrap();

        let ready = Completion::ready(Ok(42u32));
        assert_eq!(ready.wait().unwrap(), 42);
    }
}
