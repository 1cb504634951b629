use super::{LoopHandle, LoopTask};
use mio::Token;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::trace;

/// What an expired timer triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// [`Handler::timer`](crate::session::Handler::timer) with the event.
    User(u64),
    HandshakeTimeout,
    /// The engine asked for a timer callback.
    Engine,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Expired {
    pub(crate) token: Token,
    pub(crate) kind: TimerKind,
}

/// Timer wheel of a loop, ordered by deadline.
///
/// Cancelled timers stay in the heap until they come due and are then
/// skipped.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    active: HashMap<u64, Expired>,
}

impl Timers {
    pub(crate) fn schedule(&mut self, id: u64, delay: Duration, token: Token, kind: TimerKind) {
        let deadline = Instant::now() + delay;
        trace!(id, ?delay, ?kind, "Scheduled timer");
        self.heap.push(Reverse((deadline, id)));
        self.active.insert(id, Expired { token, kind });
    }

    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Cancels every timer of a session.
    pub(crate) fn cancel_session(&mut self, token: Token) {
        self.active.retain(|_, timer| timer.token != token);
    }

    /// Time until the earliest deadline, if any.
    pub(crate) fn next_timeout(&mut self) -> Option<Duration> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.active.contains_key(&id) {
                return Some(deadline.saturating_duration_since(Instant::now()));
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns the timers due at `now`, earliest first.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(timer) = self.active.remove(&id) {
                expired.push(timer);
            }
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }
}

/// Handle to a scheduled session timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    handle: Option<LoopHandle>,
}

impl TimerHandle {
    pub(crate) fn new(id: u64, handle: LoopHandle) -> Self {
        Self {
            id,
            handle: Some(handle),
        }
    }

    pub(crate) fn detached() -> Self {
        Self { id: 0, handle: None }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancels the timer. Has no effect once it fired.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            // A stopped loop has no timers left to cancel.
            let _ = handle.submit(LoopTask::CancelTimer { id: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_in_deadline_order() {
        let mut timers = Timers::default();
        timers.schedule(1, Duration::from_millis(20), Token(7), TimerKind::User(1));
        timers.schedule(2, Duration::ZERO, Token(8), TimerKind::Engine);
        timers.schedule(3, Duration::from_secs(60), Token(9), TimerKind::HandshakeTimeout);

        let expired = timers.expired(Instant::now() + Duration::from_millis(50));
        let tokens: Vec<_> = expired.iter().map(|timer| timer.token).collect();
        assert_eq!(tokens, vec![Token(8), Token(7)]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancelled_timers_are_skipped() {
        let mut timers = Timers::default();
        timers.schedule(1, Duration::ZERO, Token(7), TimerKind::User(1));
        timers.schedule(2, Duration::from_secs(5), Token(7), TimerKind::User(2));
        assert!(timers.cancel(1));
        assert!(!timers.cancel(1));

        assert!(timers.expired(Instant::now()).is_empty());
        let next = timers.next_timeout().unwrap();
        assert!(next > Duration::from_secs(4));

        timers.cancel_session(Token(7));
        assert_eq!(timers.next_timeout(), None);
    }
}
