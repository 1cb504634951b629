/// Closing progress of a session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ClosingState {
    /// Open.
    #[default]
    None,
    /// Gentle close requested; queued data is still flushed.
    Sending,
    /// Outbound close initiated; no more application data is accepted.
    Finishing,
    /// The channel is closed.
    Finished,
}

impl ClosingState {
    /// Moves to `next` if that is a forward transition. Returns whether the
    /// state changed.
    pub(crate) fn advance(&mut self, next: ClosingState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Whether the engine's `begin_handshake` still has to be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Handshake {
    #[default]
    None,
    Requested,
    Started,
}

/// Lifecycle events of a session, in the order they are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The session was registered with its loop.
    Created,
    /// The channel is connected.
    Opened,
    /// The session is ready for application data (after the engine
    /// handshake, if any).
    Ready,
    /// The channel was closed.
    Closed,
    /// Last event; the handler is dropped afterwards.
    Ending,
}

impl SessionEvent {
    fn bit(self) -> u8 {
        match self {
            SessionEvent::Created => CREATED,
            SessionEvent::Opened => OPENED,
            SessionEvent::Ready => READY,
            SessionEvent::Closed => CLOSED,
            SessionEvent::Ending => ENDING,
        }
    }
}

/// Data transfer notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataEvent {
    /// Bytes were read from the channel.
    Received,
    /// Bytes were written to the channel.
    Sent,
}

const CREATED: u8 = 1;
const OPENED: u8 = 2;
const READY: u8 = 4;
const CLOSED: u8 = 8;
const ENDING: u8 = 16;
const EXCEPTION: u8 = 32;

/// Enforces the fixed event order of a session.
///
/// Each lifecycle event fires at most once, and only after its predecessors:
/// OPENED needs CREATED, READY needs OPENED and no CLOSED, CLOSED needs
/// OPENED, ENDING needs CREATED and is always last. Data events are valid
/// between OPENED and CLOSED.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EventValidator {
    fired: u8,
}

impl EventValidator {
    /// Records `event` and returns `true` if it may be delivered.
    pub(crate) fn event(&mut self, event: SessionEvent) -> bool {
        let bit = event.bit();
        if self.fired & (bit | ENDING) != 0 {
            return false;
        }
        let allowed = match event {
            SessionEvent::Created => true,
            SessionEvent::Opened => self.has(CREATED),
            SessionEvent::Ready => self.has(OPENED) && !self.has(CLOSED),
            SessionEvent::Closed => self.has(OPENED),
            SessionEvent::Ending => self.has(CREATED),
        };
        if allowed {
            self.fired |= bit;
        }
        allowed
    }

    pub(crate) fn data(&self) -> bool {
        self.has(OPENED) && !self.has(CLOSED | ENDING)
    }

    /// Returns `true` if an exception may be delivered. Only an exception
    /// that closes the session is recorded, so one that leaves it open does
    /// not block later ones.
    pub(crate) fn exception(&mut self, closing: bool) -> bool {
        if self.has(EXCEPTION) || self.has(ENDING) || !self.has(CREATED) {
            return false;
        }
        if closing {
            self.fired |= EXCEPTION;
        }
        true
    }

    fn has(&self, bits: u8) -> bool {
        self.fired & bits != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_fire_once_in_order() {
        let mut validator = EventValidator::default();
        assert!(!validator.event(SessionEvent::Opened));
        assert!(validator.event(SessionEvent::Created));
        assert!(!validator.data());
        assert!(validator.event(SessionEvent::Opened));
        assert!(validator.data());
        assert!(validator.event(SessionEvent::Ready));
        assert!(!validator.event(SessionEvent::Ready));
        assert!(validator.event(SessionEvent::Closed));
        assert!(!validator.data());
        assert!(validator.event(SessionEvent::Ending));
        assert!(!validator.event(SessionEvent::Closed));
    }

    #[test]
    fn test_ready_not_after_closed() {
        let mut validator = EventValidator::default();
        validator.event(SessionEvent::Created);
        validator.event(SessionEvent::Opened);
        validator.event(SessionEvent::Closed);
        assert!(!validator.event(SessionEvent::Ready));
        assert!(validator.event(SessionEvent::Ending));
    }

    #[test]
    fn test_only_closing_exception_is_recorded() {
        let mut validator = EventValidator::default();
        assert!(!validator.exception(true));
        validator.event(SessionEvent::Created);
        assert!(validator.exception(false));
        assert!(validator.exception(true));
        assert!(!validator.exception(true));
    }

    #[test]
    fn test_closing_state_moves_forward() {
        let mut state = ClosingState::None;
        assert!(state.advance(ClosingState::Finishing));
        assert!(!state.advance(ClosingState::Sending));
        assert_eq!(state, ClosingState::Finishing);
    }
}
