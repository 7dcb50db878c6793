pub mod frame;
pub mod publisher;
pub mod subscriber;

use std::sync::atomic::{AtomicU8, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// lifecycle of a single TCP session, on either the accepting or the
///  connecting side
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SessionState {
    NotStarted = 0,
    Handshaking = 1,
    Running = 2,
    /// terminal - a canceled session never leaves this state
    Canceled = 3,
}

/// Atomically holds a [SessionState]. Concurrent error paths can both try to
///  tear a session down, so the transition into `Canceled` reports whether
///  this caller actually performed it.
pub(crate) struct SessionStateCell(AtomicU8);

impl SessionStateCell {
    pub fn new() -> SessionStateCell {
        SessionStateCell(AtomicU8::new(SessionState::NotStarted.into()))
    }

    pub fn get(&self) -> SessionState {
        SessionState::try_from(self.0.load(Ordering::Acquire))
            .expect("this is a bug: the state cell only ever stores valid states")
    }

    pub fn set(&self, state: SessionState) {
        self.0.store(state.into(), Ordering::Release);
    }

    /// enters the terminal state; true iff this call did the transition
    #[must_use]
    pub fn cancel(&self) -> bool {
        self.0.swap(SessionState::Canceled.into(), Ordering::AcqRel) != SessionState::Canceled as u8
    }

    pub fn is_canceled(&self) -> bool {
        self.get() == SessionState::Canceled
    }
}
