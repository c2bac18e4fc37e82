// Request tokens — opaque handles for tracking, cancelling, suspending and resuming tasks.

use std::fmt;

/// Handle for one task submitted through
/// [`Dispatcher::submit_async`](super::dispatcher::Dispatcher::submit_async).
///
/// Equality, hashing and ordering use the identifier only. Identifiers increase
/// monotonically per dispatcher, so ordering follows submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

impl Token {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    Running,
    Suspended,
    Completed,
    Cancelled,
}

impl TokenState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenState::Completed | TokenState::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Pending → Suspended` covers a task parked before it was dequeued, and
    /// `Suspended → Completed` covers a task that finished with its result
    /// buffered for a later resume.
    pub fn can_transition(self, next: TokenState) -> bool {
        use TokenState::*;
        match (self, next) {
            (Pending, Running) | (Pending, Suspended) | (Pending, Cancelled) => true,
            (Running, Suspended) | (Running, Completed) | (Running, Cancelled) => true,
            (Suspended, Running) | (Suspended, Pending) => true,
            (Suspended, Completed) | (Suspended, Cancelled) => true,
            _ => false,
        }
    }
}
