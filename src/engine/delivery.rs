// Result delivery for async submissions — a oneshot per attached handler, with
// buffering while the task is suspended.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::TaskResult;

/// Terminal outcome seen by a result receiver.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(TaskResult<T>),
    /// The task was cancelled; no result will ever be produced for it.
    Cancelled,
    /// The task was suspended and this receiver was detached. A later resume
    /// hands the result to a new receiver instead.
    Detached,
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<TaskResult<T>> {
        match self {
            Outcome::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

/// Receiving half of an async submission (or of a resume).
#[derive(Debug)]
pub struct ResultReceiver<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> ResultReceiver<T> {
    pub async fn recv(self) -> Outcome<T> {
        // A dropped sender means the dispatcher went away with the task.
        self.rx.await.unwrap_or(Outcome::Cancelled)
    }

    /// Non-blocking poll; `None` while nothing has been delivered yet.
    pub fn try_recv(&mut self) -> Option<Outcome<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Outcome::Cancelled),
        }
    }
}

pub(crate) fn result_channel<T>() -> (oneshot::Sender<Outcome<T>>, ResultReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, ResultReceiver { rx })
}

enum SlotState<T> {
    Attached(oneshot::Sender<Outcome<T>>),
    /// Suspended: results are buffered until a handler is attached again.
    Detached,
    /// Fire-and-forget submission: results are dropped.
    Discard,
    Buffered(TaskResult<T>),
    Done,
}

/// Typed delivery slot owned jointly by the dispatcher's token table and the job.
pub(crate) struct Slot<T> {
    state: Mutex<SlotState<T>>,
}

impl<T: Send + 'static> Slot<T> {
    pub(crate) fn attached(tx: oneshot::Sender<Outcome<T>>) -> Self {
        Self {
            state: Mutex::new(SlotState::Attached(tx)),
        }
    }

    pub(crate) fn discarding() -> Self {
        Self {
            state: Mutex::new(SlotState::Discard),
        }
    }

    pub(crate) fn deliver(&self, result: TaskResult<T>) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Done) {
            SlotState::Attached(tx) => {
                let _ = tx.send(Outcome::Completed(result));
            }
            SlotState::Detached => *state = SlotState::Buffered(result),
            SlotState::Discard | SlotState::Buffered(_) | SlotState::Done => {}
        }
    }

    /// Attach a new handler. A buffered result is handed over immediately.
    /// Returns false when the result was already delivered or dropped.
    pub(crate) fn attach(&self, tx: oneshot::Sender<Outcome<T>>) -> bool {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Done) {
            SlotState::Buffered(result) => {
                let _ = tx.send(Outcome::Completed(result));
                true
            }
            SlotState::Attached(old) => {
                let _ = old.send(Outcome::Detached);
                *state = SlotState::Attached(tx);
                true
            }
            SlotState::Detached | SlotState::Discard => {
                *state = SlotState::Attached(tx);
                true
            }
            SlotState::Done => false,
        }
    }
}

/// Type-erased view of a [`Slot`] kept in the token table.
pub(crate) trait ErasedSlot: Send + Sync {
    fn detach(&self);

    fn cancel(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + 'static> ErasedSlot for Slot<T> {
    fn detach(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Detached) {
            SlotState::Attached(tx) => {
                let _ = tx.send(Outcome::Detached);
            }
            SlotState::Buffered(result) => *state = SlotState::Buffered(result),
            SlotState::Done => *state = SlotState::Done,
            SlotState::Detached | SlotState::Discard => {}
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if let SlotState::Attached(tx) = std::mem::replace(&mut *state, SlotState::Done) {
            let _ = tx.send(Outcome::Cancelled);
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
