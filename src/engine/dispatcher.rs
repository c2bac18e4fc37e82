// Task dispatcher — priority queue, token table and a bounded pool of worker loops.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::ClientContext;
use super::delivery::{result_channel, ErasedSlot, ResultReceiver, Slot};
use super::execution::{Execution, TaskControl};
use super::stats::StatsSnapshot;
use super::task::{Priority, Task};
use super::token::{Token, TokenState};
use crate::error::{EngineError, SkipReason, TaskResult};

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job = Box<dyn FnOnce(Execution, Completer) -> JobFuture + Send>;

/// An accepted async submission.
#[derive(Debug)]
pub struct Pending<T> {
    pub token: Token,
    pub result: ResultReceiver<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(PartialEq, Eq)]
struct QueueKey {
    priority: Priority,
    token: Token,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the older token.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.token.cmp(&self.token))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Entry {
    state: TokenState,
    priority: Priority,
    /// Present while the task waits in the queue or is parked before its first run.
    job: Option<Job>,
    control: TaskControl,
    slot: Arc<dyn ErasedSlot>,
}

impl Entry {
    fn set_state(&mut self, next: TokenState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal token transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

#[derive(Default)]
struct DispatchState {
    queue: BinaryHeap<QueueKey>,
    entries: HashMap<Token, Entry>,
    finished: VecDeque<(Token, TokenState)>,
}

impl DispatchState {
    /// Pop the next runnable task. Keys for cancelled or parked tokens are stale
    /// and skipped.
    fn dequeue(&mut self) -> Option<(Token, Job, TaskControl)> {
        while let Some(key) = self.queue.pop() {
            let Some(entry) = self.entries.get_mut(&key.token) else {
                continue;
            };
            if entry.state != TokenState::Pending {
                continue;
            }
            let Some(job) = entry.job.take() else {
                continue;
            };
            entry.set_state(TokenState::Running);
            return Some((key.token, job, entry.control.clone()));
        }
        None
    }

    fn queued(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == TokenState::Pending)
            .count()
    }

    fn retire(&mut self, token: Token, state: TokenState, history: usize) {
        self.entries.remove(&token);
        if history == 0 {
            return;
        }
        if self.finished.len() >= history {
            self.finished.pop_front();
        }
        self.finished.push_back((token, state));
    }
}

struct Inner {
    ctx: Arc<ClientContext>,
    state: Mutex<DispatchState>,
    work_available: Notify,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl Inner {
    fn history(&self) -> usize {
        self.ctx.config().finished_history
    }

    fn complete(&self, token: Token, outcome: ExecOutcome) {
        let stats = self.ctx.stats();
        let mut st = self.state.lock();
        let Some(entry) = st.entries.get_mut(&token) else {
            // Cancelled while running; cancel() already retired the token.
            return;
        };
        match entry.state {
            TokenState::Running => {
                entry.set_state(TokenState::Completed);
                st.retire(token, TokenState::Completed, self.history());
            }
            TokenState::Suspended => {
                // Keep the entry so a later resume can collect the buffered result.
                entry.set_state(TokenState::Completed);
            }
            other => {
                warn!("task {} finished in unexpected state {:?}", token, other);
                return;
            }
        }
        drop(st);

        match outcome {
            ExecOutcome::Succeeded => stats.record_completed(),
            ExecOutcome::Failed => stats.record_failed(),
            ExecOutcome::Cancelled => stats.record_cancelled(),
        }
        debug!("task {} finished outcome={:?}", token, outcome);
    }
}

/// Reports the end of one execution back to the dispatcher.
struct Completer {
    inner: Arc<Inner>,
    token: Token,
}

impl Completer {
    fn complete(self, outcome: ExecOutcome) {
        self.inner.complete(self.token, outcome);
    }
}

/// Single logical queue of remote-operation tasks for one client.
///
/// Must be created inside a tokio runtime; worker loops are spawned eagerly.
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ClientContext>) -> Self {
        let workers = ctx.config().max_workers.max(1) as usize;
        let inner = Arc::new(Inner {
            ctx,
            state: Mutex::new(DispatchState::default()),
            work_available: Notify::new(),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        });

        for worker_id in 0..workers {
            tokio::spawn(worker_loop(Arc::clone(&inner), worker_id));
        }
        info!("dispatcher started with {} workers", workers);

        Self { inner }
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.inner.ctx
    }

    /// Queue `task` and return immediately with its token and result receiver.
    pub fn submit_async<T: Task>(&self, task: T) -> TaskResult<Pending<T::Output>> {
        let (tx, result) = result_channel();
        let token = self.enqueue(task, Slot::attached(tx))?;
        Ok(Pending { token, result })
    }

    /// Queue `task` without a result handler.
    pub fn submit_detached<T: Task>(&self, task: T) -> TaskResult<Token> {
        self.enqueue(task, Slot::discarding())
    }

    /// Execute `task` inline on the caller's task, bypassing the queue.
    pub async fn submit_sync<T: Task>(&self, mut task: T) -> TaskResult<T::Output> {
        let stats = self.inner.ctx.stats();
        stats.record_submitted();
        if task.requires_session() && !self.inner.ctx.has_session() {
            debug!("inline task skipped: no session");
            stats.record_skipped();
            return task.on_skip(SkipReason::NoSession);
        }

        let exec = Execution::new(Arc::clone(&self.inner.ctx), TaskControl::new(), None);
        let result = match AssertUnwindSafe(task.execute(&exec)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(panicked("inline task", payload)),
        };
        match &result {
            Ok(_) => stats.record_completed(),
            Err(_) => stats.record_failed(),
        }
        result
    }

    /// Execute `task` inline from a plain (non-async) thread.
    pub fn submit_blocking<T: Task>(&self, task: T) -> TaskResult<T::Output> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(EngineError::config(
                "submit_blocking called from inside an async runtime; use submit_sync",
            ));
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Transport(e.into()))?;
        rt.block_on(self.submit_sync(task))
    }

    fn enqueue<T: Task>(&self, mut task: T, slot: Slot<T::Output>) -> TaskResult<Token> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::Closed);
        }
        let token = Token::new(self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let stats = self.inner.ctx.stats();
        stats.record_submitted();
        let slot = Arc::new(slot);

        // Missing session: run the skip path now, without a worker slot.
        if task.requires_session() && !self.inner.ctx.has_session() {
            debug!("task {} skipped: no session", token);
            stats.record_skipped();
            let result = task.on_skip(SkipReason::NoSession);
            self.inner
                .state
                .lock()
                .retire(token, TokenState::Completed, self.inner.history());
            slot.deliver(result);
            return Ok(token);
        }

        let priority = task.priority();
        let job_slot = Arc::clone(&slot);
        let job: Job = Box::new(move |exec: Execution, done: Completer| -> JobFuture {
            Box::pin(async move {
                let mut task = task;
                let result = match AssertUnwindSafe(task.execute(&exec)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(panicked(&format!("task {}", token), payload)),
                };
                let outcome = match &result {
                    Ok(_) => ExecOutcome::Succeeded,
                    Err(e) if e.is_cancelled() => ExecOutcome::Cancelled,
                    Err(_) => ExecOutcome::Failed,
                };
                done.complete(outcome);
                if outcome == ExecOutcome::Cancelled {
                    job_slot.cancel();
                } else {
                    job_slot.deliver(result);
                }
            })
        });

        {
            let mut st = self.inner.state.lock();
            st.entries.insert(
                token,
                Entry {
                    state: TokenState::Pending,
                    priority,
                    job: Some(job),
                    control: TaskControl::new(),
                    slot,
                },
            );
            st.queue.push(QueueKey { priority, token });
        }
        self.inner.work_available.notify_one();
        debug!("task {} queued priority={:?}", token, priority);
        Ok(token)
    }

    /// Cancel a pending, suspended or running task. Returns false if the token
    /// is already terminal or unknown.
    pub fn cancel(&self, token: &Token) -> bool {
        let (was, entry) = {
            let mut st = self.inner.state.lock();
            let Some(entry) = st.entries.get_mut(token) else {
                return false;
            };
            if entry.state.is_terminal() {
                return false;
            }
            let was = entry.state;
            entry.set_state(TokenState::Cancelled);
            // Under the table lock, so a finishing job cannot deliver past it.
            entry.slot.cancel();
            let Some(entry) = st.entries.remove(token) else {
                return false;
            };
            st.retire(*token, TokenState::Cancelled, self.inner.history());
            (was, entry)
        };

        entry.control.cancel();
        // A queued job is dropped here along with its task.
        drop(entry.job);
        self.inner.ctx.stats().record_cancelled();
        info!("task {} cancelled (was {:?})", token, was);
        true
    }

    /// Withhold result delivery and pause the task before its next unit of work.
    pub fn suspend(&self, token: &Token) -> bool {
        {
            let mut st = self.inner.state.lock();
            let Some(entry) = st.entries.get_mut(token) else {
                return false;
            };
            match entry.state {
                TokenState::Pending => entry.set_state(TokenState::Suspended),
                TokenState::Running => {
                    entry.set_state(TokenState::Suspended);
                    entry.control.pause();
                }
                _ => return false,
            }
            // Detach before the lock is released; complete() then sees Suspended
            // and the job's delivery lands in the buffer.
            entry.slot.detach();
        }
        debug!("task {} suspended", token);
        true
    }

    /// Reattach a handler to a suspended task and let it continue. A result
    /// buffered while suspended is delivered to the new receiver immediately.
    pub fn resume<T: Send + 'static>(&self, token: &Token) -> TaskResult<ResultReceiver<T>> {
        let (tx, rx) = result_channel();
        let attached = {
            let mut st = self.inner.state.lock();
            let history = self.inner.history();
            let Some(entry) = st.entries.get_mut(token) else {
                return Err(EngineError::config(format!("unknown or retired token {}", token)));
            };
            let slot = Arc::clone(&entry.slot)
                .into_any()
                .downcast::<Slot<T>>()
                .map_err(|_| EngineError::config(format!("result type mismatch for {}", token)))?;

            match entry.state {
                TokenState::Suspended if entry.job.is_some() => {
                    entry.set_state(TokenState::Pending);
                    let priority = entry.priority;
                    st.queue.push(QueueKey {
                        priority,
                        token: *token,
                    });
                    self.inner.work_available.notify_one();
                }
                TokenState::Suspended => {
                    entry.set_state(TokenState::Running);
                    entry.control.unpause();
                }
                TokenState::Completed => st.retire(*token, TokenState::Completed, history),
                other => {
                    return Err(EngineError::config(format!(
                        "token {} is not suspended ({:?})",
                        token, other
                    )))
                }
            }
            slot.attach(tx)
        };

        if !attached {
            warn!("task {} resumed after its result was already delivered", token);
        }
        debug!("task {} resumed", token);
        Ok(rx)
    }

    /// Current state, or the terminal state of a recently retired token.
    pub fn state(&self, token: &Token) -> Option<TokenState> {
        let st = self.inner.state.lock();
        if let Some(entry) = st.entries.get(token) {
            return Some(entry.state);
        }
        st.finished
            .iter()
            .rev()
            .find(|(t, _)| t == token)
            .map(|(_, state)| *state)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let queued = self.inner.state.lock().queued();
        self.inner.ctx.stats().snapshot(queued)
    }

    /// Stop the workers and cancel every queued, suspended or running task.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let drained: Vec<(Token, Entry)> = {
            let mut st = self.inner.state.lock();
            st.queue.clear();
            let history = self.inner.history();
            let tokens: Vec<Token> = st.entries.keys().copied().collect();
            let mut drained = Vec::with_capacity(tokens.len());
            for token in tokens {
                let Some(mut entry) = st.entries.remove(&token) else {
                    continue;
                };
                if entry.state.is_terminal() {
                    continue;
                }
                entry.set_state(TokenState::Cancelled);
                entry.slot.cancel();
                st.retire(token, TokenState::Cancelled, history);
                drained.push((token, entry));
            }
            drained
        };

        for (_, entry) in &drained {
            entry.control.cancel();
            self.inner.ctx.stats().record_cancelled();
        }
        info!("dispatcher shut down, {} tasks cancelled", drained.len());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Turn a caught panic into a task failure.
fn panicked(what: &str, payload: Box<dyn Any + Send>) -> EngineError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!("{} panicked: {}", what, message);
    EngineError::Protocol(anyhow!("task panicked: {}", message))
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    debug!("worker {} started", worker_id);
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let next = {
            let mut st = inner.state.lock();
            let next = st.dequeue();
            if next.is_some() && !st.queue.is_empty() {
                // More work behind this one: wake another idle worker.
                inner.work_available.notify_one();
            }
            next
        };

        match next {
            Some((token, job, control)) => {
                debug!("worker {} running task {}", worker_id, token);
                let stats = Arc::clone(inner.ctx.stats());
                stats.increment_workers();
                let exec = Execution::new(Arc::clone(&inner.ctx), control, Some(token));
                let done = Completer {
                    inner: Arc::clone(&inner),
                    token,
                };
                job(exec, done).await;
                stats.decrement_workers();
            }
            None => {
                tokio::select! {
                    _ = inner.work_available.notified() => {}
                    _ = inner.shutdown.cancelled() => break,
                }
            }
        }
    }
    debug!("worker {} stopped", worker_id);
}
