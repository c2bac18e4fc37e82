// Execution handle passed to tasks — transport access plus the cooperative
// cancellation and pause checkpoints.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cache::Cache;
use super::context::ClientContext;
use super::stats::StatsCollector;
use super::token::Token;
use crate::config::EngineConfig;
use crate::error::{EngineError, TaskResult};
use crate::transport::traits::{Request, Response};

/// Cancellation and pause switches shared between the dispatcher and one running task.
#[derive(Clone)]
pub(crate) struct TaskControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl TaskControl {
    pub(crate) fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub(crate) fn unpause(&self) {
        self.paused.send_replace(false);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns once the task may proceed: immediately when neither paused nor
    /// cancelled, otherwise after an unpause. Cancellation always wins.
    async fn checkpoint(&self) -> TaskResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut rx = self.paused.subscribe();
        if !*rx.borrow_and_update() {
            return Ok(());
        }

        debug!("task paused at checkpoint");
        let resumed = async move { rx.wait_for(|paused| !*paused).await.is_ok() };
        tokio::select! {
            ok = resumed => {
                if !ok || self.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
            }
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
        }
        debug!("task resumed at checkpoint");
        Ok(())
    }
}

/// Everything a task may touch while it executes.
pub struct Execution {
    ctx: Arc<ClientContext>,
    control: TaskControl,
    token: Option<Token>,
}

impl Execution {
    pub(crate) fn new(ctx: Arc<ClientContext>, control: TaskControl, token: Option<Token>) -> Self {
        Self {
            ctx,
            control,
            token,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.ctx.config()
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.ctx.cache()
    }

    pub fn stats(&self) -> &StatsCollector {
        self.ctx.stats()
    }

    /// Token of the async submission; `None` for inline execution.
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// Suspension point: fails with [`EngineError::Cancelled`] once cancellation
    /// was requested and waits while the task is suspended.
    pub async fn checkpoint(&self) -> TaskResult<()> {
        self.control.checkpoint().await
    }

    /// Hand the request to the transport. The in-flight call is dropped if the
    /// task is cancelled meanwhile.
    pub async fn send(&self, mut request: Request) -> TaskResult<Response> {
        self.checkpoint().await?;
        request.session = self.ctx.session();
        let endpoint = request.endpoint.clone();
        debug!("executing {:?} {} token={:?}", request.method, endpoint, self.token);

        tokio::select! {
            res = self.ctx.transport().execute(request) => res.map_err(EngineError::Transport),
            _ = self.control.cancel.cancelled() => {
                debug!("request to {} aborted by cancellation", endpoint);
                Err(EngineError::Cancelled)
            }
        }
    }

    /// Read the next body frame, racing it against cancellation.
    pub async fn next_frame(&self, response: &mut Response) -> TaskResult<Option<Bytes>> {
        tokio::select! {
            frame = response.next_frame() => match frame {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(e)) => Err(EngineError::Transport(e)),
                None => Ok(None),
            },
            _ = self.control.cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}
