// Task abstraction — one unit of remote work described by a small set of capabilities.

use async_trait::async_trait;
use serde::Deserialize;

use super::execution::Execution;
use crate::config::EngineConfig;
use crate::error::{EngineError, SkipReason, TaskResult};
use crate::transport::traits::{Request, Response};

/// Queue ordering class. Higher priorities are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A remote operation: build a request, interpret the response.
///
/// Implementations supply [`request`](Task::request) and
/// [`on_response`](Task::on_response); the default [`execute`](Task::execute)
/// wires them to the transport. Tasks that need a different flow (for example
/// probing a cache before going to the network) override `execute`.
#[async_trait]
pub trait Task: Send + 'static {
    type Output: Send + 'static;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Whether the task may only run with an authenticated session.
    fn requires_session(&self) -> bool {
        true
    }

    /// Build the request. `None` means there is nothing to send and routes the
    /// task through [`on_skip`](Task::on_skip) with [`SkipReason::Unbound`].
    fn request(&self, config: &EngineConfig) -> Option<Request>;

    /// Result produced when the task cannot be sent.
    fn on_skip(&mut self, reason: SkipReason) -> TaskResult<Self::Output> {
        Err(EngineError::Skipped(reason))
    }

    async fn on_response(
        &mut self,
        response: Response,
        exec: &Execution,
    ) -> TaskResult<Self::Output>;

    async fn execute(&mut self, exec: &Execution) -> TaskResult<Self::Output> {
        let Some(request) = self.request(exec.config()) else {
            return self.on_skip(SkipReason::Unbound);
        };
        let response = exec.send(request).await?;
        self.on_response(response, exec).await
    }
}
