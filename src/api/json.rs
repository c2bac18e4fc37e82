// JSON request tasks — `{"data": ...}` envelope decoding on top of the generic Task.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::engine::execution::Execution;
use crate::engine::task::{Priority, Task};
use crate::error::{EngineError, TaskResult};
use crate::transport::traits::{Request, Response};

type Decoder<T> = Box<dyn FnMut(Value) -> TaskResult<T> + Send>;

/// Pull the `data` member out of a response document.
pub fn envelope_data(body: &[u8]) -> TaskResult<Value> {
    let mut doc: Value = serde_json::from_slice(body)?;
    match doc.get_mut("data") {
        Some(data) => Ok(data.take()),
        None => Err(EngineError::Protocol(anyhow!("response has no data field"))),
    }
}

/// A single JSON call whose result is decoded from the response envelope.
pub struct JsonTask<T> {
    request: Option<Request>,
    priority: Priority,
    requires_session: bool,
    decode: Decoder<T>,
}

impl<T: Send + 'static> JsonTask<T> {
    /// `request` of `None` takes the unbound skip path.
    pub fn new(
        request: Option<Request>,
        decode: impl FnMut(Value) -> TaskResult<T> + Send + 'static,
    ) -> Self {
        Self {
            request,
            priority: Priority::Normal,
            requires_session: true,
            decode: Box::new(decode),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session_required(mut self, required: bool) -> Self {
        self.requires_session = required;
        self
    }
}

impl<T: DeserializeOwned + Send + 'static> JsonTask<T> {
    /// Decode `data` into `T`.
    pub fn data(request: Request) -> Self {
        Self::new(Some(request), |data| Ok(serde_json::from_value(data)?))
    }
}

#[async_trait]
impl<T: Send + 'static> Task for JsonTask<T> {
    type Output = T;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn requires_session(&self) -> bool {
        self.requires_session
    }

    fn request(&self, _config: &EngineConfig) -> Option<Request> {
        self.request.clone()
    }

    async fn on_response(&mut self, response: Response, exec: &Execution) -> TaskResult<T> {
        let body = read_body(response, exec).await?;
        let data = envelope_data(&body)?;
        (self.decode)(data)
    }
}

/// Buffer the whole body, honouring cancellation between frames.
pub(crate) async fn read_body(mut response: Response, exec: &Execution) -> TaskResult<Vec<u8>> {
    let mut body = Vec::with_capacity(response.content_length.unwrap_or(0).min(1 << 20) as usize);
    while let Some(frame) = exec.next_frame(&mut response).await? {
        body.extend_from_slice(&frame);
    }
    Ok(body)
}
