// Streaming tasks — cache lookup, chunked network read with write-through caching,
// and the consumer callback protocol.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::cache::CacheWriter;
use super::execution::Execution;
use super::task::{Priority, Task};
use crate::config::{EngineConfig, DEFAULT_CONTENT_TYPE};
use crate::error::{EngineError, TaskResult};
use crate::transport::traits::{Request, Response};

/// Receives a binary payload incrementally.
///
/// Per execution the engine calls `on_start`, then `on_data` zero or more times
/// in order, then `on_end` on success. `on_finish` is called exactly once, last,
/// whatever the outcome.
pub trait StreamConsumer: Send + 'static {
    type Output: Send + 'static;

    /// `total_length` is `None` when the backend did not declare a length.
    fn on_start(&mut self, id: &str, total_length: Option<u64>, content_type: &str) -> Result<()>;

    fn on_data(&mut self, chunk: &[u8]) -> Result<()>;

    /// Only called when the total length is known.
    fn on_progress(&mut self, _received: u64, _total: u64) {}

    fn on_end(
        &mut self,
        id: &str,
        total_length: Option<u64>,
        content_type: &str,
    ) -> Result<Self::Output>;

    fn on_finish(&mut self, _id: &str) {}
}

/// Collects the whole payload into memory.
#[derive(Debug, Default)]
pub struct BytesConsumer {
    buf: BytesMut,
}

/// Upper bound for pre-allocating from a declared length.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

impl StreamConsumer for BytesConsumer {
    type Output = Bytes;

    fn on_start(&mut self, _id: &str, total_length: Option<u64>, _content_type: &str) -> Result<()> {
        if let Some(total) = total_length {
            self.buf.reserve(total.min(MAX_PREALLOC) as usize);
        }
        Ok(())
    }

    fn on_data(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn on_end(&mut self, _id: &str, _total: Option<u64>, _content_type: &str) -> Result<Bytes> {
        Ok(std::mem::take(&mut self.buf).freeze())
    }
}

/// Downloads one stream id, serving it from cache when possible.
pub struct StreamTask<C> {
    id: String,
    request: Request,
    consumer: C,
    priority: Priority,
    requires_session: bool,
    force_refresh: bool,
}

impl<C: StreamConsumer> StreamTask<C> {
    /// `id` doubles as the cache key and must not be empty.
    pub fn new(id: impl Into<String>, request: Request, consumer: C) -> TaskResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EngineError::config("stream id cannot be empty"));
        }
        Ok(Self {
            id,
            request,
            consumer,
            priority: Priority::Normal,
            requires_session: true,
            force_refresh: false,
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session_required(mut self, required: bool) -> Self {
        self.requires_session = required;
        self
    }

    /// Skip the cache lookup; the fresh payload is still written through.
    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn run(&mut self, exec: &Execution) -> TaskResult<C::Output> {
        if !self.force_refresh {
            if let Some(output) = self.from_cache(exec)? {
                return Ok(output);
            }
        }
        let response = exec.send(self.request.clone()).await?;
        self.on_response(response, exec).await
    }

    /// Replay a cached entry through the consumer. `Ok(None)` on a miss.
    fn from_cache(&mut self, exec: &Execution) -> TaskResult<Option<C::Output>> {
        let Some(cache) = exec.cache() else {
            return Ok(None);
        };
        let cached = match cache.get(&self.id) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("cache read failed id={}: {:#}", self.id, e);
                None
            }
        };
        let Some(bytes) = cached else {
            debug!("cache miss id={}", self.id);
            exec.stats().record_cache_miss();
            return Ok(None);
        };

        debug!("cache hit id={} bytes={}", self.id, bytes.len());
        exec.stats().record_cache_hit();
        let total = bytes.len() as u64;
        self.consumer
            .on_start(&self.id, Some(total), DEFAULT_CONTENT_TYPE)
            .map_err(EngineError::Protocol)?;
        let mut delivered = 0u64;
        for piece in bytes.chunks(exec.config().chunk_size.max(1)) {
            self.consumer.on_data(piece).map_err(EngineError::Protocol)?;
            delivered += piece.len() as u64;
            self.consumer.on_progress(delivered, total);
        }
        exec.stats().record_streamed(total);
        let output = self
            .consumer
            .on_end(&self.id, Some(total), DEFAULT_CONTENT_TYPE)
            .map_err(EngineError::Protocol)?;
        Ok(Some(output))
    }

    async fn pump(
        &mut self,
        response: &mut Response,
        session: &mut StreamSession,
        exec: &Execution,
    ) -> TaskResult<C::Output> {
        let total = session.total;
        self.consumer
            .on_start(&self.id, total, &session.content_type)
            .map_err(EngineError::Protocol)?;

        if total == Some(0) {
            session.commit();
            return self
                .consumer
                .on_end(&self.id, total, &session.content_type)
                .map_err(EngineError::Protocol);
        }

        let chunk_size = exec.config().chunk_size.max(1);
        loop {
            exec.checkpoint().await?;
            let Some(frame) = exec.next_frame(response).await? else {
                break;
            };
            session.received += frame.len() as u64;

            for piece in frame.chunks(chunk_size) {
                exec.checkpoint().await?;
                // Cache before consumer.
                session.write_cache(piece);
                self.consumer.on_data(piece).map_err(EngineError::Protocol)?;
                session.delivered += piece.len() as u64;
                exec.stats().record_streamed(piece.len() as u64);
                if let Some(total) = total {
                    self.consumer.on_progress(session.delivered, total);
                }
            }
        }

        if let Some(total) = total {
            if session.received != total {
                return Err(EngineError::Transport(anyhow!(
                    "body ended after {} of {} bytes",
                    session.received,
                    total
                )));
            }
        }

        session.commit();
        self.consumer
            .on_end(&self.id, total, &session.content_type)
            .map_err(EngineError::Protocol)
    }
}

#[async_trait]
impl<C: StreamConsumer> Task for StreamTask<C> {
    type Output = C::Output;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn requires_session(&self) -> bool {
        self.requires_session
    }

    fn request(&self, _config: &EngineConfig) -> Option<Request> {
        Some(self.request.clone())
    }

    async fn on_response(
        &mut self,
        mut response: Response,
        exec: &Execution,
    ) -> TaskResult<C::Output> {
        let writer = match exec.cache() {
            Some(cache) => match cache.begin_stream(&self.id) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    warn!("cache unavailable for id={}, streaming uncached: {:#}", self.id, e);
                    None
                }
            },
            None => None,
        };
        let mut session = StreamSession {
            id: self.id.clone(),
            content_type: response
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            total: response.content_length,
            received: 0,
            delivered: 0,
            writer,
        };

        let result = self.pump(&mut response, &mut session, exec).await;
        debug!(
            "stream id={} received={} delivered={} ok={}",
            session.id,
            session.received,
            session.delivered,
            result.is_ok()
        );
        result
    }

    async fn execute(&mut self, exec: &Execution) -> TaskResult<C::Output> {
        let result = self.run(exec).await;
        self.consumer.on_finish(&self.id);
        result
    }
}

/// Transient state for one network read. Dropping it discards an uncommitted
/// cache write.
struct StreamSession {
    id: String,
    content_type: String,
    total: Option<u64>,
    received: u64,
    delivered: u64,
    writer: Option<Box<dyn CacheWriter>>,
}

impl StreamSession {
    /// A failing cache write stops caching for this session; the stream goes on.
    fn write_cache(&mut self, piece: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writer.write(piece) {
            warn!("cache write failed id={}, dropping entry: {:#}", self.id, e);
            self.close_writer();
        }
    }

    fn commit(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.commit() {
                Ok(()) => debug!("cache committed id={}", self.id),
                Err(e) => warn!("cache commit failed id={}: {:#}", self.id, e),
            }
        }
    }

    fn close_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.close() {
                warn!("closing cache writer failed id={}: {:#}", self.id, e);
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close_writer();
    }
}
