use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// Raw upload payload, sent as a single multipart file part.
    Binary {
        bytes: Bytes,
        content_type: String,
        file_name: String,
    },
}

/// Opaque description of one remote call. The engine never looks inside;
/// only the transport interprets it.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path relative to the transport's base URL, e.g. `file/details/abc`.
    pub endpoint: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Session token stamped by the engine right before execution.
    pub session: Option<String>,
}

impl Request {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            session: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Post, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Put, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Delete, endpoint)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn binary(
        mut self,
        bytes: Bytes,
        content_type: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        self.body = RequestBody::Binary {
            bytes,
            content_type: content_type.into(),
            file_name: file_name.into(),
        };
        self
    }
}

/// Response body as an ordered stream of byte frames.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

pub struct Response {
    pub status: u16,
    pub content_type: Option<String>,
    /// Declared body length; `None` when the backend does not report it.
    pub content_length: Option<u64>,
    body: BodyStream,
}

impl Response {
    pub fn new(
        status: u16,
        content_type: Option<String>,
        content_length: Option<u64>,
        body: BodyStream,
    ) -> Self {
        Self {
            status,
            content_type,
            content_length,
            body,
        }
    }

    /// Build a fully-buffered response with an accurate content length.
    pub fn from_bytes(status: u16, content_type: Option<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self::new(
            status,
            content_type,
            Some(len),
            stream::once(async move { Ok(bytes) }).boxed(),
        )
    }

    /// Next frame of the body, or `None` once it is exhausted.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes>> {
        self.body.next().await
    }

    /// Drain the remaining body into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(frame) = self.next_frame().await {
            buf.extend_from_slice(&frame?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Non-success HTTP status returned by the backend.
#[derive(Debug, thiserror::Error)]
#[error("HTTP {status} for {endpoint}")]
pub struct StatusError {
    pub status: u16,
    pub endpoint: String,
}

impl StatusError {
    /// The backend refused the credentials (or the session expired).
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self.status, 401 | 403 | 412)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute the request, returning the response once headers are available.
    /// Non-success statuses are reported as errors, usually a [`StatusError`].
    async fn execute(&self, request: Request) -> Result<Response>;
}
