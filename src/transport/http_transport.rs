use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Url};
use tracing::{debug, warn};

use super::traits::{Method, Request, RequestBody, Response, StatusError, Transport};
use crate::config::EngineConfig;

/// reqwest-backed transport resolving endpoints against a base URL.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    headers: HashMap<String, String>,
    session_header: String,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        session_header: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: parse_base_url(base_url)?,
            headers: HashMap::new(),
            session_header: session_header.into(),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let timeout = (config.request_timeout_secs > 0)
            .then(|| Duration::from_secs(config.request_timeout_secs));
        Ok(Self::new(&config.base_url, config.session_header.clone(), timeout)?
            .with_default_headers(config.default_headers.clone()))
    }

    /// Headers attached to every request (e.g. an app code). Per-request
    /// headers with the same name are sent as well.
    pub fn with_default_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn resolve(&self, endpoint: &str) -> Result<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| anyhow!("invalid endpoint {}: {}", endpoint, e))
    }

    fn build_request(&self, request: Request) -> Result<RequestBuilder> {
        let url = self.resolve(&request.endpoint)?;
        let mut req = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Put => self.client.put(url),
            Method::Delete => self.client.delete(url),
        };

        if !request.params.is_empty() {
            req = req.query(&request.params);
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(session) = &request.session {
            req = req.header(self.session_header.as_str(), session.as_str());
        }

        req = match request.body {
            RequestBody::Empty => req,
            RequestBody::Json(value) => req.json(&value),
            RequestBody::Binary {
                bytes,
                content_type,
                file_name,
            } => {
                let part = Part::bytes(bytes.to_vec())
                    .file_name(file_name)
                    .mime_str(&content_type)?;
                req.multipart(Form::new().part("file", part))
            }
        };
        Ok(req)
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid base url {}", raw))?;
    // Url::join drops the last path segment unless the base ends with '/'.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: Request) -> Result<Response> {
        let endpoint = request.endpoint.clone();
        let resp = self
            .build_request(request)?
            .send()
            .await
            .with_context(|| format!("request to {} failed", endpoint))?;

        let status = resp.status().as_u16();
        debug!("http {} status={}", endpoint, status);
        if !resp.status().is_success() {
            let err = StatusError { status, endpoint };
            if err.is_auth_rejected() {
                warn!("http auth rejected status={} endpoint={}", status, err.endpoint);
            } else {
                warn!("http request failed status={} endpoint={}", status, err.endpoint);
            }
            return Err(err.into());
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = resp.content_length();

        let body = resp
            .bytes_stream()
            .map(|frame| frame.map_err(anyhow::Error::from))
            .boxed();
        Ok(Response::new(status, content_type, content_length, body))
    }
}
