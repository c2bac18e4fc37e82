// Remote file entities and the tasks that operate on them.

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::json::{envelope_data, read_body};
use crate::config::EngineConfig;
use crate::engine::execution::Execution;
use crate::engine::task::{Priority, Task};
use crate::error::{EngineError, TaskResult};
use crate::transport::traits::{Request, Response};

/// Server-side metadata of a stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    #[serde(rename = "fileName", default)]
    pub file_name: Option<String>,
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
    #[serde(rename = "contentLength", default)]
    pub content_length: Option<u64>,
    #[serde(rename = "_creation_date", default)]
    pub creation_date: Option<String>,
    #[serde(rename = "_author", default)]
    pub author: Option<String>,
    #[serde(rename = "@version", default)]
    pub version: Option<u64>,
    #[serde(rename = "attachedData", default)]
    pub attached_data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityState {
    Unbound,
    Uploading,
    Bound(FileInfo),
}

/// Local handle on a file that may or may not exist on the server yet.
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct FileEntity {
    name: Option<String>,
    state: Arc<Mutex<EntityState>>,
}

impl FileEntity {
    pub fn new() -> Self {
        Self {
            name: None,
            state: Arc::new(Mutex::new(EntityState::Unbound)),
        }
    }

    /// Entity uploaded under `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    pub fn bound(info: FileInfo) -> Self {
        Self {
            name: info.file_name.clone(),
            state: Arc::new(Mutex::new(EntityState::Bound(info))),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> EntityState {
        self.state.lock().clone()
    }

    pub fn id(&self) -> Option<String> {
        match &*self.state.lock() {
            EntityState::Bound(info) => Some(info.id.clone()),
            _ => None,
        }
    }

    pub fn info(&self) -> Option<FileInfo> {
        match &*self.state.lock() {
            EntityState::Bound(info) => Some(info.clone()),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(*self.state.lock(), EntityState::Bound(_))
    }

    /// Unbound → Uploading. Content can be uploaded once per entity.
    pub(crate) fn begin_upload(&self) -> TaskResult<()> {
        let mut state = self.state.lock();
        match *state {
            EntityState::Unbound => {
                *state = EntityState::Uploading;
                Ok(())
            }
            EntityState::Uploading => Err(EngineError::config("upload already in progress")),
            EntityState::Bound(_) => Err(EngineError::config(
                "file is already bound to a remote entity",
            )),
        }
    }

    /// Uploading → Unbound; no-op in any other state.
    pub(crate) fn abort_upload(&self) {
        let mut state = self.state.lock();
        if *state == EntityState::Uploading {
            *state = EntityState::Unbound;
        }
    }

    pub(crate) fn bind(&self, info: FileInfo) {
        *self.state.lock() = EntityState::Bound(info);
    }

    pub(crate) fn unbind(&self) {
        *self.state.lock() = EntityState::Unbound;
    }
}

impl Default for FileEntity {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side resize applied to image content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sizing {
    /// Free-form size spec, e.g. `"<=120px"`.
    Spec(String),
    /// Index into the server's preconfigured sizes.
    Index(u32),
}

impl Sizing {
    pub(crate) fn apply(&self, request: Request) -> Request {
        match self {
            Sizing::Spec(spec) => request.param("resize", spec.as_str()),
            Sizing::Index(idx) => request.param("sizeId", idx.to_string()),
        }
    }
}

impl fmt::Display for Sizing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sizing::Spec(spec) => write!(f, "resize={}", spec),
            Sizing::Index(idx) => write!(f, "sizeId={}", idx),
        }
    }
}

/// Escape an id or name for use as one URL path segment.
pub(crate) fn path_segment(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

/// Cache key of a (possibly resized) payload.
pub fn stream_key(base: &str, sizing: Option<&Sizing>) -> String {
    match sizing {
        Some(sizing) => format!("{}{}", variant_prefix(base), sizing),
        None => base.to_string(),
    }
}

/// Key prefix shared by every resized variant of `base`.
pub fn variant_prefix(base: &str) -> String {
    format!("{}#", base)
}

pub(crate) fn stream_request(id: &str, sizing: Option<&Sizing>) -> Request {
    let request = Request::get(format!("file/{}", path_segment(id)));
    match sizing {
        Some(sizing) => sizing.apply(request),
        None => request,
    }
}

async fn decode_info(response: Response, exec: &Execution) -> TaskResult<FileInfo> {
    let body = read_body(response, exec).await?;
    let info: FileInfo = serde_json::from_value(envelope_data(&body)?)?;
    Ok(info)
}

/// Multipart upload of new content; binds the entity on success.
pub struct UploadTask {
    entity: FileEntity,
    request: Request,
    priority: Priority,
}

impl UploadTask {
    /// Moves `entity` to `Uploading`; fails if it already has content.
    pub fn new(entity: &FileEntity, bytes: Bytes, content_type: Option<&str>) -> TaskResult<Self> {
        entity.begin_upload()?;
        let file_name = entity
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let content_type = content_type.unwrap_or(crate::config::DEFAULT_CONTENT_TYPE);
        debug!("upload prepared name={} bytes={}", file_name, bytes.len());
        Ok(Self {
            entity: entity.clone(),
            request: Request::post("file").binary(bytes, content_type, file_name),
            priority: Priority::Normal,
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Task for UploadTask {
    type Output = FileInfo;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn request(&self, _config: &EngineConfig) -> Option<Request> {
        Some(self.request.clone())
    }

    async fn on_response(&mut self, response: Response, exec: &Execution) -> TaskResult<FileInfo> {
        let info = decode_info(response, exec).await?;
        self.entity.bind(info.clone());
        Ok(info)
    }
}

impl Drop for UploadTask {
    // Skipped, failed or cancelled uploads release the entity.
    fn drop(&mut self) {
        self.entity.abort_upload();
    }
}

/// Fetch metadata for an id, refreshing the entity it came from if any.
pub struct DetailsTask {
    id: Option<String>,
    entity: Option<FileEntity>,
    priority: Priority,
}

impl DetailsTask {
    pub fn by_id(id: &str) -> TaskResult<Self> {
        if id.trim().is_empty() {
            return Err(EngineError::config("file id cannot be empty"));
        }
        Ok(Self {
            id: Some(id.to_string()),
            entity: None,
            priority: Priority::Normal,
        })
    }

    pub fn refresh(entity: &FileEntity) -> Self {
        Self {
            id: entity.id(),
            entity: Some(entity.clone()),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Task for DetailsTask {
    type Output = FileInfo;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn request(&self, _config: &EngineConfig) -> Option<Request> {
        self.id
            .as_ref()
            .map(|id| Request::get(format!("file/details/{}", path_segment(id))))
    }

    async fn on_response(&mut self, response: Response, exec: &Execution) -> TaskResult<FileInfo> {
        let info = decode_info(response, exec).await?;
        if self.id.as_deref() != Some(info.id.as_str()) {
            return Err(EngineError::Protocol(anyhow!(
                "details returned id {} for {:?}",
                info.id,
                self.id
            )));
        }
        if let Some(entity) = &self.entity {
            entity.bind(info.clone());
        }
        Ok(info)
    }
}

/// Delete a remote file and drop its cached content.
pub struct DeleteTask {
    id: Option<String>,
    entity: Option<FileEntity>,
    priority: Priority,
}

impl DeleteTask {
    pub fn by_id(id: &str) -> TaskResult<Self> {
        if id.trim().is_empty() {
            return Err(EngineError::config("file id cannot be empty"));
        }
        Ok(Self {
            id: Some(id.to_string()),
            entity: None,
            priority: Priority::Normal,
        })
    }

    pub fn entity(entity: &FileEntity) -> Self {
        Self {
            id: entity.id(),
            entity: Some(entity.clone()),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Task for DeleteTask {
    type Output = ();

    fn priority(&self) -> Priority {
        self.priority
    }

    fn request(&self, _config: &EngineConfig) -> Option<Request> {
        self.id
            .as_ref()
            .map(|id| Request::delete(format!("file/{}", path_segment(id))))
    }

    async fn on_response(&mut self, _response: Response, exec: &Execution) -> TaskResult<()> {
        let Some(id) = self.id.as_deref() else {
            return Ok(());
        };
        if let Some(cache) = exec.cache() {
            let evicted = cache
                .remove(id)
                .and_then(|()| cache.remove_prefix(&variant_prefix(id)));
            if let Err(e) = evicted {
                warn!("evicting deleted file id={} failed: {:#}", id, e);
            }
        }
        if let Some(entity) = &self.entity {
            entity.unbind();
        }
        debug!("file deleted id={}", id);
        Ok(())
    }
}

/// Opens a content stream and hands the live response to the caller, who
/// pulls the body. Bypasses the cache.
pub struct OpenStreamTask {
    request: Request,
    priority: Priority,
    requires_session: bool,
}

impl OpenStreamTask {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            priority: Priority::Normal,
            requires_session: true,
        }
    }

    pub fn file(id: &str, sizing: Option<&Sizing>) -> TaskResult<Self> {
        if id.trim().is_empty() {
            return Err(EngineError::config("file id cannot be empty"));
        }
        Ok(Self::new(stream_request(id, sizing)))
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

#[async_trait]
impl Task for OpenStreamTask {
    type Output = Response;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn requires_session(&self) -> bool {
        self.requires_session
    }

    fn request(&self, _config: &EngineConfig) -> Option<Request> {
        Some(self.request.clone())
    }

    async fn on_response(&mut self, response: Response, _exec: &Execution) -> TaskResult<Response> {
        debug!(
            "stream opened endpoint={} length={:?}",
            self.request.endpoint, response.content_length
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> FileInfo {
        serde_json::from_value(serde_json::json!({ "id": id, "fileName": "a.png" })).unwrap()
    }

    #[test]
    fn test_file_info_wire_names() {
        let raw = serde_json::json!({
            "id": "f1",
            "fileName": "cat.png",
            "contentType": "image/png",
            "contentLength": 1024,
            "_creation_date": "2024-01-01",
            "_author": "alice",
            "@version": 3,
            "attachedData": { "tag": "pets" }
        });
        let info: FileInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.file_name.as_deref(), Some("cat.png"));
        assert_eq!(info.content_length, Some(1024));
        assert_eq!(info.version, Some(3));
        assert_eq!(info.attached_data["tag"], "pets");
    }

    #[test]
    fn test_entity_upload_once() {
        let entity = FileEntity::new();
        entity.begin_upload().unwrap();
        assert!(matches!(entity.begin_upload(), Err(EngineError::Config(_))));

        entity.bind(info("f1"));
        assert_eq!(entity.id().as_deref(), Some("f1"));
        assert!(matches!(entity.begin_upload(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_dropped_upload_releases_entity() {
        let entity = FileEntity::named("a.bin");
        let task = UploadTask::new(&entity, Bytes::from_static(b"abc"), None).unwrap();
        assert_eq!(entity.state(), EntityState::Uploading);
        drop(task);
        assert_eq!(entity.state(), EntityState::Unbound);
    }

    #[test]
    fn test_unbound_entity_has_no_request() {
        let config = EngineConfig::default();
        let entity = FileEntity::new();
        assert!(DeleteTask::entity(&entity).request(&config).is_none());
        assert!(DetailsTask::refresh(&entity).request(&config).is_none());
    }

    #[test]
    fn test_ids_are_escaped_as_one_segment() {
        let config = EngineConfig::default();
        let req = stream_request("a b/c?d#e", None);
        assert_eq!(req.endpoint, "file/a%20b%2Fc%3Fd%23e");

        let details = DetailsTask::by_id("x/y").unwrap();
        assert_eq!(details.request(&config).unwrap().endpoint, "file/details/x%2Fy");

        let delete = DeleteTask::by_id("%41").unwrap();
        assert_eq!(delete.request(&config).unwrap().endpoint, "file/%2541");
    }

    #[test]
    fn test_open_stream_task_targets_content() {
        let config = EngineConfig::default();
        let task = OpenStreamTask::file("f1", Some(&Sizing::Spec("<=64px".into()))).unwrap();
        let req = task.request(&config).unwrap();
        assert_eq!(req.endpoint, "file/f1");
        assert_eq!(req.params, vec![("resize".to_string(), "<=64px".to_string())]);
        assert!(task.requires_session());
        assert!(matches!(OpenStreamTask::file("", None), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_sizing_params_and_keys() {
        let req = stream_request("f1", Some(&Sizing::Index(2)));
        assert_eq!(req.endpoint, "file/f1");
        assert_eq!(req.params, vec![("sizeId".to_string(), "2".to_string())]);

        assert_eq!(stream_key("f1", None), "f1");
        assert_eq!(
            stream_key("f1", Some(&Sizing::Spec("<=64px".into()))),
            "f1#resize=<=64px"
        );
    }
}
