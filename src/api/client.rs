// Client handle — owns one context and one dispatcher; no process-wide state.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use serde_json::Value;
use tracing::info;

use super::assets::{asset_data_task, asset_stream_task, open_asset_task};
use super::files::{
    stream_key, stream_request, DeleteTask, DetailsTask, FileEntity, FileInfo, OpenStreamTask,
    Sizing, UploadTask,
};
use super::json::JsonTask;
use crate::config::EngineConfig;
use crate::engine::cache::Cache;
use crate::engine::context::ClientContext;
use crate::engine::dispatcher::{Dispatcher, Pending};
use crate::engine::stats::StatsSnapshot;
use crate::engine::stream::{StreamConsumer, StreamTask};
use crate::engine::task::Priority;
use crate::error::{EngineError, TaskResult};
use crate::transport::traits::{Request, Response, Transport};

/// Entry point for remote file and asset operations.
///
/// Every operation comes in two flavours: the plain one queues a task at
/// [`Priority::Normal`] and returns its [`Pending`] handle, the `_sync` one runs
/// it inline. `_with_priority` variants queue at the given priority.
pub struct Client {
    dispatcher: Dispatcher,
}

impl Client {
    /// Build transport and cache from `config`. Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let ctx = ClientContext::from_config(config)?;
        Ok(Self::from_context(ctx))
    }

    /// Assemble a client from explicit collaborators.
    pub fn with_parts(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        cache: Option<Arc<dyn Cache>>,
    ) -> Self {
        Self::from_context(ClientContext::new(config, transport, cache))
    }

    fn from_context(ctx: ClientContext) -> Self {
        let dispatcher = Dispatcher::new(Arc::new(ctx));
        info!("client ready");
        Self { dispatcher }
    }

    /// Direct access for custom tasks, cancellation and suspension.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        self.dispatcher.context()
    }

    pub fn set_session(&self, token: impl Into<String>) {
        self.context().set_session(token);
    }

    pub fn clear_session(&self) {
        self.context().clear_session();
    }

    pub fn has_session(&self) -> bool {
        self.context().has_session()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats()
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    // ---- files ----

    pub fn file_details(&self, id: &str) -> TaskResult<Pending<FileInfo>> {
        self.file_details_with_priority(id, Priority::Normal)
    }

    pub fn file_details_with_priority(
        &self,
        id: &str,
        priority: Priority,
    ) -> TaskResult<Pending<FileInfo>> {
        self.dispatcher
            .submit_async(DetailsTask::by_id(id)?.with_priority(priority))
    }

    pub async fn file_details_sync(&self, id: &str) -> TaskResult<FileInfo> {
        self.dispatcher.submit_sync(DetailsTask::by_id(id)?).await
    }

    /// Reload metadata into `entity`. Unbound entities are skipped.
    pub fn refresh(&self, entity: &FileEntity) -> TaskResult<Pending<FileInfo>> {
        self.refresh_with_priority(entity, Priority::Normal)
    }

    pub fn refresh_with_priority(
        &self,
        entity: &FileEntity,
        priority: Priority,
    ) -> TaskResult<Pending<FileInfo>> {
        self.dispatcher
            .submit_async(DetailsTask::refresh(entity).with_priority(priority))
    }

    pub async fn refresh_sync(&self, entity: &FileEntity) -> TaskResult<FileInfo> {
        self.dispatcher.submit_sync(DetailsTask::refresh(entity)).await
    }

    /// List file metadata; `params` are passed through as query filters.
    pub fn list_files(&self, params: &[(&str, &str)]) -> TaskResult<Pending<Vec<FileInfo>>> {
        self.list_files_with_priority(params, Priority::Normal)
    }

    pub fn list_files_with_priority(
        &self,
        params: &[(&str, &str)],
        priority: Priority,
    ) -> TaskResult<Pending<Vec<FileInfo>>> {
        self.dispatcher
            .submit_async(list_task(params).with_priority(priority))
    }

    pub async fn list_files_sync(&self, params: &[(&str, &str)]) -> TaskResult<Vec<FileInfo>> {
        self.dispatcher.submit_sync(list_task(params)).await
    }

    pub fn delete_file(&self, id: &str) -> TaskResult<Pending<()>> {
        self.delete_file_with_priority(id, Priority::Normal)
    }

    pub fn delete_file_with_priority(&self, id: &str, priority: Priority) -> TaskResult<Pending<()>> {
        self.dispatcher
            .submit_async(DeleteTask::by_id(id)?.with_priority(priority))
    }

    pub async fn delete_file_sync(&self, id: &str) -> TaskResult<()> {
        self.dispatcher.submit_sync(DeleteTask::by_id(id)?).await
    }

    /// Delete the remote file behind `entity` and unbind it.
    pub fn delete_entity(&self, entity: &FileEntity) -> TaskResult<Pending<()>> {
        self.delete_entity_with_priority(entity, Priority::Normal)
    }

    pub fn delete_entity_with_priority(
        &self,
        entity: &FileEntity,
        priority: Priority,
    ) -> TaskResult<Pending<()>> {
        self.dispatcher
            .submit_async(DeleteTask::entity(entity).with_priority(priority))
    }

    pub async fn delete_entity_sync(&self, entity: &FileEntity) -> TaskResult<()> {
        self.dispatcher.submit_sync(DeleteTask::entity(entity)).await
    }

    pub fn upload(
        &self,
        entity: &FileEntity,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> TaskResult<Pending<FileInfo>> {
        self.upload_with_priority(entity, bytes, content_type, Priority::Normal)
    }

    pub fn upload_with_priority(
        &self,
        entity: &FileEntity,
        bytes: Bytes,
        content_type: Option<&str>,
        priority: Priority,
    ) -> TaskResult<Pending<FileInfo>> {
        self.dispatcher
            .submit_async(UploadTask::new(entity, bytes, content_type)?.with_priority(priority))
    }

    pub async fn upload_sync(
        &self,
        entity: &FileEntity,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> TaskResult<FileInfo> {
        self.dispatcher
            .submit_sync(UploadTask::new(entity, bytes, content_type)?)
            .await
    }

    pub fn stream_file<C: StreamConsumer>(
        &self,
        id: &str,
        sizing: Option<Sizing>,
        consumer: C,
    ) -> TaskResult<Pending<C::Output>> {
        self.stream_file_with_priority(id, sizing, consumer, Priority::Normal)
    }

    pub fn stream_file_with_priority<C: StreamConsumer>(
        &self,
        id: &str,
        sizing: Option<Sizing>,
        consumer: C,
        priority: Priority,
    ) -> TaskResult<Pending<C::Output>> {
        self.dispatcher
            .submit_async(file_stream_task(id, sizing.as_ref(), consumer)?.with_priority(priority))
    }

    pub async fn stream_file_sync<C: StreamConsumer>(
        &self,
        id: &str,
        sizing: Option<Sizing>,
        consumer: C,
    ) -> TaskResult<C::Output> {
        self.dispatcher
            .submit_sync(file_stream_task(id, sizing.as_ref(), consumer)?)
            .await
    }

    /// Open the content stream of `id` and return the live response; the
    /// caller pulls the body frames. Not cached.
    pub async fn open_stream_sync(&self, id: &str, sizing: Option<Sizing>) -> TaskResult<Response> {
        self.dispatcher
            .submit_sync(OpenStreamTask::file(id, sizing.as_ref())?)
            .await
    }

    // ---- assets ----

    pub fn asset_data(&self, name: &str) -> TaskResult<Pending<Value>> {
        self.asset_data_with_priority(name, Priority::Normal)
    }

    pub fn asset_data_with_priority(
        &self,
        name: &str,
        priority: Priority,
    ) -> TaskResult<Pending<Value>> {
        self.dispatcher
            .submit_async(asset_data_task(name)?.with_priority(priority))
    }

    pub async fn asset_data_sync(&self, name: &str) -> TaskResult<Value> {
        self.dispatcher.submit_sync(asset_data_task(name)?).await
    }

    pub fn stream_asset<C: StreamConsumer>(
        &self,
        name: &str,
        sizing: Option<Sizing>,
        consumer: C,
    ) -> TaskResult<Pending<C::Output>> {
        self.stream_asset_with_priority(name, sizing, consumer, Priority::Normal)
    }

    pub fn stream_asset_with_priority<C: StreamConsumer>(
        &self,
        name: &str,
        sizing: Option<Sizing>,
        consumer: C,
        priority: Priority,
    ) -> TaskResult<Pending<C::Output>> {
        self.dispatcher.submit_async(
            asset_stream_task(name, sizing.as_ref(), consumer)?.with_priority(priority),
        )
    }

    pub async fn stream_asset_sync<C: StreamConsumer>(
        &self,
        name: &str,
        sizing: Option<Sizing>,
        consumer: C,
    ) -> TaskResult<C::Output> {
        self.dispatcher
            .submit_sync(asset_stream_task(name, sizing.as_ref(), consumer)?)
            .await
    }

    /// Raw asset stream pulled by the caller. Not cached.
    pub async fn open_asset_stream_sync(
        &self,
        name: &str,
        sizing: Option<Sizing>,
    ) -> TaskResult<Response> {
        self.dispatcher
            .submit_sync(open_asset_task(name, sizing.as_ref())?)
            .await
    }
}

fn list_task(params: &[(&str, &str)]) -> JsonTask<Vec<FileInfo>> {
    let request = params
        .iter()
        .fold(Request::get("file/details"), |req, (k, v)| req.param(*k, *v));
    JsonTask::data(request)
}

fn file_stream_task<C: StreamConsumer>(
    id: &str,
    sizing: Option<&Sizing>,
    consumer: C,
) -> TaskResult<StreamTask<C>> {
    if id.trim().is_empty() {
        return Err(EngineError::config("file id cannot be empty"));
    }
    StreamTask::new(stream_key(id, sizing), stream_request(id, sizing), consumer)
}
