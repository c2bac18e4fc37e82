// Public assets — readable without an authenticated session.

use serde_json::Value;

use super::files::{path_segment, stream_key, OpenStreamTask, Sizing};
use super::json::JsonTask;
use crate::engine::stream::{StreamConsumer, StreamTask};
use crate::error::{EngineError, TaskResult};
use crate::transport::traits::Request;

fn check_name(name: &str) -> TaskResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::config("asset name cannot be empty"));
    }
    Ok(())
}

/// JSON data attached to an asset.
pub fn asset_data_task(name: &str) -> TaskResult<JsonTask<Value>> {
    check_name(name)?;
    Ok(
        JsonTask::data(Request::get(format!("asset/{}/data", path_segment(name))))
            .with_session_required(false),
    )
}

/// Binary content of an asset, cached under `asset/<name>`.
pub fn asset_stream_task<C: StreamConsumer>(
    name: &str,
    sizing: Option<&Sizing>,
    consumer: C,
) -> TaskResult<StreamTask<C>> {
    check_name(name)?;
    let key = stream_key(&format!("asset/{}", name), sizing);
    Ok(StreamTask::new(key, asset_request(name, sizing), consumer)?.with_session_required(false))
}

/// Raw asset content stream pulled by the caller; not cached.
pub fn open_asset_task(name: &str, sizing: Option<&Sizing>) -> TaskResult<OpenStreamTask> {
    check_name(name)?;
    Ok(OpenStreamTask::new(asset_request(name, sizing)).with_session_required(false))
}

fn asset_request(name: &str, sizing: Option<&Sizing>) -> Request {
    let request = Request::get(format!("asset/{}", path_segment(name)));
    match sizing {
        Some(sizing) => sizing.apply(request),
        None => request,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::stream::BytesConsumer;
    use crate::engine::task::Task;

    #[test]
    fn test_asset_tasks_skip_session_check() {
        let config = EngineConfig::default();
        let data = asset_data_task("logo").unwrap();
        assert!(!data.requires_session());
        assert_eq!(data.request(&config).unwrap().endpoint, "asset/logo/data");

        let stream =
            asset_stream_task("logo", Some(&Sizing::Index(1)), BytesConsumer::default()).unwrap();
        assert!(!stream.requires_session());
        assert_eq!(stream.id(), "asset/logo#sizeId=1");
    }

    #[test]
    fn test_empty_asset_name_rejected() {
        assert!(matches!(asset_data_task(" "), Err(EngineError::Config(_))));
        assert!(matches!(open_asset_task("", None), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_asset_names_are_escaped() {
        let config = EngineConfig::default();
        let data = asset_data_task("brand logo/v2").unwrap();
        assert_eq!(
            data.request(&config).unwrap().endpoint,
            "asset/brand%20logo%2Fv2/data"
        );

        let open = open_asset_task("brand logo/v2", None).unwrap();
        assert!(!open.requires_session());
        assert_eq!(open.request(&config).unwrap().endpoint, "asset/brand%20logo%2Fv2");
    }
}
