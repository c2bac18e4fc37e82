use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use remote_task_engine::engine::cache::{Cache, DiskCache, MemoryCache};
use remote_task_engine::engine::context::ClientContext;
use remote_task_engine::transport::traits::{Request, Response, StatusError, Transport};
use remote_task_engine::{
    BytesConsumer, Dispatcher, EngineConfig, EngineError, Outcome, StreamConsumer, StreamTask,
};

/// Canned body for one endpoint.
#[derive(Clone, Default)]
struct Reply {
    frames: Vec<Bytes>,
    content_length: Option<u64>,
    /// Emit an I/O error after this many frames.
    fail_after: Option<usize>,
    /// Never finish after the listed frames.
    hang: bool,
}

impl Reply {
    fn whole(body: &'static [u8]) -> Self {
        Self {
            frames: vec![Bytes::from_static(body)],
            content_length: Some(body.len() as u64),
            ..Self::default()
        }
    }

    fn bytewise(body: &'static [u8]) -> Self {
        Self {
            frames: body.chunks(1).map(Bytes::copy_from_slice).collect(),
            content_length: Some(body.len() as u64),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct StubTransport {
    replies: Mutex<Vec<(String, Reply)>>,
    calls: AtomicUsize,
}

impl StubTransport {
    fn route(&self, endpoint: &str, reply: Reply) {
        self.replies.lock().push((endpoint.to_string(), reply));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn execute(&self, request: Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .iter()
            .find(|(endpoint, _)| *endpoint == request.endpoint)
            .map(|(_, reply)| reply.clone());
        let Some(reply) = reply else {
            return Err(StatusError {
                status: 404,
                endpoint: request.endpoint,
            }
            .into());
        };

        let mut frames: Vec<Result<Bytes>> = reply.frames.iter().cloned().map(Ok).collect();
        if let Some(n) = reply.fail_after {
            frames.truncate(n);
            frames.push(Err(anyhow!("connection reset by peer")));
        }
        let body = if reply.hang {
            stream::iter(frames).chain(stream::pending()).boxed()
        } else {
            stream::iter(frames).boxed()
        };
        Ok(Response::new(
            200,
            Some("image/png".to_string()),
            reply.content_length,
            body,
        ))
    }
}

/// Shared record of the callbacks a consumer received.
#[derive(Default)]
struct Events {
    log: Mutex<Vec<String>>,
    data_seen: Notify,
}

impl Events {
    fn count(&self, prefix: &str) -> usize {
        self.log.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn snapshot(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

struct Recorder {
    events: Arc<Events>,
    inner: BytesConsumer,
    fail_on_chunk: Option<usize>,
    chunks: usize,
}

impl Recorder {
    fn new(events: &Arc<Events>) -> Self {
        Self {
            events: Arc::clone(events),
            inner: BytesConsumer::default(),
            fail_on_chunk: None,
            chunks: 0,
        }
    }
}

impl StreamConsumer for Recorder {
    type Output = Bytes;

    fn on_start(&mut self, id: &str, total: Option<u64>, content_type: &str) -> Result<()> {
        self.events
            .log
            .lock()
            .push(format!("start {} {:?} {}", id, total, content_type));
        self.inner.on_start(id, total, content_type)
    }

    fn on_data(&mut self, chunk: &[u8]) -> Result<()> {
        self.chunks += 1;
        if self.fail_on_chunk == Some(self.chunks) {
            return Err(anyhow!("consumer rejected chunk {}", self.chunks));
        }
        self.events.log.lock().push(format!("data {}", chunk.len()));
        self.events.data_seen.notify_one();
        self.inner.on_data(chunk)
    }

    fn on_progress(&mut self, received: u64, total: u64) {
        self.events
            .log
            .lock()
            .push(format!("progress {}/{}", received, total));
    }

    fn on_end(&mut self, id: &str, total: Option<u64>, content_type: &str) -> Result<Bytes> {
        self.events.log.lock().push("end".to_string());
        self.inner.on_end(id, total, content_type)
    }

    fn on_finish(&mut self, id: &str) {
        self.events.log.lock().push(format!("finish {}", id));
    }
}

fn setup(cache: Option<Arc<dyn Cache>>, chunk_size: usize) -> (Dispatcher, Arc<StubTransport>) {
    let transport = Arc::new(StubTransport::default());
    let config = EngineConfig {
        max_workers: 2,
        chunk_size,
        ..EngineConfig::default()
    };
    let ctx = ClientContext::new(config, transport.clone(), cache);
    ctx.set_session("session-1");
    (Dispatcher::new(Arc::new(ctx)), transport)
}

fn stream_task(id: &str, consumer: Recorder) -> StreamTask<Recorder> {
    StreamTask::new(id, Request::get(format!("file/{}", id)), consumer).unwrap()
}

#[tokio::test]
async fn test_second_stream_served_from_cache() {
    let cache = MemoryCache::new();
    let (dispatcher, transport) = setup(Some(Arc::new(cache.clone())), 4096);
    transport.route("file/img1", Reply::whole(b"0123456789"));

    let events = Arc::new(Events::default());
    let first = dispatcher
        .submit_sync(stream_task("img1", Recorder::new(&events)))
        .await
        .unwrap();
    assert_eq!(&first[..], b"0123456789");
    assert_eq!(transport.calls(), 1);
    assert_eq!(&cache.get("img1").unwrap().unwrap()[..], b"0123456789");

    let replay = Arc::new(Events::default());
    let second = dispatcher
        .submit_sync(stream_task("img1", Recorder::new(&replay)))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        replay.snapshot(),
        vec![
            "start img1 Some(10) application/octet-stream",
            "data 10",
            "progress 10/10",
            "end",
            "finish img1",
        ]
    );
    assert_eq!(dispatcher.stats().cache_hit_rate, 0.5);
}

#[tokio::test]
async fn test_force_refresh_bypasses_cache() {
    let (dispatcher, transport) = setup(Some(Arc::new(MemoryCache::new())), 4096);
    transport.route("file/img1", Reply::whole(b"fresh"));
    let events = Arc::new(Events::default());

    dispatcher
        .submit_sync(stream_task("img1", Recorder::new(&events)))
        .await
        .unwrap();
    let refreshed = dispatcher
        .submit_sync(stream_task("img1", Recorder::new(&events)).force_refresh(true))
        .await
        .unwrap();
    assert_eq!(&refreshed[..], b"fresh");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_failure_mid_stream_leaves_no_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(DiskCache::new(dir.path()).unwrap());
    let (dispatcher, transport) = setup(Some(cache.clone()), 4096);
    transport.route(
        "file/img2",
        Reply {
            fail_after: Some(3),
            ..Reply::bytewise(b"0123456789")
        },
    );

    let events = Arc::new(Events::default());
    let result = dispatcher
        .submit_sync(stream_task("img2", Recorder::new(&events)))
        .await;
    assert!(matches!(result, Err(EngineError::Transport(_))));

    assert_eq!(events.count("data"), 3);
    assert_eq!(events.count("end"), 0);
    assert_eq!(events.count("finish"), 1);
    assert!(cache.get("img2").unwrap().is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_truncated_body_is_transport_error() {
    let cache = MemoryCache::new();
    let (dispatcher, transport) = setup(Some(Arc::new(cache.clone())), 4096);
    transport.route(
        "file/short",
        Reply {
            frames: vec![Bytes::from_static(b"012345")],
            content_length: Some(10),
            ..Reply::default()
        },
    );

    let events = Arc::new(Events::default());
    let result = dispatcher
        .submit_sync(stream_task("short", Recorder::new(&events)))
        .await;
    assert!(matches!(result, Err(EngineError::Transport(_))));
    assert!(cache.is_empty());
    assert_eq!(events.count("finish"), 1);
}

#[tokio::test]
async fn test_consumer_failure_is_protocol_error() {
    let cache = MemoryCache::new();
    let (dispatcher, transport) = setup(Some(Arc::new(cache.clone())), 4096);
    transport.route("file/img3", Reply::bytewise(b"abcdef"));

    let events = Arc::new(Events::default());
    let mut consumer = Recorder::new(&events);
    consumer.fail_on_chunk = Some(2);
    let result = dispatcher.submit_sync(stream_task("img3", consumer)).await;

    assert!(matches!(result, Err(EngineError::Protocol(_))));
    assert!(cache.is_empty());
    assert_eq!(events.count("finish"), 1);
}

#[tokio::test]
async fn test_frames_split_to_chunk_size() {
    let (dispatcher, transport) = setup(None, 4);
    transport.route("file/big", Reply::whole(b"0123456789"));

    let events = Arc::new(Events::default());
    let body = dispatcher
        .submit_sync(stream_task("big", Recorder::new(&events)))
        .await
        .unwrap();
    assert_eq!(&body[..], b"0123456789");
    assert_eq!(
        events.snapshot(),
        vec![
            "start big Some(10) image/png",
            "data 4",
            "progress 4/10",
            "data 4",
            "progress 8/10",
            "data 2",
            "progress 10/10",
            "end",
            "finish big",
        ]
    );
}

#[tokio::test]
async fn test_zero_length_yields_empty_result() {
    let (dispatcher, transport) = setup(Some(Arc::new(MemoryCache::new())), 4096);
    transport.route(
        "file/empty",
        Reply {
            content_length: Some(0),
            ..Reply::default()
        },
    );

    let events = Arc::new(Events::default());
    let body = dispatcher
        .submit_sync(stream_task("empty", Recorder::new(&events)))
        .await
        .unwrap();
    assert!(body.is_empty());
    assert_eq!(
        events.snapshot(),
        vec!["start empty Some(0) image/png", "end", "finish empty"]
    );
}

#[tokio::test]
async fn test_unknown_length_streams_without_progress() {
    let (dispatcher, transport) = setup(None, 4096);
    transport.route(
        "file/live",
        Reply {
            content_length: None,
            ..Reply::bytewise(b"abc")
        },
    );

    let events = Arc::new(Events::default());
    let body = dispatcher
        .submit_sync(stream_task("live", Recorder::new(&events)))
        .await
        .unwrap();
    assert_eq!(&body[..], b"abc");
    assert_eq!(events.count("progress"), 0);
    assert_eq!(events.count("data"), 3);
    assert_eq!(events.count("start live None"), 1);
}

#[tokio::test]
async fn test_cancel_mid_stream_discards_partial_entry() {
    let cache = MemoryCache::new();
    let (dispatcher, transport) = setup(Some(Arc::new(cache.clone())), 4096);
    transport.route(
        "file/slow",
        Reply {
            frames: vec![Bytes::from_static(b"first")],
            content_length: Some(100),
            hang: true,
            ..Reply::default()
        },
    );

    let events = Arc::new(Events::default());
    let pending = dispatcher
        .submit_async(stream_task("slow", Recorder::new(&events)))
        .unwrap();
    events.data_seen.notified().await;

    assert!(dispatcher.cancel(&pending.token));
    assert!(matches!(pending.result.recv().await, Outcome::Cancelled));

    for _ in 0..100 {
        if events.count("finish") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(events.count("finish"), 1);
    assert_eq!(events.count("end"), 0);
    assert!(cache.is_empty());
    assert_eq!(dispatcher.stats().cancelled, 1);
}

#[tokio::test]
async fn test_empty_stream_id_rejected() {
    let result = StreamTask::new("  ", Request::get("file/"), BytesConsumer::default());
    assert!(matches!(result, Err(EngineError::Config(_))));
}
