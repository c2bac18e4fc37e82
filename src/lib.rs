// Remote task engine — prioritized, cancellable remote operations with a
// write-through streaming cache.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod transport;

pub use api::client::Client;
pub use config::{CacheMode, EngineConfig};
pub use engine::delivery::{Outcome, ResultReceiver};
pub use engine::dispatcher::{Dispatcher, Pending};
pub use engine::stream::{BytesConsumer, StreamConsumer, StreamTask};
pub use engine::task::{Priority, Task};
pub use engine::token::{Token, TokenState};
pub use error::{EngineError, SkipReason, TaskResult};
