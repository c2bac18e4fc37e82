// Engine orchestration — tasks, dispatch, streaming and the content cache.

pub mod cache;
pub mod context;
pub mod delivery;
pub mod dispatcher;
pub mod execution;
pub mod stats;
pub mod stream;
pub mod task;
pub mod token;
