// Client facade — file and asset operations built as tasks.

pub mod assets;
pub mod client;
pub mod files;
pub mod json;
pub mod logging;
