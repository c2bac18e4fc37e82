// Transport abstraction — the engine only needs execute(request) → response.

pub mod http_transport;
pub mod traits;
