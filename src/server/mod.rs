pub mod http;

pub use http::{router, run_http_server, ServerState};
