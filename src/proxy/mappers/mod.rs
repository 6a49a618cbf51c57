pub mod models;
pub mod request;
pub mod response;
pub mod schema;
pub mod streaming;
pub mod thinking;

pub use request::{build_upstream_request, clean_cache_control};
pub use response::{aggregate_sse_body, transform_response};
pub use streaming::{create_claude_sse_stream, synthetic_no_response_stream};
