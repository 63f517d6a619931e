pub mod backend;
pub mod http;

pub use backend::{BackendError, CompletionBackend};
pub use http::HttpCompletionBackend;
