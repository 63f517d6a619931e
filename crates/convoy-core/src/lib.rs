pub mod config;
pub mod error;
pub mod types;

pub use config::ConvoyConfig;
pub use error::ConvoyError;
pub use types::{ConversationId, TaskId};
