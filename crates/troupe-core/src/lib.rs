pub mod chat;
pub mod config;
pub mod error;
pub mod event;
pub mod redact;
pub mod topology;
pub mod traits;
pub mod types;

pub use config::Config;
pub use error::{Result, TroupeError};
pub use event::ExecutionEvent;
pub use types::*;
