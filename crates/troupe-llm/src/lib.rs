pub mod http;
pub mod mock;
pub mod registry;

pub use http::HttpChatClient;
pub use mock::{MockLlm, MockReply};
pub use registry::StaticModelRegistry;
