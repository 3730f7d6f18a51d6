pub mod error;
pub mod routes;
pub mod server;
pub mod sse;
pub mod state;

pub use server::GatewayServer;
pub use state::AppState;
