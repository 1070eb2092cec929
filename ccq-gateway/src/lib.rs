pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod server;

pub use dispatcher::DispatchOutcome;
pub use dispatcher::DispatcherSettings;
pub use dispatcher::QueryDispatcher;
pub use dispatcher::SignatureMode;
pub use error::GatewayError;
