pub mod error;
pub mod http;
pub mod store;
pub mod telemetry;
