// Clinic session gateway - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod monitor;

pub use error::{GatewayError, RefreshError};
pub use gateway::AuthGateway;
pub use http_client::{ApiRequest, ApiResponse, HttpTransport, Transport};
pub use monitor::{Clock, ManualClock, MonitorHandle, SessionMonitor, SessionState, SystemClock};
