pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod mock;
pub mod model;
pub mod prober;
mod retry;
pub mod session;
pub mod transport;
pub mod types;

pub use config::EngineConfig;
pub use dispatcher::CommandDispatcher;
pub use engine::PtzEngine;
pub use error::{FaultKind, PtzError, TransportError, TransportResult};
pub use mock::{MockTransport, RecordedCall};
pub use model::CapabilityModel;
pub use prober::CapabilityProber;
pub use retry::RetryPolicy;
pub use session::DeviceSession;
pub use transport::{PtzTransport, TransportConnector, TransportOp};
pub use types::*;
