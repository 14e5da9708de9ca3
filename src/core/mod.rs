// Core infrastructure shared by the runtime, the command kernel and the job executor

pub mod clock;
pub mod config;
pub mod errors;
pub mod registry;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use errors::{EngineError, ErrorCategory, Result};
pub use registry::Registry;
