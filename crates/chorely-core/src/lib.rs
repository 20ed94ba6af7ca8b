//! # Chorely Core
//! Configuration and error types shared by the scheduler and the binary.

pub mod config;
pub mod error;

pub use config::{
    ChorelyConfig, GatewayConfig, RetryConfig, RetryStrategy, SchedulerConfig, StorageConfig,
    ThrottleConfig,
};
pub use error::{ChorelyError, Result};
