//! Common utilities and types shared across failoverd

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{Broker, Config, CoordConfig, RaftConfig, StartupState};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use utils::{join_host_port, parse_addrs, split_host_port};
