pub mod config;

pub use config::{Config, NodeConfig, RaftConfig};
