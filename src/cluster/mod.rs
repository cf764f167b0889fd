// src/cluster/mod.rs
pub mod error;
pub mod message;
pub mod log_store;
pub mod timer;
pub mod state;
pub mod follower;
pub mod candidate;
pub mod leader;
pub mod transport;
pub mod node;
