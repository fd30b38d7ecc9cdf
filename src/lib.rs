pub mod core;
pub mod config;
pub mod devnet;
pub mod metrics;
pub mod mix;
pub mod network;
pub mod node;

pub use crate::core::types::*;
