//! Implementation of a sink port.

pub mod device_policy_manager;
pub mod policy_engine;

pub use policy_engine::Sink;
