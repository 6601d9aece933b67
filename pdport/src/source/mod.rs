//! Implementation of a source port.

pub mod cable;
pub mod device_policy_manager;
pub mod policy_engine;

pub use policy_engine::Source;
