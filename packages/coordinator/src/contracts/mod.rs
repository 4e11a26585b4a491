//! Contract bindings

pub mod evm_bridge;
