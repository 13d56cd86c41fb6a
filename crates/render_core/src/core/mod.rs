//! # Core Module
//!
//! Shared configuration used to bring up a [`crate::DeviceContext`].

pub mod config;

pub use config::{DeviceConfig, DescriptorCapacities};
pub use crate::config::{Config, ConfigError};
