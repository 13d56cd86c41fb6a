//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the crate:
//! - Alignment arithmetic
//! - Math types and the 3x4 transform encoding
//! - Collections and data structures
//! - Logging utilities

pub mod align;
pub mod math;
pub mod collections;
pub mod logging;
