//! # Device Configuration
//!
//! Settings for a [`crate::DeviceContext`]: validation, frame pacing that drives
//! the deferred disposal countdown and descriptor heap sizes.
//!
//! Configurations are plain serde structs and can be loaded from TOML or RON
//! through the [`Config`] trait.

use serde::{Serialize, Deserialize};

use crate::config::{Config, ConfigError};

/// Upper bound on frames in flight; deeper queues only add latency
pub const MAX_FRAMES_IN_FLIGHT: u32 = 8;

/// Capacity of each descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorCapacities {
    /// Constant/shader-resource/unordered-access views
    pub resource: u32,
    /// Samplers
    pub sampler: u32,
    /// Render target views
    pub render_target: u32,
    /// Depth stencil views
    pub depth_stencil: u32,
}

impl Default for DescriptorCapacities {
    fn default() -> Self {
        Self {
            resource: 4096,
            sampler: 256,
            render_target: 256,
            depth_stencil: 64,
        }
    }
}

/// # Device Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Application name for instance creation
    pub application_name: String,
    /// Whether to enable API validation layers; `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Frames the CPU may run ahead of the GPU; the default disposal countdown
    pub frames_in_flight: u32,
    /// Frames a drained upload keeps its staging memory; defaults to `frames_in_flight`
    pub upload_life_time: Option<u32>,
    /// Descriptor heap sizes
    pub descriptor_capacities: DescriptorCapacities,
}

impl DeviceConfig {
    /// Create a configuration with defaults for everything but the name
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            enable_validation: None,
            frames_in_flight: 2,
            upload_life_time: None,
            descriptor_capacities: DescriptorCapacities::default(),
        }
    }

    /// Set frames in flight
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set how long drained uploads keep their staging buffers
    pub fn with_upload_life_time(mut self, frames: u32) -> Self {
        self.upload_life_time = Some(frames);
        self
    }

    /// Set descriptor heap capacities
    pub fn with_descriptor_capacities(mut self, capacities: DescriptorCapacities) -> Self {
        self.descriptor_capacities = capacities;
        self
    }

    /// Validation setting after applying the build-type default
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Countdown applied to drained uploads
    pub fn effective_upload_life_time(&self) -> u32 {
        self.upload_life_time.unwrap_or(self.frames_in_flight)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("Application name cannot be empty".to_string()));
        }

        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid("Frames in flight must be at least 1".to_string()));
        }

        if self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::Invalid(format!(
                "Frames in flight should not exceed {MAX_FRAMES_IN_FLIGHT}"
            )));
        }

        let capacities = &self.descriptor_capacities;
        if capacities.resource == 0 || capacities.sampler == 0 {
            return Err(ConfigError::Invalid(
                "Resource and sampler heaps need at least one descriptor".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new("Render Core Application")
    }
}

impl Config for DeviceConfig {}
