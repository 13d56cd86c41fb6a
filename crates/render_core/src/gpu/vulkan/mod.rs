//! Vulkan backend
//!
//! Requires Vulkan 1.2 with timeline semaphores and buffer device addresses.
//! Ray tracing is enabled when `VK_KHR_acceleration_structure`,
//! `VK_KHR_ray_tracing_pipeline` and `VK_KHR_deferred_host_operations` are
//! all present.

mod commands;
mod convert;
mod device;
mod instance;

pub use commands::VulkanCommandList;
pub use device::VulkanDevice;
pub use instance::VulkanInstance;
