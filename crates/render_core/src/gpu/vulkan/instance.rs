//! Vulkan instance with optional validation

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, Instance};

use crate::gpu::error::{GpuError, GpuResult};

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &str = "render_core";

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance targeting Vulkan 1.2
    pub fn new(app_name: &str, enable_validation: bool) -> GpuResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| GpuError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| GpuError::InitializationFailed("Application name contains a NUL byte".to_string()))?;
        let engine_name_cstr = CString::new(ENGINE_NAME)
            .map_err(|_| GpuError::InitializationFailed("Engine name contains a NUL byte".to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let validation = enable_validation && Self::has_validation_layer(&entry);
        if enable_validation && !validation {
            log::warn!("{} requested but not installed", VALIDATION_LAYER);
        }

        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut layers: Vec<CString> = Vec::new();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
            layers.push(CString::new(VALIDATION_LAYER).map_err(|_| {
                GpuError::InitializationFailed("Invalid layer name".to_string())
            })?);
        }
        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(GpuError::Api)? };

        let debug_utils = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    log::warn!("Failed to create debug messenger: {}", e);
                    None
                }
            }
        } else {
            None
        };

        log::info!("Created Vulkan instance for '{}' (validation: {})", app_name, validation);

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn has_validation_layer(entry: &Entry) -> bool {
        let Ok(layers) = entry.enumerate_instance_layer_properties() else {
            return false;
        };
        layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name.to_bytes() == VALIDATION_LAYER.as_bytes()
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> GpuResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(GpuError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = &self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Forwards validation messages to the `log` facade
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}
