//! Vulkan context management
//!
//! Instance creation, adapter selection and logical device setup. The
//! [`DeviceContext`] is the root owner of the process-lifetime resources:
//! it is created first and destroyed last, after everything that borrows
//! the device.

use ash::{Device, Entry, Instance};
#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use std::ffi::{CStr, CString};
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::window::Window;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// No adapter with the required queue capabilities was found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No memory type satisfies the filter and property request
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Descriptor pool capacity would be exceeded
    #[error("Descriptor pool exhausted: {reason}")]
    PoolExhausted {
        /// Which capacity ran out
        reason: String,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (debug builds)
    #[cfg(debug_assertions)]
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle (debug builds)
    #[cfg(debug_assertions)]
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance with validation layers in debug builds
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

        let app_name_cstr = CString::new(app_name).unwrap();
        let engine_name_cstr = CString::new("HazeEngine").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let required_extensions = window.get_required_instance_extensions()
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to get required extensions: {}", e)))?;

        let cstr_extensions: Vec<CString> = required_extensions
            .iter()
            .map(|ext| CString::new(ext.as_str()).unwrap())
            .collect();

        #[allow(unused_mut)] // Mutable in debug builds for adding debug extensions
        let mut extensions: Vec<*const i8> = cstr_extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if cfg!(debug_assertions) && enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            vec![]
        };

        let layer_names_ptrs: Vec<*const i8> = layer_names.iter()
            .map(|name| name.as_ptr())
            .collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry.create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, &self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
#[cfg(debug_assertions)]
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

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory type table used for allocation decisions
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the compute-capable queue family
    pub compute_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select a suitable physical device
    ///
    /// Takes the first adapter exposing graphics, compute and present
    /// queue families. With `prefer_discrete_gpu` set, scanning continues
    /// past integrated adapters in the hope of a discrete one, falling
    /// back to the first suitable match.
    pub fn select(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        config: &DeviceConfig,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance.enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        let mut first_suitable: Option<Self> = None;

        for device in devices {
            let Ok(info) = Self::evaluate_device(instance, device, surface, surface_loader) else {
                continue;
            };

            let discrete = info.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
            if discrete || !config.prefer_discrete_gpu {
                log::info!("Selected GPU: {}", info.device_name());
                return Ok(info);
            }

            if first_suitable.is_none() {
                first_suitable = Some(info);
            }
        }

        if let Some(info) = first_suitable {
            log::info!("No discrete GPU available, selected: {}", info.device_name());
            return Ok(info);
        }

        Err(VulkanError::NoSuitableGpu)
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families = unsafe {
            instance.get_physical_device_queue_family_properties(device)
        };

        let mut graphics_family = None;
        let mut present_family = None;

        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }

            let present_support = unsafe {
                surface_loader.get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };

            if present_support && present_family.is_none() {
                present_family = Some(index);
            }
        }

        let graphics_family = graphics_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No graphics queue family found".to_string())
        })?;

        let compute_family = choose_compute_family(graphics_family, &queue_families)
            .ok_or_else(|| {
                VulkanError::InitializationFailed("No compute queue family found".to_string())
            })?;

        let present_family = present_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No present queue family found".to_string())
        })?;

        // Presentation is the only device extension this engine needs
        let extensions = unsafe {
            instance.enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };

        let has_swapchain = extensions.iter().any(|available| {
            let extension_name = unsafe {
                CStr::from_ptr(available.extension_name.as_ptr())
            };
            extension_name == SwapchainLoader::name()
        });

        if !has_swapchain {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string()
            ));
        }

        Ok(Self {
            device,
            properties,
            memory_properties,
            graphics_family,
            compute_family,
            present_family,
        })
    }

    fn device_name(&self) -> String {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        }
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Compute operations queue (may alias the graphics queue)
    pub compute_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
}

impl LogicalDevice {
    /// Create a new logical device with one queue per required family
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> VulkanResult<Self> {
        let unique_families: std::collections::HashSet<u32> = [
            physical_device_info.graphics_family,
            physical_device_info.compute_family,
            physical_device_info.present_family,
        ].iter().cloned().collect();

        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&[1.0])
                    .build()
            })
            .collect();

        let required_extensions = [SwapchainLoader::name().as_ptr()];

        let device_features = vk::PhysicalDeviceFeatures::builder().build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features);

        let device = unsafe {
            instance.create_device(physical_device_info.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe {
            device.get_device_queue(physical_device_info.graphics_family, 0)
        };

        let compute_queue = unsafe {
            device.get_device_queue(physical_device_info.compute_family, 0)
        };

        let present_queue = unsafe {
            device.get_device_queue(physical_device_info.present_family, 0)
        };

        let swapchain_loader = SwapchainLoader::new(instance, &device);

        Ok(Self {
            device,
            graphics_queue,
            compute_queue,
            present_queue,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            // Ensure device is idle before destruction
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Root owner of the process-lifetime Vulkan resources
///
/// Owns the instance, surface, physical and logical device, and one
/// long-lived command pool per distinct queue family. Fields are declared
/// in destruction order: command pools, then the logical device, then the
/// instance. The surface is released explicitly before the instance goes.
pub struct DeviceContext {
    /// Long-lived command pool on the graphics queue family
    pub graphics_pool: CommandPool,
    /// Long-lived command pool on the compute queue family
    pub compute_pool: CommandPool,
    /// Vulkan surface for presentation
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader
    pub surface_loader: Surface,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Logical device and queues
    pub device: LogicalDevice,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl DeviceContext {
    /// Create a device context for the window
    pub fn new(window: &mut Window, app_name: &str, config: &DeviceConfig) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, app_name, cfg!(debug_assertions))?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window.create_vulkan_surface(instance.instance.handle())
            .map_err(|e| VulkanError::InitializationFailed(format!("Surface creation: {}", e)))?;

        let physical_device = PhysicalDeviceInfo::select(
            &instance.instance, surface, &surface_loader, config,
        )?;

        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        let graphics_pool = CommandPool::new(
            device.device.clone(),
            physical_device.graphics_family,
        )?;
        let compute_pool = CommandPool::new(
            device.device.clone(),
            physical_device.compute_family,
        )?;

        Ok(Self {
            graphics_pool,
            compute_pool,
            surface,
            surface_loader,
            physical_device,
            device,
            instance,
        })
    }

    /// Get the raw device handle, cloned for RAII wrappers
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Find a memory type matching the filter bits and property request
    ///
    /// A miss is a configuration error, not a transient condition; callers
    /// treat it as fatal.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<u32> {
        find_memory_type(&self.physical_device.memory_properties, type_filter, properties)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // Remaining fields drop in declaration order: command pools first,
        // then the logical device, then the instance.
    }
}

/// Compute family for the device: the graphics family itself when it is
/// compute-capable, so per-frame images keep one owning family and
/// compute-to-fragment barriers record on a queue supporting both stages;
/// otherwise the first compute-capable family.
pub fn choose_compute_family(
    graphics_family: u32,
    queue_families: &[vk::QueueFamilyProperties],
) -> Option<u32> {
    let graphics = &queue_families[graphics_family as usize];
    if graphics.queue_flags.contains(vk::QueueFlags::COMPUTE) {
        return Some(graphics_family);
    }

    queue_families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|index| index as u32)
}

/// Linear scan of the adapter's memory-type table: first index whose type
/// bits intersect the filter and whose property flags are a superset of
/// the request.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_table(types: &[(vk::MemoryPropertyFlags, u32)]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &(flags, heap)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: heap,
            };
        }
        props
    }

    #[test]
    fn picks_first_matching_type() {
        let props = memory_table(&[
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                1,
            ),
        ]);

        let index = find_memory_type(
            &props,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn respects_type_filter_bits() {
        let props = memory_table(&[
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
        ]);

        // Only bit 1 is allowed, so index 0 must be skipped
        let index = find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn superset_properties_match() {
        let props = memory_table(&[(
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            0,
        )]);

        let index = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn missing_type_is_an_error() {
        let props = memory_table(&[(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0)]);

        let result = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(result, Err(VulkanError::NoSuitableMemoryType)));
    }

    fn families(flags: &[vk::QueueFlags]) -> Vec<vk::QueueFamilyProperties> {
        flags
            .iter()
            .map(|&queue_flags| vk::QueueFamilyProperties {
                queue_flags,
                queue_count: 1,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn compute_prefers_the_graphics_family() {
        // Family 0 is a dedicated compute family, family 1 does both;
        // graphics at 1 must pull compute onto the same family
        let table = families(&[
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        ]);
        assert_eq!(choose_compute_family(1, &table), Some(1));
    }

    #[test]
    fn graphics_only_family_falls_back_to_dedicated_compute() {
        let table = families(&[
            vk::QueueFlags::GRAPHICS,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        ]);
        assert_eq!(choose_compute_family(0, &table), Some(1));
    }

    #[test]
    fn no_compute_family_is_a_miss() {
        let table = families(&[vk::QueueFlags::GRAPHICS, vk::QueueFlags::TRANSFER]);
        assert_eq!(choose_compute_family(0, &table), None);
    }
}
