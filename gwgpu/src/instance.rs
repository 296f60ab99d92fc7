//! Vulkan loading, instance creation and physical device enumeration.
//!
//! [`Instance`] sits at the root of the object graph. It owns the
//! `ash::Entry` loader, the raw `ash::Instance`, an optional validation
//! messenger wired into [`tracing`], and the surface extension function
//! table. Every other object in the crate is created through it and holds
//! it alive with an `Arc`.

use ash::vk;
use raw_window_handle::{HandleError, HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::log::VulkanLogLevel;
use crate::surface::{CreateSurfaceError, SurfaceQueryError, SurfaceSupportError};
use std::{
    ffi::{CStr, CString},
    fmt::Debug,
    str::FromStr,
};

#[derive(Debug, Error)]
pub enum CreateInstanceError {
    #[error("Vulkan library failed to load: {0}")]
    Load(ash::LoadingError),
    #[error("Display handle unavailable: {0}")]
    InvalidDisplayHandle(HandleError),
    #[error("Required instance extensions are missing: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("Unexpected Vulkan error: {0}")]
    UnknownVulkan(vk::Result),
    #[error("Application name contained a NUL byte")]
    InvalidAppName,
}

impl From<vk::Result> for CreateInstanceError {
    fn from(value: vk::Result) -> Self {
        Self::UnknownVulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Ran out of memory enumerating physical devices")]
    MemoryExhaustion,
    #[error("Physical device enumeration failed: {0}")]
    UnknownVulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum DestroyRawSurfaceError {
    #[error("Surface extension was not loaded")]
    ExtensionNotLoaded,
}

/// A packed 32-bit Vulkan version word, the encoding `VkApplicationInfo`
/// and `vkEnumerateInstanceVersion` use.
///
/// The bit layout puts variant above major above minor above patch, so the
/// derived ordering compares component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VkVersion(u32);

impl VkVersion {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub const fn variant(self) -> u32 {
        vk::api_version_variant(self.0)
    }

    pub const fn major(self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub const fn minor(self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub const fn patch(self) -> u32 {
        vk::api_version_patch(self.0)
    }

    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

struct DebugMessenger {
    handle: vk::DebugUtilsMessengerEXT,
    loader: ash::ext::debug_utils::Instance,
}

/// The root Vulkan object: loaded entry points, the raw instance, and the
/// optional validation messenger.
pub struct Instance {
    entry: ash::Entry,
    raw: ash::Instance,
    messenger: Option<DebugMessenger>,
    surface_loader: Option<ash::khr::surface::Instance>,
    ver: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.raw.handle())
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.raw.handle());
        if let Some(messenger) = self.messenger.take() {
            // SAFETY: the messenger came from this instance and nothing uses
            // it after this point.
            unsafe {
                messenger
                    .loader
                    .destroy_debug_utils_messenger(messenger.handle, None)
            };
        }
        // SAFETY: we are in drop, so every object derived from this instance
        // is already gone.
        unsafe { self.raw.destroy_instance(None) };
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
    use vk::DebugUtilsMessageTypeFlagsEXT as Kind;

    // SAFETY: Vulkan keeps p_callback_data valid for the whole callback.
    let text = unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();

    let kind = match message_type {
        Kind::GENERAL => "general",
        Kind::VALIDATION => "validation",
        Kind::PERFORMANCE => "performance",
        _ => "unknown",
    };

    match message_severity {
        Severity::ERROR => tracing::error!(target: "gwgpu-debug-messenger", "[{kind}] {text}"),
        Severity::WARNING => tracing::warn!(target: "gwgpu-debug-messenger", "[{kind}] {text}"),
        Severity::INFO => tracing::info!(target: "gwgpu-debug-messenger", "[{kind}] {text}"),
        Severity::VERBOSE => tracing::trace!(target: "gwgpu-debug-messenger", "[{kind}] {text}"),
        _ => tracing::debug!(target: "gwgpu-debug-messenger", "[{kind}] {text}"),
    }

    vk::FALSE
}

/// Severities at or above `level`, leaning on [`VulkanLogLevel`] being
/// ordered from most to least chatty.
fn severity_flags(level: VulkanLogLevel) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
    let mut flags = Severity::ERROR;
    if level <= VulkanLogLevel::Warning {
        flags |= Severity::WARNING;
    }
    if level <= VulkanLogLevel::Info {
        flags |= Severity::INFO;
    }
    if level <= VulkanLogLevel::Verbose {
        flags |= Severity::VERBOSE;
    }
    flags
}

fn messenger_create_info(level: VulkanLogLevel) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    use vk::DebugUtilsMessageTypeFlagsEXT as Kind;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_type(Kind::GENERAL | Kind::VALIDATION | Kind::PERFORMANCE)
        .message_severity(severity_flags(level))
        .pfn_user_callback(Some(vulkan_debug_callback))
}

fn extension_available(available: &[vk::ExtensionProperties], wanted: &CStr) -> bool {
    available
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(wanted))
}

fn layer_available(available: &[vk::LayerProperties], wanted: &CStr) -> bool {
    available
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(wanted))
}

/// Optional instance-level extension groups for [`Instance::new`].
///
/// `surface` asks for the platform's surface extensions. It only has an
/// effect when a display source is also passed in, because the display
/// server determines which extension names to request.
#[derive(Debug, Default)]
pub struct InstanceExtensions {
    pub surface: bool,
}

impl Instance {
    /// Load Vulkan and create an instance at whatever API version the
    /// loader reports.
    ///
    /// With `validation_level` set and both `VK_EXT_debug_utils` and
    /// `VK_LAYER_KHRONOS_validation` present, validation output lands in
    /// `tracing` under the `gwgpu-debug-messenger` target. When either is
    /// absent the messenger is skipped without complaint.
    ///
    /// # Safety
    /// Loading the Vulkan library runs arbitrary driver initialization
    /// code through libloading. Nothing here can make that safe.
    pub unsafe fn new(
        app_name: &str,
        validation_level: Option<VulkanLogLevel>,
        display_source: Option<&impl HasDisplayHandle>,
        extensions: InstanceExtensions,
    ) -> Result<Self, CreateInstanceError> {
        use CreateInstanceError as Error;

        let app_cname = CString::from_str(app_name).map_err(|_| Error::InvalidAppName)?;
        // SAFETY: the dll-loading burden falls on our caller. The entry
        // outlives everything derived from it because Instance drops last.
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Load)?;

        // Ok(None) is how a 1.0 loader answers the version query.
        // SAFETY: a live entry is the only precondition of this query.
        let loader_version = unsafe { entry.try_enumerate_instance_version() }
            .ok()
            .flatten()
            .unwrap_or(vk::API_VERSION_1_0);

        let mut required_exts: Vec<&CStr> = Vec::new();

        // Whether the surface extensions actually end up enabled. Asking via
        // `extensions` is not enough on its own, a display handle is needed
        // to pick the platform extension names.
        let mut have_surface_ext = false;

        if let Some(display_source) = display_source
            && extensions.surface
        {
            have_surface_ext = true;
            let display = display_source
                .display_handle()
                .map_err(Error::InvalidDisplayHandle)?;
            let platform_exts = ash_window::enumerate_required_extensions(display.as_raw())?;
            // SAFETY: ash_window documents these as NUL-terminated.
            required_exts.extend(platform_exts.iter().map(|ptr| unsafe { CStr::from_ptr(*ptr) }));
        }

        // SAFETY: entry is live. None asks for the global extension list.
        let available_exts = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        // SAFETY: entry is live, nothing else required.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() };
        let available_layers = available_layers.unwrap_or_default();

        let missing: Vec<String> = required_exts
            .iter()
            .filter(|ext| !extension_available(&available_exts, ext))
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingExtensions(missing));
        }

        let debug_utils_name = ash::ext::debug_utils::NAME;
        let validation_layer = c"VK_LAYER_KHRONOS_validation";
        let can_validate = extension_available(&available_exts, debug_utils_name)
            && layer_available(&available_layers, validation_layer);

        let mut enabled_exts: Vec<*const std::ffi::c_char> =
            required_exts.iter().map(|ext| ext.as_ptr()).collect();
        let mut enabled_layers: Vec<*const std::ffi::c_char> = Vec::new();

        let mut messenger_info = match validation_level {
            Some(level) if can_validate => {
                enabled_exts.push(debug_utils_name.as_ptr());
                enabled_layers.push(validation_layer.as_ptr());
                Some(messenger_create_info(level))
            }
            _ => None,
        };

        let app_version = vk::make_api_version(0, 0, 1, 0);
        let application = vk::ApplicationInfo::default()
            .application_name(&app_cname)
            .application_version(app_version)
            .engine_name(c"gwgpu")
            .engine_version(app_version)
            .api_version(loader_version);

        let mut info = vk::InstanceCreateInfo::default()
            .application_info(&application)
            .enabled_extension_names(&enabled_exts)
            .enabled_layer_names(&enabled_layers);

        if let Some(ref mut messenger_info) = messenger_info {
            info = info.push_next(messenger_info);
        }

        // SAFETY: info was assembled from extension and layer lists we just
        // verified against the loader.
        let raw = unsafe { entry.create_instance(&info, None) }?;

        let messenger = if let Some(mut messenger_info) = messenger_info {
            // The p_next chain pointed into the instance create info. Clear
            // it before reusing the struct standalone.
            messenger_info.p_next = std::ptr::null();
            let loader = ash::ext::debug_utils::Instance::new(&entry, &raw);
            // SAFETY: messenger_info is valid and raw is a live instance.
            match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(handle) => Some(DebugMessenger { handle, loader }),
                Err(e) => {
                    tracing::error!(
                        "Debug messenger creation failed even though the \
                        extension and layer are present, continuing without \
                        one: {e}"
                    );
                    None
                }
            }
        } else {
            None
        };

        let surface_loader =
            have_surface_ext.then(|| ash::khr::surface::Instance::new(&entry, &raw));

        Ok(Instance {
            entry,
            raw,
            messenger,
            surface_loader,
            ver: VkVersion::from_raw(loader_version),
        })
    }

    /// Destroy a raw `VkSurfaceKHR`.
    ///
    /// # Safety
    /// `surf` must come from this instance, everything derived from it must
    /// already be destroyed, and no in-flight GPU work may still touch it.
    /// The handle is dead afterwards.
    pub unsafe fn destroy_raw_surface(
        &self,
        surf: vk::SurfaceKHR,
    ) -> Result<(), DestroyRawSurfaceError> {
        let Some(loader) = &self.surface_loader else {
            return Err(DestroyRawSurfaceError::ExtensionNotLoaded);
        };
        // SAFETY: surf provenance is the caller's promise.
        unsafe { loader.destroy_surface(surf, None) };
        Ok(())
    }

    /// Handles to the available physical devices. Only meaningful while
    /// this instance is alive.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: enumeration has no preconditions on a live instance.
        unsafe { self.raw.enumerate_physical_devices() }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                FetchPhysicalDeviceError::MemoryExhaustion
            }
            other => FetchPhysicalDeviceError::UnknownVulkan(other),
        })
    }

    /// # Safety
    /// `physical_device` must belong to this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: provenance is the caller's promise.
        unsafe { self.raw.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must belong to this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: provenance is the caller's promise.
        unsafe { self.raw.get_physical_device_queue_family_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must belong to this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: provenance is the caller's promise.
        unsafe { self.raw.get_physical_device_memory_properties(physical_device) }
    }

    /// Create a logical device. [`Device::create_compatible`] wraps this
    /// and is what callers normally want.
    ///
    /// [`Device::create_compatible`]: crate::device::Device::create_compatible
    ///
    /// # Safety
    /// `physical_device` must belong to this instance. `create_info` must
    /// be valid, and any handles inside it must also come from this
    /// instance and stay alive for the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: provenance and validity are the caller's promise.
        unsafe { self.raw.create_device(physical_device, create_info, None) }
    }

    /// # Safety
    /// `physical_device` must belong to this instance.
    pub unsafe fn enumerate_raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        // SAFETY: provenance is the caller's promise.
        unsafe { self.raw.enumerate_device_extension_properties(physical_device) }
    }

    /// The API version negotiated with the loader at creation time, which
    /// is not necessarily what the application asked for.
    pub fn supported_ver(&self) -> VkVersion {
        self.ver
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.raw
    }
}

// Surface extension entry points.
impl Instance {
    /// Whether `queue_family` on `physical_device` can present to `surface`.
    ///
    /// # Safety
    /// `physical_device` and `surface` must both belong to this instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        let Some(loader) = &self.surface_loader else {
            return Err(SurfaceSupportError::ExtensionNotLoaded);
        };
        // SAFETY: handle provenance is the caller's promise.
        let supported = unsafe {
            loader.get_physical_device_surface_support(physical_device, queue_family, surface)
        }?;
        Ok(supported)
    }

    /// # Safety
    /// `physical_device` and `surface` must both belong to this instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        let Some(loader) = &self.surface_loader else {
            return Err(SurfaceQueryError::ExtensionNotLoaded);
        };
        // SAFETY: handle provenance is the caller's promise.
        let caps =
            unsafe { loader.get_physical_device_surface_capabilities(physical_device, surface) }?;
        Ok(caps)
    }

    /// # Safety
    /// `physical_device` and `surface` must both belong to this instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        let Some(loader) = &self.surface_loader else {
            return Err(SurfaceQueryError::ExtensionNotLoaded);
        };
        // SAFETY: handle provenance is the caller's promise.
        let formats =
            unsafe { loader.get_physical_device_surface_formats(physical_device, surface) }?;
        Ok(formats)
    }

    /// # Safety
    /// `physical_device` and `surface` must both belong to this instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        let Some(loader) = &self.surface_loader else {
            return Err(SurfaceQueryError::ExtensionNotLoaded);
        };
        // SAFETY: handle provenance is the caller's promise.
        let modes =
            unsafe { loader.get_physical_device_surface_present_modes(physical_device, surface) }?;
        Ok(modes)
    }

    /// Create a raw `VkSurfaceKHR` from a window/display handle source.
    ///
    /// # Safety
    /// The returned surface must be destroyed before `source` is dropped
    /// and whenever the windowing system invalidates it (winit suspend,
    /// say). It belongs to this instance only.
    pub unsafe fn create_raw_surface(
        &self,
        source: &(impl HasDisplayHandle + HasWindowHandle),
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        use CreateSurfaceError as Error;
        if self.surface_loader.is_none() {
            return Err(Error::MissingExtension);
        }
        let display = source.display_handle().map_err(Error::InvalidDisplayHandle)?.as_raw();
        let window = source.window_handle().map_err(Error::InvalidWindowHandle)?.as_raw();
        // SAFETY: lifetime obligations are passed along to our caller, and
        // both the entry and the instance are live.
        unsafe { ash_window::create_surface(&self.entry, &self.raw, display, window, None) }
            .map_err(Error::Vulkan)
    }
}

// Device extension loader constructors. These just assemble function
// tables, the real preconditions sit on the calls made through them.
impl Instance {
    pub fn create_swapchain_loader(&self, device: &ash::Device) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.raw, device)
    }

    pub fn create_synchronization2_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::synchronization2::Device {
        ash::khr::synchronization2::Device::new(&self.raw, device)
    }

    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.messenger
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&self.raw, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_version_component_accessors() {
        let version = VkVersion::new(1, 2, 253, 4090);

        assert_eq!(version.variant(), 1);
        assert_eq!(version.major(), 2);
        assert_eq!(version.minor(), 253);
        assert_eq!(version.patch(), 4090);
    }

    #[test]
    fn vk_version_raw_matches_ash_encoding() {
        let raw = vk::make_api_version(0, 1, 4, 12);
        let parsed = VkVersion::from_raw(raw);

        assert_eq!(parsed.to_raw(), raw);
        assert_eq!(VkVersion::new(0, 1, 4, 12), parsed);
    }

    #[test]
    fn vk_version_ordering_follows_components() {
        assert!(VkVersion::new(0, 1, 3, 0) > VkVersion::new(0, 1, 2, 1023));
        assert!(VkVersion::new(0, 2, 0, 0) > VkVersion::new(0, 1, 127, 4095));
    }
}
