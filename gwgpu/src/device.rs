use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::{
    instance::{FetchPhysicalDeviceError, Instance, VkVersion},
    surface::Surface,
};

enum Sync2Dispatch {
    /// Vulkan 1.3 and later has synchronization2 in core, so calls go
    /// through `ash::Device`.
    Core,
    /// Older Vulkan dispatches through `VK_KHR_synchronization2`.
    Extension(ash::khr::synchronization2::Device),
}

/// Intended residency for a memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// VRAM only. Fastest for the GPU, not mappable.
    GpuOnly,
    /// Written by the CPU, read by the GPU. Staging and per-frame uploads.
    CpuToGpu,
    /// Written by the GPU, read back on the CPU.
    GpuToCpu,
}

/// A logical Vulkan device plus everything scoped to it.
///
/// Bundles the `ash::Device`, a gpu-allocator instance behind a `Mutex`,
/// the swapchain / synchronization2 / debug utils function tables, and the
/// graphics and present queues.
///
/// Built with [`Device::create_compatible`], which walks the physical
/// devices and takes the first one that can render to and present on the
/// given surface. Raw Vulkan entry points are exposed as `unsafe fn`s with
/// a `raw` somewhere in the name.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    raw: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
    swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    sync2: Sync2Dispatch,
    swapchain_counter: AtomicU64,
    physical_device: vk::PhysicalDevice,
    /// When both roles resolve to one `VkQueue` they share a single
    /// `Arc<Mutex<_>>`, so locking either role locks the queue.
    graphics_queue: (Arc<Mutex<vk::Queue>>, u32),
    present_queue: (Arc<Mutex<vk::Queue>>, u32),
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.raw.handle())
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.raw.handle());
        // The allocator has to release its pools before vkDestroyDevice.
        self.allocator = None;
        // SAFETY: we are in drop, so every object derived from this device
        // is already gone.
        unsafe { self.raw.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateCompatibleError {
    #[error("Instance and surface handed to Device::create_compatible do not match")]
    MismatchedObjects,

    #[error("Ran out of host memory while building the device")]
    MemoryExhaustion,

    #[error("Unexpected Vulkan error while building the device: {0}")]
    UnknownVulkan(vk::Result),

    #[error("No Vulkan-capable physical devices present")]
    NoDeviceFound,

    #[error("No physical device can both render to and present on this surface")]
    NoSuitableDevice,

    #[error("Logical device creation failed: {0}")]
    DeviceCreationFailed(vk::Result),

    #[error("Allocator creation failed: {0}")]
    AllocatorCreation(AllocationError),
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Object name has an interior NUL: {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Setting the object name failed: {0}")]
    Vulkan(vk::Result),
}

impl Device {
    /// Build a logical device that can drive `surf`.
    ///
    /// Physical devices are scanned in enumeration order. The first one
    /// with a graphics queue family, a family able to present to `surf`,
    /// `VK_KHR_swapchain`, synchronization2, and a surface reporting at
    /// least one format and present mode wins.
    ///
    /// The name is deliberate: physical devices are not part of the public
    /// surface of this crate, so callers never pick one themselves.
    pub fn create_compatible<T: HasDisplayHandle + HasWindowHandle>(
        instance: &Arc<Instance>,
        surf: &Surface<T>,
    ) -> Result<Self, CreateCompatibleError> {
        if !Arc::ptr_eq(surf.get_parent(), instance) {
            return Err(CreateCompatibleError::MismatchedObjects);
        }

        struct Candidate {
            handle: vk::PhysicalDevice,
            props: vk::PhysicalDeviceProperties,
            graphics_family: u32,
            present_family: u32,
            /// Sync2 has to go through the extension loader on this device.
            sync2_via_ext: bool,
        }

        let physical_devices = instance.fetch_raw_physical_devices()?;
        if physical_devices.is_empty() {
            return Err(CreateCompatibleError::NoDeviceFound);
        }

        fn below_1_3(v: VkVersion) -> bool {
            (v.major(), v.minor()) < (1, 3)
        }

        let instance_api = instance.supported_ver();
        let mut chosen: Option<Candidate> = None;

        for &dev in &physical_devices {
            // SAFETY: dev came out of this instance's enumeration.
            let props = unsafe { instance.get_raw_physical_device_properties(dev) };
            // SAFETY: as above.
            let queue_families =
                unsafe { instance.get_raw_physical_device_queue_family_properties(dev) };
            let name = props.device_name_as_c_str().unwrap_or(c"unknown");

            // The usable feature level is whichever of the instance version
            // and the device's reported version is lower.
            let dev_api = VkVersion::from_raw(props.api_version);
            let capped_below_1_3 = below_1_3(instance_api) || below_1_3(dev_api);

            // SAFETY: dev belongs to this instance.
            let exts = match unsafe { instance.enumerate_raw_device_extension_properties(dev) } {
                Ok(exts) => exts,
                Err(e) => {
                    tracing::debug!("Skipping {name:?}: extension enumeration failed: {e}");
                    continue;
                }
            };
            let supports = |wanted: &CStr| -> bool {
                exts.iter()
                    .any(|ext| ext.extension_name_as_c_str() == Ok(wanted))
            };

            // VK_KHR_swapchain never got promoted to core.
            if !supports(ash::khr::swapchain::NAME) {
                tracing::debug!("Skipping {name:?}: no VK_KHR_swapchain");
                continue;
            }

            // Synchronization2 is core from 1.3. Below that the extension
            // is mandatory.
            let sync2_via_ext = if capped_below_1_3 {
                if !supports(ash::khr::synchronization2::NAME) {
                    tracing::debug!("Skipping {name:?}: no VK_KHR_synchronization2");
                    continue;
                }
                true
            } else {
                false
            };

            // Graphics and present are tracked as separate roles since a
            // family can present without the graphics bit. A later family
            // that qualifies replaces an earlier pick.
            let mut graphics_family = None;
            let mut present_family = None;
            for (idx, family) in queue_families.iter().enumerate() {
                if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    graphics_family = Some(idx as u32);
                }
                // SAFETY: dev and surf share an instance, checked at the
                // top of this function.
                if let Ok(true) = unsafe { surf.supports_queue_family(dev, idx as u32) } {
                    present_family = Some(idx as u32);
                }
            }
            let (Some(graphics_family), Some(present_family)) = (graphics_family, present_family)
            else {
                tracing::debug!("Skipping {name:?}: graphics or present family missing");
                continue;
            };

            // A swapchain needs at least one format and one present mode
            // reported for this device.
            // SAFETY: dev and surf share an instance.
            let has_formats = unsafe { surf.query_formats(dev) }.is_ok_and(|f| !f.is_empty());
            // SAFETY: as above.
            let has_modes =
                unsafe { surf.query_present_modes(dev) }.is_ok_and(|m| !m.is_empty());
            if !has_formats || !has_modes {
                tracing::debug!("Skipping {name:?}: surface reports no formats or modes");
                continue;
            }

            chosen = Some(Candidate {
                handle: dev,
                props,
                graphics_family,
                present_family,
                sync2_via_ext,
            });
            break;
        }

        let chosen = chosen.ok_or(CreateCompatibleError::NoSuitableDevice)?;
        let physical_device = chosen.handle;
        let graphics_family = chosen.graphics_family;
        let present_family = chosen.present_family;

        // SAFETY: physical_device came from this instance.
        let memory_properties =
            unsafe { instance.get_raw_physical_device_memory_properties(physical_device) };

        tracing::info!(
            "Using physical device {:?} ({:?})",
            chosen.props.device_name_as_c_str().unwrap_or(c"unknown"),
            chosen.props.device_type,
        );
        tracing::info!(
            "Queue families: graphics {graphics_family}, present {present_family}",
        );

        // One queue per distinct family, priority 1.0.
        let mut families = vec![graphics_family];
        if present_family != graphics_family {
            families.push(present_family);
        }
        let priority = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priority)
            })
            .collect();

        let mut wanted_exts: Vec<&CStr> = vec![ash::khr::swapchain::NAME];
        if chosen.sync2_via_ext {
            wanted_exts.push(ash::khr::synchronization2::NAME);
        }
        let ext_ptrs: Vec<*const std::ffi::c_char> =
            wanted_exts.iter().map(|e| e.as_ptr()).collect();

        // Synchronization2 gets switched on either way, core or extension.
        let mut sync2_feature =
            vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);

        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&ext_ptrs)
            .push_next(&mut sync2_feature);

        // SAFETY: physical_device belongs to instance and info was fully
        // assembled above.
        let device = unsafe { instance.create_ash_device(physical_device, &info) }
            .map_err(CreateCompatibleError::DeviceCreationFailed)?;

        // SAFETY: the device was created with one queue at index 0 for each
        // family in families.
        let graphics_handle = unsafe { device.get_device_queue(graphics_family, 0) };
        // SAFETY: as above.
        let present_handle = unsafe { device.get_device_queue(present_family, 0) };

        // Same underlying VkQueue means one shared Mutex, so both roles
        // serialize on the same lock.
        let graphics_lock = Arc::new(Mutex::new(graphics_handle));
        let present_lock = if present_handle == graphics_handle {
            Arc::clone(&graphics_lock)
        } else {
            Arc::new(Mutex::new(present_handle))
        };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been created from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(CreateCompatibleError::AllocatorCreation(e));
            }
        };

        Ok(Self {
            parent: instance.clone(),
            allocator: Some(Mutex::new(allocator)),
            memory_properties,
            properties: chosen.props,
            swapchain_loader: instance.create_swapchain_loader(&device),
            debug_utils: instance.create_debug_utils_device_loader(&device),
            sync2: if chosen.sync2_via_ext {
                Sync2Dispatch::Extension(instance.create_synchronization2_loader(&device))
            } else {
                Sync2Dispatch::Core
            },
            swapchain_counter: AtomicU64::new(0),
            raw: device,
            physical_device,
            graphics_queue: (graphics_lock, graphics_family),
            present_queue: (present_lock, present_family),
        })
    }

    pub fn get_parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn get_physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Block until every submission on this device has finished.
    ///
    /// Meant for coarse transitions like shutdown, suspend, and swapchain
    /// teardown, not for anything per-frame.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: the raw device is live while self is, and the call has no
        // pointer parameters.
        unsafe { self.raw.device_wait_idle() }
    }

    /// Block until the graphics queue has drained.
    ///
    /// The one-shot transfer path uses this so the staging buffer can be
    /// reused the moment the copy lands.
    pub fn graphics_queue_wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("graphics_queue_wait_idle").entered();
        let queue = self
            .graphics_queue
            .0
            .lock()
            .expect("poisoned graphics queue lock");
        // SAFETY: the queue came from this device and the lock serializes
        // host access to it.
        unsafe { self.raw.queue_wait_idle(*queue) }
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue.1
    }

    pub fn present_queue_family(&self) -> u32 {
        self.present_queue.1
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }
}

// Memory allocation.
impl Device {
    /// Score a memory type for a usage, `None` meaning incompatible.
    /// Higher scores win.
    fn score_memory_type(flags: vk::MemoryPropertyFlags, usage: MemoryUsage) -> Option<u32> {
        use vk::MemoryPropertyFlags as F;
        let device_local = flags.contains(F::DEVICE_LOCAL);
        let host_visible = flags.contains(F::HOST_VISIBLE);
        let host_cached = flags.contains(F::HOST_CACHED);
        match usage {
            MemoryUsage::GpuOnly => {
                // Pure VRAM beats unified HOST_VISIBLE memory.
                device_local.then_some(if host_visible { 1 } else { 2 })
            }
            MemoryUsage::CpuToGpu => {
                // DEVICE_LOCAL here means ReBAR or unified memory.
                host_visible.then_some(if device_local { 2 } else { 1 })
            }
            MemoryUsage::GpuToCpu => {
                // HOST_CACHED makes the CPU read side cheap.
                host_visible.then_some(if host_cached { 2 } else { 1 })
            }
        }
    }

    /// The best memory type index for `requirements` and `usage`. Ties go
    /// to the lowest index, since Vulkan orders types within a heap from
    /// most to least preferred.
    fn select_memory_type(
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
    ) -> Option<u32> {
        memory_properties.memory_types[..memory_properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .filter(|(i, _)| requirements.memory_type_bits & (1 << i) != 0)
            .filter_map(|(i, ty)| {
                Self::score_memory_type(ty.property_flags, usage).map(|s| (i as u32, s))
            })
            .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
            .map(|(i, _)| i)
    }

    /// Allocate device memory for `requirements`.
    ///
    /// Picks the best memory type for `usage` and narrows
    /// `memory_type_bits` to it. When the picked type is HOST_VISIBLE
    /// without HOST_COHERENT, size and alignment get rounded up to
    /// `nonCoherentAtomSize` so mapped-range flushes stay in bounds.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        use vk::MemoryPropertyFlags as F;

        let requirements =
            match Self::select_memory_type(&self.memory_properties, requirements, usage) {
            Some(type_index) => {
                let type_flags =
                    self.memory_properties.memory_types[type_index as usize].property_flags;
                let needs_atom_rounding =
                    type_flags.contains(F::HOST_VISIBLE) && !type_flags.contains(F::HOST_COHERENT);
                let atom = self.properties.limits.non_coherent_atom_size;
                let (size, alignment) = if needs_atom_rounding {
                    (
                        requirements.size.div_ceil(atom) * atom,
                        requirements.alignment.max(atom),
                    )
                } else {
                    (requirements.size, requirements.alignment)
                };
                vk::MemoryRequirements {
                    size,
                    alignment,
                    memory_type_bits: 1 << type_index,
                }
            }
            None => requirements,
        };

        let location = match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        };
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator only missing during Device::drop")
            .lock()
            .expect("poisoned allocator lock");
        allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
    }

    pub fn free_memory(&self, allocation: Allocation) -> Result<(), AllocationError> {
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator only missing during Device::drop")
            .lock()
            .expect("poisoned allocator lock");
        allocator.free(allocation)
    }
}

// Swapchain entry points.
impl Device {
    /// # Safety
    /// Every handle in `info` must come from this device or its instance,
    /// and every pointer in it must stay live for the call. A non-null
    /// `old_swapchain` must be a live swapchain from this device.
    pub unsafe fn create_raw_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.swapchain_loader.create_swapchain(info, None) }
    }

    /// # Safety
    /// `swapchain` must be a live swapchain from this device.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    /// # Safety
    /// `swapchain` must come from this device, everything derived from it
    /// must already be destroyed, and no submitted work may still touch it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        // SAFETY: upheld by the caller.
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    /// Acquire the next presentable image of `swapchain`.
    ///
    /// Returns `(image_index, suboptimal)`. Suboptimal means the image is
    /// usable but the swapchain no longer matches the surface exactly, so
    /// it should be rebuilt when convenient. `ERROR_OUT_OF_DATE_KHR` means
    /// it must be rebuilt before presenting again.
    ///
    /// # Safety
    /// `swapchain` must be a live swapchain from this device. `semaphore`
    /// and `fence`, where not null, must be unsignaled handles from this
    /// device.
    pub unsafe fn acquire_next_swapchain_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, fence)
        }
    }

    /// Present a rendered image on the present queue.
    ///
    /// `Ok(true)` flags the swapchain as suboptimal, worth rebuilding when
    /// convenient. `ERROR_OUT_OF_DATE_KHR` makes rebuilding mandatory.
    ///
    /// # Safety
    /// Every handle in `present_info` must come from this device. Wait
    /// semaphores must have a signal pending. The image must be in
    /// `PRESENT_SRC_KHR` layout with no GPU work still writing it.
    pub unsafe fn queue_present(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let queue = self
            .present_queue
            .0
            .lock()
            .expect("poisoned present queue lock");
        // SAFETY: upheld by the caller, queue access serialized by the lock.
        unsafe { self.swapchain_loader.queue_present(*queue, present_info) }
    }

    /// # Safety
    /// Handles in `info` must come from this device and pointers in it
    /// must stay live for the call.
    pub unsafe fn create_raw_image_view(
        &self,
        info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_image_view(info, None) }
    }

    /// # Safety
    /// `image_view` must come from this device, with nothing left using
    /// it, submitted GPU work included.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_image_view(image_view, None) };
    }

    pub(crate) fn next_swapchain_debug_index(&self) -> u64 {
        self.swapchain_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// Queue submission.
impl Device {
    /// Submit to the graphics queue through synchronization2.
    ///
    /// # Safety
    /// Every handle in `submits` must come from this device. Command
    /// buffers must be executable, wait semaphores signaled or with a
    /// signal pending, signal semaphores unsignaled, and a non-null
    /// `fence` unsignaled.
    pub unsafe fn graphics_queue_submit2(
        &self,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self
            .graphics_queue
            .0
            .lock()
            .expect("poisoned graphics queue lock");
        match &self.sync2 {
            // SAFETY: upheld by the caller, queue access serialized by the
            // lock.
            Sync2Dispatch::Core => unsafe { self.raw.queue_submit2(*queue, submits, fence) },
            // SAFETY: as above.
            Sync2Dispatch::Extension(loader) => unsafe {
                loader.queue_submit2(*queue, submits, fence)
            },
        }
    }
}

// Render passes and framebuffers.
impl Device {
    /// # Safety
    /// `info` must be a valid render pass description whose pointers stay
    /// live for the call.
    pub unsafe fn create_raw_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_render_pass(info, None) }
    }

    /// # Safety
    /// `render_pass` must come from this device, with every framebuffer
    /// and pipeline built against it already destroyed.
    pub unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_render_pass(render_pass, None) };
    }

    /// # Safety
    /// `info` must reference a render pass and image view attachments from
    /// this device, with pointers live for the call.
    pub unsafe fn create_raw_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_framebuffer(info, None) }
    }

    /// # Safety
    /// `framebuffer` must come from this device with no submitted work
    /// still referencing it.
    pub unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_framebuffer(framebuffer, None) };
    }

    /// Open a render pass instance on `command_buffer`.
    ///
    /// # Safety
    /// `command_buffer` must be recording on this device. `begin_info`
    /// must pair a render pass with a compatible framebuffer, and that
    /// framebuffer's attachments must not be in use by another pending
    /// pass instance.
    pub unsafe fn cmd_begin_raw_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    ) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.raw
                .cmd_begin_render_pass(command_buffer, begin_info, contents)
        }
    }

    /// Close the render pass instance opened with
    /// [`cmd_begin_raw_render_pass`](Self::cmd_begin_raw_render_pass).
    ///
    /// # Safety
    /// `command_buffer` must be recording, inside such an instance.
    pub unsafe fn cmd_end_raw_render_pass(&self, command_buffer: vk::CommandBuffer) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.cmd_end_render_pass(command_buffer) }
    }
}

// Debug names.
impl Device {
    /// Attach a debug name to an object owned by this device.
    ///
    /// Does nothing without `VK_EXT_debug_utils` or with `name: None`.
    ///
    /// # Safety
    /// `object` must be a handle from this device (or a child associated
    /// with it) and stay live for the call.
    pub unsafe fn set_object_name<H>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let Some(debug_utils) = self.debug_utils.as_ref() else {
            return Ok(());
        };
        let Some(name) = name else {
            return Ok(());
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);

        // SAFETY: upheld by the caller.
        unsafe { debug_utils.set_debug_utils_object_name(&name_info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// Attach a debug name produced lazily.
    ///
    /// The closure only runs when `VK_EXT_debug_utils` is enabled, and a
    /// `None` from it means no name.
    ///
    /// # Safety
    /// Same contract as [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_with<H, F>(
        &self,
        object: H,
        name_provider: F,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
        F: FnOnce() -> Option<CString>,
    {
        if self.debug_utils.is_none() {
            return Ok(());
        }

        let name = name_provider();
        // SAFETY: forwarded contract.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }

    /// Attach a debug name given as UTF-8.
    ///
    /// # Safety
    /// Same contract as [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let name = name
            .map(|n| CString::new(n).map_err(NameObjectError::InvalidName))
            .transpose()?;

        // SAFETY: forwarded contract.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }
}

// Shader modules.
impl Device {
    /// # Safety
    /// `info` must hold valid SPIR-V with pointers live for the call.
    pub unsafe fn create_raw_shader_module(
        &self,
        info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_shader_module(info, None) }
    }

    /// # Safety
    /// `shader_module` must come from this device, with everything built
    /// from it already destroyed.
    pub unsafe fn destroy_raw_shader_module(&self, shader_module: vk::ShaderModule) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_shader_module(shader_module, None) };
    }
}

// Pipelines.
impl Device {
    /// # Safety
    /// Descriptor set layouts referenced by `info` must be live handles
    /// from this device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_pipeline_layout(info, None) }
    }

    /// # Safety
    /// `layout` must come from this device and no pipeline still using it
    /// may be in use.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_pipeline_layout(layout, None) };
    }

    /// Create one graphics pipeline.
    ///
    /// ash hands back any pipelines that did get created alongside a batch
    /// error. Those get destroyed here so an error never leaks handles to
    /// the caller.
    ///
    /// # Safety
    /// The stages, layout, render pass, and any pNext structures in `info`
    /// must be live objects of this device, with pointers live for the
    /// call.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe {
            self.raw.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            )
        }
        .map(|mut pipelines| {
            debug_assert_eq!(pipelines.len(), 1);
            pipelines.remove(0)
        })
        .map_err(|(partial, result)| {
            for p in partial {
                if p != vk::Pipeline::null() {
                    // SAFETY: p was created by this device moments ago.
                    unsafe { self.raw.destroy_pipeline(p, None) };
                }
            }
            result
        })
    }

    /// # Safety
    /// `pipeline` must come from this device with no submitted work still
    /// referencing it.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_pipeline(pipeline, None) };
    }
}

// Buffers.
impl Device {
    /// # Safety
    /// `info` must be valid, reference only objects of this device, and
    /// keep its pointers live for the call.
    pub unsafe fn create_raw_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_buffer(info, None) }
    }

    /// # Safety
    /// `buffer` must come from this device with no submitted work still
    /// referencing it.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a live buffer from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must both come from this device, with
    /// `offset` meeting the buffer's reported alignment and size needs.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// Every range must point into mapped memory of this device and meet
    /// Vulkan's flush alignment rules.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.flush_mapped_memory_ranges(memory_ranges) }
    }
}

// Command pools and buffers.
impl Device {
    /// # Safety
    /// `info.queue_family_index` must be a family of this device, with
    /// pointers live for the call.
    pub unsafe fn create_raw_command_pool(
        &self,
        info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_command_pool(info, None) }
    }

    /// # Safety
    /// `pool` must come from this device. Every command buffer out of it
    /// must have finished executing, with nothing pending against it.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `info.command_pool` must be a pool of this device and the count
    /// non-zero.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.allocate_command_buffers(info) }
    }

    /// # Safety
    /// `command_buffer` must be in the initial or executable state, not
    /// pending, and pointers in `begin_info` must stay live for the call.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be recording.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending, and its pool must have been
    /// created with `RESET_COMMAND_BUFFER`.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.reset_command_buffer(command_buffer, flags) }
    }

    /// Return command buffers to their pool's internal allocator.
    ///
    /// Does nothing with an empty slice.
    ///
    /// # Safety
    /// - Everything in `command_buffers` must have been allocated from
    ///   `pool`.
    /// - None of them may be pending on the GPU.
    /// - Access to `pool` must be externally synchronized, meaning no
    ///   concurrent allocation or reset on another thread.
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: upheld by the caller.
        unsafe { self.raw.free_command_buffers(pool, command_buffers) }
    }
}

// Recorded commands.
impl Device {
    /// Bind a graphics pipeline for the draws that follow.
    ///
    /// # Safety
    /// `command_buffer` must be recording and `pipeline` must be a live
    /// graphics pipeline of this device.
    pub unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.raw
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline)
        }
    }

    /// Bind vertex buffers for the draws that follow.
    ///
    /// # Safety
    /// `command_buffer` must be recording, `buffers` and `offsets` must
    /// have equal length, and every buffer must be a live handle of this
    /// device.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.raw
                .cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets)
        }
    }

    /// Record a buffer-to-buffer copy.
    ///
    /// # Safety
    /// `command_buffer` must be recording. Both buffers must be live
    /// handles of this device and every region must sit inside both
    /// without overlap.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.raw
                .cmd_copy_buffer(command_buffer, src_buffer, dst_buffer, regions)
        }
    }

    /// Record a non-indexed draw.
    ///
    /// # Safety
    /// `command_buffer` must be recording inside an open render pass, with
    /// a compatible pipeline bound and the vertex buffers it reads bound.
    pub unsafe fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.raw.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }
}

// Fences and semaphores.
impl Device {
    /// # Safety
    /// Pointers in `info` must stay live for the call.
    pub unsafe fn create_raw_fence(
        &self,
        info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_fence(info, None) }
    }

    /// # Safety
    /// `fence` must come from this device with no GPU work referencing it
    /// at destruction time.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_fence(fence, None) };
    }

    /// # Safety
    /// Every handle in `fences` must be a live fence of this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// Every handle in `fences` must be a live fence of this device with
    /// no submission pending on it.
    pub unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.reset_fences(fences) }
    }

    /// # Safety
    /// Pointers in `info` must stay live for the call.
    pub unsafe fn create_raw_semaphore(
        &self,
        info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.create_semaphore(info, None) }
    }

    /// # Safety
    /// `semaphore` must come from this device with no GPU work waiting on
    /// it or about to signal it.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: upheld by the caller.
        unsafe { self.raw.destroy_semaphore(semaphore, None) };
    }
}

impl From<FetchPhysicalDeviceError> for CreateCompatibleError {
    fn from(value: FetchPhysicalDeviceError) -> Self {
        match value {
            FetchPhysicalDeviceError::MemoryExhaustion => Self::MemoryExhaustion,
            FetchPhysicalDeviceError::UnknownVulkan(e) => Self::UnknownVulkan(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (idx, &flags) in types.iter().enumerate() {
            props.memory_types[idx] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    fn requirements(memory_type_bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 256,
            alignment: 16,
            memory_type_bits,
        }
    }

    #[test]
    fn gpu_only_prefers_pure_vram() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::DEVICE_LOCAL | F::HOST_VISIBLE,
            F::DEVICE_LOCAL,
        ]);
        let picked = Device::select_memory_type(&props, requirements(0b111), MemoryUsage::GpuOnly);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn cpu_to_gpu_prefers_device_local_host_visible() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);
        let picked = Device::select_memory_type(&props, requirements(0b111), MemoryUsage::CpuToGpu);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn type_bits_mask_is_respected() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::DEVICE_LOCAL,
        ]);
        // Only type 0 is allowed even though type 1 scores higher.
        let picked = Device::select_memory_type(&props, requirements(0b01), MemoryUsage::CpuToGpu);
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn incompatible_usage_yields_none() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[F::HOST_VISIBLE | F::HOST_COHERENT]);
        // GpuOnly needs DEVICE_LOCAL and the only type is host memory.
        let picked = Device::select_memory_type(&props, requirements(0b1), MemoryUsage::GpuOnly);
        assert_eq!(picked, None);
    }

    #[test]
    fn equal_scores_pick_lowest_index() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);
        let picked = Device::select_memory_type(&props, requirements(0b11), MemoryUsage::CpuToGpu);
        assert_eq!(picked, Some(0));
    }
}
