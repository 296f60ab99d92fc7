//! Owned `VkSurfaceKHR` wrapper tied to the window that backs it.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HandleError, HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::Instance;

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Display handle unavailable: {0}")]
    InvalidDisplayHandle(HandleError),
    #[error("Window handle unavailable: {0}")]
    InvalidWindowHandle(HandleError),
    #[error("Surface creation failed: {0}")]
    Vulkan(vk::Result),
    #[error("Instance is missing the surface extensions for this platform")]
    MissingExtension,
}

#[derive(Debug, Error)]
pub enum SurfaceSupportError {
    #[error("Surface extension was not loaded")]
    ExtensionNotLoaded,
    #[error("Present support query failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("Surface extension was not loaded")]
    ExtensionNotLoaded,
    #[error("Surface query failed: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for SurfaceSupportError {
    fn from(value: vk::Result) -> Self {
        Self::Vulkan(value)
    }
}

impl From<vk::Result> for SurfaceQueryError {
    fn from(value: vk::Result) -> Self {
        Self::Vulkan(value)
    }
}

/// An owned `VkSurfaceKHR` pinned to the window it came from.
///
/// Holding the handle source behind an `Arc` keeps the native window alive
/// for as long as the surface is, so the platform handles cannot dangle.
pub struct Surface<T: HasDisplayHandle + HasWindowHandle> {
    instance: Arc<Instance>,
    raw: vk::SurfaceKHR,
    source: Arc<T>,
}

struct SurfaceWithSource<'a, T: HasDisplayHandle + HasWindowHandle + std::fmt::Debug>(
    &'a Surface<T>,
);

impl<T: HasDisplayHandle + HasWindowHandle + std::fmt::Debug> std::fmt::Debug
    for SurfaceWithSource<'_, T>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.0.raw)
            .field("parent", &self.0.instance)
            .field("source", &self.0.source)
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Surface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.raw)
            .field("parent", &self.instance)
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Surface<T> {
    /// Create a surface for `source`.
    ///
    /// A single type supplies both the window and the display handle.
    /// winit's `Window` is both, and nothing has needed the two roles split
    /// so far.
    ///
    /// # Safety
    /// The surface must be dropped when the windowing system invalidates it,
    /// which winit's suspend event does implicitly. The caller also ensures
    /// that no in-flight GPU work references anything derived from this
    /// surface when it is destroyed.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        source: Arc<T>,
    ) -> Result<Self, CreateSurfaceError> {
        // SAFETY: both the instance and the source are kept in Arcs stored
        // alongside the handle, so they outlive it.
        let raw = unsafe { instance.create_raw_surface(&source) }?;

        // SAFETY: raw came from instance, against source's handles.
        Ok(unsafe { Self::from_parts(Arc::clone(instance), raw, source) })
    }

    /// # Safety
    /// `handle` must be a surface created from `instance` against the window
    /// and display handles that `source` provides.
    pub unsafe fn from_parts(
        instance: Arc<Instance>,
        handle: vk::SurfaceKHR,
        source: Arc<T>,
    ) -> Self {
        Self {
            instance,
            raw: handle,
            source,
        }
    }

    pub fn get_parent(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn raw_handle(&self) -> vk::SurfaceKHR {
        self.raw
    }

    /// A debug view that also prints the handle source.
    ///
    /// Separate from the base `Debug` impl so that one stays available when
    /// `T` is not `Debug`.
    pub fn debug_with_source(&self) -> impl std::fmt::Debug + '_
    where
        T: std::fmt::Debug,
    {
        SurfaceWithSource(self)
    }

    /// Ask whether `queue_family` on `physical_device` can present to this
    /// surface.
    ///
    /// # Safety
    /// `physical_device` must belong to the same instance as this surface.
    pub unsafe fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool, SurfaceSupportError> {
        // SAFETY: the caller vouches for physical_device, and raw is live.
        unsafe {
            self.instance
                .get_raw_physical_device_surface_support(physical_device, queue_family, self.raw)
        }
    }

    /// Fetch the surface capabilities (extent bounds, image count bounds,
    /// supported transforms) on `physical_device`.
    ///
    /// # Safety
    /// `physical_device` must belong to the same instance as this surface.
    pub unsafe fn query_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        // SAFETY: the caller vouches for physical_device, and raw is live.
        unsafe {
            self.instance
                .get_surface_capabilities(physical_device, self.raw)
        }
    }

    /// Fetch the surface formats supported on `physical_device`.
    ///
    /// # Safety
    /// `physical_device` must belong to the same instance as this surface.
    pub unsafe fn query_formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        // SAFETY: the caller vouches for physical_device, and raw is live.
        unsafe { self.instance.get_surface_formats(physical_device, self.raw) }
    }

    /// Fetch the present modes supported on `physical_device`.
    ///
    /// # Safety
    /// `physical_device` must belong to the same instance as this surface.
    pub unsafe fn query_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        // SAFETY: the caller vouches for physical_device, and raw is live.
        unsafe {
            self.instance
                .get_surface_present_modes(physical_device, self.raw)
        }
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for Surface<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.raw);
        // SAFETY: everything derived from the surface drops first, and the
        // renderer idles the device before tearing down presentation state.
        let _ = unsafe { self.instance.destroy_raw_surface(self.raw) }
            .inspect_err(|e| tracing::error!("Error while dropping surface {:?}: {e}", self.raw));
    }
}
