use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::device::Device;
use crate::surface::{Surface, SurfaceQueryError};

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error("Device, surface, and old swapchain must share one instance")]
    MismatchedObjects,

    #[error("Surface reported no formats")]
    NoSurfaceFormats,

    #[error("Surface reported no present modes")]
    NoPresentModes,

    #[error("Unusable swapchain extent {width}x{height}")]
    InvalidExtent { width: u32, height: u32 },

    #[error("Surface support query failed: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("Swapchain creation failed: {0}")]
    Swapchain(vk::Result),

    #[error("Fetching swapchain images failed: {0}")]
    Images(vk::Result),

    #[error("Swapchain image view creation failed: {0}")]
    ImageView(vk::Result),
}

/// `B8G8R8A8_UNORM` with sRGB non-linear when offered, else whatever the
/// surface lists first.
fn pick_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    available
        .iter()
        .copied()
        .find(|candidate| {
            candidate.format == vk::Format::B8G8R8A8_UNORM
                && candidate.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(available[0])
}

/// Mailbox when offered, for low latency without tearing. FIFO otherwise,
/// the one mode every implementation must support.
fn pick_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's `current_extent` wins when defined. The `u32::MAX` sentinel
/// means the swapchain picks, so clamp the request to the advertised bounds.
fn pick_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One above the minimum so acquire rarely waits on the driver. A zero
/// maximum means unbounded, anything else clamps.
fn pick_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count.saturating_add(1);
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

fn pick_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    use vk::CompositeAlphaFlagsKHR as Alpha;
    for mode in [Alpha::OPAQUE, Alpha::PRE_MULTIPLIED, Alpha::POST_MULTIPLIED] {
        if caps.supported_composite_alpha.contains(mode) {
            return mode;
        }
    }
    Alpha::INHERIT
}

/// Make one 2D color view per swapchain image. If any creation fails, the
/// views made so far are destroyed before the error comes back.
///
/// The injected closures stand in for the device, which keeps the unwind
/// logic testable on its own.
fn build_image_views<FMake, FDrop, FLabel>(
    images: &[vk::Image],
    format: vk::Format,
    mut make_view: FMake,
    mut drop_view: FDrop,
    mut label_view: FLabel,
) -> Result<Vec<vk::ImageView>, CreateSwapchainError>
where
    FMake: FnMut(&vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView, vk::Result>,
    FDrop: FnMut(vk::ImageView),
    FLabel: FnMut(usize, vk::ImageView),
{
    let mut views: Vec<vk::ImageView> = Vec::with_capacity(images.len());
    for (i, image) in images.iter().copied().enumerate() {
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(range);

        match make_view(&info) {
            Ok(view) => {
                label_view(i, view);
                views.push(view);
            }
            Err(e) => {
                while let Some(view) = views.pop() {
                    drop_view(view);
                }
                return Err(CreateSwapchainError::ImageView(e));
            }
        }
    }

    Ok(views)
}

/// An owned `VkSwapchainKHR` plus its presentable images and one color view
/// per image.
pub struct Swapchain<T: HasDisplayHandle + HasWindowHandle> {
    device: Arc<Device>,
    surface: Arc<Surface<T>>,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    /// `vkAcquireNextImageKHR` requires external synchronization on the
    /// swapchain handle. Host-side calls are serialized here.
    acquire_lock: Mutex<()>,
}

struct SwapchainWithSource<'a, T: HasDisplayHandle + HasWindowHandle + std::fmt::Debug>(
    &'a Swapchain<T>,
);

impl<T: HasDisplayHandle + HasWindowHandle + std::fmt::Debug> std::fmt::Debug
    for SwapchainWithSource<'_, T>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.0.handle)
            .field("format", &self.0.format)
            .field("extent", &self.0.extent)
            .field("image_count", &self.0.images.len())
            .field("surface", &self.0.surface.debug_with_source())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Swapchain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Swapchain<T> {
    /// Create a swapchain with no predecessor.
    ///
    /// Resize and recreation paths should go through
    /// [`new_with_old`](Self::new_with_old) instead, which lets the driver
    /// scavenge the retired chain.
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        requested_extent: vk::Extent2D,
    ) -> Result<Self, CreateSwapchainError> {
        Self::new_with_old(device, surface, requested_extent, None)
    }

    /// A debug view that also prints the surface's handle source when
    /// `T: Debug`.
    pub fn debug_with_source(&self) -> impl std::fmt::Debug + '_
    where
        T: std::fmt::Debug,
    {
        SwapchainWithSource(self)
    }

    /// Create a swapchain, optionally retiring a predecessor into it.
    ///
    /// `old` must come from the same `device` and `surface` when given.
    /// GPU-side synchronization around retiring the old chain is the
    /// caller's job.
    pub fn new_with_old(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        requested_extent: vk::Extent2D,
        old: Option<&Self>,
    ) -> Result<Self, CreateSwapchainError> {
        use CreateSwapchainError as Error;

        if requested_extent.width == 0 || requested_extent.height == 0 {
            return Err(Error::InvalidExtent {
                width: requested_extent.width,
                height: requested_extent.height,
            });
        }

        if !Arc::ptr_eq(surface.get_parent(), device.get_parent()) {
            return Err(Error::MismatchedObjects);
        }

        if let Some(old) = old
            && (!Arc::ptr_eq(&old.device, device) || !Arc::ptr_eq(&old.surface, surface))
        {
            return Err(Error::MismatchedObjects);
        }

        let phys = device.get_physical_device();

        // SAFETY: phys belongs to device's instance and surface shares that
        // instance per the checks above.
        let caps = unsafe { surface.query_capabilities(phys) }?;
        // SAFETY: as above.
        let formats = unsafe { surface.query_formats(phys) }?;
        // SAFETY: as above.
        let modes = unsafe { surface.query_present_modes(phys) }?;

        if formats.is_empty() {
            return Err(Error::NoSurfaceFormats);
        }
        if modes.is_empty() {
            return Err(Error::NoPresentModes);
        }

        let format = pick_surface_format(&formats);
        let present_mode = pick_present_mode(&modes);
        let extent = pick_extent(&caps, requested_extent);
        let min_images = pick_image_count(&caps);
        let alpha = pick_composite_alpha(&caps);

        // Separate graphics and present families need the images shareable
        // across both. A single family keeps exclusive ownership and passes
        // no family list.
        let families = [
            device.graphics_queue_family(),
            device.present_queue_family(),
        ];
        let (sharing, family_list): (vk::SharingMode, &[u32]) = if families[0] == families[1] {
            (vk::SharingMode::EXCLUSIVE, &[])
        } else {
            (vk::SharingMode::CONCURRENT, &families)
        };

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw_handle())
            .min_image_count(min_images)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .queue_family_indices(family_list)
            .pre_transform(caps.current_transform)
            .composite_alpha(alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.handle));

        // SAFETY: info references live handles and values taken straight
        // from the surface queries above.
        let handle = unsafe { device.create_raw_swapchain(&info) }.map_err(Error::Swapchain)?;
        let chain_index = device.next_swapchain_debug_index();

        // Failures past this point must not leak the new swapchain.
        let drop_swapchain = || {
            // SAFETY: handle was created above and nothing else has seen it.
            unsafe { device.destroy_raw_swapchain(handle) };
        };

        // SAFETY: handle came from device.
        if let Err(e) = unsafe {
            device.set_object_name_with(handle, || {
                std::ffi::CString::new(format!("Swapchain {chain_index}")).ok()
            })
        } {
            tracing::warn!("Could not name swapchain {:?}: {e}", handle);
        }

        // SAFETY: handle is a live swapchain from this device's loader.
        let images = match unsafe { device.get_raw_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                drop_swapchain();
                return Err(Error::Images(e));
            }
        };

        for (i, image) in images.iter().copied().enumerate() {
            // SAFETY: image belongs to the swapchain just created.
            if let Err(e) = unsafe {
                device.set_object_name_with(image, || {
                    std::ffi::CString::new(format!("Swapchain {chain_index} Image {}", i + 1)).ok()
                })
            } {
                tracing::warn!("Could not name swapchain image {:?}: {e}", image);
            }
        }

        let views = build_image_views(
            &images,
            format.format,
            |info| {
                // SAFETY: info references a live image of this swapchain
                // with a plain 2D color range.
                unsafe { device.create_raw_image_view(info) }
            },
            |view| {
                // SAFETY: view was created from device moments ago.
                unsafe { device.destroy_raw_image_view(view) };
            },
            |i, view| {
                // SAFETY: view came from device.
                if let Err(e) = unsafe {
                    device.set_object_name_with(view, || {
                        std::ffi::CString::new(format!(
                            "Swapchain {chain_index} ImageView {}",
                            i + 1,
                        ))
                        .ok()
                    })
                } {
                    tracing::warn!("Could not name swapchain image view {:?}: {e}", view);
                }
            },
        );
        let views = match views {
            Ok(views) => views,
            Err(e) => {
                drop_swapchain();
                return Err(e);
            }
        };

        // SAFETY: every handle here was created from device, and surface
        // shares its instance.
        Ok(unsafe {
            Self::from_parts(
                Arc::clone(device),
                Arc::clone(surface),
                handle,
                format.format,
                extent,
                images,
                views,
            )
        })
    }

    /// # Safety
    /// `handle`, `images`, and `image_views` must all be live resources of
    /// `device`, with one view per image in matching order. `surface` must
    /// share `device`'s instance.
    pub unsafe fn from_parts(
        device: Arc<Device>,
        surface: Arc<Surface<T>>,
        handle: vk::SwapchainKHR,
        format: vk::Format,
        extent: vk::Extent2D,
        images: Vec<vk::Image>,
        image_views: Vec<vk::ImageView>,
    ) -> Self {
        Self {
            device,
            surface,
            handle,
            format,
            extent,
            images,
            image_views,
            acquire_lock: Mutex::new(()),
        }
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.device
    }

    /// Hand out the next presentable image index.
    ///
    /// Takes `&self` because the swapchain is shared through `Arc`. The
    /// Vulkan-side effect, dequeuing an image, is serialized by an internal
    /// lock.
    ///
    /// Returns `(image_index, suboptimal)`. Suboptimal means the image is
    /// usable but the swapchain should be rebuilt soon. An
    /// `ERROR_OUT_OF_DATE_KHR` error means it must be rebuilt before any
    /// further presentation.
    ///
    /// # Safety
    /// `semaphore` and `fence`, where not null, must be unsignaled handles
    /// from this swapchain's device.
    pub unsafe fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        let _guard = self
            .acquire_lock
            .lock()
            .expect("acquire lock held by panicked thread");
        // SAFETY: handle lives as long as self, and the caller vouches for
        // the sync objects.
        unsafe {
            self.device
                .acquire_next_swapchain_image(self.handle, timeout_ns, semaphore, fence)
        }
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for Swapchain<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        // Owners wait for the GPU (fences or a device idle) before letting
        // a swapchain go, so nothing in flight references these.
        while let Some(view) = self.image_views.pop() {
            // SAFETY: view belongs to this swapchain on this device.
            unsafe { self.device.destroy_raw_image_view(view) };
        }
        // SAFETY: the wrapper owns the handle and every view is gone. The
        // images die with the swapchain itself.
        unsafe { self.device.destroy_raw_swapchain(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn bgra_srgb_wins_when_listed() {
        let other = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let wanted = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let picked = pick_surface_format(&[other, other, wanted]);
        assert_eq!(picked.format, wanted.format);
        assert_eq!(picked.color_space, wanted.color_space);
    }

    #[test]
    fn first_format_wins_without_bgra_srgb() {
        let first = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let second = vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };

        let picked = pick_surface_format(&[first, second]);
        assert_eq!(picked.format, first.format);
    }

    #[test]
    fn mailbox_wins_when_offered() {
        let picked = pick_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]);
        assert_eq!(picked, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn fifo_without_mailbox() {
        let picked = pick_present_mode(&[vk::PresentModeKHR::IMMEDIATE]);
        assert_eq!(picked, vk::PresentModeKHR::FIFO);
    }

    fn caps_with_bounds(current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: current,
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 2048,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn current_extent_wins_when_defined() {
        let caps = caps_with_bounds(vk::Extent2D {
            width: 640,
            height: 480,
        });

        let picked = pick_extent(
            &caps,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );

        assert_eq!((picked.width, picked.height), (640, 480));
    }

    #[test]
    fn sentinel_extent_clamps_to_bounds() {
        let caps = caps_with_bounds(vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        });

        let tiny = pick_extent(
            &caps,
            vk::Extent2D {
                width: 8,
                height: 8,
            },
        );
        assert_eq!((tiny.width, tiny.height), (64, 64));

        let huge = pick_extent(
            &caps,
            vk::Extent2D {
                width: 9000,
                height: 9000,
            },
        );
        assert_eq!((huge.width, huge.height), (2048, 2048));
    }

    #[test]
    fn image_count_respects_maximum() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };

        assert_eq!(pick_image_count(&caps), 3);
    }

    #[test]
    fn image_count_with_unbounded_maximum() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };

        assert_eq!(pick_image_count(&caps), 3);
    }

    #[test]
    fn opaque_alpha_wins_when_supported() {
        let caps = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
                | vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        };

        assert_eq!(
            pick_composite_alpha(&caps),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
    }

    #[test]
    fn inherit_alpha_as_last_resort() {
        let caps = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::INHERIT,
            ..Default::default()
        };

        assert_eq!(
            pick_composite_alpha(&caps),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn failed_view_creation_unwinds_earlier_views() {
        let images = [
            vk::Image::from_raw(0xA1),
            vk::Image::from_raw(0xA2),
            vk::Image::from_raw(0xA3),
        ];
        let first_view = vk::ImageView::from_raw(0xB1);
        let makes = RefCell::new(0usize);
        let dropped = RefCell::new(Vec::<vk::ImageView>::new());

        let result = build_image_views(
            &images,
            vk::Format::B8G8R8A8_UNORM,
            |_| {
                let mut n = makes.borrow_mut();
                let out = if *n == 0 {
                    Ok(first_view)
                } else {
                    Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
                };
                *n += 1;
                out
            },
            |view| dropped.borrow_mut().push(view),
            |_, _| {},
        );

        assert!(matches!(
            result,
            Err(CreateSwapchainError::ImageView(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            ))
        ));
        assert_eq!(dropped.borrow().as_slice(), &[first_view]);
    }

    #[test]
    fn view_builder_labels_every_view() {
        let images = [vk::Image::from_raw(0xC1), vk::Image::from_raw(0xC2)];
        let out_views = [vk::ImageView::from_raw(0xD1), vk::ImageView::from_raw(0xD2)];
        let makes = RefCell::new(0usize);
        let labels = RefCell::new(0usize);

        let built = build_image_views(
            &images,
            vk::Format::B8G8R8A8_UNORM,
            |_| {
                let mut n = makes.borrow_mut();
                let view = out_views[*n];
                *n += 1;
                Ok(view)
            },
            |_| panic!("nothing should be destroyed on the success path"),
            |_, _| {
                *labels.borrow_mut() += 1;
            },
        )
        .expect("view creation succeeds");

        assert_eq!(built, out_views);
        assert_eq!(*labels.borrow(), 2);
    }
}
