use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateRenderPassError {
    #[error("Vulkan error creating render pass: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateFramebuffersError {
    #[error("Vulkan error creating framebuffer: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Render pass
// ---------------------------------------------------------------------------

/// A single-subpass render pass drawing into one presentable color
/// attachment.
///
/// The attachment is cleared on load, stored on completion, and transitions
/// from undefined straight to `PRESENT_SRC_KHR`. An external dependency holds
/// color-attachment writes until the presentation engine has released the
/// image at the color-attachment-output stage.
pub struct RenderPass {
    parent: Arc<Device>,
    handle: vk::RenderPass,
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl RenderPass {
    pub fn new(
        device: &Arc<Device>,
        color_format: vk::Format,
        name: Option<&str>,
    ) -> Result<Self, CreateRenderPassError> {
        let color_attachment = vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let color_attachment_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let color_attachment_refs = [color_attachment_ref];
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachment_refs);

        // Acquire semaphores signal at color-attachment-output, so gating the
        // dependency on that stage keeps the attachment untouched until the
        // presentation engine is done with it.
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            );

        let attachments = [color_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        // SAFETY: create_info only references the local arrays above, which
        // outlive the call.
        let handle = unsafe { device.create_raw_render_pass(&create_info) }
            .map_err(CreateRenderPassError::Vulkan)?;

        // SAFETY: handle is a valid render pass created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Could not name render pass {handle:?}: {e}");
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        tracing::debug!("Dropping render pass {:?}", self.handle);
        // SAFETY: handle was created from parent. Framebuffers and pipelines
        // built against this render pass must be dropped before it.
        unsafe { self.parent.destroy_raw_render_pass(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Framebuffers
// ---------------------------------------------------------------------------

/// Create one framebuffer per attachment view, unwinding the framebuffers
/// already created if any creation fails.
///
/// Injected create/destroy/name closures keep this testable without a device.
fn create_raw_framebuffers<FCreate, FDestroy, FName>(
    render_pass: vk::RenderPass,
    image_views: &[vk::ImageView],
    extent: vk::Extent2D,
    mut create_framebuffer: FCreate,
    mut destroy_framebuffer: FDestroy,
    mut name_framebuffer: FName,
) -> Result<Vec<vk::Framebuffer>, CreateFramebuffersError>
where
    FCreate: FnMut(&vk::FramebufferCreateInfo<'_>) -> Result<vk::Framebuffer, vk::Result>,
    FDestroy: FnMut(vk::Framebuffer),
    FName: FnMut(usize, vk::Framebuffer),
{
    let mut framebuffers: Vec<vk::Framebuffer> = Vec::with_capacity(image_views.len());
    for (index, image_view) in image_views.iter().copied().enumerate() {
        let attachments = [image_view];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = match create_framebuffer(&create_info) {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                for created in framebuffers.drain(..) {
                    destroy_framebuffer(created);
                }
                return Err(CreateFramebuffersError::Vulkan(e));
            }
        };

        name_framebuffer(index, framebuffer);
        framebuffers.push(framebuffer);
    }

    Ok(framebuffers)
}

/// One framebuffer per swapchain image view, all sized to the swapchain
/// extent.
///
/// Indexed identically to the image sequence of the swapchain the views came
/// from, so an acquired image index selects its framebuffer directly.
pub struct Framebuffers {
    parent: Arc<Device>,
    handles: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for Framebuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffers")
            .field("handles", &self.handles)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl Framebuffers {
    /// Build one framebuffer per entry in `image_views` against
    /// `render_pass`.
    ///
    /// # Safety
    /// Every view in `image_views` must be a valid image view created from
    /// the same device as `render_pass`, compatible with its color
    /// attachment, and must stay valid for the lifetime of the returned
    /// `Framebuffers`.
    pub unsafe fn new(
        render_pass: &RenderPass,
        image_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self, CreateFramebuffersError> {
        let device = render_pass.get_parent();

        let handles = create_raw_framebuffers(
            render_pass.raw_handle(),
            image_views,
            extent,
            |create_info| {
                // SAFETY: view validity is the caller's promise. The render
                // pass is alive and owned by `device`.
                unsafe { device.create_raw_framebuffer(create_info) }
            },
            |framebuffer| {
                // SAFETY: framebuffer was created by `device` and must be
                // destroyed on early exit.
                unsafe { device.destroy_raw_framebuffer(framebuffer) };
            },
            |index, framebuffer| {
                // SAFETY: framebuffer is valid and created from `device`.
                if let Err(e) = unsafe {
                    device.set_object_name_with(framebuffer, || {
                        std::ffi::CString::new(format!("Framebuffer {}", index + 1)).ok()
                    })
                } {
                    tracing::warn!("Could not name framebuffer {framebuffer:?}: {e}");
                }
            },
        )?;

        Ok(Self {
            parent: Arc::clone(device),
            handles,
            extent,
        })
    }

    /// The framebuffer for the swapchain image at `image_index`.
    ///
    /// Returns `None` if `image_index` is out of range, which indicates the
    /// framebuffers were built for a different (stale) swapchain.
    pub fn get(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.handles.get(image_index as usize).copied()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        tracing::debug!("Dropping {} framebuffers", self.handles.len());
        // NOTE: Callers must ensure no in-flight GPU work references these
        // framebuffers before drop.
        for framebuffer in self.handles.drain(..) {
            // SAFETY: framebuffer was created from parent and this is the
            // final destruction path for this wrapper.
            unsafe { self.parent.destroy_raw_framebuffer(framebuffer) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn framebuffer_helper_cleans_up_on_partial_failure() {
        let image_views = [
            vk::ImageView::from_raw(1),
            vk::ImageView::from_raw(2),
            vk::ImageView::from_raw(3),
        ];
        let created = [vk::Framebuffer::from_raw(20), vk::Framebuffer::from_raw(21)];
        let create_calls = RefCell::new(0usize);
        let destroyed = RefCell::new(Vec::<vk::Framebuffer>::new());

        let result = create_raw_framebuffers(
            vk::RenderPass::from_raw(7),
            &image_views,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            |_| {
                let mut call = create_calls.borrow_mut();
                let ret = match *call {
                    0 => Ok(created[0]),
                    1 => Ok(created[1]),
                    _ => Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
                };
                *call += 1;
                ret
            },
            |framebuffer| destroyed.borrow_mut().push(framebuffer),
            |_index, _framebuffer| {},
        );

        assert!(matches!(
            result,
            Err(CreateFramebuffersError::Vulkan(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            ))
        ));
        assert_eq!(destroyed.borrow().as_slice(), &created);
    }

    #[test]
    fn framebuffer_helper_sizes_create_info_to_extent() {
        let image_views = [vk::ImageView::from_raw(1)];
        let recorded = RefCell::new((0u32, 0u32));

        create_raw_framebuffers(
            vk::RenderPass::from_raw(7),
            &image_views,
            vk::Extent2D {
                width: 1024,
                height: 768,
            },
            |create_info| {
                *recorded.borrow_mut() = (create_info.width, create_info.height);
                Ok(vk::Framebuffer::from_raw(30))
            },
            |_framebuffer| panic!("destroy callback should not be called on success"),
            |_index, _framebuffer| {},
        )
        .expect("helper should succeed");

        assert_eq!(*recorded.borrow(), (1024, 768));
    }

    #[test]
    fn framebuffer_helper_returns_one_per_view() {
        let image_views = [vk::ImageView::from_raw(1), vk::ImageView::from_raw(2)];
        let handles = [vk::Framebuffer::from_raw(40), vk::Framebuffer::from_raw(41)];
        let create_calls = RefCell::new(0usize);

        let result = create_raw_framebuffers(
            vk::RenderPass::from_raw(7),
            &image_views,
            vk::Extent2D {
                width: 640,
                height: 480,
            },
            |_| {
                let mut call = create_calls.borrow_mut();
                let framebuffer = handles[*call];
                *call += 1;
                Ok(framebuffer)
            },
            |_framebuffer| panic!("destroy callback should not be called on success"),
            |_index, _framebuffer| {},
        )
        .expect("helper should succeed");

        assert_eq!(result, handles);
    }
}
