//! The renderer composite: one of each gwgpu building block, wired into the
//! per-frame acquire/record/submit/present cycle and the swapchain rebuild
//! path that keeps the whole bundle consistent across resizes.

use std::sync::Arc;

use gwgpu::ash::vk;
use gwgpu::buffer::CreateBufferError;
use gwgpu::command::{
    AllocateCommandBufferError, CreateCommandPoolError, ResettableCommandBuffer,
    ResettableCommandPool, TransientCommandPool,
};
use gwgpu::device::Device;
use gwgpu::frame::{
    AcquireOutcome, CreateFrameSchedulerError, FrameScheduler, SubmitFrameError,
    recreate_required,
};
use gwgpu::pipeline::{CreateRenderTargetsError, RenderTargets, RenderTargetsDesc};
use gwgpu::surface::Surface;
use gwgpu::swapchain::{CreateSwapchainError, Swapchain};
use gwgpu::sync::WaitFenceError;
use gwgpu::vertex::{GrowableVertexBuffer, UploadVerticesError, Vertex};
use thiserror::Error;
use winit::window::Window as WinitWindow;

use crate::shaders;

#[derive(Debug, Error)]
pub enum CreateRendererError {
    #[error("Failed to create swapchain: {0}")]
    Swapchain(#[from] CreateSwapchainError),

    #[error("Failed to create render targets: {0}")]
    RenderTargets(#[from] CreateRenderTargetsError),

    #[error("Failed to create the vertex store: {0}")]
    VertexStore(#[from] CreateBufferError),

    #[error("Failed to create a command pool: {0}")]
    CommandPool(#[from] CreateCommandPoolError),

    #[error("Failed to allocate frame command buffers: {0}")]
    CommandBuffers(#[from] AllocateCommandBufferError),

    #[error("Failed to create the frame scheduler: {0}")]
    Scheduler(#[from] CreateFrameSchedulerError),
}

#[derive(Debug, Error)]
pub enum RecreateError {
    #[error("Vulkan error waiting for device idle before the rebuild: {0}")]
    WaitIdle(vk::Result),

    #[error("Failed to recreate swapchain: {0}")]
    Swapchain(#[from] CreateSwapchainError),

    #[error("Failed to recreate render targets: {0}")]
    RenderTargets(#[from] CreateRenderTargetsError),

    #[error("Failed to reallocate frame command buffers: {0}")]
    CommandBuffers(#[from] AllocateCommandBufferError),
}

#[derive(Debug, Error)]
pub enum RecordCommandsError {
    #[error("No command buffer or framebuffer for image index {image_index}")]
    UnknownImage { image_index: u32 },

    #[error("Vulkan error resetting the frame command buffer: {0}")]
    Reset(vk::Result),

    #[error("Vulkan error beginning the frame command buffer: {0}")]
    Begin(vk::Result),

    #[error("Vulkan error ending the frame command buffer: {0}")]
    End(vk::Result),
}

#[derive(Debug, Error)]
pub enum DrawFrameError {
    #[error("Failed to wait for a frame fence: {0}")]
    FenceWait(#[from] WaitFenceError),

    #[error("Vulkan error acquiring a swapchain image: {0}")]
    Acquire(vk::Result),

    #[error("Failed to upload vertices: {0}")]
    Upload(#[from] UploadVerticesError),

    #[error("Failed to record frame commands: {0}")]
    Record(#[from] RecordCommandsError),

    #[error("Failed to submit the frame: {0}")]
    Submit(#[from] SubmitFrameError),

    #[error("Vulkan error presenting a swapchain image: {0}")]
    Present(vk::Result),

    #[error("Failed to rebuild the swapchain: {0}")]
    Recreate(#[from] RecreateError),
}

/// Everything needed to draw a frame, rebuilt together when the surface
/// invalidates.
///
/// Field order is drop order, the reverse of construction: the scheduler's
/// sync objects go first, the swapchain and surface last.
pub struct Renderer {
    resize_pending: bool,
    scheduler: FrameScheduler,
    /// One resettable command buffer per swapchain image, indexed by image
    /// index. Re-recorded every frame.
    frame_commands: Vec<ResettableCommandBuffer>,
    graphics_pool: ResettableCommandPool,
    transfer_pool: TransientCommandPool,
    vertex_store: GrowableVertexBuffer,
    targets: RenderTargets,
    swapchain: Swapchain<WinitWindow>,
    surface: Arc<Surface<WinitWindow>>,
    device: Arc<Device>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("extent", &self.swapchain.extent())
            .field("image_count", &self.swapchain.image_count())
            .field("vertex_capacity", &self.vertex_store.capacity())
            .field("vertex_used", &self.vertex_store.used_size())
            .field("resize_pending", &self.resize_pending)
            .finish_non_exhaustive()
    }
}

impl Renderer {
    /// Build the full per-surface stack for a non-zero `drawable` extent.
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<WinitWindow>>,
        drawable: vk::Extent2D,
    ) -> Result<Self, CreateRendererError> {
        let swapchain = Swapchain::new(device, surface, drawable)?;
        let targets = build_render_targets(device, &swapchain)?;
        let vertex_store = GrowableVertexBuffer::new(device)?;
        let graphics_pool = ResettableCommandPool::new(
            device,
            device.graphics_queue_family(),
            Some("Frame Command Pool"),
        )?;
        // The graphics queue is transfer-capable, so staging copies go
        // through it rather than a dedicated transfer queue.
        let transfer_pool = TransientCommandPool::new(
            device,
            device.graphics_queue_family(),
            Some("Upload Command Pool"),
        )?;
        let frame_commands = allocate_frame_commands(&graphics_pool, swapchain.image_count())?;
        let scheduler = FrameScheduler::new(device, swapchain.image_count())?;

        Ok(Self {
            resize_pending: false,
            scheduler,
            frame_commands,
            graphics_pool,
            transfer_pool,
            vertex_store,
            targets,
            swapchain,
            surface: Arc::clone(surface),
            device: Arc::clone(device),
        })
    }

    /// Note that the window was resized. The rebuild itself is deferred to
    /// the end of the next presented frame.
    pub fn note_resize(&mut self) {
        self.resize_pending = true;
    }

    /// Upload this frame's vertices and run one full frame cycle.
    ///
    /// `drawable` is the window's current drawable size; it is only used
    /// when the cycle decides the swapchain must be rebuilt. A zero-sized
    /// drawable never fails: the frame (or the rebuild) is skipped and
    /// retried once the window has area again.
    pub fn draw_frame(
        &mut self,
        drawable: vk::Extent2D,
        vertices: &[Vertex],
    ) -> Result<(), DrawFrameError> {
        let upload = self.vertex_store.upload(&self.transfer_pool, vertices)?;
        if upload.reallocated {
            // Fine without further handling: commands are re-recorded below
            // and pick up the replacement buffer handle.
            tracing::trace!("Vertex store grew to {} bytes", self.vertex_store.capacity());
        }

        self.scheduler.wait_for_slot()?;

        // SAFETY: one acquire per slot cycle; the matching submit (or the
        // abandon branch) runs below before this slot acquires again.
        let acquired = unsafe { self.scheduler.acquire_image(&self.swapchain) }
            .map_err(DrawFrameError::Acquire)?;
        let (image_index, acquire_suboptimal) = match acquired {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                tracing::debug!("Swapchain out of date at acquire; rebuilding");
                self.recreate(drawable)?;
                self.scheduler.advance();
                return Ok(());
            }
        };

        self.scheduler.claim_image(image_index)?;

        self.record_frame_commands(image_index)?;

        // SAFETY: the buffer was just recorded to the executable state and
        // only binds resources owned by self, which stay alive until the
        // slot fence signals (enforced by wait_for_slot and the device-idle
        // wait in recreate).
        unsafe { self.scheduler.submit(&self.frame_commands[image_index as usize]) }?;

        // SAFETY: submit succeeded, so render-finished has a pending signal
        // for this slot, and image_index is this frame's acquired image.
        let outcome = unsafe { self.scheduler.present(&self.swapchain, image_index) }
            .map_err(DrawFrameError::Present)?;

        if recreate_required(outcome, acquire_suboptimal, self.resize_pending) {
            tracing::debug!(
                ?outcome,
                acquire_suboptimal,
                resize_pending = self.resize_pending,
                "Rebuilding swapchain after present"
            );
            self.recreate(drawable)?;
        }

        self.scheduler.advance();
        Ok(())
    }

    /// Rebuild the swapchain-derived half of the renderer at `drawable`.
    ///
    /// With a zero-sized drawable the rebuild is deferred: the resize stays
    /// pending and the next frame with a real drawable size lands here
    /// again.
    fn recreate(&mut self, drawable: vk::Extent2D) -> Result<(), RecreateError> {
        if drawable.width == 0 || drawable.height == 0 {
            tracing::trace!(
                "Deferring swapchain rebuild while the drawable is zero-sized: {}x{}",
                drawable.width,
                drawable.height
            );
            self.resize_pending = true;
            return Ok(());
        }

        let rebuild_span = tracing::trace_span!(
            "swapchain_rebuild",
            width = drawable.width,
            height = drawable.height
        )
        .entered();

        self.device.wait_idle().map_err(RecreateError::WaitIdle)?;

        // New chain first so it can link the old handle, then targets from
        // the new views. Targets are assigned before the swapchain so the
        // old framebuffers are destroyed before the views they reference.
        let swapchain = Swapchain::new_with_old(
            &self.device,
            &self.surface,
            drawable,
            Some(&self.swapchain),
        )?;
        let targets = build_render_targets(&self.device, &swapchain)?;
        self.targets = targets;
        self.swapchain = swapchain;

        if self.frame_commands.len() != self.swapchain.image_count() {
            tracing::debug!(
                "Image count changed from {} to {}; reallocating frame command buffers",
                self.frame_commands.len(),
                self.swapchain.image_count()
            );
            // Clear first so the dropped buffers can be recycled by the
            // allocations below.
            self.frame_commands.clear();
            self.frame_commands =
                allocate_frame_commands(&self.graphics_pool, self.swapchain.image_count())?;
        }

        self.scheduler.reset_image_owners(self.swapchain.image_count());
        self.resize_pending = false;

        drop(rebuild_span);
        Ok(())
    }

    /// Record the draw sequence for `image_index`: clear to opaque black,
    /// bind the pipeline and vertex buffer, draw the store's current vertex
    /// count.
    fn record_frame_commands(&mut self, image_index: u32) -> Result<(), RecordCommandsError> {
        let framebuffer = self
            .targets
            .framebuffers()
            .get(image_index)
            .ok_or(RecordCommandsError::UnknownImage { image_index })?;
        let command_buffer = self
            .frame_commands
            .get_mut(image_index as usize)
            .ok_or(RecordCommandsError::UnknownImage { image_index })?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.targets.render_pass().raw_handle())
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.targets.extent(),
            })
            .clear_values(&clear_values);

        // SAFETY: the buffer is not pending execution, since the image's
        // previous frame was waited out by the scheduler's image fence
        // guard. Every bound handle lives in self and outlives this frame's
        // submission.
        unsafe {
            command_buffer.reset().map_err(RecordCommandsError::Reset)?;
            command_buffer.begin().map_err(RecordCommandsError::Begin)?;
            command_buffer.begin_render_pass(&begin_info);
            command_buffer.bind_graphics_pipeline(self.targets.pipeline().raw_handle());
            command_buffer.bind_vertex_buffer(0, &self.vertex_store, 0);
            command_buffer.draw(self.vertex_store.vertex_count(), 1, 0, 0);
            command_buffer.end_render_pass();
            command_buffer.end().map_err(RecordCommandsError::End)?;
        }
        Ok(())
    }
}

fn build_render_targets(
    device: &Arc<Device>,
    swapchain: &Swapchain<WinitWindow>,
) -> Result<RenderTargets, CreateRenderTargetsError> {
    let vertex_bindings = [Vertex::binding_description()];
    let vertex_attributes = Vertex::attribute_descriptions();
    let desc = RenderTargetsDesc {
        color_format: swapchain.format(),
        extent: swapchain.extent(),
        image_views: swapchain.image_views(),
        vertex_spirv: shaders::TRIANGLE_VERT,
        fragment_spirv: shaders::TRIANGLE_FRAG,
        vertex_bindings: &vertex_bindings,
        vertex_attributes: &vertex_attributes,
    };
    // SAFETY: the views belong to `swapchain` and were created from
    // `device` with `color_format`. The renderer keeps the swapchain alive
    // at least as long as the returned targets.
    unsafe { RenderTargets::new(device, &desc) }
}

fn allocate_frame_commands(
    pool: &ResettableCommandPool,
    count: usize,
) -> Result<Vec<ResettableCommandBuffer>, AllocateCommandBufferError> {
    (0..count).map(|_| pool.allocate_command_buffer()).collect()
}
