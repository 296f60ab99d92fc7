use std::{
    marker::PhantomData,
    sync::{Arc, mpsc},
};

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::device::Device;

/// Anything that can hand out a raw `vk::CommandBuffer` to record into.
pub trait CommandBufferHandle {
    fn raw_command_buffer(&self) -> vk::CommandBuffer;
}

impl<T: CommandBufferHandle + ?Sized> CommandBufferHandle for &T {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        (**self).raw_command_buffer()
    }
}

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Command pool creation failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Command buffer allocation failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum OneShotCommandError {
    #[error("One-shot command buffer allocation failed: {0}")]
    Allocate(vk::Result),

    #[error("One-shot command buffer begin failed: {0}")]
    Begin(vk::Result),

    #[error("One-shot command buffer end failed: {0}")]
    End(vk::Result),

    #[error("One-shot submission failed: {0}")]
    Submit(vk::Result),

    #[error("Graphics queue wait after one-shot submission failed: {0}")]
    WaitIdle(vk::Result),
}

/// Allocate exactly one primary command buffer from `pool`.
///
/// # Safety
/// `pool` must be a live pool of `device`, with no other thread touching
/// it during the call.
unsafe fn allocate_one(
    device: &Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer, vk::Result> {
    let info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    // SAFETY: upheld by the caller.
    let mut bufs = unsafe { device.allocate_raw_command_buffers(&info) }?;
    debug_assert_eq!(bufs.len(), 1);
    Ok(bufs.remove(0))
}

/// Pool handle co-owned by [`ResettableCommandPool`] and every buffer it
/// hands out.
///
/// The raw pool outlives whichever side drops last, so a live
/// [`ResettableCommandBuffer`] can never point into a destroyed pool.
struct PoolCore {
    device: Arc<Device>,
    raw: vk::CommandPool,
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.raw);
        // SAFETY: this is the last co-owner, so the wrapper and every
        // buffer from this pool are gone. Destroying the pool frees any
        // buffers still allocated from it.
        unsafe { self.device.destroy_raw_command_pool(self.raw) };
    }
}

/// Command pool whose buffers can be reset one at a time.
///
/// Created with `RESET_COMMAND_BUFFER` so the frame loop can re-record a
/// single [`ResettableCommandBuffer`] per image every frame.
///
/// Vulkan wants pool-level calls externally synchronized. Instead of a
/// mutex, this type is `!Sync` (the `Receiver` below makes it so), which
/// pins allocation to the owning thread at compile time.
pub struct ResettableCommandPool {
    core: Arc<PoolCore>,
    /// Cloned into every buffer so its drop can mail the raw handle back.
    recycle_tx: mpsc::Sender<vk::CommandBuffer>,
    /// Handles mailed back by dropped buffers, drained on the next
    /// allocation. `Receiver` is `!Sync` and keeps the whole pool `!Sync`.
    recycle_rx: mpsc::Receiver<vk::CommandBuffer>,
}

impl std::fmt::Debug for ResettableCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableCommandPool")
            .field("pool", &self.core.raw)
            .finish_non_exhaustive()
    }
}

impl ResettableCommandPool {
    /// Create a resettable pool on `queue_family`.
    ///
    /// `name` becomes a debug label when `VK_EXT_debug_utils` is around; a
    /// labeling failure only warns.
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: info holds a queue family of this device and no borrowed
        // pointers.
        let raw = unsafe { device.create_raw_command_pool(&info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        // SAFETY: raw was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(raw, name) } {
            tracing::warn!("Could not name command pool {raw:?}: {e}");
        }

        let (recycle_tx, recycle_rx) = mpsc::channel();

        Ok(Self {
            core: Arc::new(PoolCore {
                device: Arc::clone(device),
                raw,
            }),
            recycle_tx,
            recycle_rx,
        })
    }

    /// Hand out one primary command buffer.
    ///
    /// Handles mailed back by dropped buffers get drained first: one is
    /// reused, the surplus is freed back to the pool so peak usage stays
    /// bounded, and only when none came back does Vulkan allocate a fresh
    /// one. Either way the result may carry old state and has to be reset
    /// before recording.
    ///
    /// The buffer co-owns the pool, which stays alive until both sides are
    /// gone.
    pub fn allocate_command_buffer(
        &self,
    ) -> Result<ResettableCommandBuffer, AllocateCommandBufferError> {
        let mut reuse = None;
        let mut surplus = Vec::new();
        while let Ok(returned) = self.recycle_rx.try_recv() {
            if let Some(older) = reuse.replace(returned) {
                surplus.push(older);
            }
        }

        if !surplus.is_empty() {
            // SAFETY: each surplus handle came out of this pool, and the
            // recycling contract says buffers are only dropped once their
            // GPU work is done. Being !Sync rules out pool access from
            // another thread during the free.
            unsafe {
                self.core
                    .device
                    .free_raw_command_buffers(self.core.raw, &surplus)
            };
        }

        let raw = match reuse {
            Some(buf) => buf,
            // SAFETY: core.raw is a live pool of core.device, and being
            // !Sync rules out concurrent pool access.
            None => unsafe { allocate_one(&self.core.device, self.core.raw) }
                .map_err(AllocateCommandBufferError::Vulkan)?,
        };

        Ok(ResettableCommandBuffer {
            core: Arc::clone(&self.core),
            raw,
            recycle_tx: self.recycle_tx.clone(),
        })
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.core.raw
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.core.device
    }
}

/// Primary command buffer from a [`ResettableCommandPool`], re-recorded
/// frame after frame.
///
/// Recording calls are `unsafe`: Vulkan's state sequencing (initial,
/// recording, executable, pending) is on the caller. Dropping it mails the
/// raw handle back to the pool for reuse; with the pool already gone the
/// send just fizzles and pool destruction reclaims the handle.
pub struct ResettableCommandBuffer {
    /// Co-owns the pool the handle lives in.
    core: Arc<PoolCore>,
    raw: vk::CommandBuffer,
    recycle_tx: mpsc::Sender<vk::CommandBuffer>,
}

impl Drop for ResettableCommandBuffer {
    fn drop(&mut self) {
        // A dead receiver means the pool wrapper is gone. PoolCore cleans
        // up in that case, so the failed send is fine to drop.
        let _ = self.recycle_tx.send(self.raw);
    }
}

impl std::fmt::Debug for ResettableCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableCommandBuffer")
            .field("handle", &self.raw)
            .finish_non_exhaustive()
    }
}

impl ResettableCommandBuffer {
    /// Put the buffer back in the initial state.
    ///
    /// # Safety
    /// No submission of this buffer may still be in flight.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe {
            self.core
                .device
                .reset_raw_command_buffer(self.raw, vk::CommandBufferResetFlags::empty())
        }
    }

    /// Start recording.
    ///
    /// # Safety
    /// The buffer must be in the initial state, fresh or just reset.
    pub unsafe fn begin(&mut self) -> Result<(), vk::Result> {
        let info = vk::CommandBufferBeginInfo::default();
        // SAFETY: upheld by the caller.
        unsafe { self.core.device.begin_raw_command_buffer(self.raw, &info) }
    }

    /// Finish recording, leaving the buffer executable.
    ///
    /// # Safety
    /// The buffer must be recording.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.core.device.end_raw_command_buffer(self.raw) }
    }

    /// Open a render pass instance with inline contents.
    ///
    /// # Safety
    /// The buffer must be recording. `begin_info` must pair a render pass
    /// and compatible framebuffer from this buffer's device, with the
    /// framebuffer's attachments free of other pending pass instances.
    pub unsafe fn begin_render_pass(&mut self, begin_info: &vk::RenderPassBeginInfo<'_>) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.core.device.cmd_begin_raw_render_pass(
                self.raw,
                begin_info,
                vk::SubpassContents::INLINE,
            )
        }
    }

    /// Close the open render pass instance.
    ///
    /// # Safety
    /// The buffer must be recording inside a pass opened with
    /// [`begin_render_pass`](Self::begin_render_pass).
    pub unsafe fn end_render_pass(&mut self) {
        // SAFETY: upheld by the caller.
        unsafe { self.core.device.cmd_end_raw_render_pass(self.raw) }
    }

    /// Bind a graphics pipeline for the draws that follow.
    ///
    /// # Safety
    /// The buffer must be recording and `pipeline` must be a live graphics
    /// pipeline of the same device.
    pub unsafe fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.core
                .device
                .cmd_bind_graphics_pipeline(self.raw, pipeline)
        }
    }

    /// Bind raw vertex buffers for the draws that follow.
    ///
    /// # Safety
    /// The buffer must be recording, `buffers` and `offsets` must match in
    /// length, and every handle must be a live buffer of the same device.
    pub unsafe fn bind_raw_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.core
                .device
                .cmd_bind_vertex_buffers(self.raw, first_binding, buffers, offsets)
        }
    }

    /// Bind one vertex buffer for the draws that follow.
    ///
    /// # Safety
    /// The buffer must be recording and `buffer` must be live on the same
    /// device.
    pub unsafe fn bind_vertex_buffer<B>(&mut self, binding: u32, buffer: B, offset: vk::DeviceSize)
    where
        B: BufferHandle,
    {
        let buffers = [buffer.raw_buffer()];
        let offsets = [offset];
        // SAFETY: forwarded contract.
        unsafe { self.bind_raw_vertex_buffers(binding, &buffers, &offsets) }
    }

    /// Record a non-indexed draw.
    ///
    /// # Safety
    /// The buffer must be recording inside a render pass, with a
    /// compatible pipeline bound.
    pub unsafe fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: upheld by the caller.
        unsafe {
            self.core.device.cmd_draw(
                self.raw,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.core.device
    }
}

impl CommandBufferHandle for ResettableCommandBuffer {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.raw
    }
}

/// Command pool for record-submit-discard work.
///
/// Carries the `TRANSIENT` hint. The vertex upload path pulls its
/// synchronous staging copies from here.
///
/// `!Sync` for the same reason as [`ResettableCommandPool`], here via the
/// `PhantomData` marker.
pub struct TransientCommandPool {
    device: Arc<Device>,
    raw: vk::CommandPool,
    _single_thread: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for TransientCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientCommandPool")
            .field("pool", &self.raw)
            .finish_non_exhaustive()
    }
}

impl TransientCommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        // SAFETY: info holds a queue family of this device and no borrowed
        // pointers.
        let raw = unsafe { device.create_raw_command_pool(&info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        // SAFETY: raw was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(raw, name) } {
            tracing::warn!("Could not name command pool {raw:?}: {e}");
        }

        Ok(Self {
            device: Arc::clone(device),
            raw,
            _single_thread: PhantomData,
        })
    }

    /// Allocate a buffer and open it for a single submission.
    ///
    /// Record into the returned [`OneShotCommandBuffer`], then finish with
    /// [`submit_and_wait`](OneShotCommandBuffer::submit_and_wait).
    pub fn begin_one_shot(&self) -> Result<OneShotCommandBuffer<'_>, OneShotCommandError> {
        // SAFETY: self.raw is a live pool of self.device, and being !Sync
        // rules out concurrent pool access.
        let raw = unsafe { allocate_one(&self.device, self.raw) }
            .map_err(OneShotCommandError::Allocate)?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: raw is fresh out of the pool, in the initial state.
        if let Err(e) = unsafe { self.device.begin_raw_command_buffer(raw, &begin_info) } {
            // SAFETY: raw came from self.raw moments ago with nothing
            // submitted.
            unsafe {
                self.device
                    .free_raw_command_buffers(self.raw, std::slice::from_ref(&raw))
            };
            return Err(OneShotCommandError::Begin(e));
        }

        Ok(OneShotCommandBuffer { pool: self, raw })
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.raw
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for TransientCommandPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping transient command pool {:?}", self.raw);
        // SAFETY: raw came from this device. OneShotCommandBuffer borrows
        // the pool, so none survive to this point, and destroying the pool
        // frees whatever is still allocated.
        unsafe { self.device.destroy_raw_command_pool(self.raw) };
    }
}

/// Recording command buffer out of a [`TransientCommandPool`], good for
/// one submission.
///
/// Record against [`raw_command_buffer`](Self::raw_command_buffer) or any
/// helper generic over [`CommandBufferHandle`], then consume it with
/// [`submit_and_wait`](Self::submit_and_wait). Dropped unsubmitted, it
/// frees the buffer without running anything.
pub struct OneShotCommandBuffer<'a> {
    pool: &'a TransientCommandPool,
    raw: vk::CommandBuffer,
}

impl std::fmt::Debug for OneShotCommandBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShotCommandBuffer")
            .field("handle", &self.raw)
            .finish_non_exhaustive()
    }
}

impl OneShotCommandBuffer<'_> {
    /// End recording, submit on the graphics queue, and block until the
    /// queue drains.
    ///
    /// When this returns, anything the recorded commands touched is free
    /// to reuse or destroy.
    ///
    /// # Safety
    /// The recorded commands must form a valid sequence, over resources
    /// that are live and in the states those commands expect.
    pub unsafe fn submit_and_wait(self) -> Result<(), OneShotCommandError> {
        let device = &self.pool.device;

        // SAFETY: recording began in begin_one_shot and nothing else ends
        // it.
        unsafe { device.end_raw_command_buffer(self.raw) }.map_err(OneShotCommandError::End)?;

        let buf_info = vk::CommandBufferSubmitInfo::default().command_buffer(self.raw);
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(std::slice::from_ref(&buf_info));

        // SAFETY: the buffer is executable now, and the caller vouches for
        // the commands and their resources.
        unsafe { device.graphics_queue_submit2(std::slice::from_ref(&submit), vk::Fence::null()) }
            .map_err(OneShotCommandError::Submit)?;

        device
            .graphics_queue_wait_idle()
            .map_err(OneShotCommandError::WaitIdle)?;

        // Dropping self frees the handle, which the queue drain above made
        // safe.
        Ok(())
    }
}

impl Drop for OneShotCommandBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: raw came from this pool. Either it was never submitted or
        // submit_and_wait drained the queue first, and the pool borrow
        // keeps everything on one thread.
        unsafe {
            self.pool
                .device
                .free_raw_command_buffers(self.pool.raw, std::slice::from_ref(&self.raw))
        };
    }
}

impl CommandBufferHandle for OneShotCommandBuffer<'_> {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn require_send<T: Send>() {}

    // The pools are deliberately !Sync, but all three owning types have to
    // move between threads freely.
    #[test]
    fn pools_and_buffers_are_send() {
        require_send::<ResettableCommandPool>();
        require_send::<ResettableCommandBuffer>();
        require_send::<TransientCommandPool>();
    }
}
