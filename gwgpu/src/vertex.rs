//! The vertex format and the growable vertex store.
//!
//! [`Vertex`] is the only vertex layout the renderer knows: a 2D position
//! and an RGB color, matching the pipeline's fixed input description.
//! [`GrowableVertexBuffer`] pairs a host-visible staging buffer with a
//! device-local buffer of the same capacity and grows both by doubling when
//! an upload no longer fits.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::buffer::{
    BufferHandle, CreateBufferError, DeviceLocalBuffer, HostVisibleBuffer, UploadBufferError,
    WriteBufferError,
};
use crate::command::{OneShotCommandError, TransientCommandPool};
use crate::device::Device;

/// Capacity both buffers start at, in bytes.
pub const INITIAL_CAPACITY: vk::DeviceSize = 1024;

/// One colored 2D vertex as the vertex shader consumes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    /// The single vertex buffer binding, stepped per vertex.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    /// Position at location 0, color at location 1.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, pos) as u32),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, color) as u32),
        ]
    }
}

#[derive(Debug, Error)]
pub enum UploadVerticesError {
    #[error("Failed to wait for device idle before vertex buffer growth: {0}")]
    WaitIdle(vk::Result),

    #[error("Failed to recreate vertex buffers during growth: {0}")]
    Recreate(#[from] CreateBufferError),

    #[error("Failed to write vertex data to the staging buffer: {0}")]
    StagingWrite(#[from] WriteBufferError),

    #[error("Failed to record the staging copy: {0}")]
    CopyRecord(#[from] UploadBufferError),

    #[error("Failed to execute the staging copy: {0}")]
    CopySubmit(#[from] OneShotCommandError),
}

/// What [`GrowableVertexBuffer::upload`] did besides copying the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadResult {
    /// The buffers were destroyed and recreated at a larger capacity. Any
    /// recorded command sequence embedding the old buffer handle is stale
    /// and must be re-recorded.
    pub reallocated: bool,
}

/// Smallest capacity ≥ `required` reachable by repeated doubling from
/// `current`. Returns `current` unchanged when it already suffices.
fn grown_capacity(current: vk::DeviceSize, required: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(current > 0);
    let mut capacity = current;
    while capacity < required {
        capacity *= 2;
    }
    capacity
}

/// A vertex buffer that grows to fit whatever the scene produces.
///
/// Owns a host-visible staging buffer and a device-local vertex buffer of
/// equal capacity. Uploads copy into staging, then run a one-shot
/// staging-to-device transfer on the graphics queue and wait for it, so the
/// data is ready for the next recorded draw as soon as
/// [`upload`](Self::upload) returns.
///
/// Capacity starts at [`INITIAL_CAPACITY`] bytes and only ever grows.
pub struct GrowableVertexBuffer {
    parent: Arc<Device>,
    staging: HostVisibleBuffer,
    device_local: DeviceLocalBuffer,
    capacity: vk::DeviceSize,
    used_size: vk::DeviceSize,
    vertex_count: u32,
}

impl std::fmt::Debug for GrowableVertexBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableVertexBuffer")
            .field("capacity", &self.capacity)
            .field("used_size", &self.used_size)
            .field("vertex_count", &self.vertex_count)
            .finish_non_exhaustive()
    }
}

impl GrowableVertexBuffer {
    pub fn new(device: &Arc<Device>) -> Result<Self, CreateBufferError> {
        let (staging, device_local) = Self::create_buffers(device, INITIAL_CAPACITY)?;
        Ok(Self {
            parent: Arc::clone(device),
            staging,
            device_local,
            capacity: INITIAL_CAPACITY,
            used_size: 0,
            vertex_count: 0,
        })
    }

    fn create_buffers(
        device: &Arc<Device>,
        capacity: vk::DeviceSize,
    ) -> Result<(HostVisibleBuffer, DeviceLocalBuffer), CreateBufferError> {
        let staging = HostVisibleBuffer::new(
            device,
            capacity,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Some("Vertex Staging Buffer"),
        )?;
        let device_local = DeviceLocalBuffer::new(
            device,
            capacity,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
            Some("Vertex Buffer"),
        )?;
        Ok((staging, device_local))
    }

    /// Upload `vertices`, growing the buffers first if they no longer fit.
    ///
    /// Growth waits for the device to go fully idle before the old buffers
    /// are released, since earlier frames may still be reading them. When
    /// that happens the returned [`UploadResult`] reports `reallocated` and
    /// the caller must re-record any command buffers that bound the old
    /// handle.
    ///
    /// An empty `vertices` records a vertex count of zero without touching
    /// the GPU.
    ///
    /// The copy is submitted through `transfer_pool` on the graphics queue
    /// and waited on synchronously, so the staging buffer is immediately
    /// reusable and the device buffer is up to date on return.
    pub fn upload(
        &mut self,
        transfer_pool: &TransientCommandPool,
        vertices: &[Vertex],
    ) -> Result<UploadResult, UploadVerticesError> {
        let mut result = UploadResult::default();

        if vertices.is_empty() {
            self.used_size = 0;
            self.vertex_count = 0;
            return Ok(result);
        }

        let new_used_size = std::mem::size_of_val(vertices) as vk::DeviceSize;

        if new_used_size > self.capacity {
            let new_capacity = grown_capacity(self.capacity, new_used_size);
            tracing::debug!(
                "Growing vertex buffers: {} -> {} bytes ({} vertices)",
                self.capacity,
                new_capacity,
                vertices.len(),
            );

            // In-flight frames may still read the old device buffer; idle
            // the whole device before it is released.
            self.parent
                .wait_idle()
                .map_err(UploadVerticesError::WaitIdle)?;

            // Build the replacements first so a creation failure leaves the
            // store with its old buffers intact.
            let (staging, device_local) = Self::create_buffers(&self.parent, new_capacity)?;
            self.staging = staging;
            self.device_local = device_local;
            self.capacity = new_capacity;
            result.reallocated = true;
        }

        self.staging.write_pod(vertices)?;

        let command_buffer = transfer_pool.begin_one_shot()?;
        // SAFETY: command_buffer is in the recording state; the staging
        // buffer has TRANSFER_SRC usage and the device buffer TRANSFER_DST;
        // both outlive the synchronous submit below.
        unsafe {
            self.device_local.record_copy_region_from(
                &command_buffer,
                &self.staging,
                0,
                0,
                new_used_size,
            )
        }?;
        // SAFETY: the recorded copy only references the two buffers above,
        // which stay alive until the queue-idle wait inside returns.
        unsafe { command_buffer.submit_and_wait() }?;

        self.used_size = new_used_size;
        self.vertex_count = vertices.len() as u32;

        Ok(result)
    }

    /// Current capacity of both buffers, in bytes.
    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    /// Bytes of valid vertex data in the device buffer.
    pub fn used_size(&self) -> vk::DeviceSize {
        self.used_size
    }

    /// Number of vertices the last upload stored. Drives the draw call.
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// The device-local buffer the pipeline reads from.
    pub fn raw_buffer(&self) -> vk::Buffer {
        self.device_local.raw_buffer()
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl BufferHandle for GrowableVertexBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.device_local.raw_buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_pipeline_description() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);

        let binding = Vertex::binding_description();
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.stride, 20);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);

        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attributes[1].offset, 8);
    }

    #[test]
    fn capacity_doubles_until_request_fits() {
        assert_eq!(grown_capacity(1024, 1500), 2048);
    }

    #[test]
    fn sufficient_capacity_is_left_unchanged() {
        assert_eq!(grown_capacity(2048, 1800), 2048);
        assert_eq!(grown_capacity(1024, 1024), 1024);
        assert_eq!(grown_capacity(1024, 0), 1024);
    }

    #[test]
    fn growth_spans_multiple_doublings_in_one_step() {
        assert_eq!(grown_capacity(2048, 5000), 8192);
        assert_eq!(grown_capacity(1024, 1_000_000), 1_048_576);
    }
}
