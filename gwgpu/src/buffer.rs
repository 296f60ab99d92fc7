//! Buffer wrappers for the two memory patterns the vertex path needs.
//!
//! Vertex data flows through a pair of buffers: a [`HostVisibleBuffer`] the
//! CPU writes into ([`write_pod`](HostVisibleBuffer::write_pod)) and a
//! [`DeviceLocalBuffer`] the pipeline reads from, filled by recording a
//! region copy ([`record_copy_region_from`]) on a command buffer the caller
//! submits. Backing memory comes from gpu-allocator and is returned on drop.
//!
//! [`record_copy_region_from`]: DeviceLocalBuffer::record_copy_region_from

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::command::CommandBufferHandle;
use crate::device::{Device, MemoryUsage};

/// Exposes the raw `VkBuffer` behind a wrapper type.
///
/// A blanket impl covers `&T`, letting recording helpers accept owned
/// wrappers and borrows alike.
pub trait BufferHandle {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl<T: BufferHandle + ?Sized> BufferHandle for &T {
    fn raw_buffer(&self) -> vk::Buffer {
        (**self).raw_buffer()
    }
}

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Buffer creation failed: {0}")]
    Creation(vk::Result),

    #[error("Backing memory allocation failed: {0}")]
    Allocation(AllocationError),

    #[error("Binding memory to the buffer failed: {0}")]
    Bind(vk::Result),
}

#[derive(Debug, Error)]
pub enum WriteBufferError {
    #[error("Write of {data_bytes} bytes does not fit in a {capacity} byte buffer")]
    DataTooLarge {
        data_bytes: usize,
        capacity: vk::DeviceSize,
    },

    #[error("Flushing the written range failed: {0}")]
    Flush(vk::Result),

    #[error("Backing allocation has no CPU mapping")]
    NotMapped,
}

#[derive(Debug, Error)]
pub enum UploadBufferError {
    #[error(
        "Copy of {copy_size} bytes at src offset {src_offset} / dst offset \
         {dst_offset} does not fit (src {src_size} bytes, dst {dst_size} bytes)"
    )]
    RegionOutOfBounds {
        src_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_size: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    },
}

/// Check that a copy region lies inside both buffers.
///
/// Saturating adds keep absurd offsets from wrapping into apparent validity.
fn validate_copy_region(
    src_size: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_size: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
    copy_size: vk::DeviceSize,
) -> Result<(), UploadBufferError> {
    let src_fits = src_offset.saturating_add(copy_size) <= src_size;
    let dst_fits = dst_offset.saturating_add(copy_size) <= dst_size;
    if src_fits && dst_fits {
        return Ok(());
    }
    Err(UploadBufferError::RegionOutOfBounds {
        src_size,
        src_offset,
        dst_size,
        dst_offset,
        copy_size,
    })
}

/// Flush the first `written` bytes of `allocation` unless its memory type is
/// host-coherent, in which case the CPU write is already visible.
fn flush_written_range(
    device: &Device,
    allocation: &Allocation,
    written: usize,
) -> Result<(), WriteBufferError> {
    let props = allocation.memory_properties();
    if props.contains(vk::MemoryPropertyFlags::HOST_COHERENT) || written == 0 {
        return Ok(());
    }

    let atom = device.non_coherent_atom_size();
    let offset = allocation.offset();
    // Device::allocate_memory aligns host-visible allocations to the atom.
    debug_assert!(offset % atom == 0 && allocation.size() % atom == 0);
    // The rounded range stays inside the allocation because written is at
    // most the buffer size, which is at most the allocation size.
    let flush_size = (written as vk::DeviceSize).div_ceil(atom) * atom;
    // SAFETY: the allocation is live for the duration of this call.
    let memory = unsafe { allocation.memory() };
    let range = vk::MappedMemoryRange::default()
        .memory(memory)
        .offset(offset)
        .size(flush_size);
    // SAFETY: range references a mapped allocation owned by this device.
    unsafe { device.flush_raw_mapped_memory_ranges(std::slice::from_ref(&range)) }
        .map_err(WriteBufferError::Flush)
}

/// A `VkBuffer` bound to a dedicated gpu-allocator allocation.
///
/// Shared plumbing behind both public wrappers.
struct BackedBuffer {
    device: Arc<Device>,
    raw: vk::Buffer,
    /// `None` only transiently inside `Drop`.
    memory: Option<Allocation>,
    size: vk::DeviceSize,
}

impl std::fmt::Debug for BackedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackedBuffer")
            .field("handle", &self.raw)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl BackedBuffer {
    fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
        memory_usage: MemoryUsage,
    ) -> Result<Self, CreateBufferError> {
        let info = vk::BufferCreateInfo::default()
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .size(size)
            .usage(usage);
        // SAFETY: info holds no borrowed pointers.
        let raw = unsafe { device.create_raw_buffer(&info) }.map_err(CreateBufferError::Creation)?;
        // SAFETY: raw was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(raw, name) } {
            tracing::warn!("Could not name buffer {raw:?}: {e}");
        }

        // Failures past this point must not leak raw.
        let destroy_raw = || {
            // SAFETY: raw came from device and has no memory bound yet.
            unsafe { device.destroy_raw_buffer(raw) };
        };

        // SAFETY: raw is live.
        let requirements = unsafe { device.get_raw_buffer_memory_requirements(raw) };
        let allocation =
            match device.allocate_memory(name.unwrap_or("buffer"), requirements, memory_usage, true)
            {
                Ok(allocation) => allocation,
                Err(e) => {
                    destroy_raw();
                    return Err(CreateBufferError::Allocation(e));
                }
            };

        // SAFETY: raw and the allocation's memory both come from device, and
        // gpu-allocator hands out offsets satisfying the requirements queried
        // above.
        let bound =
            unsafe { device.bind_raw_buffer_memory(raw, allocation.memory(), allocation.offset()) };
        if let Err(e) = bound {
            if let Err(free) = device.free_memory(allocation) {
                tracing::error!("Could not return the unbound buffer's allocation: {free}");
            }
            destroy_raw();
            return Err(CreateBufferError::Bind(e));
        }

        Ok(Self {
            device: Arc::clone(device),
            raw,
            memory: Some(allocation),
            size,
        })
    }
}

impl Drop for BackedBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.raw);
        // SAFETY: this wrapper owns raw. Callers idle the device or queue
        // before teardown and growth, so nothing in flight references it.
        unsafe { self.device.destroy_raw_buffer(self.raw) };

        if let Some(allocation) = self.memory.take()
            && let Err(e) = self.device.free_memory(allocation)
        {
            tracing::error!("Could not return the buffer allocation: {e}");
        }
    }
}

/// A CPU-writable buffer in `CpuToGpu` memory.
///
/// The staging side of the vertex upload path.
#[derive(Debug)]
pub struct HostVisibleBuffer {
    backing: BackedBuffer,
}

impl HostVisibleBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            backing: BackedBuffer::new(device, size, usage, name, MemoryUsage::CpuToGpu)?,
        })
    }

    /// Copy `data` to the start of the mapped region, flushing afterwards
    /// when the backing memory is not host-coherent.
    ///
    /// Fails without touching the mapping if `data` is larger than the
    /// buffer.
    pub fn write_pod<T: Pod>(&mut self, data: &[T]) -> Result<(), WriteBufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let data_bytes = bytes.len();
        if data_bytes as vk::DeviceSize > self.backing.size {
            let capacity = self.backing.size;
            return Err(WriteBufferError::DataTooLarge { data_bytes, capacity });
        }

        let allocation = self.backing.memory.as_ref().expect("memory only missing during drop");
        let mapped = allocation.mapped_ptr().ok_or(WriteBufferError::NotMapped)?;

        // SAFETY: mapped points at the allocation's CPU mapping and the
        // length was checked against the buffer size above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.as_ptr().cast::<u8>(), data_bytes);
        }

        flush_written_range(&self.backing.device, allocation, data_bytes)
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.backing.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.backing.size
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.backing.device
    }
}

impl BufferHandle for HostVisibleBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.backing.raw
    }
}

/// A GPU-only buffer in `GpuOnly` memory.
///
/// Not CPU-writable. Filled from a [`HostVisibleBuffer`] by recording a
/// region copy and submitting the command buffer.
#[derive(Debug)]
pub struct DeviceLocalBuffer {
    backing: BackedBuffer,
}

impl DeviceLocalBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            backing: BackedBuffer::new(device, size, usage, name, MemoryUsage::GpuOnly)?,
        })
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.backing.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.backing.size
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.backing.device
    }

    /// Record a copy of a byte range from `src` into this buffer, rejecting
    /// regions that extend past the end of either buffer.
    ///
    /// Only records. Begin/end/submit and CPU/GPU synchronization are the
    /// caller's job.
    ///
    /// # Safety
    /// - `command_buffer` must be in the recording state.
    /// - `src` and `self` must stay alive until the recorded copy has
    ///   finished executing on the GPU.
    /// - `src` needs `TRANSFER_SRC` usage and `self` needs `TRANSFER_DST`.
    pub unsafe fn record_copy_region_from<C: CommandBufferHandle>(
        &mut self,
        command_buffer: &C,
        src: &HostVisibleBuffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    ) -> Result<(), UploadBufferError> {
        validate_copy_region(src.size(), src_offset, self.size(), dst_offset, copy_size)?;

        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(copy_size);
        // SAFETY: recording state and buffer lifetimes are the caller's
        // promise, and the region was just validated to be in-bounds.
        unsafe {
            self.backing.device.cmd_copy_buffer(
                command_buffer.raw_command_buffer(),
                src.raw_buffer(),
                self.backing.raw,
                std::slice::from_ref(&region),
            )
        };

        Ok(())
    }
}

impl BufferHandle for DeviceLocalBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.backing.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_region_within_bounds_is_accepted() {
        assert!(validate_copy_region(1024, 0, 2048, 0, 1024).is_ok());
        assert!(validate_copy_region(1024, 512, 2048, 1024, 512).is_ok());
    }

    #[test]
    fn copy_region_past_source_end_is_rejected() {
        let result = validate_copy_region(1024, 0, 4096, 0, 1025);
        assert!(matches!(
            result,
            Err(UploadBufferError::RegionOutOfBounds {
                src_size: 1024,
                copy_size: 1025,
                ..
            })
        ));
    }

    #[test]
    fn copy_region_past_destination_end_is_rejected() {
        let result = validate_copy_region(4096, 0, 1024, 512, 1024);
        assert!(matches!(
            result,
            Err(UploadBufferError::RegionOutOfBounds {
                dst_size: 1024,
                dst_offset: 512,
                ..
            })
        ));
    }

    #[test]
    fn copy_region_offset_overflow_is_rejected() {
        let result = validate_copy_region(u64::MAX, u64::MAX, u64::MAX, 0, 1);
        assert!(result.is_err());
    }
}
