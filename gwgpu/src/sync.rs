use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Fence creation failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Timed out waiting for fence")]
    Timeout,
    #[error("Fence wait failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateSemaphoreError {
    #[error("Semaphore creation failed: {0}")]
    Vulkan(vk::Result),
}

/// An owned binary fence, the CPU-facing half of frame pacing.
///
/// The host blocks in [`wait`](Self::wait) until the GPU signals the fence,
/// then [`reset`](Self::reset)s it before reusing the frame slot.
pub struct Fence {
    device: Arc<Device>,
    raw: vk::Fence,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.raw)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence, optionally already signaled.
    ///
    /// A render loop that waits at the top of every iteration wants
    /// `signaled: true` so the very first wait falls through.
    ///
    /// `name` becomes a `VK_EXT_debug_utils` label when given. A naming
    /// failure is only logged.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let mut info = vk::FenceCreateInfo::default();
        if signaled {
            info = info.flags(vk::FenceCreateFlags::SIGNALED);
        }

        // SAFETY: info contains no borrowed pointers.
        let raw = unsafe { device.create_raw_fence(&info) }.map_err(CreateFenceError::Vulkan)?;

        // SAFETY: raw was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(raw, name) } {
            tracing::warn!("Could not name fence {raw:?}: {e}");
        }

        Ok(Self {
            device: Arc::clone(device),
            raw,
        })
    }

    /// Block until the fence signals, for at most `timeout_ns` nanoseconds
    /// (`u64::MAX` means no limit).
    pub fn wait(&self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        // SAFETY: raw belongs to this device and stays alive for the call.
        let waited = unsafe {
            self.device
                .wait_for_raw_fences(&[self.raw], true, timeout_ns)
        };
        match waited {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(WaitFenceError::Timeout),
            Err(e) => Err(WaitFenceError::Vulkan(e)),
        }
    }

    /// Return the fence to the unsignaled state.
    ///
    /// # Safety
    /// The fence must not be pending: any submission that signals it must
    /// already have completed, or never have happened.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: upheld by the caller.
        unsafe { self.device.reset_raw_fences(&[self.raw]) }
    }

    pub fn raw_handle(&self) -> vk::Fence {
        self.raw
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.raw);
        // SAFETY: the wrapper owns raw, and owners wait out in-flight
        // submissions before dropping their sync objects.
        unsafe { self.device.destroy_raw_fence(self.raw) };
    }
}

/// An owned binary semaphore for ordering work across queue operations.
///
/// One queue operation signals it, another waits on it. The host never
/// touches its state.
pub struct Semaphore {
    device: Arc<Device>,
    raw: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.raw)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    /// Create a semaphore.
    ///
    /// `name` becomes a `VK_EXT_debug_utils` label when given. A naming
    /// failure is only logged.
    pub fn new(device: &Arc<Device>, name: Option<&str>) -> Result<Self, CreateSemaphoreError> {
        let info = vk::SemaphoreCreateInfo::default();

        // SAFETY: info contains no borrowed pointers.
        let raw =
            unsafe { device.create_raw_semaphore(&info) }.map_err(CreateSemaphoreError::Vulkan)?;

        // SAFETY: raw was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(raw, name) } {
            tracing::warn!("Could not name semaphore {raw:?}: {e}");
        }

        Ok(Self {
            device: Arc::clone(device),
            raw,
        })
    }

    pub fn raw_handle(&self) -> vk::Semaphore {
        self.raw
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.raw);
        // SAFETY: the wrapper owns raw, and owners wait out in-flight
        // submissions before dropping their sync objects.
        unsafe { self.device.destroy_raw_semaphore(self.raw) };
    }
}
