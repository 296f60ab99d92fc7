//! Frame pacing: the in-flight slot ring, per-image fence ownership, and
//! the acquire/submit/present calls bound to them.
//!
//! [`FrameScheduler`] owns one semaphore pair and one fence per frame slot
//! and cycles through the slots in strict round-robin order. The plain
//! bookkeeping (which slot is current, which slot's fence owns which
//! swapchain image) lives in a separate structure with no Vulkan handles in
//! it, so the transition rules are testable on their own.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::command::CommandBufferHandle;
use crate::device::Device;
use crate::swapchain::Swapchain;
use crate::sync::{CreateFenceError, CreateSemaphoreError, Fence, Semaphore, WaitFenceError};

/// How many frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Error)]
pub enum CreateFrameSchedulerError {
    #[error("Failed to create frame semaphore: {0}")]
    Semaphore(#[from] CreateSemaphoreError),

    #[error("Failed to create frame fence: {0}")]
    Fence(#[from] CreateFenceError),
}

#[derive(Debug, Error)]
pub enum SubmitFrameError {
    #[error("Vulkan error resetting the in-flight fence: {0}")]
    ResetFence(vk::Result),

    #[error("Vulkan error submitting the frame: {0}")]
    Submit(vk::Result),
}

/// Result of asking the swapchain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired. `suboptimal` means the frame should still be
    /// drawn and presented, but the swapchain wants rebuilding afterwards.
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface. Abandon the frame and
    /// rebuild before trying again.
    OutOfDate,
}

/// Result of a present request that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Whether the swapchain must be rebuilt once the current frame's present
/// has been issued.
pub fn recreate_required(
    present: PresentOutcome,
    acquire_suboptimal: bool,
    resize_pending: bool,
) -> bool {
    resize_pending || acquire_suboptimal || !matches!(present, PresentOutcome::Presented)
}

// ---------------------------------------------------------------------------
// SlotTracker — plain transition rules, no Vulkan handles
// ---------------------------------------------------------------------------

/// The slot ring and the per-image fence-ownership map.
///
/// Slots are identified by index; the fence objects themselves stay in
/// [`FrameScheduler`].
#[derive(Debug)]
struct SlotTracker {
    slot_count: usize,
    current: usize,
    /// For each swapchain image, the slot whose fence last submitted work
    /// targeting it. `None` until the image is first used, and again after
    /// every swapchain rebuild.
    image_owner: Vec<Option<usize>>,
}

impl SlotTracker {
    fn new(slot_count: usize, image_count: usize) -> Self {
        Self {
            slot_count,
            current: 0,
            image_owner: vec![None; image_count],
        }
    }

    fn current(&self) -> usize {
        self.current
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.slot_count;
    }

    /// Rebind `image_index` to the current slot.
    ///
    /// Returns the slot that owned the image before, if any. That slot's
    /// fence must be waited on before the image is reused, since its
    /// submission may still be rendering into it.
    fn claim_image(&mut self, image_index: u32) -> Option<usize> {
        let index = image_index as usize;
        debug_assert!(index < self.image_owner.len());
        let owner = self.image_owner.get_mut(index)?;
        owner.replace(self.current)
    }

    /// Forget all image ownership. Used when the swapchain is rebuilt: the
    /// new chain's images have no outstanding work.
    fn reset_images(&mut self, image_count: usize) {
        self.image_owner = vec![None; image_count];
    }

    fn image_count(&self) -> usize {
        self.image_owner.len()
    }
}

// ---------------------------------------------------------------------------
// FrameScheduler
// ---------------------------------------------------------------------------

struct FrameSlot {
    /// Signaled by acquire, waited by the submit at color-attachment-output.
    image_available: Semaphore,
    /// Signaled by the submit, waited by present.
    render_finished: Semaphore,
    /// Signaled when the slot's submission completes. Created signaled so
    /// the first wait on a never-used slot returns immediately.
    in_flight: Fence,
}

/// Cycles [`FRAMES_IN_FLIGHT`] frame slots round-robin and enforces the two
/// waits that keep CPU and GPU honest: the per-slot fence wait that bounds
/// frames in flight, and the per-image fence wait that stops a new frame
/// from rendering into an image an older frame still targets.
///
/// The expected call sequence per frame is [`wait_for_slot`], [`acquire_image`],
/// [`claim_image`], [`submit`], [`present`], [`advance`] — with the frame
/// abandoned (skipping straight to [`advance`]) when acquire reports the
/// swapchain out of date.
///
/// The caller must idle the device before dropping this scheduler so no
/// submitted frame still references its fences and semaphores.
///
/// [`wait_for_slot`]: Self::wait_for_slot
/// [`acquire_image`]: Self::acquire_image
/// [`claim_image`]: Self::claim_image
/// [`submit`]: Self::submit
/// [`present`]: Self::present
/// [`advance`]: Self::advance
pub struct FrameScheduler {
    parent: Arc<Device>,
    slots: Vec<FrameSlot>,
    tracker: SlotTracker,
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("slot_count", &self.slots.len())
            .field("current_slot", &self.tracker.current())
            .field("image_count", &self.tracker.image_count())
            .finish_non_exhaustive()
    }
}

impl FrameScheduler {
    /// Create the scheduler with [`FRAMES_IN_FLIGHT`] slots for a swapchain
    /// of `image_count` images.
    pub fn new(
        device: &Arc<Device>,
        image_count: usize,
    ) -> Result<Self, CreateFrameSchedulerError> {
        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for i in 0..FRAMES_IN_FLIGHT {
            slots.push(FrameSlot {
                image_available: Semaphore::new(
                    device,
                    Some(&format!("Frame {} Image Available", i + 1)),
                )?,
                render_finished: Semaphore::new(
                    device,
                    Some(&format!("Frame {} Render Finished", i + 1)),
                )?,
                in_flight: Fence::new(device, true, Some(&format!("Frame {} In Flight", i + 1)))?,
            });
        }

        Ok(Self {
            parent: Arc::clone(device),
            slots,
            tracker: SlotTracker::new(FRAMES_IN_FLIGHT, image_count),
        })
    }

    /// The slot the next frame will use. Cycles `0, 1, 0, 1, …`.
    pub fn current_slot(&self) -> usize {
        self.tracker.current()
    }

    /// Block until the current slot's previous submission has completed.
    ///
    /// Bounds the CPU to [`FRAMES_IN_FLIGHT`] frames ahead of the GPU. The
    /// fence is left signaled; it is only reset by [`submit`](Self::submit),
    /// so an abandoned frame leaves the slot immediately reusable.
    pub fn wait_for_slot(&self) -> Result<(), WaitFenceError> {
        self.slots[self.tracker.current()].in_flight.wait(u64::MAX)
    }

    /// Acquire the next swapchain image, signaling the current slot's
    /// "image available" semaphore.
    ///
    /// # Safety
    /// The caller must follow the frame protocol: after a successful
    /// acquire, the same slot's [`submit`](Self::submit) must run before
    /// this slot acquires again, so the semaphore's pending signal is
    /// consumed exactly once.
    pub unsafe fn acquire_image<T>(
        &self,
        swapchain: &Swapchain<T>,
    ) -> Result<AcquireOutcome, vk::Result>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let semaphore = self.slots[self.tracker.current()].image_available.raw_handle();
        // SAFETY: semaphore is unsignaled with no pending operations per the
        // caller's protocol obligation; no fence is passed.
        match unsafe { swapchain.acquire_next_image(u64::MAX, semaphore, vk::Fence::null()) } {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e),
        }
    }

    /// Take ownership of `image_index` for the current slot, first waiting
    /// out any older submission that still targets the image.
    pub fn claim_image(&mut self, image_index: u32) -> Result<(), WaitFenceError> {
        if let Some(previous_slot) = self.tracker.claim_image(image_index) {
            self.slots[previous_slot].in_flight.wait(u64::MAX)?;
        }
        Ok(())
    }

    /// Reset the current slot's fence and submit `command_buffer` to the
    /// graphics queue: waits the "image available" semaphore at
    /// color-attachment-output, signals "render finished" and the slot's
    /// fence on completion.
    ///
    /// # Safety
    /// `command_buffer` must be in the executable state, recorded against
    /// resources that stay alive until the slot's fence signals. The frame
    /// protocol must have been followed: [`wait_for_slot`](Self::wait_for_slot)
    /// and a successful [`acquire_image`](Self::acquire_image) this frame.
    pub unsafe fn submit<C>(&mut self, command_buffer: &C) -> Result<(), SubmitFrameError>
    where
        C: CommandBufferHandle,
    {
        let slot = &mut self.slots[self.tracker.current()];

        // SAFETY: the slot's fence was waited by wait_for_slot, so no
        // submission still references it.
        unsafe { slot.in_flight.reset() }.map_err(SubmitFrameError::ResetFence)?;

        let wait_semaphore_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.image_available.raw_handle())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let command_buffer_info = vk::CommandBufferSubmitInfo::default()
            .command_buffer(command_buffer.raw_command_buffer());
        let signal_semaphore_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.render_finished.raw_handle())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(std::slice::from_ref(&wait_semaphore_info))
            .command_buffer_infos(std::slice::from_ref(&command_buffer_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_semaphore_info));

        // SAFETY: all handles belong to this scheduler's device; the wait
        // semaphore has a pending signal from acquire, the signal semaphore
        // is unsignaled, and the fence was reset above.
        unsafe {
            self.parent.graphics_queue_submit2(
                std::slice::from_ref(&submit_info),
                slot.in_flight.raw_handle(),
            )
        }
        .map_err(SubmitFrameError::Submit)
    }

    /// Present `image_index`, waiting on the current slot's "render
    /// finished" semaphore.
    ///
    /// Out-of-date surfaces are reported as an outcome rather than an
    /// error; anything else in the error path is a real failure.
    ///
    /// # Safety
    /// [`submit`](Self::submit) must have succeeded for this frame, so the
    /// "render finished" semaphore has a pending signal. `image_index` must
    /// be the index acquired this frame from `swapchain`.
    pub unsafe fn present<T>(
        &self,
        swapchain: &Swapchain<T>,
        image_index: u32,
    ) -> Result<PresentOutcome, vk::Result>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let wait_semaphores = [self.slots[self.tracker.current()].render_finished.raw_handle()];
        let swapchains = [swapchain.raw_handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: all handles are valid and owned by this scheduler's
        // device/swapchain; the wait semaphore has a pending signal per the
        // caller's protocol obligation.
        match unsafe { self.parent.queue_present(&present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e),
        }
    }

    /// Move on to the next slot. Called once per frame, including frames
    /// abandoned at acquire.
    pub fn advance(&mut self) {
        self.tracker.advance();
    }

    /// Forget image ownership after a swapchain rebuild. The caller must
    /// have idled the device first, which is already required for the
    /// rebuild itself.
    pub fn reset_image_owners(&mut self, image_count: usize) {
        self.tracker.reset_images(image_count);
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_ring_cycles_with_period_two() {
        let mut tracker = SlotTracker::new(2, 3);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(tracker.current());
            tracker.advance();
        }
        assert_eq!(seen, [0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn first_claim_of_an_image_has_no_previous_owner() {
        let mut tracker = SlotTracker::new(2, 3);
        assert_eq!(tracker.claim_image(0), None);
        assert_eq!(tracker.claim_image(1), None);
    }

    #[test]
    fn reclaiming_an_image_reports_the_owning_slot() {
        let mut tracker = SlotTracker::new(2, 3);

        assert_eq!(tracker.claim_image(1), None);
        tracker.advance();

        // Slot 1 steals image 1 from slot 0 and must wait slot 0's fence.
        assert_eq!(tracker.claim_image(1), Some(0));
        assert_eq!(tracker.claim_image(2), None);
        tracker.advance();

        assert_eq!(tracker.claim_image(1), Some(1));
    }

    #[test]
    fn rebuild_clears_image_ownership() {
        let mut tracker = SlotTracker::new(2, 2);
        assert_eq!(tracker.claim_image(0), None);
        assert_eq!(tracker.claim_image(0), Some(0));

        tracker.reset_images(3);
        assert_eq!(tracker.image_count(), 3);
        assert_eq!(tracker.claim_image(0), None);
    }

    #[test]
    fn abandoned_acquire_still_advances_the_ring() {
        let mut tracker = SlotTracker::new(2, 3);

        // Three clean frames land on images 0, 1, 2.
        for image in 0..3u32 {
            tracker.claim_image(image);
            tracker.advance();
        }
        assert_eq!(tracker.current(), 1);

        // The next acquire reports out of date: nothing is claimed, the
        // chain is rebuilt, and the slot still advances.
        tracker.reset_images(2);
        tracker.advance();

        // Cycling resumes on schedule against a chain with no stale owners.
        assert_eq!(tracker.current(), 0);
        assert_eq!(tracker.claim_image(0), None);
    }

    #[test]
    fn clean_present_without_flags_needs_no_recreate() {
        assert!(!recreate_required(PresentOutcome::Presented, false, false));
    }

    #[test]
    fn suboptimal_or_out_of_date_present_forces_recreate() {
        assert!(recreate_required(PresentOutcome::Suboptimal, false, false));
        assert!(recreate_required(PresentOutcome::OutOfDate, false, false));
    }

    #[test]
    fn pending_resize_forces_recreate_even_after_clean_present() {
        assert!(recreate_required(PresentOutcome::Presented, false, true));
    }

    #[test]
    fn suboptimal_acquire_is_remembered_until_after_present() {
        assert!(recreate_required(PresentOutcome::Presented, true, false));
    }
}
