// Frame synchronization and submission
//
// Each frame slot owns an image-available semaphore, a render-finished
// semaphore and a fence that starts signaled. A frame waits on its slot's
// fence before touching the slot again, so at most MAX_FRAMES_IN_FLIGHT
// frames are ever queued on the GPU.
//
//   throttle -> acquire -> submit -> present -> advance
//
// The GPU is reached through `FrameDriver`, which keeps the protocol itself
// free of Vulkan calls.

use ash::prelude::VkResult;
use ash::vk;

use super::error::{FrameStep, RendererError, Result};
use super::swapchain::SwapchainState;
use super::teardown::TeardownStack;

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Sync objects for one frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device, stack: &mut TeardownStack) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        let mut semaphore = || -> Result<vk::Semaphore> {
            let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }.map_err(
                |source| RendererError::ResourceCreation {
                    what: "semaphore",
                    source,
                },
            )?;
            stack.push_device_object(device, semaphore);
            Ok(semaphore)
        };

        let image_available = semaphore()?;
        let render_finished = semaphore()?;

        let in_flight_fence = unsafe { device.create_fence(&fence_info, None) }.map_err(
            |source| RendererError::ResourceCreation {
                what: "fence",
                source,
            },
        )?;
        stack.push_device_object(device, in_flight_fence);

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }
}

/// Where a frame slot is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Submitted,
    Presenting,
}

/// The GPU-facing calls one frame needs
pub trait FrameDriver {
    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;

    /// Returns the image index and whether the swapchain is suboptimal
    fn acquire_next_image(&mut self, signal: vk::Semaphore, timeout: u64) -> VkResult<(u32, bool)>;

    /// Number of swapchain images that have recorded commands
    fn recorded_images(&self) -> usize;

    /// Submit the commands recorded for `image_index`
    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()>;

    /// Returns whether the swapchain is suboptimal
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool>;
}

pub struct FrameSynchronizer {
    slots: [FrameSync; MAX_FRAMES_IN_FLIGHT],
    states: [SlotState; MAX_FRAMES_IN_FLIGHT],
    current_frame: usize,
    frames_drawn: u64,
    timeout: u64,
    reported_suboptimal: bool,
}

impl FrameSynchronizer {
    pub fn new(device: &ash::Device, timeout: u64, stack: &mut TeardownStack) -> Result<Self> {
        let first = FrameSync::new(device, stack)?;
        let second = FrameSync::new(device, stack)?;
        Ok(Self::from_slots([first, second], timeout))
    }

    pub fn from_slots(slots: [FrameSync; MAX_FRAMES_IN_FLIGHT], timeout: u64) -> Self {
        Self {
            slots,
            states: [SlotState::Idle; MAX_FRAMES_IN_FLIGHT],
            current_frame: 0,
            frames_drawn: 0,
            timeout,
            reported_suboptimal: false,
        }
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    /// Render one frame; returns the swapchain image that was presented
    pub fn draw<D: FrameDriver>(&mut self, driver: &mut D) -> Result<u32> {
        let slot = self.current_frame;
        let sync = self.slots[slot];

        // 1. Throttle: the GPU must be done with this slot's previous frame
        driver
            .wait_for_fence(sync.in_flight_fence, self.timeout)
            .map_err(|e| RendererError::frame(FrameStep::Throttle, e))?;
        self.states[slot] = SlotState::Idle;
        driver
            .reset_fence(sync.in_flight_fence)
            .map_err(|e| RendererError::frame(FrameStep::Throttle, e))?;

        // 2. Acquire (image index is independent of the slot)
        let (image_index, suboptimal) = driver
            .acquire_next_image(sync.image_available, self.timeout)
            .map_err(|e| RendererError::frame(FrameStep::Acquire, e))?;
        self.note_suboptimal(suboptimal);
        let recorded = driver.recorded_images();
        if image_index as usize >= recorded {
            return Err(RendererError::UnrecordedImage {
                index: image_index,
                recorded,
            });
        }

        // 3. Submit
        driver
            .submit(
                image_index,
                sync.image_available,
                sync.render_finished,
                sync.in_flight_fence,
            )
            .map_err(|e| RendererError::frame(FrameStep::Submit, e))?;
        self.states[slot] = SlotState::Submitted;

        // 4. Present
        let suboptimal = driver
            .present(image_index, sync.render_finished)
            .map_err(|e| RendererError::frame(FrameStep::Present, e))?;
        self.states[slot] = SlotState::Presenting;
        self.note_suboptimal(suboptimal);

        // 5. Advance
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        self.frames_drawn += 1;
        log::trace!(
            "Frame {} presented image {} from slot {}; slots now {:?}",
            self.frames_drawn,
            image_index,
            slot,
            self.states
        );

        Ok(image_index)
    }

    #[cfg(test)]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[cfg(test)]
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    fn note_suboptimal(&mut self, suboptimal: bool) {
        if suboptimal && !self.reported_suboptimal {
            log::warn!("Swapchain is suboptimal for the surface; continuing without recreation");
            self.reported_suboptimal = true;
        }
    }
}

/// `FrameDriver` over a live device and swapchain
pub struct VulkanFrameDriver<'a> {
    pub device: &'a ash::Device,
    pub graphics_queue: vk::Queue,
    pub presentation_queue: vk::Queue,
    pub swapchain: &'a SwapchainState,
    pub command_buffers: &'a [vk::CommandBuffer],
}

impl FrameDriver for VulkanFrameDriver<'_> {
    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore, timeout: u64) -> VkResult<(u32, bool)> {
        self.swapchain.acquire_next_image(timeout, signal)
    }

    fn recorded_images(&self) -> usize {
        self.command_buffers.len()
    }

    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()> {
        // draw() has already checked the index against recorded_images()
        let command_buffer = self.command_buffers[image_index as usize];

        let wait_semaphores = [wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [signal];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], fence)
        }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        self.swapchain
            .present(self.presentation_queue, image_index, &[wait])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::{HashMap, VecDeque};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(u64),
        Reset(u64),
        Acquire(u64),
        Submit { image: u32, wait: u64, signal: u64, fence: u64 },
        Present { image: u32, wait: u64 },
    }

    /// Models fences and the GPU queue. Submitted work completes when the
    /// host waits on its fence, or stays pending when `hang` is set.
    struct FakeGpu {
        fences: HashMap<u64, bool>,
        pending: VecDeque<u64>,
        image_count: u32,
        recorded: usize,
        next_image: u32,
        calls: Vec<Call>,
        hang: bool,
        fail_present: Option<vk::Result>,
    }

    impl FakeGpu {
        fn new(image_count: u32, slots: &[FrameSync]) -> Self {
            Self {
                fences: slots.iter().map(|s| (s.in_flight_fence.as_raw(), true)).collect(),
                pending: VecDeque::new(),
                image_count,
                recorded: image_count as usize,
                next_image: 0,
                calls: Vec::new(),
                hang: false,
                fail_present: None,
            }
        }

        fn in_flight(&self) -> usize {
            self.pending.len()
        }
    }

    impl FrameDriver for FakeGpu {
        fn wait_for_fence(&mut self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
            let raw = fence.as_raw();
            self.calls.push(Call::Wait(raw));
            if self.hang {
                return Err(vk::Result::TIMEOUT);
            }
            // Retire GPU work in order until this fence is signaled
            while !self.fences[&raw] {
                let done = self.pending.pop_front().expect("waiting on a fence nobody will signal");
                self.fences.insert(done, true);
            }
            Ok(())
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
            let raw = fence.as_raw();
            self.calls.push(Call::Reset(raw));
            assert!(self.fences[&raw], "reset before the fence was waited on");
            self.fences.insert(raw, false);
            Ok(())
        }

        fn acquire_next_image(&mut self, signal: vk::Semaphore, _timeout: u64) -> VkResult<(u32, bool)> {
            self.calls.push(Call::Acquire(signal.as_raw()));
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok((image, false))
        }

        fn recorded_images(&self) -> usize {
            self.recorded
        }

        fn submit(
            &mut self,
            image_index: u32,
            wait: vk::Semaphore,
            signal: vk::Semaphore,
            fence: vk::Fence,
        ) -> VkResult<()> {
            self.calls.push(Call::Submit {
                image: image_index,
                wait: wait.as_raw(),
                signal: signal.as_raw(),
                fence: fence.as_raw(),
            });
            assert!(!self.fences[&fence.as_raw()], "submitted with a signaled fence");
            self.pending.push_back(fence.as_raw());
            Ok(())
        }

        fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
            self.calls.push(Call::Present {
                image: image_index,
                wait: wait.as_raw(),
            });
            match self.fail_present {
                Some(e) => Err(e),
                None => Ok(false),
            }
        }
    }

    fn slots() -> [FrameSync; MAX_FRAMES_IN_FLIGHT] {
        let slot = |base: u64| FrameSync {
            image_available: vk::Semaphore::from_raw(base + 1),
            render_finished: vk::Semaphore::from_raw(base + 2),
            in_flight_fence: vk::Fence::from_raw(base + 3),
        };
        [slot(10), slot(20)]
    }

    #[test]
    fn current_frame_rotates_with_draw_count() {
        let mut sync = FrameSynchronizer::from_slots(slots(), u64::MAX);
        let mut gpu = FakeGpu::new(3, &slots());

        assert_eq!(sync.current_frame(), 0);
        for n in 1..=7u64 {
            sync.draw(&mut gpu).unwrap();
            assert_eq!(sync.frames_drawn(), n);
            assert_eq!(sync.current_frame(), n as usize % MAX_FRAMES_IN_FLIGHT);
        }
    }

    #[test]
    fn never_more_than_max_frames_in_flight() {
        let mut sync = FrameSynchronizer::from_slots(slots(), u64::MAX);
        let mut gpu = FakeGpu::new(3, &slots());

        for _ in 0..10 {
            sync.draw(&mut gpu).unwrap();
            assert!(gpu.in_flight() <= MAX_FRAMES_IN_FLIGHT);
        }
        assert_eq!(gpu.in_flight(), MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn one_frame_follows_the_protocol_order() {
        let slots = slots();
        let mut sync = FrameSynchronizer::from_slots(slots, u64::MAX);
        let mut gpu = FakeGpu::new(3, &slots);

        let image = sync.draw(&mut gpu).unwrap();
        let s = slots[0];
        assert_eq!(
            gpu.calls,
            vec![
                Call::Wait(s.in_flight_fence.as_raw()),
                Call::Reset(s.in_flight_fence.as_raw()),
                Call::Acquire(s.image_available.as_raw()),
                Call::Submit {
                    image,
                    wait: s.image_available.as_raw(),
                    signal: s.render_finished.as_raw(),
                    fence: s.in_flight_fence.as_raw(),
                },
                Call::Present {
                    image,
                    wait: s.render_finished.as_raw(),
                },
            ]
        );
        assert_eq!(sync.slot_state(0), SlotState::Presenting);
        assert_eq!(sync.slot_state(1), SlotState::Idle);
    }

    #[test]
    fn image_index_is_independent_of_slot() {
        let slots = slots();
        let mut sync = FrameSynchronizer::from_slots(slots, u64::MAX);
        let mut gpu = FakeGpu::new(3, &slots);

        let presented: Vec<u32> = (0..6).map(|_| sync.draw(&mut gpu).unwrap()).collect();
        assert_eq!(presented, vec![0, 1, 2, 0, 1, 2]);

        // The third frame is back on slot 0 but renders image 2
        let submits: Vec<_> = gpu
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Submit { image, fence, .. } => Some((*image, *fence)),
                _ => None,
            })
            .collect();
        assert_eq!(submits[2], (2, slots[0].in_flight_fence.as_raw()));
        assert_eq!(submits[3], (0, slots[1].in_flight_fence.as_raw()));
    }

    #[test]
    fn hung_gpu_surfaces_as_device_lost() {
        let slots = slots();
        let mut sync = FrameSynchronizer::from_slots(slots, 1_000_000);
        let mut gpu = FakeGpu::new(2, &slots);
        gpu.hang = true;

        let err = sync.draw(&mut gpu).unwrap_err();
        assert!(matches!(
            err,
            RendererError::DeviceLostOrHung {
                step: FrameStep::Throttle,
                ..
            }
        ));
        assert_eq!(sync.current_frame(), 0, "failed frame does not advance");
    }

    #[test]
    fn present_failure_is_fatal_and_does_not_advance() {
        let slots = slots();
        let mut sync = FrameSynchronizer::from_slots(slots, u64::MAX);
        let mut gpu = FakeGpu::new(2, &slots);
        gpu.fail_present = Some(vk::Result::ERROR_OUT_OF_DATE_KHR);

        let err = sync.draw(&mut gpu).unwrap_err();
        assert!(matches!(
            err,
            RendererError::SubmissionOrPresent {
                step: FrameStep::Present,
                source: vk::Result::ERROR_OUT_OF_DATE_KHR,
            }
        ));
        assert_eq!(sync.frames_drawn(), 0);
        assert_eq!(sync.slot_state(0), SlotState::Submitted);
    }

    #[test]
    fn image_without_recorded_commands_is_never_submitted() {
        let slots = slots();
        let mut sync = FrameSynchronizer::from_slots(slots, u64::MAX);
        let mut gpu = FakeGpu::new(3, &slots);
        gpu.recorded = 2;

        sync.draw(&mut gpu).unwrap();
        sync.draw(&mut gpu).unwrap();
        let err = sync.draw(&mut gpu).unwrap_err();

        assert!(matches!(
            err,
            RendererError::UnrecordedImage {
                index: 2,
                recorded: 2
            }
        ));
        assert!(!matches!(gpu.calls.last(), Some(Call::Submit { .. })));
        assert_eq!(sync.frames_drawn(), 2);
    }
}
