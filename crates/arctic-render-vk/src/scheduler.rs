// SPDX-License-Identifier: CEPL-1.0
//! Frame scheduler: the per-frame protocol over a ring of frame slots.
//!
//! Per slot the order is always wait → acquire → reset fence → record →
//! submit → present. The fence is reset only once a submission that signals
//! it is certain; an out-of-date acquire leaves it signaled and returns.

use tracing::{error, info, warn};

use crate::error::{RenderError, RenderResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Done,
    /// Out-of-date or suboptimal; the image was still queued when possible.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
    /// Fence reset or acquire semaphore signaled with nothing queued to
    /// resolve it; the slot's sync objects are rebuilt before reuse.
    Orphaned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image: u32 },
    /// Chain was stale at acquire; nothing was submitted.
    Skipped,
}

/// The GPU-facing half of a frame. Slot indices are always `< slot_count()`.
pub trait FrameGpu {
    fn slot_count(&self) -> usize;
    /// Blocks until the slot's fence is signaled.
    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()>;
    fn acquire_image(&mut self, slot: usize) -> RenderResult<Acquire>;
    /// Resets the slot's fence.
    fn reset_slot(&mut self, slot: usize) -> RenderResult<()>;
    /// Records the draw and writes the slot's uniform block.
    fn record(&mut self, slot: usize, image: u32) -> RenderResult<()>;
    fn submit(&mut self, slot: usize) -> RenderResult<()>;
    fn present(&mut self, slot: usize, image: u32) -> RenderResult<Presented>;
    /// Empty submission that consumes the acquire semaphore and signals the
    /// slot's fence after a failed record or submit.
    fn abandon_slot(&mut self, slot: usize) -> RenderResult<()>;
    /// Replaces the slot's fence (signaled) and acquire semaphore. Only
    /// called with the device idle.
    fn recover_slot(&mut self, slot: usize) -> RenderResult<()>;
    fn wait_idle(&mut self) -> RenderResult<()>;
    /// Swapchain clean-up + create, then pipeline clean-up + load.
    fn rebuild_targets(&mut self) -> RenderResult<()>;
}

#[derive(Debug)]
pub struct FrameScheduler {
    current: usize,
    states: Vec<SlotState>,
    dirty: bool,
}

impl FrameScheduler {
    pub fn new(slot_count: usize) -> Self {
        Self { current: 0, states: vec![SlotState::Idle; slot_count.max(1)], dirty: false }
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Rebuilds a dirty chain, then runs one frame.
    pub fn tick<G: FrameGpu + ?Sized>(&mut self, gpu: &mut G) -> RenderResult<FrameOutcome> {
        if self.dirty {
            gpu.wait_idle()?;
            for state in &mut self.states {
                if *state != SlotState::Orphaned {
                    *state = SlotState::Idle;
                }
            }
            // stays dirty on failure so the next tick retries
            gpu.rebuild_targets()?;
            self.dirty = false;
            info!("render targets rebuilt");
        }
        self.render(gpu)
    }

    /// One pass of the frame protocol for the current slot.
    pub fn render<G: FrameGpu + ?Sized>(&mut self, gpu: &mut G) -> RenderResult<FrameOutcome> {
        let slot = self.current;
        if self.states[slot] == SlotState::Orphaned {
            gpu.wait_idle()?;
            gpu.recover_slot(slot)?;
            self.states[slot] = SlotState::Idle;
            info!("slot {slot} sync objects rebuilt");
        }
        gpu.wait_for_slot(slot)?;
        self.states[slot] = SlotState::Idle;

        let image = match gpu.acquire_image(slot)? {
            Acquire::OutOfDate => {
                warn!("swapchain out of date at acquire");
                gpu.wait_idle()?;
                self.dirty = true;
                return Ok(FrameOutcome::Skipped);
            }
            Acquire::Image { index, suboptimal } => {
                if suboptimal {
                    self.dirty = true;
                }
                index
            }
        };

        if let Err(e) = gpu.reset_slot(slot) {
            self.orphan(slot, &e);
            return Err(e);
        }
        self.states[slot] = SlotState::Recording;
        if let Err(e) = gpu.record(slot, image).and_then(|()| gpu.submit(slot)) {
            warn!("frame on slot {slot} abandoned: {e}");
            match gpu.abandon_slot(slot) {
                Ok(()) => {
                    self.states[slot] = SlotState::Submitted;
                    // the acquired image is never presented; only a rebuild returns it
                    self.dirty = true;
                    self.advance();
                }
                Err(re_arm) => self.orphan(slot, &re_arm),
            }
            return Err(e);
        }
        self.states[slot] = SlotState::Submitted;

        let presented = gpu.present(slot, image);
        self.advance();
        if presented? == Presented::Stale {
            warn!("swapchain stale at present");
            self.dirty = true;
        }
        Ok(FrameOutcome::Presented { slot, image })
    }

    /// Nothing will ever signal the slot's fence or wait its semaphore.
    fn orphan(&mut self, slot: usize, cause: &RenderError) {
        error!("slot {slot} left without a pending signal: {cause}");
        self.states[slot] = SlotState::Orphaned;
        self.dirty = true;
        self.advance();
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.states.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Ev {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Abandon(usize),
        Recover(usize),
        Idle,
        Rebuild,
    }

    fn failure(op: &'static str) -> RenderError {
        RenderError::Vulkan { op, result: vk::Result::ERROR_UNKNOWN }
    }

    /// Slots complete their work only when waited on, so any ordering bug
    /// shows up as an assertion instead of a race. The chain hands out
    /// `surface_images` views per rebuild and one framebuffer is made per view.
    struct MockGpu {
        fence_signaled: Vec<bool>,
        pending: Vec<bool>,
        acquired: Vec<bool>,
        surface_images: u32,
        views: Vec<u32>,
        framebuffers: Vec<u32>,
        next_image: u32,
        acquires: VecDeque<Acquire>,
        presents: VecDeque<Presented>,
        fail_reset: bool,
        fail_submit: bool,
        fail_abandon: bool,
        fail_recover: bool,
        fail_rebuild: bool,
        rebuilds: usize,
        log: Vec<Ev>,
    }

    impl MockGpu {
        fn new(slots: usize, image_count: u32) -> Self {
            let views: Vec<u32> = (0..image_count).collect();
            Self {
                fence_signaled: vec![true; slots],
                pending: vec![false; slots],
                acquired: vec![false; slots],
                surface_images: image_count,
                framebuffers: views.clone(),
                views,
                next_image: 0,
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                fail_reset: false,
                fail_submit: false,
                fail_abandon: false,
                fail_recover: false,
                fail_rebuild: false,
                rebuilds: 0,
                log: Vec::new(),
            }
        }

        fn position(&self, ev: Ev) -> Option<usize> {
            self.log.iter().position(|e| *e == ev)
        }
    }

    impl FrameGpu for MockGpu {
        fn slot_count(&self) -> usize {
            self.fence_signaled.len()
        }

        fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()> {
            self.log.push(Ev::Wait(slot));
            if self.pending[slot] {
                self.pending[slot] = false;
                self.fence_signaled[slot] = true;
            }
            assert!(self.fence_signaled[slot], "wait on slot {slot} would never return");
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> RenderResult<Acquire> {
            self.log.push(Ev::Acquire(slot));
            if let Some(scripted) = self.acquires.pop_front() {
                if matches!(scripted, Acquire::Image { .. }) {
                    self.acquired[slot] = true;
                }
                return Ok(scripted);
            }
            assert!(!self.acquired[slot], "acquire semaphore of slot {slot} still signaled");
            self.acquired[slot] = true;
            let index = self.next_image % self.views.len() as u32;
            self.next_image += 1;
            Ok(Acquire::Image { index, suboptimal: false })
        }

        fn reset_slot(&mut self, slot: usize) -> RenderResult<()> {
            self.log.push(Ev::Reset(slot));
            if std::mem::take(&mut self.fail_reset) {
                return Err(failure("reset_fences"));
            }
            assert!(self.fence_signaled[slot] && !self.pending[slot]);
            self.fence_signaled[slot] = false;
            Ok(())
        }

        fn record(&mut self, slot: usize, image: u32) -> RenderResult<()> {
            self.log.push(Ev::Record(slot, image));
            assert!(!self.pending[slot], "slot {slot} re-recorded while its work is in flight");
            assert!((image as usize) < self.framebuffers.len(), "no framebuffer for image {image}");
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> RenderResult<()> {
            self.log.push(Ev::Submit(slot));
            if std::mem::take(&mut self.fail_submit) {
                return Err(failure("queue_submit"));
            }
            self.acquired[slot] = false;
            self.pending[slot] = true;
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> RenderResult<Presented> {
            self.log.push(Ev::Present(slot, image));
            Ok(self.presents.pop_front().unwrap_or(Presented::Done))
        }

        fn abandon_slot(&mut self, slot: usize) -> RenderResult<()> {
            self.log.push(Ev::Abandon(slot));
            if std::mem::take(&mut self.fail_abandon) {
                return Err(failure("queue_submit(abandon)"));
            }
            assert!(!self.fence_signaled[slot]);
            self.acquired[slot] = false;
            self.pending[slot] = true;
            Ok(())
        }

        fn recover_slot(&mut self, slot: usize) -> RenderResult<()> {
            self.log.push(Ev::Recover(slot));
            assert!(self.pending.iter().all(|p| !p), "recovery with work in flight");
            if std::mem::take(&mut self.fail_recover) {
                return Err(RenderError::OutOfMemory {
                    op: "create_fence",
                    result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                });
            }
            self.fence_signaled[slot] = true;
            self.acquired[slot] = false;
            Ok(())
        }

        fn wait_idle(&mut self) -> RenderResult<()> {
            self.log.push(Ev::Idle);
            for (p, f) in self.pending.iter_mut().zip(&mut self.fence_signaled) {
                if std::mem::take(p) {
                    *f = true;
                }
            }
            Ok(())
        }

        fn rebuild_targets(&mut self) -> RenderResult<()> {
            self.log.push(Ev::Rebuild);
            assert!(self.pending.iter().all(|p| !p), "rebuild with work in flight");
            self.framebuffers.clear();
            self.views.clear();
            if std::mem::take(&mut self.fail_rebuild) {
                return Err(failure("create_swapchain"));
            }
            self.views = (0..self.surface_images).collect();
            self.framebuffers = self.views.iter().copied().collect();
            self.rebuilds += 1;
            Ok(())
        }
    }

    #[test]
    fn steady_state_order_and_ring() {
        let mut gpu = MockGpu::new(3, 3);
        let mut sched = FrameScheduler::new(gpu.slot_count());
        for expected in [0, 1, 2, 0] {
            assert!(matches!(sched.tick(&mut gpu).unwrap(), FrameOutcome::Presented { slot, .. } if slot == expected));
            assert_eq!(sched.slot_state(expected), SlotState::Submitted);
        }
        assert_eq!(
            &gpu.log[..6],
            &[Ev::Wait(0), Ev::Acquire(0), Ev::Reset(0), Ev::Record(0, 0), Ev::Submit(0), Ev::Present(0, 0)]
        );
        assert_eq!(sched.current_slot(), 1);
        assert!(!sched.is_dirty());
    }

    #[test]
    fn out_of_date_leaves_fence_alone() {
        let mut gpu = MockGpu::new(3, 3);
        gpu.acquires.push_back(Acquire::OutOfDate);
        let mut sched = FrameScheduler::new(3);

        assert_eq!(sched.render(&mut gpu).unwrap(), FrameOutcome::Skipped);
        assert_eq!(gpu.log, vec![Ev::Wait(0), Ev::Acquire(0), Ev::Idle]);
        assert!(gpu.fence_signaled[0]);
        assert!(sched.is_dirty());
        assert_eq!(sched.current_slot(), 0);

        // next tick rebuilds first, then draws on the same slot
        gpu.log.clear();
        assert!(matches!(sched.tick(&mut gpu).unwrap(), FrameOutcome::Presented { slot: 0, .. }));
        assert_eq!(&gpu.log[..3], &[Ev::Idle, Ev::Rebuild, Ev::Wait(0)]);
        assert!(!sched.is_dirty());
    }

    #[test]
    fn framebuffers_follow_the_new_chain_after_repeated_staleness() {
        let mut gpu = MockGpu::new(3, 3);
        gpu.acquires.extend([Acquire::OutOfDate; 3]);
        let mut sched = FrameScheduler::new(3);

        for _ in 0..3 {
            assert_eq!(sched.tick(&mut gpu).unwrap(), FrameOutcome::Skipped);
        }
        // the surface now offers a longer chain
        gpu.surface_images = 4;
        for _ in 0..4 {
            assert!(matches!(sched.tick(&mut gpu).unwrap(), FrameOutcome::Presented { .. }));
        }
        assert_eq!(gpu.rebuilds, 3);
        assert_eq!(gpu.views.len(), 4);
        assert_eq!(gpu.framebuffers.len(), gpu.views.len());
        assert!(gpu.log.contains(&Ev::Record(0, 3)));
        assert_eq!(gpu.log.iter().filter(|e| matches!(e, Ev::Reset(_))).count(), 4);
    }

    #[test]
    fn failed_rebuild_stays_dirty_and_retries() {
        let mut gpu = MockGpu::new(3, 3);
        gpu.acquires.push_back(Acquire::OutOfDate);
        let mut sched = FrameScheduler::new(3);
        assert_eq!(sched.tick(&mut gpu).unwrap(), FrameOutcome::Skipped);

        gpu.fail_rebuild = true;
        assert!(matches!(sched.tick(&mut gpu), Err(RenderError::Vulkan { op: "create_swapchain", .. })));
        assert!(sched.is_dirty());
        assert!(gpu.framebuffers.is_empty());
        assert!(!gpu.log.contains(&Ev::Wait(1)));

        assert!(matches!(sched.tick(&mut gpu).unwrap(), FrameOutcome::Presented { slot: 0, .. }));
        assert!(!sched.is_dirty());
        assert_eq!(gpu.rebuilds, 1);
        assert_eq!(gpu.log.iter().filter(|e| **e == Ev::Rebuild).count(), 2);
        assert_eq!(gpu.framebuffers.len(), 3);
    }

    #[test]
    fn clean_tick_does_not_rebuild() {
        let mut gpu = MockGpu::new(2, 3);
        let mut sched = FrameScheduler::new(2);
        for _ in 0..5 {
            sched.tick(&mut gpu).unwrap();
        }
        assert_eq!(gpu.rebuilds, 0);
    }

    #[test]
    fn failed_submit_rearms_slot() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.fail_submit = true;
        let mut sched = FrameScheduler::new(2);

        assert!(sched.render(&mut gpu).is_err());
        assert_eq!(gpu.log.last(), Some(&Ev::Abandon(0)));
        assert_eq!(sched.slot_state(0), SlotState::Submitted);
        assert!(sched.is_dirty());

        // wrapping back to slot 0 must not hang on its fence
        for _ in 0..3 {
            sched.tick(&mut gpu).unwrap();
        }
        assert!(gpu.log.contains(&Ev::Record(0, 2)));
        assert!(!gpu.log.contains(&Ev::Recover(0)));
    }

    #[test]
    fn failed_rearm_orphans_slot_until_recovered() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.fail_submit = true;
        gpu.fail_abandon = true;
        let mut sched = FrameScheduler::new(2);

        assert!(matches!(sched.render(&mut gpu), Err(RenderError::Vulkan { op: "queue_submit", .. })));
        assert_eq!(sched.slot_state(0), SlotState::Orphaned);
        assert!(!gpu.fence_signaled[0]);
        assert!(sched.is_dirty());
        assert_eq!(sched.current_slot(), 1);

        for _ in 0..4 {
            sched.tick(&mut gpu).unwrap();
        }
        let recovered = gpu.position(Ev::Recover(0)).unwrap();
        assert_eq!(gpu.log[recovered - 1], Ev::Idle);
        assert_eq!(gpu.log[recovered + 1], Ev::Wait(0));
        assert_ne!(sched.slot_state(0), SlotState::Orphaned);
    }

    #[test]
    fn failed_fence_reset_orphans_slot() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.fail_reset = true;
        let mut sched = FrameScheduler::new(2);

        assert!(sched.render(&mut gpu).is_err());
        assert_eq!(sched.slot_state(0), SlotState::Orphaned);
        assert!(gpu.acquired[0]);
        assert!(!gpu.log.iter().any(|e| matches!(e, Ev::Record(..))));

        // a rebuild in between keeps the slot marked
        sched.tick(&mut gpu).unwrap();
        assert_eq!(sched.slot_state(0), SlotState::Orphaned);

        // slot 0 comes round again: its semaphore is replaced before the acquire
        sched.tick(&mut gpu).unwrap();
        assert!(!gpu.acquired[0] || gpu.pending[0]);
        assert!(gpu.log.contains(&Ev::Recover(0)));
    }

    #[test]
    fn failed_recovery_is_retried() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.fail_submit = true;
        gpu.fail_abandon = true;
        let mut sched = FrameScheduler::new(2);
        assert!(sched.render(&mut gpu).is_err());
        sched.tick(&mut gpu).unwrap();

        gpu.fail_recover = true;
        assert!(matches!(sched.tick(&mut gpu), Err(RenderError::OutOfMemory { .. })));
        assert_eq!(sched.slot_state(0), SlotState::Orphaned);
        assert_eq!(sched.current_slot(), 0);

        assert!(matches!(sched.tick(&mut gpu).unwrap(), FrameOutcome::Presented { slot: 0, .. }));
        assert_eq!(gpu.log.iter().filter(|e| **e == Ev::Recover(0)).count(), 2);
    }

    #[test]
    fn stale_present_and_suboptimal_acquire_mark_dirty() {
        let mut gpu = MockGpu::new(3, 3);
        gpu.presents.push_back(Presented::Stale);
        let mut sched = FrameScheduler::new(3);
        assert!(matches!(sched.render(&mut gpu).unwrap(), FrameOutcome::Presented { .. }));
        assert!(sched.is_dirty());

        let mut gpu = MockGpu::new(3, 3);
        gpu.acquires.push_back(Acquire::Image { index: 2, suboptimal: true });
        let mut sched = FrameScheduler::new(3);
        assert_eq!(sched.render(&mut gpu).unwrap(), FrameOutcome::Presented { slot: 0, image: 2 });
        assert!(sched.is_dirty());
    }

    #[test]
    fn explicit_mark_dirty_triggers_rebuild() {
        let mut gpu = MockGpu::new(3, 3);
        let mut sched = FrameScheduler::new(3);
        sched.tick(&mut gpu).unwrap();
        sched.mark_dirty();
        sched.tick(&mut gpu).unwrap();
        assert_eq!(gpu.rebuilds, 1);
        assert!(!sched.is_dirty());
    }
}
