//! Driver context: one instance per screen, owning the register file,
//! the allocator, the pipes and outputs, and the presentation state.
//!
//! Lifecycle mirrors the server's: `pre_init` probes hardware and plans
//! memory, `screen_init` commits the plan, `enter_vt`/`leave_vt`
//! bracket ownership of the hardware, `close_screen` tears down.

use std::sync::Arc;

use log::{info, warn};

use crate::device::{DeviceHandle, DrmDevice};
use crate::error::{DisplayError, DisplayResult, PipeError};
use crate::mem::{
    tileable_pitch, AllocFlags, AllocRequest, Allocator, PoolKind, Purpose, RangeHandle,
    GTT_PAGE_SIZE, MM_MAX_BYTES, MM_MIN_PAGES,
};
use crate::mmio::{MmioSpace, RegisterFile};
use crate::mode::{DisplayMode, ModeLimits};
use crate::output::{assign_pipes, poll_outputs, Output};
use crate::pipe::{PipeId, PipeState, Rotation};
use crate::present::{CompletionSink, PresentClock, PresentState, TimerHost};
use crate::hwstate::SavedRegisterSet;
use crate::regs;

/// Chip families with meaningfully different programming models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuGeneration {
    /// 830M through 865G
    I8xx,
    /// 915G through 945GM
    I9xx,
    /// 965G and later
    I965,
}

impl GpuGeneration {
    /// Map a PCI device id to a family. Unknown ids get the middle
    /// generation, which has the most conservative programming model.
    pub fn classify(device_id: u16) -> Self {
        match device_id {
            0x3577 | 0x2562 | 0x3582 | 0x2572 => Self::I8xx,
            0x2582 | 0x258A | 0x2592 | 0x2772 | 0x27A2 | 0x27AE => Self::I9xx,
            0x2972 | 0x2982 | 0x2992 | 0x29A2 | 0x2A02 | 0x2A12 => Self::I965,
            other => {
                warn!("unrecognized device id {:#06x}, assuming 9xx", other);
                Self::I9xx
            }
        }
    }

    pub fn mode_limits(self) -> ModeLimits {
        match self {
            Self::I8xx => ModeLimits {
                max_width: 2048,
                max_height: 2048,
                max_stride: 8192,
            },
            Self::I9xx => ModeLimits {
                max_width: 4096,
                max_height: 4096,
                max_stride: 16384,
            },
            Self::I965 => ModeLimits {
                max_width: 8192,
                max_height: 8192,
                max_stride: 32768,
            },
        }
    }

    /// Number of fence registers to scrub on state reset.
    pub fn fence_count(self) -> usize {
        match self {
            Self::I965 => regs::FENCE_NEW_COUNT,
            _ => regs::FENCE_COUNT,
        }
    }

    /// 965-class display planes take a surface base register and do the
    /// panning arithmetic in hardware.
    pub fn has_surface_regs(self) -> bool {
        matches!(self, Self::I965)
    }

    pub fn num_pipes(self) -> usize {
        2
    }
}

/// User-visible configuration knobs.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// 2D acceleration (allocates a ring buffer)
    pub accel: bool,
    /// Force the software cursor
    pub sw_cursor: bool,
    /// Override detected video memory, in KiB
    pub video_ram_kb: Option<u64>,
    /// Framebuffer tiling (falls back automatically when infeasible)
    pub tiling: bool,
    pub rotation: Rotation,
    /// Drive all connected outputs with the same framebuffer
    pub clone_mode: bool,
    /// Route presentation flips through the blitter to avoid tearing
    pub tear_free: bool,
    /// Cap on the 3D texture pool, in bytes
    pub texture_cap: Option<u64>,
    /// Shadow framebuffer (required for rotation on older chips)
    pub shadow_fb: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            accel: true,
            sw_cursor: false,
            video_ram_kb: None,
            tiling: true,
            rotation: Rotation::Deg0,
            clone_mode: false,
            tear_free: false,
            texture_cap: None,
            shadow_fb: false,
        }
    }
}

/// Everything probed from the platform before the driver starts.
pub struct Hardware {
    pub mmio: Box<dyn MmioSpace + Send>,
    pub drm: Box<dyn DrmDevice>,
    pub drm_minor: u32,
    pub device_id: u16,
    pub stolen_base: u64,
    pub stolen_physical: u64,
    pub stolen_size: u64,
    pub aperture_base: u64,
    pub aperture_physical: u64,
    pub aperture_size: u64,
    pub clock: Box<dyn PresentClock>,
    pub timers: Box<dyn TimerHost>,
    pub completions: Box<dyn CompletionSink>,
}

/// Per-screen driver state.
pub struct DeviceContext {
    pub options: DriverOptions,
    pub generation: GpuGeneration,
    pub(crate) regs: RegisterFile,
    pub(crate) handle: Arc<DeviceHandle>,
    pub(crate) allocator: Allocator,
    pub(crate) pipes: Vec<PipeState>,
    pub(crate) outputs: Vec<Output>,
    pub(crate) saved: Option<SavedRegisterSet>,
    pub(crate) present: PresentState,
    pub(crate) clock: Box<dyn PresentClock>,
    pub(crate) timers: Box<dyn TimerHost>,
    pub(crate) completions: Box<dyn CompletionSink>,
    /// Bytes per pixel of the front buffer
    pub(crate) cpp: u32,
    /// Virtual desktop width in pixels, after pitch widening
    pub(crate) display_width: u32,
    pub(crate) display_height: u32,
    pub(crate) front: Option<RangeHandle>,
    pub(crate) cursor_mem: Option<RangeHandle>,
    pub(crate) ring: Option<RangeHandle>,
    /// Kernel memory-manager reservation, in GTT pages
    pub(crate) mm_reserved_pages: u64,
    /// Effective tiling state after feasibility probing
    pub(crate) tiling_enabled: bool,
    /// Direct rendering; disabled as a last resort when memory is tight
    pub(crate) dri_enabled: bool,
    /// Engine may have writes in flight that panning must wait out
    pub(crate) accel_needs_sync: bool,
    pub(crate) vt_active: bool,
    pub(crate) cursor_on: bool,
    aperture_total: u64,
}

impl DeviceContext {
    /// Build a context over probed hardware and open the kernel device.
    pub fn new(hw: Hardware, options: DriverOptions) -> DisplayResult<Self> {
        let generation = GpuGeneration::classify(hw.device_id);
        let handle = DeviceHandle::open(hw.drm_minor, hw.drm);
        handle.acquire()?;

        let aperture_total = match options.video_ram_kb {
            Some(kb) => (kb * 1024).min(hw.aperture_size),
            None => hw.aperture_size,
        };

        let num_pipes = generation.num_pipes();
        let pipes = (0..num_pipes)
            .filter_map(PipeId::from_index)
            .map(PipeState::new)
            .collect();

        info!(
            "device {:#06x} ({:?}), {} MiB aperture, {} KiB stolen",
            hw.device_id,
            generation,
            aperture_total / (1024 * 1024),
            hw.stolen_size / 1024
        );

        Ok(Self {
            tiling_enabled: options.tiling,
            options,
            generation,
            regs: RegisterFile::new(hw.mmio),
            handle,
            allocator: Allocator::new(
                hw.stolen_base,
                hw.stolen_physical,
                hw.stolen_size,
                hw.aperture_base,
                hw.aperture_physical,
                aperture_total,
            ),
            pipes,
            outputs: Vec::new(),
            saved: None,
            present: PresentState::new(num_pipes),
            clock: hw.clock,
            timers: hw.timers,
            completions: hw.completions,
            cpp: 4,
            display_width: 0,
            display_height: 0,
            front: None,
            cursor_mem: None,
            ring: None,
            mm_reserved_pages: MM_MAX_BYTES.min(aperture_total / 2) / GTT_PAGE_SIZE,
            dri_enabled: true,
            accel_needs_sync: false,
            vt_active: false,
            cursor_on: false,
            aperture_total,
        })
    }

    pub fn register_output(&mut self, output: Output) {
        self.outputs.push(output);
    }

    /// Probe outputs, settle the framebuffer geometry and prove the
    /// memory plan feasible before any hardware is committed.
    ///
    /// Tiling demands pitches from a fixed set of classes, so the
    /// virtual width may be widened here; if even the widened layout
    /// cannot fit alongside the kernel memory-manager reservation, the
    /// reservation shrinks page by page to a floor, after which tiling
    /// and finally direct rendering are sacrificed.
    pub fn pre_init(&mut self, width: u32, height: u32) -> DisplayResult<()> {
        poll_outputs(&mut self.outputs, &mut self.regs);
        assign_pipes(&mut self.outputs, self.pipes.len());

        let limits = self.generation.mode_limits();
        if width > limits.max_width || height > limits.max_height {
            return Err(PipeError::ModeTooLarge {
                width,
                height,
                max_width: limits.max_width,
                max_height: limits.max_height,
            }
            .into());
        }

        self.display_height = height;
        self.settle_layout(width)?;
        info!(
            "virtual desktop {}x{}, pitch {} bytes, tiling {}, DRI {}",
            self.display_width,
            self.display_height,
            self.stride(),
            if self.tiling_enabled { "on" } else { "off" },
            if self.dri_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    fn initial_mm_pages(&self) -> u64 {
        MM_MAX_BYTES.min(self.aperture_total / 2) / GTT_PAGE_SIZE
    }

    /// Pick the effective width (pitch widening) and shrink the kernel
    /// reservation until a dry-run allocation succeeds.
    fn settle_layout(&mut self, width: u32) -> DisplayResult<()> {
        let limits = self.generation.mode_limits();
        loop {
            let effective = if self.tiling_enabled {
                match tileable_pitch(width) {
                    Some(w) if (w * self.cpp) <= limits.max_stride => w,
                    _ => {
                        info!("no tileable pitch for width {}, tiling disabled", width);
                        self.tiling_enabled = false;
                        continue;
                    }
                }
            } else {
                width
            };
            self.display_width = effective;

            match self.prove_plan() {
                Ok(()) => return Ok(()),
                Err(deficit) => {
                    if self.tiling_enabled {
                        // Tiling costs power-of-two fencing; give it up
                        // before giving up 3D.
                        info!("tiled layout short {} bytes, tiling disabled", deficit);
                        self.tiling_enabled = false;
                        self.mm_reserved_pages = self.initial_mm_pages();
                        continue;
                    }
                    if self.dri_enabled {
                        info!("layout short {} bytes, direct rendering disabled", deficit);
                        self.dri_enabled = false;
                        self.mm_reserved_pages = self.initial_mm_pages();
                        continue;
                    }
                    return Err(DisplayError::from(crate::error::AllocError::PoolExhausted {
                        requested: 0,
                        deficit,
                    }));
                }
            }
        }
    }

    /// Dry-run the current request list, shrinking the memory-manager
    /// reservation by the reported deficit until it fits or bottoms out
    /// at the floor. Returns the residual deficit on failure.
    fn prove_plan(&mut self) -> Result<(), u64> {
        loop {
            let capacity = self
                .aperture_total
                .saturating_sub(self.mm_reserved_pages * GTT_PAGE_SIZE);
            self.allocator.reset_allocations();
            self.allocator.set_aperture_capacity(capacity);

            let requests = self.allocation_requests();
            let deficit = match self
                .allocator
                .allocate(&requests, AllocFlags::DRY_RUN | AllocFlags::INITIAL)
            {
                Ok(_) => return Ok(()),
                Err(crate::error::AllocError::PoolExhausted { deficit, .. }) => deficit,
                // A single buffer bigger than the leftover aperture is
                // still a reservation problem until the floor is hit.
                Err(crate::error::AllocError::Oversized { requested, capacity }) => {
                    requested.saturating_sub(capacity)
                }
                Err(_) => return Err(0),
            };
            let deficit_pages = deficit.div_ceil(GTT_PAGE_SIZE);
            let spare = self.mm_reserved_pages.saturating_sub(MM_MIN_PAGES);
            if spare == 0 {
                return Err(deficit);
            }
            let shrink = deficit_pages.min(spare);
            self.mm_reserved_pages -= shrink;
            info!(
                "shrinking memory-manager reservation to {} pages",
                self.mm_reserved_pages
            );
        }
    }

    pub(crate) fn stride(&self) -> u32 {
        self.display_width * self.cpp
    }

    /// The request list both the dry-run prover and the commit use, so
    /// planned offsets are the offsets the screen actually gets.
    fn allocation_requests(&self) -> Vec<AllocRequest> {
        let mut requests = Vec::new();
        let fb_size = self.stride() as u64 * self.display_height as u64;
        requests.push(if self.tiling_enabled {
            AllocRequest::tiled(Purpose::FrontBuffer, fb_size, GTT_PAGE_SIZE, PoolKind::Stolen)
        } else {
            AllocRequest::fixed(Purpose::FrontBuffer, fb_size, GTT_PAGE_SIZE, PoolKind::Stolen)
        });
        if !self.options.sw_cursor {
            requests.push(AllocRequest::fixed(
                Purpose::CursorArgb,
                64 * 64 * 4,
                GTT_PAGE_SIZE,
                PoolKind::Stolen,
            ));
        }
        if self.options.accel {
            requests.push(AllocRequest::fixed(
                Purpose::RingBuffer,
                128 * 1024,
                GTT_PAGE_SIZE,
                PoolKind::Aperture,
            ));
        }
        if self.dri_enabled {
            requests.push(if self.tiling_enabled {
                AllocRequest::tiled(Purpose::BackBuffer, fb_size, GTT_PAGE_SIZE, PoolKind::Aperture)
            } else {
                AllocRequest::fixed(Purpose::BackBuffer, fb_size, GTT_PAGE_SIZE, PoolKind::Aperture)
            });
            requests.push(if self.tiling_enabled {
                AllocRequest::tiled(Purpose::DepthBuffer, fb_size, GTT_PAGE_SIZE, PoolKind::Aperture)
            } else {
                AllocRequest::fixed(Purpose::DepthBuffer, fb_size, GTT_PAGE_SIZE, PoolKind::Aperture)
            });
            requests.push(AllocRequest::flexible(
                Purpose::TexturePool,
                self.options.texture_cap.unwrap_or(self.aperture_total / 2),
            ));
        }
        requests
    }

    /// Commit the memory plan proven by `pre_init`.
    pub fn screen_init(&mut self) -> DisplayResult<()> {
        let requests = self.allocation_requests();
        let outcome = self
            .allocator
            .allocate(&requests, AllocFlags::INITIAL)?;
        self.front = outcome.handle_for(Purpose::FrontBuffer);
        self.cursor_mem = outcome.handle_for(Purpose::CursorArgb);
        self.ring = outcome.handle_for(Purpose::RingBuffer);
        Ok(())
    }

    /// Take ownership of the hardware.
    ///
    /// First entry snapshots the firmware register state; every entry
    /// scrubs whatever the previous owner left in the fences and ring
    /// before modes are lit.
    pub fn enter_vt(&mut self) -> DisplayResult<()> {
        self.handle.grab_master()?;

        if self.saved.is_none() {
            let saved = self.save_hw_state();
            self.saved = Some(saved);
        }
        self.check_inherited_state();
        self.reset_state(false);
        self.program_ring();
        self.program_fences();

        if let Err(e) = self.set_desired_modes() {
            self.handle.put_master();
            return Err(e);
        }
        self.adjust_frame(0, 0)?;
        self.vt_active = true;
        Ok(())
    }

    /// Release the hardware back to the previous owner's state.
    pub fn leave_vt(&mut self) {
        self.show_cursor(false);
        self.reset_state(true);
        if let Some(saved) = self.saved.take() {
            self.restore_hw_state(&saved);
            self.saved = Some(saved);
        }
        self.vt_active = false;
        self.handle.put_master();
    }

    /// Light every pipe that has a desired mode and a claimed output.
    pub fn set_desired_modes(&mut self) -> DisplayResult<()> {
        for idx in 0..self.pipes.len() {
            let Some(pipe) = PipeId::from_index(idx) else {
                continue;
            };
            if let Some(mode) = self.pipes[idx].desired_mode.clone() {
                self.set_mode(pipe, &mode)?;
            }
        }
        Ok(())
    }

    /// Switch the active mode on one pipe.
    pub fn switch_mode(&mut self, pipe: PipeId, mode: &DisplayMode) -> DisplayResult<()> {
        self.pipes[pipe.index()].desired_mode = Some(mode.clone());
        if self.vt_active {
            self.set_mode(pipe, mode)?;
        }
        Ok(())
    }

    /// Tear down: restore hardware if we still own it, then drop every
    /// allocation and the device reference.
    pub fn close_screen(&mut self) {
        if self.vt_active {
            self.leave_vt();
        }
        self.front = None;
        self.cursor_mem = None;
        self.ring = None;
        self.allocator.reset_allocations();
        match self.handle.release() {
            Ok(true) => info!("closed last reference to device"),
            Ok(false) => {}
            Err(e) => warn!("device release out of balance: {}", e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixture: a full context over fake hardware.

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::device::testing::{unique_minor, FakeDrm, FakeDrmState};
    use crate::mmio::SparseMmio;

    pub(crate) struct FakeClock(pub Arc<AtomicU64>);

    impl PresentClock for FakeClock {
        fn now_ust(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub(crate) struct TimerLog {
        pub armed: Vec<(u64, u64)>,
    }

    pub(crate) struct FakeTimers(pub Arc<Mutex<TimerLog>>);

    impl TimerHost for FakeTimers {
        fn set_timer(&mut self, delay_ms: u64, token: u64) {
            self.0
                .lock()
                .expect("timer log lock poisoned")
                .armed
                .push((delay_ms, token));
        }
    }

    #[derive(Default)]
    pub(crate) struct CompletionLog {
        pub notified: Vec<(u64, u64, u64)>,
    }

    pub(crate) struct FakeCompletions(pub Arc<Mutex<CompletionLog>>);

    impl CompletionSink for FakeCompletions {
        fn notify(&mut self, event_id: u64, ust: u64, msc: u64) {
            self.0
                .lock()
                .expect("completion log lock poisoned")
                .notified
                .push((event_id, ust, msc));
        }
    }

    pub(crate) struct Fixture {
        pub ctx: DeviceContext,
        pub drm: Arc<spin::Mutex<FakeDrmState>>,
        pub clock: Arc<AtomicU64>,
        pub timers: Arc<Mutex<TimerLog>>,
        pub completions: Arc<Mutex<CompletionLog>>,
    }

    pub(crate) fn fixture_over(
        mmio: Box<dyn MmioSpace + Send>,
        device_id: u16,
        options: DriverOptions,
    ) -> Fixture {
        let (drm, state) = FakeDrm::new();
        let clock = Arc::new(AtomicU64::new(0));
        let timers = Arc::new(Mutex::new(TimerLog::default()));
        let completions = Arc::new(Mutex::new(CompletionLog::default()));
        let hw = Hardware {
            mmio,
            drm: Box::new(drm),
            drm_minor: unique_minor(),
            device_id,
            stolen_base: 0,
            stolen_physical: 0x2000_0000,
            stolen_size: 8 * 1024 * 1024,
            aperture_base: 0x1000_0000,
            aperture_physical: 0x8000_0000,
            aperture_size: 256 * 1024 * 1024,
            clock: Box::new(FakeClock(Arc::clone(&clock))),
            timers: Box::new(FakeTimers(Arc::clone(&timers))),
            completions: Box::new(FakeCompletions(Arc::clone(&completions))),
        };
        let ctx = DeviceContext::new(hw, options).expect("context over fake hardware");
        Fixture {
            ctx,
            drm: state,
            clock,
            timers,
            completions,
        }
    }

    pub(crate) fn fixture_with(device_id: u16, options: DriverOptions) -> Fixture {
        fixture_over(Box::new(SparseMmio::new()), device_id, options)
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(0x2772, DriverOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{fixture, fixture_with};
    use super::*;
    use crate::output::{AnalogOutput, DetectStatus, LvdsOutput, Output};

    #[test]
    fn generation_classification() {
        assert_eq!(GpuGeneration::classify(0x3582), GpuGeneration::I8xx);
        assert_eq!(GpuGeneration::classify(0x2772), GpuGeneration::I9xx);
        assert_eq!(GpuGeneration::classify(0x29A2), GpuGeneration::I965);
        assert_eq!(GpuGeneration::classify(0xFFFF), GpuGeneration::I9xx);
    }

    #[test]
    fn pre_init_widens_pitch_to_class() {
        let mut f = fixture();
        f.ctx.pre_init(1300, 1000).expect("1300x1000 fits");
        assert!(f.ctx.tiling_enabled);
        assert_eq!(f.ctx.display_width, 2048, "1300 widens to the 2048 class");
    }

    #[test]
    fn pre_init_rejects_oversized_desktop() {
        let mut f = fixture_with(0x3582, DriverOptions::default());
        let err = f.ctx.pre_init(4000, 1000).expect_err("beyond 8xx limits");
        assert!(matches!(
            err,
            DisplayError::Pipe(PipeError::ModeTooLarge { .. })
        ));
    }

    #[test]
    fn memory_pressure_disables_tiling_first() {
        // Squeeze the aperture so the power-of-two tiled buffers cannot
        // fit but linear ones can.
        let options = DriverOptions {
            video_ram_kb: Some(24 * 1024),
            ..DriverOptions::default()
        };
        let mut f = fixture_with(0x2772, options);
        f.ctx.pre_init(1920, 1080).expect("fits after fallback");
        assert!(!f.ctx.tiling_enabled, "tiling sacrificed under pressure");
    }

    #[test]
    fn screen_init_commits_planned_ranges() {
        let mut f = fixture();
        f.ctx.pre_init(1024, 768).expect("pre_init");
        f.ctx.screen_init().expect("screen_init");
        assert!(f.ctx.front.is_some());
        assert!(f.ctx.cursor_mem.is_some());
        assert!(f.ctx.ring.is_some(), "accel default allocates a ring");
        let front = f
            .ctx
            .allocator
            .range(f.ctx.front.expect("front handle"))
            .expect("front range");
        assert_eq!(front.size % GTT_PAGE_SIZE, 0);
    }

    #[test]
    fn enter_and_leave_vt_balance_mastership() {
        let mut f = fixture();
        f.ctx
            .register_output(Output::new(Box::new(AnalogOutput::new(true))));
        // Hotplug status makes the probe inside pre_init see Connected.
        f.ctx
            .regs
            .write(crate::regs::PORT_HOTPLUG_STAT, crate::regs::CRT_HOTPLUG_MONITOR_MASK);
        f.ctx.pre_init(1024, 768).expect("pre_init");
        f.ctx.screen_init().expect("screen_init");
        assert_eq!(f.ctx.outputs[0].last_detect, DetectStatus::Connected);
        assert_eq!(f.ctx.outputs[0].pipe, Some(PipeId::A));
        f.ctx.pipes[0].desired_mode = Some(DisplayMode::with_size(1024, 768, 65_000));

        f.ctx.enter_vt().expect("enter_vt");
        assert!(f.ctx.vt_active);
        assert_eq!(f.ctx.handle.master_count(), 1);
        assert!(f.ctx.saved.is_some(), "first entry snapshots state");

        f.ctx.leave_vt();
        assert!(!f.ctx.vt_active);
        assert_eq!(f.ctx.handle.master_count(), 0);
        assert!(f.ctx.saved.is_some(), "snapshot is kept for re-entry");
    }

    #[test]
    fn lvds_fixture_prefers_highest_pipe() {
        let mut f = fixture();
        let mode = DisplayMode::with_size(1400, 1050, 108_000);
        f.ctx
            .register_output(Output::new(Box::new(LvdsOutput::new(Some(mode)))));
        f.ctx.pre_init(1400, 1050).expect("pre_init");
        assert_eq!(f.ctx.outputs[0].pipe, Some(PipeId::B));
    }
}
