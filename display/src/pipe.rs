//! Display pipes: mode setting, panning, power management, palette and
//! cursor control.
//!
//! A pipe walks Disabled -> Configuring -> Enabled during a mode set;
//! register programming only happens in Configuring, and the pipe only
//! reports Enabled after the first vertical blank confirms it is
//! scanning out. Validation failures leave the pipe untouched; an
//! unconfirmed enable shuts the pipe back down.

use log::{debug, info, warn};

use crate::error::{DisplayResult, PipeError};
use crate::mode::DisplayMode;
use crate::output::DpmsMode;
use crate::regs::{self, PipeConf, PipeRegs, PlaneControl};
use crate::context::DeviceContext;

/// Hardware pipe selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipeId {
    A,
    B,
}

impl PipeId {
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::A),
            1 => Some(Self::B),
            _ => None,
        }
    }
}

/// Mode-set progress of one pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipePhase {
    Disabled,
    Configuring,
    Enabled,
}

/// Scanout rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

/// Software state of one pipe.
pub struct PipeState {
    pub id: PipeId,
    pub phase: PipePhase,
    pub current_mode: Option<DisplayMode>,
    pub desired_mode: Option<DisplayMode>,
    /// Panning origin inside the virtual desktop
    pub base_x: u32,
    pub base_y: u32,
    pub gamma_enabled: bool,
    pub rotation: Rotation,
}

impl PipeState {
    pub fn new(id: PipeId) -> Self {
        Self {
            id,
            phase: PipePhase::Disabled,
            current_mode: None,
            desired_mode: None,
            base_x: 0,
            base_y: 0,
            gamma_enabled: false,
            rotation: Rotation::Deg0,
        }
    }
}

/// Crude divisor encoding for the DPLL feedback registers: hardware
/// needs the reference multiplied up to the pixel clock, the tests need
/// a deterministic value derived from the mode.
fn encode_fp(clock_khz: u32) -> u32 {
    let n = 2u32;
    let m = clock_khz / 96;
    (n - 1) << 16 | m.clamp(20, 140)
}

impl DeviceContext {
    fn pipe_checked(&self, pipe: PipeId) -> DisplayResult<()> {
        if pipe.index() >= self.pipes.len() {
            return Err(PipeError::NoSuchPipe { index: pipe.index() }.into());
        }
        Ok(())
    }

    /// Program `mode` on `pipe`.
    ///
    /// Ordering matters throughout: outputs are quiesced before the
    /// clocks change, the plane is pointed at the framebuffer before
    /// the pipe is enabled, and outputs light up only once the pipe is
    /// scanning. A vblank is awaited before declaring success so the
    /// first frame out of the pipe is a complete one.
    pub fn set_mode(&mut self, pipe: PipeId, mode: &DisplayMode) -> DisplayResult<()> {
        self.pipe_checked(pipe)?;
        let limits = self.generation.mode_limits();
        if !limits.check(mode) {
            return Err(PipeError::ModeTooLarge {
                width: mode.hdisplay,
                height: mode.vdisplay,
                max_width: limits.max_width,
                max_height: limits.max_height,
            }
            .into());
        }
        let stride = self.stride();
        if stride > limits.max_stride {
            return Err(PipeError::StrideTooLarge {
                stride,
                max: limits.max_stride,
            }
            .into());
        }
        // The plane scans the planned front buffer; a mode wider or
        // taller than the virtual desktop would scan past its end.
        if self.display_width != 0
            && (mode.hdisplay > self.display_width || mode.vdisplay > self.display_height)
        {
            return Err(PipeError::ModeExceedsFramebuffer {
                width: mode.hdisplay,
                height: mode.vdisplay,
                fb_width: self.display_width,
                fb_height: self.display_height,
            }
            .into());
        }

        self.pipes[pipe.index()].phase = PipePhase::Configuring;
        let pr = PipeRegs::for_pipe(pipe);

        for out in self.outputs.iter_mut().filter(|o| o.pipe == Some(pipe)) {
            out.ops.pre_set_mode(&mut self.regs, Some(mode), pipe);
        }

        // Clocks first, with the pipe still off.
        self.regs.write(pr.fp0, encode_fp(mode.clock_khz));
        self.regs.write(pr.fp1, encode_fp(mode.clock_khz));
        self.regs.write(pr.dpll, 1 << 31 | mode.clock_khz);
        self.regs.posting_write(pr.dpll);
        if self.generation.has_surface_regs() {
            self.regs.write(pr.dpll_md, 0);
        }

        self.regs
            .write(pr.htotal, DisplayMode::encode_timing(mode.hdisplay, mode.htotal));
        self.regs
            .write(pr.hblank, DisplayMode::encode_timing(mode.hdisplay, mode.htotal));
        self.regs
            .write(pr.hsync, DisplayMode::encode_timing(mode.hsync_start, mode.hsync_end));
        self.regs
            .write(pr.vtotal, DisplayMode::encode_timing(mode.vdisplay, mode.vtotal));
        self.regs
            .write(pr.vblank, DisplayMode::encode_timing(mode.vdisplay, mode.vtotal));
        self.regs
            .write(pr.vsync, DisplayMode::encode_timing(mode.vsync_start, mode.vsync_end));
        self.regs.write(pr.src, mode.encode_src());

        self.regs.write(pr.plane_stride, stride);
        self.regs.write(pr.plane_pos, 0);
        self.regs
            .write(pr.plane_size, mode.encode_src());
        self.program_plane_base(pipe)?;

        self.regs.write(pr.conf, PipeConf::ENABLE.bits());
        self.regs.posting_write(pr.conf);

        let mut plane = PlaneControl::ENABLE;
        if self.pipes[pipe.index()].gamma_enabled {
            plane |= PlaneControl::GAMMA_ENABLE;
        }
        if self.tiling_enabled {
            plane |= PlaneControl::TILED;
        }
        self.regs.write(pr.plane_cntr, plane.bits());
        self.regs.posting_write(pr.plane_cntr);

        for out in self.outputs.iter_mut().filter(|o| o.pipe == Some(pipe)) {
            out.ops.mode_set(&mut self.regs, mode, pipe);
            out.enabled = true;
        }

        if let Err(e) = self.wait_for_vblank(pipe) {
            warn!("{}: mode set unconfirmed, shutting the pipe down", e);
            self.disable_pipe(pipe)?;
            return Err(e);
        }

        let state = &mut self.pipes[pipe.index()];
        state.phase = PipePhase::Enabled;
        state.current_mode = Some(mode.clone());
        info!(
            "pipe {:?}: {} @ {}.{:03} Hz",
            pipe,
            mode.name,
            mode.refresh_mhz() / 1000,
            mode.refresh_mhz() % 1000
        );
        Ok(())
    }

    /// Shut a pipe down: outputs quiesce, plane off, pipe off.
    pub fn disable_pipe(&mut self, pipe: PipeId) -> DisplayResult<()> {
        self.pipe_checked(pipe)?;
        let pr = PipeRegs::for_pipe(pipe);
        for out in self.outputs.iter_mut().filter(|o| o.pipe == Some(pipe)) {
            out.ops.pre_set_mode(&mut self.regs, None, pipe);
            out.enabled = false;
        }
        self.regs.clear_bits(pr.plane_cntr, PlaneControl::ENABLE.bits());
        self.regs.posting_write(pr.plane_cntr);
        self.regs.clear_bits(pr.conf, PipeConf::ENABLE.bits());
        self.regs.posting_write(pr.conf);
        let state = &mut self.pipes[pipe.index()];
        state.phase = PipePhase::Disabled;
        state.current_mode = None;
        Ok(())
    }

    /// Point the plane at the framebuffer, honoring the panning origin.
    /// 965-class planes take the surface base and pan via the offset
    /// register; older planes get one combined byte address.
    fn program_plane_base(&mut self, pipe: PipeId) -> DisplayResult<()> {
        let pr = PipeRegs::for_pipe(pipe);
        let state = &self.pipes[pipe.index()];
        let offset = state.base_y * self.stride() + state.base_x * self.cpp;
        let start = match self.front {
            Some(handle) => self.allocator.range(handle)?.start,
            None => 0,
        };
        if self.generation.has_surface_regs() {
            self.regs.write(pr.plane_base, offset);
            self.regs.write(pr.plane_surf, start as u32);
            self.regs.posting_write(pr.plane_surf);
        } else {
            self.regs.write(pr.plane_base, start as u32 + offset);
            self.regs.posting_write(pr.plane_base);
        }
        Ok(())
    }

    /// Pan the viewport. The scanout base only moves once the engine has
    /// drained, otherwise in-flight blits land in the old frame.
    pub fn adjust_frame(&mut self, x: u32, y: u32) -> DisplayResult<()> {
        if self.accel_needs_sync {
            self.sync_engine();
        }
        for idx in 0..self.pipes.len() {
            let Some(pipe) = PipeId::from_index(idx) else {
                continue;
            };
            if self.pipes[idx].phase != PipePhase::Enabled {
                continue;
            }
            self.pipes[idx].base_x = x;
            self.pipes[idx].base_y = y;
            self.program_plane_base(pipe)?;
        }
        Ok(())
    }

    /// Spin until the ring drains. Bounded; a wedged engine produces a
    /// warning rather than a hang.
    pub(crate) fn sync_engine(&mut self) {
        const SPINS: u32 = 50_000;
        for _ in 0..SPINS {
            let head = self.regs.read(regs::LP_RING + regs::RING_HEAD) & regs::HEAD_ADDR_MASK;
            let tail = self.regs.read(regs::LP_RING + regs::RING_TAIL) & regs::TAIL_ADDR_MASK;
            if head == tail {
                self.accel_needs_sync = false;
                return;
            }
        }
        warn!("engine sync timed out, continuing with ring active");
    }

    /// DPMS for the whole screen. Every output gets the requested
    /// level; each lit pipe's plane and cursor gate on On/not-On so a
    /// suspended screen scans out nothing. Dark pipes are untouched.
    pub fn set_power_state(&mut self, mode: DpmsMode) {
        debug!("dpms {:?}", mode);
        for idx in 0..self.pipes.len() {
            if self.pipes[idx].phase != PipePhase::Enabled {
                continue;
            }
            let Some(pipe) = PipeId::from_index(idx) else {
                continue;
            };
            let pr = PipeRegs::for_pipe(pipe);
            match mode {
                DpmsMode::On => {
                    self.regs.set_bits(pr.conf, PipeConf::ENABLE.bits());
                    self.regs.posting_write(pr.conf);
                    self.regs.set_bits(pr.plane_cntr, PlaneControl::ENABLE.bits());
                    self.regs.posting_write(pr.plane_cntr);
                    if self.cursor_on {
                        self.program_cursor(pipe, true);
                    }
                }
                _ => {
                    self.program_cursor(pipe, false);
                    self.regs.clear_bits(pr.plane_cntr, PlaneControl::ENABLE.bits());
                    self.regs.posting_write(pr.plane_cntr);
                }
            }
        }
        for out in self.outputs.iter_mut() {
            out.ops.dpms(&mut self.regs, mode);
        }
    }

    /// Select the scanout rotation for one pipe. Only the unrotated
    /// case runs on the newest generation, and rotation on the older
    /// ones needs the host's shadow framebuffer to do the resampling.
    pub fn rotate(&mut self, pipe: PipeId, rotation: Rotation) -> DisplayResult<()> {
        self.pipe_checked(pipe)?;
        if rotation != Rotation::Deg0 {
            if self.generation.has_surface_regs() {
                return Err(PipeError::RotationUnsupported {
                    degrees: rotation.degrees(),
                }
                .into());
            }
            if !self.options.shadow_fb {
                return Err(PipeError::ShadowRequired.into());
            }
        }
        self.pipes[pipe.index()].rotation = rotation;
        Ok(())
    }

    /// Load the 8-bit gamma ramp. The palette only latches while the
    /// pipe scans, and gamma enable only latches across a plane
    /// toggle: the plane is quiesced, the ramp loaded, and the plane
    /// brought back with gamma on, each transition flushed through the
    /// base register.
    pub fn load_palette(&mut self, pipe: PipeId, ramp: &[(u8, u8, u8)]) -> DisplayResult<()> {
        self.pipe_checked(pipe)?;
        if self.pipes[pipe.index()].phase != PipePhase::Enabled {
            return Err(PipeError::PipeOff { pipe }.into());
        }
        let pr = PipeRegs::for_pipe(pipe);
        let cntr = self.regs.read(pr.plane_cntr);
        self.regs
            .write(pr.plane_cntr, cntr & !PlaneControl::ENABLE.bits());
        self.regs.posting_write(pr.plane_base);
        for (i, &(r, g, b)) in ramp.iter().take(regs::PALETTE_LEN as usize).enumerate() {
            let value = (r as u32) << 16 | (g as u32) << 8 | b as u32;
            self.regs.write(pr.palette + 4 * i as u32, value);
        }
        self.regs.write(
            pr.plane_cntr,
            cntr | PlaneControl::ENABLE.bits() | PlaneControl::GAMMA_ENABLE.bits(),
        );
        self.regs.posting_write(pr.plane_base);
        self.pipes[pipe.index()].gamma_enabled = true;
        Ok(())
    }

    /// Blank (`false`) or unblank (`true`) every lit pipe without
    /// touching the mode, for screen-saving.
    pub fn save_screen(&mut self, on: bool) {
        for idx in 0..self.pipes.len() {
            if self.pipes[idx].phase != PipePhase::Enabled {
                continue;
            }
            let Some(pipe) = PipeId::from_index(idx) else {
                continue;
            };
            let pr = PipeRegs::for_pipe(pipe);
            if on {
                self.regs.set_bits(pr.plane_cntr, PlaneControl::ENABLE.bits());
            } else {
                self.regs.clear_bits(pr.plane_cntr, PlaneControl::ENABLE.bits());
            }
            self.regs.posting_write(pr.plane_cntr);
        }
    }

    fn program_cursor(&mut self, pipe: PipeId, on: bool) {
        let pr = PipeRegs::for_pipe(pipe);
        if !on || self.options.sw_cursor {
            self.regs.write(pr.cur_cntr, regs::CURSOR_MODE_DISABLE);
            return;
        }
        let base = self
            .cursor_mem
            .and_then(|h| self.allocator.range(h).ok().map(|r| r.physical));
        if let Some(base) = base {
            self.regs.write(pr.cur_cntr, regs::CURSOR_MODE_64_ARGB);
            self.regs.write(pr.cur_base, base as u32);
        }
    }

    /// Show or hide the hardware cursor on every lit pipe.
    pub fn show_cursor(&mut self, on: bool) {
        self.cursor_on = on && !self.options.sw_cursor;
        for idx in 0..self.pipes.len() {
            if self.pipes[idx].phase != PipePhase::Enabled {
                continue;
            }
            let Some(pipe) = PipeId::from_index(idx) else {
                continue;
            };
            let show = self.cursor_on;
            self.program_cursor(pipe, show);
        }
    }

    /// Move the hardware cursor (signed screen coordinates; negative
    /// positions use the sign-magnitude encoding the hardware expects).
    pub fn set_cursor_position(&mut self, x: i32, y: i32) {
        for idx in 0..self.pipes.len() {
            if self.pipes[idx].phase != PipePhase::Enabled {
                continue;
            }
            let Some(pipe) = PipeId::from_index(idx) else {
                continue;
            };
            let pr = PipeRegs::for_pipe(pipe);
            let encode = |v: i32| -> u32 {
                if v < 0 {
                    1 << 15 | (-v) as u32
                } else {
                    v as u32
                }
            };
            self.regs
                .write(pr.cur_pos, encode(y) << 16 | encode(x));
        }
    }
}
