//! Hardware register save and restore.
//!
//! The firmware (or a previous owner) left the display engine in some
//! state; `save_hw_state` snapshots everything this driver touches and
//! `restore_hw_state` puts it back in an order the hardware tolerates:
//! scanout stops completely before any clock or timing register moves,
//! and planes relight last, against fully restored timings.

use log::{debug, warn};

use crate::context::DeviceContext;
use crate::error::{DisplayResult, PipeError};
use crate::pipe::{PipeId, PipePhase};
use crate::regs::{self, PipeConf, PipeRegs, PlaneControl, RingLen};

/// Bounded busy-wait on the vblank status bit. At 60 Hz a frame is
/// ~17ms; this bound is far past any real refresh interval.
const VBLANK_SPINS: u32 = 50_000;

/// Snapshot of one pipe's registers.
#[derive(Debug, Clone)]
pub struct SavedPipeRegs {
    pub conf: u32,
    pub src: u32,
    pub htotal: u32,
    pub hblank: u32,
    pub hsync: u32,
    pub vtotal: u32,
    pub vblank: u32,
    pub vsync: u32,
    pub dpll: u32,
    pub dpll_md: u32,
    pub fp0: u32,
    pub fp1: u32,
    pub plane_cntr: u32,
    pub plane_stride: u32,
    pub plane_size: u32,
    pub plane_pos: u32,
    pub plane_base: u32,
    pub plane_surf: u32,
    pub palette: Box<[u32; regs::PALETTE_LEN as usize]>,
}

/// Complete register snapshot taken on first VT entry.
#[derive(Debug, Clone)]
pub struct SavedRegisterSet {
    pub pipes: Vec<SavedPipeRegs>,
    pub vga_cntrl: u32,
    pub vclk_divisor: [u32; 2],
    pub vclk_post: u32,
    pub pfit: u32,
    pub swf: [u32; regs::SWF_COUNT],
}

/// Scratch ("software flag") register offsets: the BIOS stashes state
/// across suspend in three scattered banks.
fn swf_offset(index: usize) -> u32 {
    match index {
        0..=6 => regs::SWF0 + 4 * index as u32,
        7..=13 => regs::SWF00 + 4 * (index as u32 - 7),
        14 => regs::SWF30,
        15 => regs::SWF31,
        _ => regs::SWF32,
    }
}

impl DeviceContext {
    /// Snapshot every register the driver will touch.
    pub fn save_hw_state(&mut self) -> SavedRegisterSet {
        let mut pipes = Vec::with_capacity(self.pipes.len());
        for idx in 0..self.pipes.len() {
            let pr = match PipeId::from_index(idx) {
                Some(p) => PipeRegs::for_pipe(p),
                None => continue,
            };
            let mut palette = Box::new([0u32; regs::PALETTE_LEN as usize]);
            for (i, slot) in palette.iter_mut().enumerate() {
                *slot = self.regs.read(pr.palette + 4 * i as u32);
            }
            pipes.push(SavedPipeRegs {
                conf: self.regs.read(pr.conf),
                src: self.regs.read(pr.src),
                htotal: self.regs.read(pr.htotal),
                hblank: self.regs.read(pr.hblank),
                hsync: self.regs.read(pr.hsync),
                vtotal: self.regs.read(pr.vtotal),
                vblank: self.regs.read(pr.vblank),
                vsync: self.regs.read(pr.vsync),
                dpll: self.regs.read(pr.dpll),
                dpll_md: if self.generation.has_surface_regs() {
                    self.regs.read(pr.dpll_md)
                } else {
                    0
                },
                fp0: self.regs.read(pr.fp0),
                fp1: self.regs.read(pr.fp1),
                plane_cntr: self.regs.read(pr.plane_cntr),
                plane_stride: self.regs.read(pr.plane_stride),
                plane_size: self.regs.read(pr.plane_size),
                plane_pos: self.regs.read(pr.plane_pos),
                plane_base: self.regs.read(pr.plane_base),
                plane_surf: if self.generation.has_surface_regs() {
                    self.regs.read(pr.plane_surf)
                } else {
                    0
                },
                palette,
            });
        }

        for out in &mut self.outputs {
            out.ops.save(&mut self.regs);
        }

        let mut swf = [0u32; regs::SWF_COUNT];
        for (i, slot) in swf.iter_mut().enumerate() {
            *slot = self.regs.read(swf_offset(i));
        }

        debug!("saved register state for {} pipes", pipes.len());
        SavedRegisterSet {
            pipes,
            vga_cntrl: self.regs.read(regs::VGACNTRL),
            vclk_divisor: [
                self.regs.read(regs::VCLK_DIVISOR_VGA0),
                self.regs.read(regs::VCLK_DIVISOR_VGA1),
            ],
            vclk_post: self.regs.read(regs::VCLK_POST_DIV),
            pfit: self.regs.read(regs::PFIT_CONTROL),
            swf,
        }
    }

    /// Put the hardware back the way `save_hw_state` found it.
    ///
    /// Scanout is fully quiesced first (planes, then pipes, then output
    /// ports), a vblank passes so the disable lands, and only then do
    /// timing and clock registers move. Plane controls are rewritten
    /// last so nothing scans out of a half-restored configuration.
    pub fn restore_hw_state(&mut self, saved: &SavedRegisterSet) {
        for idx in 0..self.pipes.len() {
            let Some(pipe) = PipeId::from_index(idx) else {
                continue;
            };
            let pr = PipeRegs::for_pipe(pipe);
            self.regs.clear_bits(pr.plane_cntr, PlaneControl::ENABLE.bits());
            self.regs.posting_write(pr.plane_cntr);
        }
        for idx in 0..self.pipes.len() {
            let Some(pipe) = PipeId::from_index(idx) else {
                continue;
            };
            let pr = PipeRegs::for_pipe(pipe);
            self.regs.clear_bits(pr.conf, PipeConf::ENABLE.bits());
            self.regs.posting_write(pr.conf);
        }
        for out in &mut self.outputs {
            let pipe = out.pipe.unwrap_or(PipeId::A);
            out.ops.pre_set_mode(&mut self.regs, None, pipe);
            out.enabled = false;
        }
        for idx in 0..self.pipes.len() {
            if let Some(pipe) = PipeId::from_index(idx) {
                if let Err(e) = self.wait_for_vblank(pipe) {
                    warn!("{} while quiescing for restore", e);
                }
            }
        }

        for (idx, sp) in saved.pipes.iter().enumerate() {
            let pr = match PipeId::from_index(idx) {
                Some(p) => PipeRegs::for_pipe(p),
                None => continue,
            };
            self.regs.write(pr.fp0, sp.fp0);
            self.regs.write(pr.fp1, sp.fp1);
            self.regs.write(pr.dpll, sp.dpll);
            self.regs.posting_write(pr.dpll);
            if self.generation.has_surface_regs() {
                self.regs.write(pr.dpll_md, sp.dpll_md);
            }
            self.regs.write(pr.htotal, sp.htotal);
            self.regs.write(pr.hblank, sp.hblank);
            self.regs.write(pr.hsync, sp.hsync);
            self.regs.write(pr.vtotal, sp.vtotal);
            self.regs.write(pr.vblank, sp.vblank);
            self.regs.write(pr.vsync, sp.vsync);
            self.regs.write(pr.src, sp.src);
            self.regs.write(pr.plane_stride, sp.plane_stride);
            self.regs.write(pr.plane_size, sp.plane_size);
            self.regs.write(pr.plane_pos, sp.plane_pos);
            self.regs.write(pr.plane_base, sp.plane_base);
            for (i, &value) in sp.palette.iter().enumerate() {
                self.regs.write(pr.palette + 4 * i as u32, value);
            }
        }

        self.regs.write(regs::PFIT_CONTROL, saved.pfit);
        for out in &mut self.outputs {
            out.ops.restore(&mut self.regs);
        }

        for (idx, sp) in saved.pipes.iter().enumerate() {
            let pr = match PipeId::from_index(idx) {
                Some(p) => PipeRegs::for_pipe(p),
                None => continue,
            };
            if self.generation.has_surface_regs() {
                self.regs.write(pr.plane_surf, sp.plane_surf);
            }
        }

        self.regs.write(regs::VCLK_DIVISOR_VGA0, saved.vclk_divisor[0]);
        self.regs.write(regs::VCLK_DIVISOR_VGA1, saved.vclk_divisor[1]);
        self.regs.write(regs::VCLK_POST_DIV, saved.vclk_post);

        for (idx, sp) in saved.pipes.iter().enumerate() {
            let pr = match PipeId::from_index(idx) {
                Some(p) => PipeRegs::for_pipe(p),
                None => continue,
            };
            self.regs.write(pr.conf, sp.conf);
            self.regs.posting_write(pr.conf);
        }
        self.regs.write(regs::VGACNTRL, saved.vga_cntrl);
        for (idx, sp) in saved.pipes.iter().enumerate() {
            let pr = match PipeId::from_index(idx) {
                Some(p) => PipeRegs::for_pipe(p),
                None => continue,
            };
            self.regs.write(pr.plane_cntr, sp.plane_cntr);
            self.regs.posting_write(pr.plane_cntr);
        }
        for (i, &value) in saved.swf.iter().enumerate() {
            self.regs.write(swf_offset(i), value);
        }

        for pipe in &mut self.pipes {
            pipe.phase = PipePhase::Disabled;
            pipe.current_mode = None;
        }
        debug!("restored register state");
    }

    /// Wait for the start of vertical blank on `pipe`. The status bit is
    /// acknowledged first, so the wait observes a fresh blank rather
    /// than a stale latched one.
    pub(crate) fn wait_for_vblank(&mut self, pipe: PipeId) -> DisplayResult<()> {
        let pr = PipeRegs::for_pipe(pipe);
        let stat = regs::PipeStat::VBLANK_STATUS.bits();
        self.regs.write(pr.stat, stat);
        for _ in 0..VBLANK_SPINS {
            if self.regs.read(pr.stat) & stat != 0 {
                return Ok(());
            }
        }
        warn!("pipe {:?}: vblank wait timed out", pipe);
        Err(PipeError::VblankTimeout { pipe }.into())
    }

    /// Inspect what the previous owner left behind. A ring that is
    /// enabled with outstanding commands means someone exited without
    /// cleaning up; the caller follows with `reset_state`.
    pub fn check_inherited_state(&mut self) -> bool {
        let len = self.regs.read(regs::LP_RING + regs::RING_LEN);
        let head = self.regs.read(regs::LP_RING + regs::RING_HEAD) & regs::HEAD_ADDR_MASK;
        let tail = self.regs.read(regs::LP_RING + regs::RING_TAIL) & regs::TAIL_ADDR_MASK;
        let dirty = len & RingLen::ENABLED.bits() != 0 && head != tail;
        if dirty {
            warn!(
                "inherited an active ring (head {:#x} tail {:#x}), scrubbing",
                head, tail
            );
        }
        dirty
    }

    /// Force the engine to a known-idle configuration: every fence
    /// cleared, ring disabled and pointers zeroed, cursor off. With
    /// `flush` the ring is drained first so queued commands finish
    /// rather than vanish.
    pub fn reset_state(&mut self, flush: bool) {
        if flush {
            self.sync_engine();
        }
        let (base, count) = if self.generation.has_surface_regs() {
            (regs::FENCE_NEW, self.generation.fence_count())
        } else {
            (regs::FENCE, self.generation.fence_count())
        };
        for i in 0..count {
            self.regs.write(base + 4 * i as u32, 0);
        }
        self.regs.write(regs::LP_RING + regs::RING_LEN, 0);
        self.regs.write(regs::LP_RING + regs::RING_HEAD, 0);
        self.regs.write(regs::LP_RING + regs::RING_TAIL, 0);
        self.regs.write(regs::LP_RING + regs::RING_START, 0);
        for idx in 0..self.pipes.len() {
            if let Some(pipe) = PipeId::from_index(idx) {
                let pr = PipeRegs::for_pipe(pipe);
                self.regs.write(pr.cur_cntr, regs::CURSOR_MODE_DISABLE);
            }
        }
    }

    /// Point the hardware ring at our allocation and enable it.
    pub(crate) fn program_ring(&mut self) {
        let Some(handle) = self.ring else {
            return;
        };
        let Ok(range) = self.allocator.range(handle) else {
            return;
        };
        let (start, size) = (range.start as u32, range.size);
        self.regs.write(regs::LP_RING + regs::RING_LEN, 0);
        self.regs.write(regs::LP_RING + regs::RING_HEAD, 0);
        self.regs.write(regs::LP_RING + regs::RING_TAIL, 0);
        self.regs.write(regs::LP_RING + regs::RING_START, start);
        let pages = (size / crate::mem::GTT_PAGE_SIZE).max(1) as u32;
        self.regs.write(
            regs::LP_RING + regs::RING_LEN,
            (pages - 1) << 12 | RingLen::ENABLED.bits(),
        );
        debug!("ring at {:#x}, {} pages", start, pages);
    }

    /// Program fence 0 to cover a tiled front buffer; everything else
    /// stays cleared.
    pub(crate) fn program_fences(&mut self) {
        if !self.tiling_enabled {
            return;
        }
        let Some(handle) = self.front else {
            return;
        };
        let Ok(range) = self.allocator.range(handle) else {
            return;
        };
        if range.tiling == crate::mem::TileMode::None {
            return;
        }
        let base = if self.generation.has_surface_regs() {
            regs::FENCE_NEW
        } else {
            regs::FENCE
        };
        // Valid bit plus the naturally aligned start; pitch class is
        // implied by the stride the plane was programmed with.
        self.regs.write(base, range.start as u32 | 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::fixture;
    use crate::mode::DisplayMode;
    use crate::output::{AnalogOutput, Output};

    fn ready_fixture() -> crate::context::testing::Fixture {
        let mut f = fixture();
        f.ctx
            .register_output(Output::new(Box::new(AnalogOutput::new(true))));
        f.ctx
            .regs
            .write(regs::PORT_HOTPLUG_STAT, regs::CRT_HOTPLUG_MONITOR_MASK);
        f.ctx.pre_init(1024, 768).expect("pre_init");
        f.ctx.screen_init().expect("screen_init");
        f
    }

    #[test]
    fn save_captures_seeded_registers() {
        let mut f = ready_fixture();
        f.ctx.regs.write(regs::VGACNTRL, 0x8000_0001);
        f.ctx.regs.write(regs::PFIT_CONTROL, 0x1234);
        f.ctx.regs.write(regs::PALETTE_A + 4 * 17, 0xAABBCC);
        f.ctx.regs.write(super::swf_offset(16), 0x5A5A_5A5A);
        let saved = f.ctx.save_hw_state();
        assert_eq!(saved.vga_cntrl, 0x8000_0001);
        assert_eq!(saved.pfit, 0x1234);
        assert_eq!(saved.pipes[0].palette[17], 0xAABBCC);
        assert_eq!(saved.swf[16], 0x5A5A_5A5A);
    }

    #[test]
    fn restore_round_trips_scribbled_registers() {
        let mut f = ready_fixture();
        f.ctx.regs.write(regs::HTOTAL_A, 0x031F_027F);
        f.ctx.regs.write(regs::DSPASTRIDE, 4096);
        f.ctx.regs.write(regs::VGACNTRL, 0x11);
        let saved = f.ctx.save_hw_state();

        f.ctx.regs.write(regs::HTOTAL_A, 0xDEAD);
        f.ctx.regs.write(regs::DSPASTRIDE, 0xDEAD);
        f.ctx.regs.write(regs::VGACNTRL, 0xDEAD);
        f.ctx.restore_hw_state(&saved);

        assert_eq!(f.ctx.regs.read(regs::HTOTAL_A), 0x031F_027F);
        assert_eq!(f.ctx.regs.read(regs::DSPASTRIDE), 4096);
        assert_eq!(f.ctx.regs.read(regs::VGACNTRL), 0x11);
    }

    #[test]
    fn restore_disables_planes_before_touching_timings() {
        let mut f = ready_fixture();
        let saved = f.ctx.save_hw_state();
        // Light the pipe so the disable path has something to do.
        f.ctx
            .regs
            .write(regs::PIPEASTAT, regs::PipeStat::VBLANK_STATUS.bits());
        f.ctx
            .set_mode(crate::pipe::PipeId::A, &DisplayMode::with_size(1024, 768, 65_000))
            .expect("mode set");

        f.ctx.regs.sparse_mut().clear_journal();
        f.ctx.restore_hw_state(&saved);
        let journal = f.ctx.regs.sparse_mut().journal().to_vec();

        let first = |offset: u32| {
            journal
                .iter()
                .position(|&(o, _)| o == offset)
                .unwrap_or(usize::MAX)
        };
        assert!(
            first(regs::DSPACNTR) < first(regs::HTOTAL_A),
            "plane must quiesce before timings move"
        );
        assert!(
            first(regs::PIPEACONF) < first(regs::HTOTAL_A),
            "pipe must stop before timings move"
        );
        let last_plane = journal
            .iter()
            .rposition(|&(o, _)| o == regs::DSPACNTR)
            .expect("plane restored");
        let last_conf = journal
            .iter()
            .rposition(|&(o, _)| o == regs::PIPEACONF)
            .expect("conf restored");
        assert!(last_conf < last_plane, "plane relights after pipe conf");
        assert_eq!(f.ctx.pipes[0].phase, PipePhase::Disabled);
    }

    #[test]
    fn inherited_active_ring_is_reported_and_scrubbed() {
        let mut f = ready_fixture();
        f.ctx
            .regs
            .write(regs::LP_RING + regs::RING_LEN, RingLen::ENABLED.bits());
        f.ctx.regs.write(regs::LP_RING + regs::RING_HEAD, 0x100);
        f.ctx.regs.write(regs::LP_RING + regs::RING_TAIL, 0x800);
        f.ctx.regs.write(regs::FENCE, 0xBAD1);
        assert!(f.ctx.check_inherited_state());

        f.ctx.reset_state(false);
        assert_eq!(f.ctx.regs.read(regs::LP_RING + regs::RING_LEN), 0);
        assert_eq!(f.ctx.regs.read(regs::LP_RING + regs::RING_HEAD), 0);
        assert_eq!(f.ctx.regs.read(regs::LP_RING + regs::RING_TAIL), 0);
        assert_eq!(f.ctx.regs.read(regs::FENCE), 0);
        assert!(!f.ctx.check_inherited_state());
    }

    #[test]
    fn idle_ring_is_not_flagged() {
        let mut f = ready_fixture();
        f.ctx
            .regs
            .write(regs::LP_RING + regs::RING_LEN, RingLen::ENABLED.bits());
        assert!(!f.ctx.check_inherited_state(), "head == tail is idle");
    }

    #[test]
    fn program_ring_points_at_allocation() {
        let mut f = ready_fixture();
        f.ctx.program_ring();
        let handle = f.ctx.ring.expect("ring allocated");
        let start = f.ctx.allocator.range(handle).expect("ring range").start as u32;
        assert_eq!(f.ctx.regs.read(regs::LP_RING + regs::RING_START), start);
        let len = f.ctx.regs.read(regs::LP_RING + regs::RING_LEN);
        assert_ne!(len & RingLen::ENABLED.bits(), 0);
        assert_eq!(len >> 12, 128 * 1024 / 4096 - 1, "page count encoding");
    }

    #[test]
    fn fences_cover_tiled_front_buffer() {
        let mut f = ready_fixture();
        assert!(f.ctx.tiling_enabled);
        f.ctx.program_fences();
        let fence = f.ctx.regs.read(regs::FENCE);
        assert_ne!(fence & 1, 0, "fence valid bit");
    }
}
