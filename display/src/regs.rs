//! MMIO register map for the i8xx/i9xx display engine.
//!
//! Offsets follow the programming documentation for the 8xx/9xx display
//! blocks. Pixel-exact semantics per chip revision are out of scope; the
//! offsets and bit positions here are the set the driver core depends on.

use bitflags::bitflags;

use crate::pipe::PipeId;

// ---------------------------------------------------------------------------
// Pipe timing and configuration (per-pipe blocks at 0x60000 / 0x61000)
// ---------------------------------------------------------------------------

pub const HTOTAL_A: u32 = 0x60000;
pub const HBLANK_A: u32 = 0x60004;
pub const HSYNC_A: u32 = 0x60008;
pub const VTOTAL_A: u32 = 0x6000C;
pub const VBLANK_A: u32 = 0x60010;
pub const VSYNC_A: u32 = 0x60014;
pub const PIPEASRC: u32 = 0x6001C;

pub const HTOTAL_B: u32 = 0x61000;
pub const HBLANK_B: u32 = 0x61004;
pub const HSYNC_B: u32 = 0x61008;
pub const VTOTAL_B: u32 = 0x6100C;
pub const VBLANK_B: u32 = 0x61010;
pub const VSYNC_B: u32 = 0x61014;
pub const PIPEBSRC: u32 = 0x6101C;

pub const PIPEACONF: u32 = 0x70008;
pub const PIPEASTAT: u32 = 0x70024;
pub const PIPEBCONF: u32 = 0x71008;
pub const PIPEBSTAT: u32 = 0x71024;

// ---------------------------------------------------------------------------
// Display planes
// ---------------------------------------------------------------------------

pub const DSPACNTR: u32 = 0x70180;
pub const DSPABASE: u32 = 0x70184;
pub const DSPASTRIDE: u32 = 0x70188;
pub const DSPAPOS: u32 = 0x7018C;
pub const DSPASIZE: u32 = 0x70190;
/// 965-class surface base; DSPABASE becomes a panning offset
pub const DSPASURF: u32 = 0x7019C;

pub const DSPBCNTR: u32 = 0x71180;
pub const DSPBBASE: u32 = 0x71184;
pub const DSPBSTRIDE: u32 = 0x71188;
pub const DSPBPOS: u32 = 0x7118C;
pub const DSPBSIZE: u32 = 0x71190;
pub const DSPBSURF: u32 = 0x7119C;

// ---------------------------------------------------------------------------
// Hardware cursor
// ---------------------------------------------------------------------------

pub const CURACNTR: u32 = 0x70080;
pub const CURABASE: u32 = 0x70084;
pub const CURAPOS: u32 = 0x70088;

pub const CURBCNTR: u32 = 0x700C0;
pub const CURBBASE: u32 = 0x700C4;
pub const CURBPOS: u32 = 0x700C8;

pub const CURSOR_MODE_DISABLE: u32 = 0x00;
pub const CURSOR_MODE_64_ARGB: u32 = 0x27;

// ---------------------------------------------------------------------------
// Clocks and palettes
// ---------------------------------------------------------------------------

pub const VCLK_DIVISOR_VGA0: u32 = 0x6000;
pub const VCLK_DIVISOR_VGA1: u32 = 0x6004;
pub const VCLK_POST_DIV: u32 = 0x6010;
pub const DPLL_A: u32 = 0x6014;
pub const DPLL_B: u32 = 0x6018;
pub const DPLL_A_MD: u32 = 0x601C;
pub const DPLL_B_MD: u32 = 0x6020;
pub const FPA0: u32 = 0x6040;
pub const FPA1: u32 = 0x6044;
pub const FPB0: u32 = 0x6048;
pub const FPB1: u32 = 0x604C;

pub const PALETTE_A: u32 = 0xA000;
pub const PALETTE_B: u32 = 0xA800;
/// Palette entries per pipe
pub const PALETTE_LEN: u32 = 256;

// ---------------------------------------------------------------------------
// Panel fitting, VGA plane, scratch
// ---------------------------------------------------------------------------

pub const PFIT_CONTROL: u32 = 0x61230;
pub const VGACNTRL: u32 = 0x71400;

pub const SWF0: u32 = 0x71410;
pub const SWF00: u32 = 0x70410;
pub const SWF30: u32 = 0x72414;
pub const SWF31: u32 = 0x72418;
pub const SWF32: u32 = 0x7241C;
/// Scratch registers captured across save/restore (SWF0x7 + SWF00x7 + SWF30..32)
pub const SWF_COUNT: usize = 17;

// ---------------------------------------------------------------------------
// Ring buffer and fences
// ---------------------------------------------------------------------------

pub const LP_RING: u32 = 0x2030;
pub const RING_TAIL: u32 = 0x00;
pub const RING_HEAD: u32 = 0x04;
pub const RING_START: u32 = 0x08;
pub const RING_LEN: u32 = 0x0C;

pub const HEAD_ADDR_MASK: u32 = 0x001F_FFFC;
pub const TAIL_ADDR_MASK: u32 = 0x001F_FFF8;

pub const FENCE: u32 = 0x2000;
pub const FENCE_COUNT: usize = 8;
/// 965-class fences are 64-bit pairs at a separate block
pub const FENCE_NEW: u32 = 0x3000;
pub const FENCE_NEW_COUNT: usize = 16;

bitflags! {
    /// Display plane control bits (DSPxCNTR)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PlaneControl: u32 {
        const ENABLE = 1 << 31;
        const GAMMA_ENABLE = 1 << 30;
        /// X-major tiled scanout
        const TILED = 1 << 10;
    }
}

bitflags! {
    /// Pipe configuration bits (PIPExCONF)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeConf: u32 {
        const ENABLE = 1 << 31;
    }
}

bitflags! {
    /// Pipe status bits (PIPExSTAT)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeStat: u32 {
        const VBLANK_STATUS = 1 << 1;
    }
}

bitflags! {
    /// Ring length register bits (RING_LEN)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RingLen: u32 {
        const ENABLED = 1 << 0;
    }
}

/// Per-pipe register block, resolving the A/B offset selection in one place.
#[derive(Debug, Clone, Copy)]
pub struct PipeRegs {
    pub conf: u32,
    pub stat: u32,
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
    pub palette: u32,
    pub plane_cntr: u32,
    pub plane_base: u32,
    pub plane_stride: u32,
    pub plane_pos: u32,
    pub plane_size: u32,
    pub plane_surf: u32,
    pub cur_cntr: u32,
    pub cur_base: u32,
    pub cur_pos: u32,
}

pub const PIPE_A_REGS: PipeRegs = PipeRegs {
    conf: PIPEACONF,
    stat: PIPEASTAT,
    src: PIPEASRC,
    htotal: HTOTAL_A,
    hblank: HBLANK_A,
    hsync: HSYNC_A,
    vtotal: VTOTAL_A,
    vblank: VBLANK_A,
    vsync: VSYNC_A,
    dpll: DPLL_A,
    dpll_md: DPLL_A_MD,
    fp0: FPA0,
    fp1: FPA1,
    palette: PALETTE_A,
    plane_cntr: DSPACNTR,
    plane_base: DSPABASE,
    plane_stride: DSPASTRIDE,
    plane_pos: DSPAPOS,
    plane_size: DSPASIZE,
    plane_surf: DSPASURF,
    cur_cntr: CURACNTR,
    cur_base: CURABASE,
    cur_pos: CURAPOS,
};

pub const PIPE_B_REGS: PipeRegs = PipeRegs {
    conf: PIPEBCONF,
    stat: PIPEBSTAT,
    src: PIPEBSRC,
    htotal: HTOTAL_B,
    hblank: HBLANK_B,
    hsync: HSYNC_B,
    vtotal: VTOTAL_B,
    vblank: VBLANK_B,
    vsync: VSYNC_B,
    dpll: DPLL_B,
    dpll_md: DPLL_B_MD,
    fp0: FPB0,
    fp1: FPB1,
    palette: PALETTE_B,
    plane_cntr: DSPBCNTR,
    plane_base: DSPBBASE,
    plane_stride: DSPBSTRIDE,
    plane_pos: DSPBPOS,
    plane_size: DSPBSIZE,
    plane_surf: DSPBSURF,
    cur_cntr: CURBCNTR,
    cur_base: CURBBASE,
    cur_pos: CURBPOS,
};

impl PipeRegs {
    pub const fn for_pipe(pipe: PipeId) -> Self {
        match pipe {
            PipeId::A => PIPE_A_REGS,
            PipeId::B => PIPE_B_REGS,
        }
    }
}

// ---------------------------------------------------------------------------
// Output control registers
// ---------------------------------------------------------------------------

/// Analog CRT DAC control
pub const ADPA: u32 = 0x61100;
pub const ADPA_DAC_ENABLE: u32 = 1 << 31;
pub const ADPA_PIPE_B_SELECT: u32 = 1 << 30;
pub const ADPA_HSYNC_ACTIVE_HIGH: u32 = 1 << 3;
pub const ADPA_VSYNC_ACTIVE_HIGH: u32 = 1 << 4;
/// Hotplug detect status for the DAC
pub const PORT_HOTPLUG_STAT: u32 = 0x61114;
pub const CRT_HOTPLUG_MONITOR_MASK: u32 = 3 << 8;

/// DVO ports
pub const DVOA: u32 = 0x61120;
pub const DVOB: u32 = 0x61140;
pub const DVOC: u32 = 0x61160;
pub const DVO_ENABLE: u32 = 1 << 31;

/// SDVO ports share the DVO B/C register locations
pub const SDVOB: u32 = DVOB;
pub const SDVOC: u32 = DVOC;

/// LVDS panel port
pub const LVDS: u32 = 0x61180;
pub const LVDS_PORT_ENABLE: u32 = 1 << 31;
pub const LVDS_PIPE_B_SELECT: u32 = 1 << 30;
/// Panel power control
pub const PP_CONTROL: u32 = 0x61204;
pub const PP_STATUS: u32 = 0x61200;
pub const POWER_TARGET_ON: u32 = 1 << 0;

/// TV-out control
pub const TV_CTL: u32 = 0x68000;
pub const TV_ENC_ENABLE: u32 = 1 << 31;
pub const TV_DAC: u32 = 0x68004;
