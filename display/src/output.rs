//! Output ports: CRT DAC, DVO, SDVO, LVDS panel and TV encoder.
//!
//! Each port type implements [`OutputOps`]; the driver core treats them
//! uniformly through the trait and only special-cases pipe assignment
//! (the panel prefers the highest pipe, the TV encoder only works on
//! pipe A).

use log::{debug, info};

use crate::mmio::RegisterFile;
use crate::mode::DisplayMode;
use crate::pipe::PipeId;
use crate::regs;

/// Result of probing a port for an attached monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectStatus {
    Connected,
    Disconnected,
    /// Port cannot tell (no load-detect path)
    Unknown,
}

/// Output power levels, in decreasing order of liveliness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsMode {
    On,
    Standby,
    Suspend,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Analog,
    Dvo,
    Sdvo,
    Lvds,
    TvOut,
}

impl OutputKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Analog => "VGA",
            Self::Dvo => "DVO",
            Self::Sdvo => "SDVO",
            Self::Lvds => "LVDS",
            Self::TvOut => "TV",
        }
    }
}

/// Per-port operations. All register traffic goes through the passed-in
/// register file so ports stay stateless with respect to the MMIO
/// mapping.
pub trait OutputOps: Send {
    fn kind(&self) -> OutputKind;

    fn detect(&mut self, regs: &mut RegisterFile) -> DetectStatus;

    /// Snapshot port registers for later [`OutputOps::restore`].
    fn save(&mut self, regs: &mut RegisterFile);

    fn restore(&mut self, regs: &mut RegisterFile);

    /// Called before a mode switch on the owning pipe. `None` means the
    /// pipe is being shut down; the port must reach a state that is
    /// safe while the pipe is off.
    fn pre_set_mode(&mut self, regs: &mut RegisterFile, mode: Option<&DisplayMode>, pipe: PipeId);

    /// Program the port for `mode` after pipe timings are in place.
    fn mode_set(&mut self, regs: &mut RegisterFile, mode: &DisplayMode, pipe: PipeId);

    fn dpms(&mut self, regs: &mut RegisterFile, mode: DpmsMode);
}

/// A discovered output: the port driver plus driver-core bookkeeping.
pub struct Output {
    pub ops: Box<dyn OutputOps>,
    pub pipe: Option<PipeId>,
    pub enabled: bool,
    pub last_detect: DetectStatus,
}

impl Output {
    pub fn new(ops: Box<dyn OutputOps>) -> Self {
        Self {
            ops,
            pipe: None,
            enabled: false,
            last_detect: DetectStatus::Unknown,
        }
    }

    pub fn kind(&self) -> OutputKind {
        self.ops.kind()
    }
}

/// Assign pipes to detected outputs.
///
/// The panel claims the highest pipe so panel fitting keeps working in
/// clone configurations; the TV encoder can only drive pipe A; everyone
/// else takes the first unclaimed pipe in discovery order. Outputs that
/// probed `Disconnected` keep no pipe.
pub fn assign_pipes(outputs: &mut [Output], num_pipes: usize) {
    let mut claimed = vec![false; num_pipes];
    for out in outputs.iter_mut() {
        out.pipe = None;
    }

    // Panel first.
    for out in outputs.iter_mut() {
        if out.kind() == OutputKind::Lvds && out.last_detect != DetectStatus::Disconnected {
            let idx = num_pipes - 1;
            out.pipe = PipeId::from_index(idx);
            claimed[idx] = true;
            info!("LVDS pinned to pipe {}", (b'A' + idx as u8) as char);
        }
    }

    for out in outputs.iter_mut() {
        if out.pipe.is_some() || out.last_detect == DetectStatus::Disconnected {
            continue;
        }
        let candidates: &[usize] = match out.kind() {
            OutputKind::Lvds => continue,
            // TV encoder is wired to pipe A only
            OutputKind::TvOut => &[0],
            _ => &[0, 1],
        };
        for &idx in candidates {
            if idx < num_pipes && !claimed[idx] {
                claimed[idx] = true;
                out.pipe = PipeId::from_index(idx);
                debug!(
                    "{} assigned to pipe {}",
                    out.kind().name(),
                    (b'A' + idx as u8) as char
                );
                break;
            }
        }
    }
}

/// Re-probe every output, returning true if any connection state
/// changed since the last probe.
pub fn poll_outputs(outputs: &mut [Output], regs: &mut RegisterFile) -> bool {
    let mut changed = false;
    for out in outputs.iter_mut() {
        let status = out.ops.detect(regs);
        if status != out.last_detect {
            info!("{} changed to {:?}", out.kind().name(), status);
            out.last_detect = status;
            changed = true;
        }
    }
    changed
}

// ---------------------------------------------------------------------
// CRT DAC
// ---------------------------------------------------------------------

/// Analog VGA output on the ADPA port.
pub struct AnalogOutput {
    saved_adpa: u32,
    hotplug_capable: bool,
}

impl AnalogOutput {
    pub fn new(hotplug_capable: bool) -> Self {
        Self {
            saved_adpa: 0,
            hotplug_capable,
        }
    }
}

impl OutputOps for AnalogOutput {
    fn kind(&self) -> OutputKind {
        OutputKind::Analog
    }

    fn detect(&mut self, regs: &mut RegisterFile) -> DetectStatus {
        if !self.hotplug_capable {
            return DetectStatus::Unknown;
        }
        if regs.read(regs::PORT_HOTPLUG_STAT) & regs::CRT_HOTPLUG_MONITOR_MASK != 0 {
            DetectStatus::Connected
        } else {
            DetectStatus::Disconnected
        }
    }

    fn save(&mut self, regs: &mut RegisterFile) {
        self.saved_adpa = regs.read(regs::ADPA);
    }

    fn restore(&mut self, regs: &mut RegisterFile) {
        regs.write(regs::ADPA, self.saved_adpa);
    }

    fn pre_set_mode(&mut self, regs: &mut RegisterFile, mode: Option<&DisplayMode>, _pipe: PipeId) {
        if mode.is_none() {
            regs.clear_bits(regs::ADPA, regs::ADPA_DAC_ENABLE);
        }
    }

    fn mode_set(&mut self, regs: &mut RegisterFile, _mode: &DisplayMode, pipe: PipeId) {
        let mut adpa = regs::ADPA_DAC_ENABLE
            | regs::ADPA_HSYNC_ACTIVE_HIGH
            | regs::ADPA_VSYNC_ACTIVE_HIGH;
        if pipe == PipeId::B {
            adpa |= regs::ADPA_PIPE_B_SELECT;
        }
        regs.write(regs::ADPA, adpa);
    }

    fn dpms(&mut self, regs: &mut RegisterFile, mode: DpmsMode) {
        match mode {
            DpmsMode::On => regs.set_bits(regs::ADPA, regs::ADPA_DAC_ENABLE),
            _ => regs.clear_bits(regs::ADPA, regs::ADPA_DAC_ENABLE),
        }
    }
}

// ---------------------------------------------------------------------
// DVO / SDVO
// ---------------------------------------------------------------------

/// Digital video out. SDVO ports share the DVO register block; the
/// `kind` distinguishes them for reporting and pipe assignment.
pub struct DigitalOutput {
    kind: OutputKind,
    reg: u32,
    saved_ctl: u32,
}

impl DigitalOutput {
    pub fn dvo(reg: u32) -> Self {
        Self {
            kind: OutputKind::Dvo,
            reg,
            saved_ctl: 0,
        }
    }

    pub fn sdvo(reg: u32) -> Self {
        Self {
            kind: OutputKind::Sdvo,
            reg,
            saved_ctl: 0,
        }
    }
}

impl OutputOps for DigitalOutput {
    fn kind(&self) -> OutputKind {
        self.kind
    }

    fn detect(&mut self, _regs: &mut RegisterFile) -> DetectStatus {
        // Presence is a transmitter-chip query, outside the register
        // file. Report Unknown and let configuration decide.
        DetectStatus::Unknown
    }

    fn save(&mut self, regs: &mut RegisterFile) {
        self.saved_ctl = regs.read(self.reg);
    }

    fn restore(&mut self, regs: &mut RegisterFile) {
        regs.write(self.reg, self.saved_ctl);
    }

    fn pre_set_mode(&mut self, regs: &mut RegisterFile, mode: Option<&DisplayMode>, _pipe: PipeId) {
        if mode.is_none() {
            regs.clear_bits(self.reg, regs::DVO_ENABLE);
        }
    }

    fn mode_set(&mut self, regs: &mut RegisterFile, _mode: &DisplayMode, pipe: PipeId) {
        let mut ctl = regs::DVO_ENABLE;
        if pipe == PipeId::B {
            ctl |= regs::ADPA_PIPE_B_SELECT;
        }
        regs.write(self.reg, ctl);
    }

    fn dpms(&mut self, regs: &mut RegisterFile, mode: DpmsMode) {
        match mode {
            DpmsMode::On => regs.set_bits(self.reg, regs::DVO_ENABLE),
            _ => regs.clear_bits(self.reg, regs::DVO_ENABLE),
        }
    }
}

// ---------------------------------------------------------------------
// LVDS panel
// ---------------------------------------------------------------------

/// Integrated panel. The port itself is simple; the sequencing matters:
/// panel power comes up only after the port is driving valid timings,
/// and goes down before the port is disabled.
pub struct LvdsOutput {
    saved_lvds: u32,
    saved_pp_control: u32,
    pub fixed_mode: Option<DisplayMode>,
}

impl LvdsOutput {
    pub fn new(fixed_mode: Option<DisplayMode>) -> Self {
        Self {
            saved_lvds: 0,
            saved_pp_control: 0,
            fixed_mode,
        }
    }

    fn panel_power(&self, regs: &mut RegisterFile, on: bool) {
        if on {
            regs.set_bits(regs::PP_CONTROL, regs::POWER_TARGET_ON);
        } else {
            regs.clear_bits(regs::PP_CONTROL, regs::POWER_TARGET_ON);
        }
    }
}

impl OutputOps for LvdsOutput {
    fn kind(&self) -> OutputKind {
        OutputKind::Lvds
    }

    fn detect(&mut self, _regs: &mut RegisterFile) -> DetectStatus {
        // A wired panel is always attached.
        if self.fixed_mode.is_some() {
            DetectStatus::Connected
        } else {
            DetectStatus::Disconnected
        }
    }

    fn save(&mut self, regs: &mut RegisterFile) {
        self.saved_lvds = regs.read(regs::LVDS);
        self.saved_pp_control = regs.read(regs::PP_CONTROL);
    }

    fn restore(&mut self, regs: &mut RegisterFile) {
        regs.write(regs::LVDS, self.saved_lvds);
        regs.write(regs::PP_CONTROL, self.saved_pp_control);
    }

    fn pre_set_mode(&mut self, regs: &mut RegisterFile, mode: Option<&DisplayMode>, _pipe: PipeId) {
        // Panel power off before the pipe stops, on either a shutdown
        // or a re-mode.
        let _ = mode;
        self.panel_power(regs, false);
        regs.clear_bits(regs::LVDS, regs::LVDS_PORT_ENABLE);
    }

    fn mode_set(&mut self, regs: &mut RegisterFile, _mode: &DisplayMode, pipe: PipeId) {
        let mut lvds = regs::LVDS_PORT_ENABLE;
        if pipe == PipeId::B {
            lvds |= regs::LVDS_PIPE_B_SELECT;
        }
        regs.write(regs::LVDS, lvds);
        regs.posting_write(regs::LVDS);
        self.panel_power(regs, true);
    }

    fn dpms(&mut self, regs: &mut RegisterFile, mode: DpmsMode) {
        match mode {
            DpmsMode::On => {
                regs.set_bits(regs::LVDS, regs::LVDS_PORT_ENABLE);
                self.panel_power(regs, true);
            }
            _ => {
                self.panel_power(regs, false);
                regs.clear_bits(regs::LVDS, regs::LVDS_PORT_ENABLE);
            }
        }
    }
}

// ---------------------------------------------------------------------
// TV encoder
// ---------------------------------------------------------------------

pub struct TvOutput {
    saved_tv_ctl: u32,
}

impl TvOutput {
    pub fn new() -> Self {
        Self { saved_tv_ctl: 0 }
    }
}

impl Default for TvOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputOps for TvOutput {
    fn kind(&self) -> OutputKind {
        OutputKind::TvOut
    }

    fn detect(&mut self, regs: &mut RegisterFile) -> DetectStatus {
        // DAC state reflects load detection run by firmware.
        if regs.read(regs::TV_DAC) != 0 {
            DetectStatus::Connected
        } else {
            DetectStatus::Unknown
        }
    }

    fn save(&mut self, regs: &mut RegisterFile) {
        self.saved_tv_ctl = regs.read(regs::TV_CTL);
    }

    fn restore(&mut self, regs: &mut RegisterFile) {
        regs.write(regs::TV_CTL, self.saved_tv_ctl);
    }

    fn pre_set_mode(&mut self, regs: &mut RegisterFile, mode: Option<&DisplayMode>, _pipe: PipeId) {
        if mode.is_none() {
            regs.clear_bits(regs::TV_CTL, regs::TV_ENC_ENABLE);
        }
    }

    fn mode_set(&mut self, regs: &mut RegisterFile, _mode: &DisplayMode, _pipe: PipeId) {
        regs.write(regs::TV_CTL, regs::TV_ENC_ENABLE);
    }

    fn dpms(&mut self, regs: &mut RegisterFile, mode: DpmsMode) {
        match mode {
            DpmsMode::On => regs.set_bits(regs::TV_CTL, regs::TV_ENC_ENABLE),
            _ => regs.clear_bits(regs::TV_CTL, regs::TV_ENC_ENABLE),
        }
    }
}
