//! Display mode timings.

/// One set of CRTC timings.
///
/// Horizontal values are in pixels, vertical values in lines, the dot
/// clock in kHz. `*_start`/`*_end` follow the usual convention: active,
/// then front porch to sync start, sync to sync end, then back porch to
/// total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    pub name: String,
    pub clock_khz: u32,
    pub hdisplay: u32,
    pub hsync_start: u32,
    pub hsync_end: u32,
    pub htotal: u32,
    pub vdisplay: u32,
    pub vsync_start: u32,
    pub vsync_end: u32,
    pub vtotal: u32,
}

impl DisplayMode {
    /// Conventional timings for a given active size, for tests and for
    /// hosts that only care about the resolution.
    pub fn with_size(width: u32, height: u32, clock_khz: u32) -> Self {
        Self {
            name: format!("{}x{}", width, height),
            clock_khz,
            hdisplay: width,
            hsync_start: width + width / 32,
            hsync_end: width + width / 16,
            htotal: width + width / 8,
            vdisplay: height,
            vsync_start: height + 3,
            vsync_end: height + 8,
            vtotal: height + height / 20 + 10,
        }
    }

    /// Refresh rate in millihertz.
    pub fn refresh_mhz(&self) -> u32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return 0;
        }
        let num = self.clock_khz as u64 * 1_000_000;
        (num / (self.htotal as u64 * self.vtotal as u64)) as u32
    }

    /// Duration of one frame in milliseconds, the unit the software
    /// vblank timer works in. Matches the delay computation the fake
    /// vblank path uses: frames * vtotal * htotal / clock_khz.
    pub fn frame_period_ms(&self) -> u64 {
        if self.clock_khz == 0 {
            return 0;
        }
        self.htotal as u64 * self.vtotal as u64 / self.clock_khz as u64
    }

    /// Timing-register encoding: (active - 1) | (total - 1) << 16.
    pub fn encode_timing(active: u32, total: u32) -> u32 {
        (active.saturating_sub(1)) | (total.saturating_sub(1)) << 16
    }

    /// Pipe source size encoding: (width - 1) << 16 | (height - 1).
    pub fn encode_src(&self) -> u32 {
        (self.hdisplay.saturating_sub(1)) << 16 | self.vdisplay.saturating_sub(1)
    }
}

/// Per-generation scanout limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeLimits {
    pub max_width: u32,
    pub max_height: u32,
    /// Hard stride limit of the display plane, in bytes
    pub max_stride: u32,
}

impl ModeLimits {
    pub fn check(&self, mode: &DisplayMode) -> bool {
        mode.hdisplay <= self.max_width && mode.vdisplay <= self.max_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_rate_is_plausible() {
        // 1024x768@60 needs roughly a 65 MHz dot clock
        let mode = DisplayMode {
            name: "1024x768".into(),
            clock_khz: 65_000,
            hdisplay: 1024,
            hsync_start: 1048,
            hsync_end: 1184,
            htotal: 1344,
            vdisplay: 768,
            vsync_start: 771,
            vsync_end: 777,
            vtotal: 806,
        };
        let mhz = mode.refresh_mhz();
        assert!((59_000..61_000).contains(&mhz), "got {} mHz", mhz);
        assert_eq!(mode.frame_period_ms(), 16);
    }

    #[test]
    fn timing_encoding() {
        assert_eq!(DisplayMode::encode_timing(1024, 1344), 1023 | (1343 << 16));
        let mode = DisplayMode::with_size(800, 600, 40_000);
        assert_eq!(mode.encode_src(), (799 << 16) | 599);
    }

    #[test]
    fn limits_reject_oversized_modes() {
        let limits = ModeLimits {
            max_width: 2048,
            max_height: 2048,
            max_stride: 8192,
        };
        assert!(limits.check(&DisplayMode::with_size(1920, 1080, 148_500)));
        assert!(!limits.check(&DisplayMode::with_size(2560, 1440, 241_500)));
    }
}
