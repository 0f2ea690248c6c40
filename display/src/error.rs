//! Error types for the display core.
//!
//! Each subsystem reports through its own enum; `DisplayError` aggregates
//! them for callers that cross subsystem boundaries. Variants carry the
//! numbers a caller needs to react (exact byte deficits, errnos, pipe
//! ids) rather than preformatted strings.

use core::fmt;

use crate::pipe::PipeId;

/// Memory-allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The request list does not fit the backing pools. `deficit` is the
    /// exact number of bytes by which the plan overflows; shrinking any
    /// competing reservation by at least this much makes a retry succeed.
    PoolExhausted { requested: u64, deficit: u64 },
    /// Alignment is zero or not a power of two
    BadAlignment { alignment: u64 },
    /// A single request exceeds the pool outright
    Oversized { requested: u64, capacity: u64 },
    /// Handle predates the last `reset_allocations`
    StaleHandle,
    /// Handle does not name a live range
    UnknownRange,
}

/// Display-pipe errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// Mode exceeds the generation's active-resolution limit
    ModeTooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    /// Frame buffer stride exceeds the scanout engine's limit
    StrideTooLarge { stride: u32, max: u32 },
    /// Mode scans out past the planned framebuffer geometry
    ModeExceedsFramebuffer {
        width: u32,
        height: u32,
        fb_width: u32,
        fb_height: u32,
    },
    /// Rotation angle not supported on this hardware generation
    RotationUnsupported { degrees: u16 },
    /// Rotation requires shadow-framebuffer support from the host
    ShadowRequired,
    /// Operation requires the pipe to be enabled
    PipeOff { pipe: PipeId },
    /// No such pipe on this device
    NoSuchPipe { index: usize },
    /// Vertical blank did not arrive within the bounded wait
    VblankTimeout { pipe: PipeId },
}

/// Kernel-device errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// SET_VERSION ioctl kept failing after the bounded retry loop
    InterfaceVersion { errno: i32 },
    /// SET_MASTER ioctl kept failing after the bounded retry loop
    MasterDenied { errno: i32 },
    /// Magic-cookie authentication rejected
    AuthFailed { errno: i32 },
    /// Handle was released more times than acquired
    NotOpen,
}

/// Present/vblank scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentError {
    /// A synchronous flip is already in flight; retry after it completes
    FlipBusy,
    /// Async flips are not (or no longer) advertised by the device
    AsyncUnsupported,
    /// The page-flip ioctl failed
    FlipFailed { errno: i32 },
    /// Flips require an enabled pipe
    CrtcOff { pipe: PipeId },
}

/// Top-level error type for the display core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayError {
    Alloc(AllocError),
    Pipe(PipeError),
    Device(DeviceError),
    Present(PresentError),
}

/// Result alias used throughout the crate
pub type DisplayResult<T> = Result<T, DisplayError>;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted { requested, deficit } => write!(
                f,
                "allocation of {} bytes exceeds pool capacity by {} bytes",
                requested, deficit
            ),
            Self::BadAlignment { alignment } => {
                write!(f, "alignment {} is not a power of two", alignment)
            }
            Self::Oversized {
                requested,
                capacity,
            } => write!(
                f,
                "request of {} bytes exceeds pool capacity {}",
                requested, capacity
            ),
            Self::StaleHandle => write!(f, "range handle from a previous allocation epoch"),
            Self::UnknownRange => write!(f, "range handle does not name a live range"),
        }
    }
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModeTooLarge {
                width,
                height,
                max_width,
                max_height,
            } => write!(
                f,
                "mode {}x{} exceeds hardware limit {}x{}",
                width, height, max_width, max_height
            ),
            Self::StrideTooLarge { stride, max } => {
                write!(f, "stride {} exceeds limit {}", stride, max)
            }
            Self::ModeExceedsFramebuffer {
                width,
                height,
                fb_width,
                fb_height,
            } => write!(
                f,
                "mode {}x{} does not fit the {}x{} framebuffer",
                width, height, fb_width, fb_height
            ),
            Self::RotationUnsupported { degrees } => {
                write!(f, "{} degree rotation not supported on this generation", degrees)
            }
            Self::ShadowRequired => write!(f, "rotation requires shadow framebuffer support"),
            Self::PipeOff { pipe } => write!(f, "pipe {:?} is not enabled", pipe),
            Self::NoSuchPipe { index } => write!(f, "no pipe with index {}", index),
            Self::VblankTimeout { pipe } => {
                write!(f, "vblank wait timed out on pipe {:?}", pipe)
            }
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InterfaceVersion { errno } => {
                write!(f, "failed to set drm interface version: errno {}", errno)
            }
            Self::MasterDenied { errno } => {
                write!(f, "failed to acquire drm master: errno {}", errno)
            }
            Self::AuthFailed { errno } => {
                write!(f, "client authentication failed: errno {}", errno)
            }
            Self::NotOpen => write!(f, "device handle is not open"),
        }
    }
}

impl fmt::Display for PresentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlipBusy => write!(f, "a flip is already in flight"),
            Self::AsyncUnsupported => write!(f, "async flips not supported"),
            Self::FlipFailed { errno } => write!(f, "page flip failed: errno {}", errno),
            Self::CrtcOff { pipe } => write!(f, "cannot flip on disabled pipe {:?}", pipe),
        }
    }
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "memory: {}", e),
            Self::Pipe(e) => write!(f, "pipe: {}", e),
            Self::Device(e) => write!(f, "device: {}", e),
            Self::Present(e) => write!(f, "present: {}", e),
        }
    }
}

impl std::error::Error for DisplayError {}

impl From<AllocError> for DisplayError {
    fn from(err: AllocError) -> Self {
        Self::Alloc(err)
    }
}

impl From<PipeError> for DisplayError {
    fn from(err: PipeError) -> Self {
        Self::Pipe(err)
    }
}

impl From<DeviceError> for DisplayError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

impl From<PresentError> for DisplayError {
    fn from(err: PresentError) -> Self {
        Self::Present(err)
    }
}
