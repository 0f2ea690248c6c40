//! Display driver core for Intel i8xx/i9xx-class graphics.
//!
//! This crate owns the hard parts of a display driver stack: discovering
//! and partitioning video memory (stolen + dynamically mapped aperture)
//! under tiling and alignment constraints, driving the per-pipe CRTC
//! state machine through mode changes, VT switches and power management,
//! snapshotting and restoring hardware register state, and scheduling
//! vblank-synchronized buffer flips with exactly-once completion
//! delivery.
//!
//! The host windowing layer, the kernel graphics device and the event
//! loop are collaborators, not implementations: they are reached through
//! the [`device::DrmDevice`], [`mmio::MmioSpace`], [`present::PresentClock`],
//! [`present::TimerHost`] and [`present::CompletionSink`] traits. All
//! hardware programming happens on one control thread; "concurrency" is
//! the temporal interleaving of kernel events with client requests, and
//! serialization comes from that discipline rather than from locks.

pub mod context;
pub mod device;
pub mod error;
pub mod hwstate;
pub mod mem;
pub mod mmio;
pub mod mode;
pub mod output;
pub mod pipe;
pub mod present;
pub mod regs;

pub use context::{DeviceContext, DriverOptions, GpuGeneration, Hardware};
pub use device::{DeviceHandle, DrmDevice, FbHandle};
pub use error::{DisplayError, DisplayResult};
pub use mem::{AllocFlags, Allocator, Purpose, TileMode};
pub use mode::DisplayMode;
pub use output::{DetectStatus, DpmsMode, Output, OutputKind, OutputOps};
pub use pipe::{PipeId, PipePhase, Rotation};
pub use present::{CompletionSink, PresentClock, TimerHost, UstMsc};
