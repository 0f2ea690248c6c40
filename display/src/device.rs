//! Kernel graphics-device handle.
//!
//! One physical card gets one process-wide [`DeviceHandle`], shared by
//! every per-screen driver instance attached to it (dual-head). The
//! handle arbitrates two nested reference counts: the open count, which
//! keeps the device alive, and the master count, so an inner
//! "needs master" scope never drops mode-setting authority out from
//! under an outer scope still depending on it.
//!
//! The kernel itself is behind the [`DrmDevice`] trait. Ioctl numbers
//! and structure layouts are the host glue's problem; the trait carries
//! the operations the core depends on with their hardware-ABI semantics
//! intact (vblank waits relative/absolute/evented, page flip with an
//! optional completion event, magic-cookie authentication).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use spin::Mutex;

use crate::error::DeviceError;
use crate::pipe::PipeId;

/// Bounded retry for SET_VERSION / SET_MASTER: the server may still be
/// releasing the device during a VT switch, so spin for up to ~2s.
const IOCTL_RETRIES: u32 = 2000;
const IOCTL_RETRY_DELAY: Duration = Duration::from_millis(1);

/// A scanout buffer as the kernel names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbHandle(pub u32);

/// Sequence target of a vblank wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VblankSeq {
    /// N frames from now; `Relative(0)` reads back the current counter
    Relative(u32),
    /// An absolute hardware sequence number
    Absolute(u64),
}

/// A vblank wait request.
#[derive(Debug, Clone, Copy)]
pub struct VblankRequest {
    pub seq: VblankSeq,
    /// When set, the kernel completes asynchronously and delivers an
    /// event carrying this token instead of blocking.
    pub event_token: Option<u64>,
    /// Complete on the next vblank if the target has already passed
    pub next_on_miss: bool,
}

impl VblankRequest {
    pub fn relative(frames: u32) -> Self {
        Self {
            seq: VblankSeq::Relative(frames),
            event_token: None,
            next_on_miss: false,
        }
    }

    pub fn absolute_event(target: u64, token: u64) -> Self {
        Self {
            seq: VblankSeq::Absolute(target),
            event_token: Some(token),
            next_on_miss: false,
        }
    }
}

/// Reply to a (synchronous) vblank wait.
#[derive(Debug, Clone, Copy)]
pub struct VblankReply {
    pub sequence: u64,
    /// Microseconds, monotonic
    pub ust: u64,
}

/// Presentation capabilities probed once at device open.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCaps {
    pub has_flip: bool,
    pub has_async_flip: bool,
}

/// The kernel graphics device contract. Errors are raw errno values;
/// policy (retries, fallbacks, capability revocation) lives in the core.
pub trait DrmDevice: Send {
    fn set_version(&mut self) -> Result<(), i32>;
    fn set_master(&mut self) -> Result<(), i32>;
    fn drop_master(&mut self) -> Result<(), i32>;
    /// Elevate a client identified by its magic cookie
    fn auth_magic(&mut self, magic: u32) -> Result<(), i32>;
    fn wait_vblank(&mut self, pipe: PipeId, req: VblankRequest) -> Result<VblankReply, i32>;
    fn page_flip(
        &mut self,
        pipe: PipeId,
        fb: FbHandle,
        event_token: Option<u64>,
        async_flip: bool,
    ) -> Result<(), i32>;
    fn capabilities(&self) -> DeviceCaps;
}

struct HandleInner {
    dev: Box<dyn DrmDevice>,
    open_count: u32,
    master_count: u32,
    caps: DeviceCaps,
}

/// Process-wide, reference-counted handle to one card.
pub struct DeviceHandle {
    minor: u32,
    inner: Mutex<HandleInner>,
}

/// Registry of open handles keyed by device minor, so a second screen
/// instance on the same card shares the first instance's handle.
static DEVICES: Mutex<Vec<(u32, Arc<DeviceHandle>)>> = Mutex::new(Vec::new());

impl DeviceHandle {
    /// Register a freshly opened device, or return the handle another
    /// screen already registered for this minor.
    pub fn open(minor: u32, dev: Box<dyn DrmDevice>) -> Arc<DeviceHandle> {
        let mut table = DEVICES.lock();
        if let Some((_, handle)) = table.iter().find(|(m, _)| *m == minor) {
            return handle.clone();
        }
        let caps = dev.capabilities();
        let handle = Arc::new(DeviceHandle {
            minor,
            inner: Mutex::new(HandleInner {
                dev,
                open_count: 0,
                master_count: 0,
                caps,
            }),
        });
        table.push((minor, handle.clone()));
        handle
    }

    pub fn lookup(minor: u32) -> Option<Arc<DeviceHandle>> {
        DEVICES
            .lock()
            .iter()
            .find(|(m, _)| *m == minor)
            .map(|(_, h)| h.clone())
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Take an open reference. The first opener checks that the fd is
    /// master-capable by negotiating the interface version, with a
    /// bounded retry while another master winds down.
    pub fn acquire(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if inner.open_count == 0 {
            let mut last = 0;
            let mut ok = false;
            for _ in 0..IOCTL_RETRIES {
                match inner.dev.set_version() {
                    Ok(()) => {
                        ok = true;
                        break;
                    }
                    Err(errno) => {
                        last = errno;
                        std::thread::sleep(IOCTL_RETRY_DELAY);
                    }
                }
            }
            if !ok {
                error!(
                    "card{}: failed to set drm interface version (errno {})",
                    self.minor, last
                );
                return Err(DeviceError::InterfaceVersion { errno: last });
            }
        }
        inner.open_count += 1;
        Ok(())
    }

    /// Drop an open reference. Returns `true` when this was the last
    /// reference and the underlying device may be closed.
    pub fn release(&self) -> Result<bool, DeviceError> {
        let mut inner = self.inner.lock();
        if inner.open_count == 0 {
            return Err(DeviceError::NotOpen);
        }
        inner.open_count -= 1;
        if inner.open_count == 0 {
            let mut table = DEVICES.lock();
            table.retain(|(m, _)| *m != self.minor);
            return Ok(true);
        }
        Ok(false)
    }

    /// Acquire mode-setting authority. Counting nests: only the
    /// outermost grab talks to the kernel.
    pub fn grab_master(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if inner.master_count == 0 {
            let mut last = 0;
            let mut ok = false;
            for _ in 0..IOCTL_RETRIES {
                match inner.dev.set_master() {
                    Ok(()) => {
                        ok = true;
                        break;
                    }
                    Err(errno) => {
                        last = errno;
                        std::thread::sleep(IOCTL_RETRY_DELAY);
                    }
                }
            }
            if !ok {
                error!("card{}: failed to become drm master (errno {})", self.minor, last);
                return Err(DeviceError::MasterDenied { errno: last });
            }
        }
        inner.master_count += 1;
        Ok(())
    }

    /// Release mode-setting authority; only the outermost release drops
    /// master. Releasing without a matching grab is a programming error.
    pub fn put_master(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.master_count > 0, "unbalanced put_master");
        inner.master_count -= 1;
        if inner.master_count == 0 {
            if let Err(errno) = inner.dev.drop_master() {
                warn!("card{}: drop_master failed (errno {})", self.minor, errno);
            }
        }
    }

    /// Authenticate a secondary client by its magic cookie.
    pub fn authorize_client(&self, magic: u32) -> Result<(), DeviceError> {
        self.inner
            .lock()
            .dev
            .auth_magic(magic)
            .map_err(|errno| DeviceError::AuthFailed { errno })
    }

    pub fn wait_vblank(&self, pipe: PipeId, req: VblankRequest) -> Result<VblankReply, i32> {
        self.inner.lock().dev.wait_vblank(pipe, req)
    }

    pub fn page_flip(
        &self,
        pipe: PipeId,
        fb: FbHandle,
        event_token: Option<u64>,
        async_flip: bool,
    ) -> Result<(), i32> {
        self.inner.lock().dev.page_flip(pipe, fb, event_token, async_flip)
    }

    pub fn supports_flip(&self) -> bool {
        self.inner.lock().caps.has_flip
    }

    pub fn supports_async_flip(&self) -> bool {
        self.inner.lock().caps.has_async_flip
    }

    /// Forget the async-flip capability for the rest of the session.
    /// Called when the async page-flip ioctl fails so future requests
    /// take the synchronous path without re-probing.
    pub fn revoke_async_flip(&self) {
        let mut inner = self.inner.lock();
        if inner.caps.has_async_flip {
            debug!("card{}: revoking async flip capability", self.minor);
            inner.caps.has_async_flip = false;
        }
    }

    pub fn open_count(&self) -> u32 {
        self.inner.lock().open_count
    }

    pub fn master_count(&self) -> u32 {
        self.inner.lock().master_count
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn open_is_shared_per_minor() {
        let minor = unique_minor();
        let (drm, _) = FakeDrm::new();
        let a = DeviceHandle::open(minor, Box::new(drm));
        let (drm2, _) = FakeDrm::new();
        let b = DeviceHandle::open(minor, Box::new(drm2));
        assert!(Arc::ptr_eq(&a, &b), "same minor must share one handle");
        a.acquire().expect("first acquire should negotiate version");
        a.release().expect("release after acquire");
    }

    #[test]
    fn set_version_runs_only_on_first_acquire() {
        let minor = unique_minor();
        let (drm, state) = FakeDrm::new();
        let handle = DeviceHandle::open(minor, Box::new(drm));
        handle.acquire().expect("first acquire");
        handle.acquire().expect("second acquire");
        assert_eq!(state.lock().set_version_calls, 1);
        assert!(!handle.release().expect("inner release"), "not yet last");
        assert!(handle.release().expect("outer release"), "last reference");
    }

    #[test]
    fn master_counting_nests() {
        let minor = unique_minor();
        let (drm, state) = FakeDrm::new();
        let handle = DeviceHandle::open(minor, Box::new(drm));
        handle.grab_master().expect("outer grab");
        handle.grab_master().expect("nested grab");
        handle.put_master();
        assert_eq!(
            state.lock().drop_master_calls,
            0,
            "inner release must not drop master"
        );
        handle.put_master();
        assert_eq!(state.lock().drop_master_calls, 1);
        assert_eq!(state.lock().set_master_calls, 1);
    }

    #[test]
    fn master_grab_retries_through_transient_failure() {
        let minor = unique_minor();
        let (drm, state) = FakeDrm::new();
        state.lock().master_failures = 3;
        let handle = DeviceHandle::open(minor, Box::new(drm));
        handle
            .grab_master()
            .expect("grab should succeed after bounded retries");
        assert_eq!(state.lock().set_master_calls, 4);
        handle.put_master();
    }

    #[test]
    fn async_capability_revocation_sticks() {
        let minor = unique_minor();
        let (drm, _) = FakeDrm::new();
        let handle = DeviceHandle::open(minor, Box::new(drm));
        assert!(handle.supports_async_flip());
        handle.revoke_async_flip();
        assert!(!handle.supports_async_flip());
        handle.revoke_async_flip(); // idempotent
        assert!(!handle.supports_async_flip());
    }

    #[test]
    #[should_panic(expected = "unbalanced put_master")]
    fn unbalanced_put_master_asserts() {
        let minor = unique_minor();
        let (drm, _) = FakeDrm::new();
        let handle = DeviceHandle::open(minor, Box::new(drm));
        handle.put_master();
    }
}
