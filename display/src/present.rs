//! Presentation: vblank-synchronized completion events and page flips.
//!
//! The host event loop feeds kernel events back in through
//! `handle_vblank_event` / `handle_flip_complete` / `handle_timer`;
//! everything here guarantees each queued request is answered exactly
//! once, through whichever path ends up serving it: a hardware vblank
//! event, a software timer standing in for one, an immediate answer
//! when the target already passed, or the flip-completion bookkeeping.

use log::{debug, warn};

use crate::context::DeviceContext;
use crate::device::{FbHandle, VblankRequest};
use crate::error::{DisplayResult, PresentError};
use crate::pipe::{PipeId, PipePhase};

/// Timestamp/counter pair: microseconds and media stream counter
/// (hardware vblank sequence number).
#[derive(Debug, Clone, Copy, Default)]
pub struct UstMsc {
    pub ust: u64,
    pub msc: u64,
}

/// A vblank wait armed in the kernel.
#[derive(Debug, Clone, Copy)]
struct ArmedVblank {
    token: u64,
    event_id: u64,
    target_msc: u64,
}

/// A vblank wait simulated with a host timer because the kernel wait
/// was unavailable.
#[derive(Debug, Clone, Copy)]
struct FakeVblank {
    token: u64,
    event_id: u64,
    pipe: PipeId,
    target_msc: u64,
}

/// A notification deferred until the pending composite lands, so the
/// tear-free exchange publishes a fully drawn frame.
#[derive(Debug, Clone, Copy)]
struct DeferredNotify {
    event_id: u64,
}

/// Presentation bookkeeping, one per context.
pub struct PresentState {
    /// Last observed timestamp/counter per pipe
    last_swap: Vec<UstMsc>,
    /// Synchronous flips in flight (at most one)
    flip_active: u32,
    flip_event: Option<(u64, u64)>,
    /// Unflip parked behind an in-flight flip; a single slot
    pending_unflip: Option<u64>,
    armed: Vec<ArmedVblank>,
    fake: Vec<FakeVblank>,
    deferred: Vec<DeferredNotify>,
    composite_pending: bool,
    /// What the planes scan out right now
    scanout_fb: Option<FbHandle>,
    /// The host's framebuffer id for the real front buffer
    front_fb: FbHandle,
    next_token: u64,
}

impl PresentState {
    pub fn new(num_pipes: usize) -> Self {
        Self {
            last_swap: vec![UstMsc::default(); num_pipes],
            flip_active: 0,
            flip_event: None,
            pending_unflip: None,
            armed: Vec::new(),
            fake: Vec::new(),
            deferred: Vec::new(),
            composite_pending: false,
            scanout_fb: None,
            front_fb: FbHandle(0),
            next_token: 1,
        }
    }

    fn token(&mut self) -> u64 {
        let t = self.next_token;
        self.next_token += 1;
        t
    }
}

/// Monotonic clock in microseconds, matching the kernel's UST domain.
pub trait PresentClock: Send {
    fn now_ust(&self) -> u64;
}

/// One-shot timers from the host event loop. Expiry comes back through
/// [`DeviceContext::handle_timer`] with the same token.
pub trait TimerHost: Send {
    fn set_timer(&mut self, delay_ms: u64, token: u64);
}

/// Where completed presentation requests are reported.
pub trait CompletionSink: Send {
    fn notify(&mut self, event_id: u64, ust: u64, msc: u64);
}

impl DeviceContext {
    /// Current timestamp and vblank counter for `pipe`.
    ///
    /// A zero-frame kernel wait reads both without blocking; if the
    /// kernel refuses, the last values seen on this pipe stand in, aged
    /// with the host clock.
    pub fn get_ust_msc(&mut self, pipe: PipeId) -> UstMsc {
        match self.handle.wait_vblank(pipe, VblankRequest::relative(0)) {
            Ok(reply) => {
                let cur = UstMsc {
                    ust: reply.ust,
                    msc: reply.sequence,
                };
                self.present.last_swap[pipe.index()] = cur;
                cur
            }
            Err(errno) => {
                debug!("pipe {:?}: vblank query failed (errno {})", pipe, errno);
                let last = self.present.last_swap[pipe.index()];
                UstMsc {
                    ust: self.clock.now_ust().max(last.ust),
                    msc: last.msc,
                }
            }
        }
    }

    /// Answer `event_id` when the vblank counter reaches `target_msc`.
    ///
    /// Already-reached targets answer immediately. A live kernel gets an
    /// evented wait; a dead one gets a software timer computed from the
    /// pipe's timings, which re-checks the hardware on expiry rather
    /// than trusting its own arithmetic.
    pub fn queue_vblank(&mut self, pipe: PipeId, event_id: u64, target_msc: u64) {
        let cur = self.get_ust_msc(pipe);
        if target_msc <= cur.msc {
            self.completions.notify(event_id, cur.ust, cur.msc);
            return;
        }

        let token = self.present.token();
        match self
            .handle
            .wait_vblank(pipe, VblankRequest::absolute_event(target_msc, token))
        {
            Ok(_) => {
                self.present.armed.push(ArmedVblank {
                    token,
                    event_id,
                    target_msc,
                });
            }
            Err(errno) => {
                debug!(
                    "pipe {:?}: evented vblank failed (errno {}), using timer",
                    pipe, errno
                );
                let delay = self.msc_to_delay(pipe, target_msc, cur);
                self.present.fake.push(FakeVblank {
                    token,
                    event_id,
                    pipe,
                    target_msc,
                });
                self.timers.set_timer(delay, token);
            }
        }
    }

    /// Milliseconds until `target_msc`, from the pipe's timings, net of
    /// the part of the current frame that already elapsed. Never
    /// negative; a zero delay means "check the hardware right away".
    fn msc_to_delay(&self, pipe: PipeId, target_msc: u64, cur: UstMsc) -> u64 {
        let period = self.pipes[pipe.index()]
            .current_mode
            .as_ref()
            .map(|m| m.frame_period_ms())
            .filter(|&p| p > 0)
            .unwrap_or(16);
        let frames = target_msc.saturating_sub(cur.msc);
        let subframe_ms = (self.clock.now_ust().saturating_sub(cur.ust)) / 1000;
        (frames * period).saturating_sub(subframe_ms)
    }

    /// Kernel delivered the vblank event for `token`.
    pub fn handle_vblank_event(&mut self, token: u64, msc: u64, ust: u64) {
        let Some(pos) = self.present.armed.iter().position(|a| a.token == token) else {
            debug!("vblank event for unknown token {}", token);
            return;
        };
        let armed = self.present.armed.swap_remove(pos);
        if msc > armed.target_msc {
            debug!(
                "vblank missed target {} by {} frames",
                armed.target_msc,
                msc - armed.target_msc
            );
        }
        self.completions.notify(armed.event_id, ust, msc);
    }

    /// A software vblank timer expired. The hardware counter decides
    /// whether the target was really reached; the timer re-arms itself
    /// if the clock ran fast.
    pub fn handle_timer(&mut self, token: u64) {
        let Some(pos) = self.present.fake.iter().position(|f| f.token == token) else {
            return;
        };
        let fake = self.present.fake[pos];
        let cur = self.get_ust_msc(fake.pipe);
        if cur.msc >= fake.target_msc {
            self.present.fake.swap_remove(pos);
            self.completions.notify(fake.event_id, cur.ust, cur.msc);
            return;
        }
        let delay = self.msc_to_delay(fake.pipe, fake.target_msc, cur).max(1);
        self.timers.set_timer(delay, token);
    }

    /// Abort a queued vblank answer. The kernel has no cancel ioctl, so
    /// this is an accepted no-op: the armed event (or timer) fires on
    /// schedule and delivers the completion anyway.
    pub fn abort_vblank(&mut self, event_id: u64) {
        debug!("abort for event {} accepted; completion still fires", event_id);
    }

    /// Present `fb` on `pipe`.
    ///
    /// Synchronous flips ride the kernel's flip queue, at most one in
    /// flight; `async_flip` swaps immediately without waiting for
    /// vblank, and a kernel that rejects it loses the capability for
    /// the rest of the session. Under tear-free, frames with a
    /// composite still pending defer their completion until the
    /// composite lands; a newer frame arriving first supersedes the
    /// deferred one, which is answered immediately.
    pub fn flip(
        &mut self,
        pipe: PipeId,
        fb: FbHandle,
        event_id: u64,
        async_flip: bool,
    ) -> DisplayResult<()> {
        if self.pipes[pipe.index()].phase != PipePhase::Enabled {
            return Err(PresentError::CrtcOff { pipe }.into());
        }

        if self.options.tear_free {
            self.present.scanout_fb = Some(fb);
            if self.present.composite_pending {
                // A newer frame replaces the scanout candidate, so any
                // frame already waiting on this composite is superseded;
                // answer it now rather than queueing without bound.
                let superseded: Vec<DeferredNotify> =
                    self.present.deferred.drain(..).collect();
                if !superseded.is_empty() {
                    let cur = self.get_ust_msc(pipe);
                    for d in superseded {
                        self.completions.notify(d.event_id, cur.ust, cur.msc);
                    }
                }
                self.present.deferred.push(DeferredNotify { event_id });
                return Ok(());
            }
            let cur = self.get_ust_msc(pipe);
            self.queue_vblank(pipe, event_id, cur.msc + 1);
            return Ok(());
        }

        if async_flip {
            if !self.handle.supports_async_flip() {
                return Err(PresentError::AsyncUnsupported.into());
            }
            if let Err(errno) = self.handle.page_flip(pipe, fb, None, true) {
                warn!("async flip failed (errno {}), capability revoked", errno);
                self.handle.revoke_async_flip();
                return Err(PresentError::FlipFailed { errno }.into());
            }
            self.present.scanout_fb = Some(fb);
            let cur = self.get_ust_msc(pipe);
            self.completions.notify(event_id, cur.ust, cur.msc);
            return Ok(());
        }

        if self.present.flip_active > 0 {
            return Err(PresentError::FlipBusy.into());
        }
        let token = self.present.token();
        self.handle
            .page_flip(pipe, fb, Some(token), false)
            .map_err(|errno| PresentError::FlipFailed { errno })?;
        self.present.flip_active += 1;
        self.present.flip_event = Some((token, event_id));
        self.present.scanout_fb = Some(fb);
        Ok(())
    }

    /// Kernel reported the in-flight flip has landed.
    pub fn handle_flip_complete(&mut self, token: u64, msc: u64, ust: u64) {
        match self.present.flip_event {
            Some((t, event_id)) if t == token => {
                self.present.flip_event = None;
                self.present.flip_active -= 1;
                self.completions.notify(event_id, ust, msc);
            }
            _ => {
                debug!("flip completion for unknown token {}", token);
                return;
            }
        }
        if let Some(event_id) = self.present.pending_unflip.take() {
            self.unflip(event_id);
        }
    }

    /// Put the real front buffer back on the planes, answering
    /// `event_id` when scanout has moved.
    ///
    /// With a flip still in flight the request parks in a single slot
    /// and runs from the flip completion; a second park is a caller
    /// bug. When flipping back is impossible the modes are simply
    /// reprogrammed, which scans out the front buffer by construction.
    pub fn unflip(&mut self, event_id: u64) {
        let front_fb = self.present.front_fb;
        let lit = (0..self.pipes.len())
            .filter_map(PipeId::from_index)
            .find(|p| self.pipes[p.index()].phase == PipePhase::Enabled);

        let Some(pipe) = lit else {
            let last = self.present.last_swap.first().copied().unwrap_or_default();
            self.completions.notify(event_id, last.ust, last.msc);
            return;
        };

        if self.options.tear_free {
            self.present.scanout_fb = Some(front_fb);
            let cur = self.get_ust_msc(pipe);
            self.completions.notify(event_id, cur.ust, cur.msc);
            return;
        }

        if self.present.flip_active > 0 {
            assert!(
                self.present.pending_unflip.is_none(),
                "unflip already pending"
            );
            self.present.pending_unflip = Some(event_id);
            return;
        }

        let flipped = if self.handle.supports_async_flip() {
            self.handle.page_flip(pipe, front_fb, None, true).is_ok()
        } else {
            false
        };
        if !flipped && self.handle.page_flip(pipe, front_fb, None, false).is_err() {
            warn!("unflip could not flip, reprogramming modes");
            if let Err(e) = self.set_desired_modes() {
                warn!("mode reprogram during unflip failed: {}", e);
            }
        }
        self.present.scanout_fb = Some(front_fb);
        let cur = self.get_ust_msc(pipe);
        self.completions.notify(event_id, cur.ust, cur.msc);
    }

    /// The compositor started (true) or finished (false) drawing into
    /// the scanout candidate. Finishing releases any deferred tear-free
    /// completions.
    pub fn set_composite_pending(&mut self, pending: bool) {
        self.present.composite_pending = pending;
        if pending {
            return;
        }
        let deferred: Vec<DeferredNotify> = self.present.deferred.drain(..).collect();
        if deferred.is_empty() {
            return;
        }
        let pipe = (0..self.pipes.len())
            .filter_map(PipeId::from_index)
            .find(|p| self.pipes[p.index()].phase == PipePhase::Enabled);
        let cur = match pipe {
            Some(p) => self.get_ust_msc(p),
            None => self.present.last_swap.first().copied().unwrap_or_default(),
        };
        for d in deferred {
            self.completions.notify(d.event_id, cur.ust, cur.msc);
        }
    }

    /// Tell presentation which framebuffer id the host registered for
    /// the front buffer, so unflips know what to flip back to.
    pub fn set_front_fb(&mut self, fb: FbHandle) {
        self.present.front_fb = fb;
    }

    /// Whether a synchronous flip is currently in flight.
    pub fn flip_pending(&self) -> bool {
        self.present.flip_active > 0
    }

    /// Framebuffer the planes currently scan out, if presentation has
    /// moved it off the front buffer.
    pub fn scanout_fb(&self) -> Option<FbHandle> {
        self.present.scanout_fb
    }
}
