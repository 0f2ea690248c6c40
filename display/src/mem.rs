//! Video memory allocator.
//!
//! Converts a declarative list of fixed-purpose memory requests (front
//! buffer, cursor, overlay, ring buffer, 3D texture pool) into
//! non-overlapping ranges inside two backing pools: statically reserved
//! "stolen" memory and the dynamically mapped aperture. Placement is
//! deterministic, so a dry run followed by a commit with the same
//! requests yields the same byte offsets — that is what makes the
//! tiling feasibility probe and the memory-manager shrink loop work.

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::error::AllocError;

/// Granularity of the kernel memory-manager carve-out.
pub const GTT_PAGE_SIZE: u64 = 4096;

/// Floor for shrinking the kernel memory-manager reservation, in GTT
/// pages. Inherited from the original driver as a tuning constant; it
/// is not a derived hardware limit, so do not "correct" it.
pub const MM_MIN_PAGES: u64 = 512;

/// Default kernel memory-manager reservation.
pub const MM_MAX_BYTES: u64 = 32 * 1024 * 1024;

/// The texture pool is worthless below this size; allocation plans that
/// cannot offer at least this much report the shortfall as a deficit.
pub const MIN_TEXTURE_BYTES: u64 = 512 * 1024;

/// Scanline pitches (in pixels) that the fence hardware can tile.
/// Pitches below 1024 are not worth tiling.
pub const TILE_PITCHES: [u32; 4] = [1024, 2048, 4096, 8192];

/// Next tileable pitch class >= `width_px`, if one exists.
pub fn tileable_pitch(width_px: u32) -> Option<u32> {
    TILE_PITCHES.iter().copied().find(|p| *p >= width_px)
}

pub fn is_tileable_pitch(width_px: u32) -> bool {
    TILE_PITCHES.contains(&width_px)
}

bitflags! {
    /// Allocation pass modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Compute feasibility and offsets without committing
        const DRY_RUN = 1 << 0;
        /// Initial (pre-ScreenInit) allocation pass
        const INITIAL = 1 << 1;
        /// Ignore tiling preferences on every request
        const NO_TILING = 1 << 2;
    }
}

/// Surface tiling layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileMode {
    None,
    XMajor,
}

/// Allocation domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// BIOS-reserved stolen memory
    Stolen,
    /// Dynamically mapped aperture memory
    Aperture,
}

/// What a range is for. Order here is allocation priority: the front
/// buffer is placed first, the texture pool soaks up what remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Purpose {
    FrontBuffer,
    BackBuffer,
    DepthBuffer,
    RingBuffer,
    Cursor,
    CursorArgb,
    Overlay,
    Scratch,
    TexturePool,
}

impl Purpose {
    pub fn name(self) -> &'static str {
        match self {
            Self::FrontBuffer => "front buffer",
            Self::BackBuffer => "back buffer",
            Self::DepthBuffer => "depth buffer",
            Self::RingBuffer => "ring buffer",
            Self::Cursor => "cursor",
            Self::CursorArgb => "ARGB cursor",
            Self::Overlay => "overlay",
            Self::Scratch => "scratch",
            Self::TexturePool => "texture pool",
        }
    }
}

/// A live, contiguous allocation. Owned by the allocator; consumers hold
/// [`RangeHandle`]s.
#[derive(Debug, Clone)]
pub struct MemRange {
    pub start: u64,
    pub end: u64,
    pub size: u64,
    /// Bus address of the range start
    pub physical: u64,
    pub tiling: TileMode,
    pub alignment: u64,
    pub purpose: Purpose,
    id: u64,
}

/// Reference to a range. Invalidated by `reset_allocations`; stale
/// handles are detected, not dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeHandle {
    id: u64,
    epoch: u64,
    pool: PoolKind,
}

/// One allocation request.
#[derive(Debug, Clone)]
pub struct AllocRequest {
    pub purpose: Purpose,
    /// Bytes; 0 means flexible (take the remainder, up to `flex_cap`)
    pub size: u64,
    pub alignment: u64,
    pub tiling: TileMode,
    pub pool: PoolKind,
    /// Cap for flexible requests
    pub flex_cap: Option<u64>,
}

impl AllocRequest {
    pub fn fixed(purpose: Purpose, size: u64, alignment: u64, pool: PoolKind) -> Self {
        Self {
            purpose,
            size,
            alignment,
            tiling: TileMode::None,
            pool,
            flex_cap: None,
        }
    }

    pub fn tiled(purpose: Purpose, size: u64, alignment: u64, pool: PoolKind) -> Self {
        Self {
            tiling: TileMode::XMajor,
            ..Self::fixed(purpose, size, alignment, pool)
        }
    }

    /// Flexible consumer: takes whatever is left in the aperture, up to
    /// `cap` bytes.
    pub fn flexible(purpose: Purpose, cap: u64) -> Self {
        Self {
            purpose,
            size: 0,
            alignment: GTT_PAGE_SIZE,
            tiling: TileMode::None,
            pool: PoolKind::Aperture,
            flex_cap: Some(cap),
        }
    }
}

/// Where one request landed.
#[derive(Debug, Clone)]
pub struct Placement {
    pub purpose: Purpose,
    pub pool: PoolKind,
    pub start: u64,
    pub size: u64,
    pub tiling: TileMode,
    pub alignment: u64,
    /// Present only on committed passes
    pub handle: Option<RangeHandle>,
}

/// Result of one allocation pass.
#[derive(Debug, Clone)]
pub struct AllocOutcome {
    pub committed: bool,
    pub placements: Vec<Placement>,
}

impl AllocOutcome {
    pub fn handle_for(&self, purpose: Purpose) -> Option<RangeHandle> {
        self.placements
            .iter()
            .find(|p| p.purpose == purpose)
            .and_then(|p| p.handle)
    }

    pub fn placement_for(&self, purpose: Purpose) -> Option<&Placement> {
        self.placements.iter().find(|p| p.purpose == purpose)
    }
}

/// Allocator statistics, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorStats {
    pub stolen_capacity: u64,
    pub stolen_live: u64,
    pub aperture_capacity: u64,
    pub aperture_live: u64,
    pub live_ranges: usize,
}

struct Pool {
    kind: PoolKind,
    base: u64,
    physical_base: u64,
    capacity: u64,
    /// Live ranges, sorted by start; free space is the gaps between them
    ranges: Vec<MemRange>,
}

impl Pool {
    fn new(kind: PoolKind, base: u64, physical_base: u64, capacity: u64) -> Self {
        Self {
            kind,
            base,
            physical_base,
            capacity,
            ranges: Vec::new(),
        }
    }

    fn end(&self) -> u64 {
        self.base + self.capacity
    }

    fn live_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.size).sum()
    }

    fn insert(&mut self, range: MemRange) {
        let pos = self
            .ranges
            .iter()
            .position(|r| r.start > range.start)
            .unwrap_or(self.ranges.len());
        self.ranges.insert(pos, range);
    }

    /// Removing a range returns its span to the pool; adjacent free
    /// space coalesces for free because gaps are derived, not tracked.
    fn remove(&mut self, id: u64) -> Option<MemRange> {
        let pos = self.ranges.iter().position(|r| r.id == id)?;
        Some(self.ranges.remove(pos))
    }

    fn find(&self, id: u64) -> Option<&MemRange> {
        self.ranges.iter().find(|r| r.id == id)
    }
}

/// The two-pool video memory allocator.
pub struct Allocator {
    stolen: Pool,
    aperture: Pool,
    epoch: u64,
    next_id: u64,
}

impl Allocator {
    pub fn new(
        stolen_base: u64,
        stolen_physical: u64,
        stolen_size: u64,
        aperture_base: u64,
        aperture_physical: u64,
        aperture_size: u64,
    ) -> Self {
        Self {
            stolen: Pool::new(PoolKind::Stolen, stolen_base, stolen_physical, stolen_size),
            aperture: Pool::new(
                PoolKind::Aperture,
                aperture_base,
                aperture_physical,
                aperture_size,
            ),
            epoch: 0,
            next_id: 1,
        }
    }

    /// Clear every live range in both pools. Outstanding handles become
    /// stale and must be re-acquired.
    pub fn reset_allocations(&mut self) {
        debug!(
            "resetting allocations ({} live ranges dropped)",
            self.stolen.ranges.len() + self.aperture.ranges.len()
        );
        self.stolen.ranges.clear();
        self.aperture.ranges.clear();
        self.epoch += 1;
    }

    /// Resize the aperture pool. Used by the memory-manager shrink loop;
    /// requires an empty pool so committed ranges cannot be orphaned.
    pub fn set_aperture_capacity(&mut self, bytes: u64) {
        assert!(
            self.aperture.ranges.is_empty(),
            "resize requires reset_allocations first"
        );
        self.aperture.capacity = bytes;
    }

    pub fn aperture_capacity(&self) -> u64 {
        self.aperture.capacity
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            stolen_capacity: self.stolen.capacity,
            stolen_live: self.stolen.live_bytes(),
            aperture_capacity: self.aperture.capacity,
            aperture_live: self.aperture.live_bytes(),
            live_ranges: self.stolen.ranges.len() + self.aperture.ranges.len(),
        }
    }

    fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Stolen => &self.stolen,
            PoolKind::Aperture => &self.aperture,
        }
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut Pool {
        match kind {
            PoolKind::Stolen => &mut self.stolen,
            PoolKind::Aperture => &mut self.aperture,
        }
    }

    /// Run one allocation pass over `requests`.
    ///
    /// Fixed-purpose requests are placed in priority order, each rounded
    /// up to its (tiling-adjusted) alignment; flexible requests then
    /// take the remaining aperture up to their cap. On overflow the
    /// exact deficit in bytes is reported so the caller can shrink a
    /// competing reservation and retry. With `DRY_RUN` nothing is
    /// committed, but the computed offsets are identical to what a
    /// commit would produce.
    pub fn allocate(
        &mut self,
        requests: &[AllocRequest],
        flags: AllocFlags,
    ) -> Result<AllocOutcome, AllocError> {
        for req in requests {
            if req.alignment == 0 || !req.alignment.is_power_of_two() {
                return Err(AllocError::BadAlignment {
                    alignment: req.alignment,
                });
            }
        }

        // Priority order, stable so equal-priority requests keep the
        // caller's order and dry-run/commit agree.
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by_key(|&i| requests[i].purpose);

        // Scratch copies of the live-range lists; dry runs never touch
        // the real pools, commits apply the identical plan afterwards.
        let mut scratch_stolen = self.stolen.ranges.clone();
        let mut scratch_aperture = self.aperture.ranges.clone();

        let mut placements: Vec<Option<Placement>> = vec![None; requests.len()];
        let mut total_requested = 0u64;
        let mut deficit = 0u64;

        for &idx in &order {
            let req = &requests[idx];
            let tiling = if flags.contains(AllocFlags::NO_TILING) {
                TileMode::None
            } else {
                req.tiling
            };

            let (size, alignment) = if req.size == 0 {
                // Flexible: what is left in the aperture tail, capped.
                let free = tail_free(&scratch_aperture, &self.aperture);
                let cap = req.flex_cap.unwrap_or(u64::MAX);
                let take = round_down(free.min(cap), GTT_PAGE_SIZE);
                if take < MIN_TEXTURE_BYTES {
                    deficit += MIN_TEXTURE_BYTES - take;
                    debug!(
                        "{}: only {} bytes free, need {}",
                        req.purpose.name(),
                        take,
                        MIN_TEXTURE_BYTES
                    );
                    continue;
                }
                (take, req.alignment)
            } else if tiling != TileMode::None {
                // Fenced (tiled) regions must be power-of-two sized and
                // naturally aligned.
                let fenced = req.size.next_power_of_two();
                (fenced, fenced.max(req.alignment))
            } else {
                (round_up(req.size, GTT_PAGE_SIZE), req.alignment)
            };
            total_requested += size;

            if size > self.pool(req.pool).capacity && size > self.pool(other(req.pool)).capacity {
                return Err(AllocError::Oversized {
                    requested: size,
                    capacity: self
                        .pool(req.pool)
                        .capacity
                        .max(self.pool(other(req.pool)).capacity),
                });
            }

            // Preferred pool first, then the other, then account the
            // overflow against the preferred pool.
            let mut placed = None;
            for kind in [req.pool, other(req.pool)] {
                let pool = self.pool(kind);
                let ranges = scratch_for(kind, &scratch_stolen, &scratch_aperture);
                let (start, fits) = place_in(ranges, pool, size, alignment);
                if fits {
                    placed = Some((kind, start));
                    break;
                }
            }

            let (kind, start) = match placed {
                Some(p) => p,
                None => {
                    // Account the shortfall against whichever pool is
                    // closest to fitting; that is the bound a shrinking
                    // competing reservation has to clear. Keep stacking
                    // past the end so the total deficit stays exact for
                    // the whole request list.
                    let (mut kind, mut start, mut short) = {
                        let pool = self.pool(req.pool);
                        let ranges = scratch_for(req.pool, &scratch_stolen, &scratch_aperture);
                        let (start, _) = place_in(ranges, pool, size, alignment);
                        (req.pool, start, (start + size).saturating_sub(pool.end()))
                    };
                    let alt = other(req.pool);
                    if self.pool(alt).capacity > 0 {
                        let pool = self.pool(alt);
                        let ranges = scratch_for(alt, &scratch_stolen, &scratch_aperture);
                        let (alt_start, _) = place_in(ranges, pool, size, alignment);
                        let alt_short = (alt_start + size).saturating_sub(pool.end());
                        if alt_short < short {
                            kind = alt;
                            start = alt_start;
                            short = alt_short;
                        }
                    }
                    deficit += short;
                    (kind, start)
                }
            };

            let range = MemRange {
                start,
                end: start + size,
                size,
                physical: self.pool(kind).physical_base + (start - self.pool(kind).base),
                tiling,
                alignment,
                purpose: req.purpose,
                id: 0, // assigned on commit
            };
            match kind {
                PoolKind::Stolen => insert_sorted(&mut scratch_stolen, range.clone()),
                PoolKind::Aperture => insert_sorted(&mut scratch_aperture, range.clone()),
            }
            placements[idx] = Some(Placement {
                purpose: req.purpose,
                pool: kind,
                start,
                size,
                tiling,
                alignment,
                handle: None,
            });
        }

        if deficit > 0 {
            debug!(
                "allocation plan overflows by {} bytes ({} requested)",
                deficit, total_requested
            );
            return Err(AllocError::PoolExhausted {
                requested: total_requested,
                deficit,
            });
        }

        let committed = !flags.contains(AllocFlags::DRY_RUN);
        let mut out = Vec::with_capacity(requests.len());
        for placement in placements.into_iter().flatten() {
            let mut placement = placement;
            if committed {
                let id = self.next_id;
                self.next_id += 1;
                let epoch = self.epoch;
                let kind = placement.pool;
                let physical =
                    self.pool(kind).physical_base + (placement.start - self.pool(kind).base);
                self.pool_mut(kind).insert(MemRange {
                    start: placement.start,
                    end: placement.start + placement.size,
                    size: placement.size,
                    physical,
                    tiling: placement.tiling,
                    alignment: placement.alignment,
                    purpose: placement.purpose,
                    id,
                });
                placement.handle = Some(RangeHandle {
                    id,
                    epoch,
                    pool: kind,
                });
                info!(
                    "allocated {} at {:#x}+{:#x} ({:?})",
                    placement.purpose.name(),
                    placement.start,
                    placement.size,
                    kind
                );
            }
            out.push(placement);
        }

        Ok(AllocOutcome {
            committed,
            placements: out,
        })
    }

    /// Return a range to its pool.
    pub fn free(&mut self, handle: RangeHandle) -> Result<(), AllocError> {
        if handle.epoch != self.epoch {
            return Err(AllocError::StaleHandle);
        }
        match self.pool_mut(handle.pool).remove(handle.id) {
            Some(r) => {
                debug!("freed {} at {:#x}+{:#x}", r.purpose.name(), r.start, r.size);
                Ok(())
            }
            None => Err(AllocError::UnknownRange),
        }
    }

    /// Look up a live range.
    pub fn range(&self, handle: RangeHandle) -> Result<&MemRange, AllocError> {
        if handle.epoch != self.epoch {
            return Err(AllocError::StaleHandle);
        }
        self.pool(handle.pool)
            .find(handle.id)
            .ok_or(AllocError::UnknownRange)
    }

    /// Verify the no-overlap invariant across both pools. Cheap enough
    /// to call from debug assertions and tests.
    pub fn check_invariants(&self) -> bool {
        for pool in [&self.stolen, &self.aperture] {
            let mut prev_end = pool.base;
            for r in &pool.ranges {
                if r.start < prev_end || r.end > pool.end() || r.size != r.end - r.start {
                    warn!(
                        "range invariant violated: {:#x}..{:#x} in {:?}",
                        r.start, r.end, pool.kind
                    );
                    return false;
                }
                prev_end = r.end;
            }
            if pool.live_bytes() > pool.capacity {
                return false;
            }
        }
        true
    }
}

fn other(kind: PoolKind) -> PoolKind {
    match kind {
        PoolKind::Stolen => PoolKind::Aperture,
        PoolKind::Aperture => PoolKind::Stolen,
    }
}

fn round_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

fn round_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

fn insert_sorted(ranges: &mut Vec<MemRange>, range: MemRange) {
    let pos = ranges
        .iter()
        .position(|r| r.start > range.start)
        .unwrap_or(ranges.len());
    ranges.insert(pos, range);
}

fn scratch_for<'a>(
    kind: PoolKind,
    stolen: &'a [MemRange],
    aperture: &'a [MemRange],
) -> &'a [MemRange] {
    match kind {
        PoolKind::Stolen => stolen,
        PoolKind::Aperture => aperture,
    }
}

/// First-fit over a scratch range list (same algorithm as `Pool::place`,
/// but against the plan under construction).
fn place_in(ranges: &[MemRange], pool: &Pool, size: u64, alignment: u64) -> (u64, bool) {
    let mut cursor = pool.base;
    for r in ranges {
        let aligned = round_up(cursor, alignment);
        if aligned + size <= r.start {
            return (aligned, true);
        }
        cursor = cursor.max(r.end);
    }
    let aligned = round_up(cursor, alignment);
    (aligned, aligned + size <= pool.end())
}

fn tail_free(ranges: &[MemRange], pool: &Pool) -> u64 {
    let cursor = ranges.iter().map(|r| r.end).max().unwrap_or(pool.base);
    pool.end().saturating_sub(cursor)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MB: u64 = 1024 * 1024;

    fn aperture_only(capacity: u64) -> Allocator {
        Allocator::new(0, 0, 0, 0, 0x8000_0000, capacity)
    }

    #[test]
    fn scenario_front_cursor_ring_in_32mb() {
        // 1920x1080x32bpp tiled with the pitch widened to 8192 bytes,
        // plus a 64x64 ARGB cursor and a 128K ring buffer.
        let mut alloc = aperture_only(32 * MB);
        let requests = [
            AllocRequest::tiled(
                Purpose::FrontBuffer,
                8192 * 1080,
                GTT_PAGE_SIZE,
                PoolKind::Aperture,
            ),
            AllocRequest::fixed(Purpose::Cursor, 64 * 64 * 4, GTT_PAGE_SIZE, PoolKind::Aperture),
            AllocRequest::fixed(
                Purpose::RingBuffer,
                128 * 1024,
                GTT_PAGE_SIZE,
                PoolKind::Aperture,
            ),
        ];
        let out = alloc
            .allocate(&requests, AllocFlags::INITIAL)
            .expect("32MB pool fits front+cursor+ring");
        assert!(alloc.check_invariants());
        assert_eq!(out.placements.len(), 3);
        let stats = alloc.stats();
        assert!(stats.aperture_live <= 32 * MB);
        // Tiled front buffer is fenced to the next power of two.
        let front = out.placement_for(Purpose::FrontBuffer).expect("front placed");
        assert_eq!(front.size, (8192u64 * 1080).next_power_of_two());
        assert_eq!(front.start % front.size, 0, "fenced region naturally aligned");
    }

    #[test]
    fn no_tiling_flag_demotes_tiled_requests() {
        let mut alloc = aperture_only(32 * MB);
        let requests = [AllocRequest::tiled(
            Purpose::FrontBuffer,
            8192 * 1080,
            GTT_PAGE_SIZE,
            PoolKind::Aperture,
        )];
        let out = alloc
            .allocate(&requests, AllocFlags::INITIAL | AllocFlags::NO_TILING)
            .expect("linear layout fits");
        let front = out.placement_for(Purpose::FrontBuffer).expect("front placed");
        assert_eq!(front.tiling, TileMode::None);
        assert_eq!(
            front.size,
            round_up(8192 * 1080, GTT_PAGE_SIZE),
            "no power-of-two fencing without tiling"
        );
    }

    #[test]
    fn dry_run_matches_commit_offsets() {
        let mut alloc = aperture_only(64 * MB);
        let requests = [
            AllocRequest::fixed(Purpose::FrontBuffer, 8 * MB, GTT_PAGE_SIZE, PoolKind::Aperture),
            AllocRequest::fixed(Purpose::Cursor, 16 * 1024, GTT_PAGE_SIZE, PoolKind::Aperture),
            AllocRequest::flexible(Purpose::TexturePool, 16 * MB),
        ];
        let dry = alloc
            .allocate(&requests, AllocFlags::DRY_RUN)
            .expect("dry run fits");
        assert!(!dry.committed);
        let real = alloc
            .allocate(&requests, AllocFlags::empty())
            .expect("commit fits");
        assert!(real.committed);
        for (d, r) in dry.placements.iter().zip(real.placements.iter()) {
            assert_eq!(d.start, r.start, "{}: dry-run offset must match", d.purpose.name());
            assert_eq!(d.size, r.size);
        }
        assert!(dry.placements.iter().all(|p| p.handle.is_none()));
        assert!(real.placements.iter().all(|p| p.handle.is_some()));
    }

    #[test]
    fn deficit_is_exact() {
        let mut alloc = aperture_only(8 * MB);
        let requests = [AllocRequest::fixed(
            Purpose::FrontBuffer,
            10 * MB,
            GTT_PAGE_SIZE,
            PoolKind::Aperture,
        )];
        // 10MB can never fit an 8MB pool no matter the carve-out.
        assert!(matches!(
            alloc.allocate(&requests, AllocFlags::DRY_RUN),
            Err(AllocError::Oversized { .. })
        ));

        let mut alloc = aperture_only(8 * MB);
        let requests = [
            AllocRequest::fixed(Purpose::FrontBuffer, 6 * MB, GTT_PAGE_SIZE, PoolKind::Aperture),
            AllocRequest::fixed(Purpose::BackBuffer, 4 * MB, GTT_PAGE_SIZE, PoolKind::Aperture),
        ];
        let deficit = match alloc.allocate(&requests, AllocFlags::DRY_RUN) {
            Err(AllocError::PoolExhausted { deficit, .. }) => deficit,
            other => panic!("expected exhaustion, got {:?}", other),
        };
        assert_eq!(deficit, 2 * MB);
        // Growing the pool by exactly the deficit makes the retry fit.
        alloc.set_aperture_capacity(8 * MB + deficit);
        alloc
            .allocate(&requests, AllocFlags::DRY_RUN)
            .expect("retry after shrinking the competing reservation by the deficit");
    }

    #[test]
    fn mixed_pool_deficit_tracks_the_closest_pool() {
        // 4MB of stolen memory, 8MB of aperture. Stolen-preferring
        // requests spill into the aperture, and the overflow must be
        // accounted against the aperture (which a shrinking reservation
        // can actually grow), not the fixed stolen pool.
        let mut alloc = Allocator::new(0, 0x2000_0000, 4 * MB, 0x1000_0000, 0x8000_0000, 8 * MB);
        let requests = [
            AllocRequest::fixed(Purpose::FrontBuffer, 3 * MB, GTT_PAGE_SIZE, PoolKind::Stolen),
            AllocRequest::fixed(Purpose::BackBuffer, 6 * MB, GTT_PAGE_SIZE, PoolKind::Stolen),
            AllocRequest::fixed(Purpose::DepthBuffer, 6 * MB, GTT_PAGE_SIZE, PoolKind::Stolen),
        ];
        let deficit = match alloc.allocate(&requests, AllocFlags::DRY_RUN) {
            Err(AllocError::PoolExhausted { deficit, .. }) => deficit,
            other => panic!("expected exhaustion, got {:?}", other),
        };
        // Depth spills past the aperture by 4MB; the stolen pool is
        // 5MB short and must not win the accounting.
        assert_eq!(deficit, 4 * MB);
        alloc.set_aperture_capacity(8 * MB + deficit);
        alloc
            .allocate(&requests, AllocFlags::DRY_RUN)
            .expect("retry after growing the aperture by the deficit");
    }

    #[test]
    fn flexible_pool_reports_shortfall() {
        let mut alloc = aperture_only(4 * MB);
        let requests = [
            AllocRequest::fixed(Purpose::FrontBuffer, 4 * MB, GTT_PAGE_SIZE, PoolKind::Aperture),
            AllocRequest::flexible(Purpose::TexturePool, 64 * MB),
        ];
        match alloc.allocate(&requests, AllocFlags::DRY_RUN) {
            Err(AllocError::PoolExhausted { deficit, .. }) => {
                assert_eq!(deficit, MIN_TEXTURE_BYTES)
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn flexible_pool_respects_cap() {
        let mut alloc = aperture_only(64 * MB);
        let requests = [
            AllocRequest::fixed(Purpose::FrontBuffer, 8 * MB, GTT_PAGE_SIZE, PoolKind::Aperture),
            AllocRequest::flexible(Purpose::TexturePool, 16 * MB),
        ];
        let out = alloc
            .allocate(&requests, AllocFlags::empty())
            .expect("fits with room to spare");
        let tex = out.placement_for(Purpose::TexturePool).expect("placed");
        assert_eq!(tex.size, 16 * MB, "flexible consumer capped");
    }

    #[test]
    fn freed_space_is_reused() {
        let mut alloc = aperture_only(8 * MB);
        let out = alloc
            .allocate(
                &[
                    AllocRequest::fixed(Purpose::FrontBuffer, 4 * MB, GTT_PAGE_SIZE, PoolKind::Aperture),
                    AllocRequest::fixed(Purpose::BackBuffer, 4 * MB, GTT_PAGE_SIZE, PoolKind::Aperture),
                ],
                AllocFlags::empty(),
            )
            .expect("exactly fills the pool");
        let front = out.handle_for(Purpose::FrontBuffer).expect("front handle");
        alloc.free(front).expect("free the front buffer");
        alloc
            .allocate(
                &[AllocRequest::fixed(
                    Purpose::DepthBuffer,
                    4 * MB,
                    GTT_PAGE_SIZE,
                    PoolKind::Aperture,
                )],
                AllocFlags::empty(),
            )
            .expect("freed space must coalesce and be reusable");
        assert!(alloc.check_invariants());
    }

    #[test]
    fn stolen_overflow_falls_back_to_aperture() {
        let mut alloc = Allocator::new(0, 0, MB, 0x10_0000, 0x8000_0000, 32 * MB);
        let out = alloc
            .allocate(
                &[
                    AllocRequest::fixed(Purpose::Cursor, 16 * 1024, GTT_PAGE_SIZE, PoolKind::Stolen),
                    AllocRequest::fixed(Purpose::FrontBuffer, 8 * MB, GTT_PAGE_SIZE, PoolKind::Stolen),
                ],
                AllocFlags::empty(),
            )
            .expect("front buffer spills into the aperture");
        assert_eq!(
            out.placement_for(Purpose::Cursor).expect("cursor").pool,
            PoolKind::Stolen
        );
        assert_eq!(
            out.placement_for(Purpose::FrontBuffer).expect("front").pool,
            PoolKind::Aperture
        );
    }

    #[test]
    fn reset_invalidates_handles() {
        let mut alloc = aperture_only(8 * MB);
        let out = alloc
            .allocate(
                &[AllocRequest::fixed(
                    Purpose::FrontBuffer,
                    MB,
                    GTT_PAGE_SIZE,
                    PoolKind::Aperture,
                )],
                AllocFlags::empty(),
            )
            .expect("fits");
        let handle = out.handle_for(Purpose::FrontBuffer).expect("handle");
        alloc.reset_allocations();
        assert_eq!(alloc.free(handle), Err(AllocError::StaleHandle));
        assert_eq!(
            alloc.range(handle).map(|_| ()),
            Err(AllocError::StaleHandle)
        );
    }

    #[test]
    fn pitch_classes() {
        assert_eq!(tileable_pitch(1300), Some(2048));
        assert_eq!(tileable_pitch(1024), Some(1024));
        assert_eq!(tileable_pitch(9000), None);
        assert!(is_tileable_pitch(4096));
        assert!(!is_tileable_pitch(1300));
    }

    proptest! {
        /// For any interleaving of allocations and frees, live ranges
        /// never overlap and never exceed pool capacity.
        #[test]
        fn no_overlap_under_random_ops(ops in proptest::collection::vec((1u64..512, any::<bool>()), 1..64)) {
            let mut alloc = aperture_only(16 * MB);
            let mut handles: Vec<RangeHandle> = Vec::new();
            for (pages, do_free) in ops {
                if do_free && !handles.is_empty() {
                    let h = handles.swap_remove(pages as usize % handles.len());
                    alloc.free(h).expect("live handle frees cleanly");
                } else {
                    let req = [AllocRequest::fixed(
                        Purpose::Scratch,
                        pages * GTT_PAGE_SIZE,
                        GTT_PAGE_SIZE,
                        PoolKind::Aperture,
                    )];
                    if let Ok(out) = alloc.allocate(&req, AllocFlags::empty()) {
                        handles.push(out.handle_for(Purpose::Scratch).expect("committed handle"));
                    }
                }
                prop_assert!(alloc.check_invariants());
            }
        }
    }
}
