//! Large-scale address space manager.
//!
//! One [`VmManager`] owns one address space: its mappings, the frames
//! backing them, compressed and swapped page content and commit accounting.
//! Frames come from a [`FrameProvider`], normally the NUMA manager.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use helix_coherency::CancelToken;
use helix_numa::{CoreLocator, PageRange, PAGE_SIZE};
use helix_topology::{CoreId, NodeId};
use spin::{Mutex, RwLock};

use crate::addr::{AddrRange, PagingMode, VirtAddr, HUGE_PAGE_FRAMES};
use crate::compress::{is_zero_page, Codec, CompressedPage, CompressionStats, RleCodec};
use crate::config::VmConfig;
use crate::dedup::{DedupOutcome, DedupStats, Fnv1aHasher, PageHasher};
use crate::error::{VmError, VmResult};
use crate::frames::{FrameProvider, FrameTable};
use crate::overcommit::CommitAccounting;
use crate::pressure::{PressureStats, PressureStep};
use crate::swap::{SwapArea, SwapStats};
use crate::vma::{Access, Backing, Page, PageState, Vma, VmaFlags, VmaId, VmaInfo};

/// How a touch was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Page was resident
    Hit,
    /// Fresh zero-filled frame
    DemandZero,
    /// Shared frame copied before a write
    CopyOnWrite,
    /// Decompressed into a fresh frame
    Decompressed,
    /// Read back from swap
    SwappedIn,
}

/// Result of a successful touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address of the touched byte
    pub phys: u64,
    /// How the access was satisfied
    pub fault: FaultKind,
    /// Backed by a huge page
    pub huge: bool,
    /// Node holding the frame
    pub node: NodeId,
}

/// Fault counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    /// Touches that were not hits
    pub faults: u64,
    /// Zero-fill faults
    pub demand_zero: u64,
    /// Of which on file-backed mappings
    pub file_backed: u64,
    /// Copy-on-write breaks
    pub copy_on_write: u64,
    /// Transparent decompressions
    pub decompressed: u64,
    /// Swap-ins
    pub swapped_in: u64,
    /// Accesses refused by mapping permissions
    pub permission_denied: u64,
}

/// Huge page counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HugeStats {
    /// Windows promoted
    pub promotions: u64,
    /// Eligible windows that fell back to base pages
    pub fallbacks: u64,
}

/// Point-in-time view of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    /// Live mappings
    pub vmas: usize,
    /// Page-table depth in use
    pub paging_mode: PagingMode,
    /// Frames held
    pub frames_held: usize,
    /// Frames mapped by more than one page
    pub shared_frames: usize,
    /// Pages charged against the commit limit
    pub committed_pages: u64,
    /// Allocations are being denied
    pub allocations_denied: bool,
    /// Fault counters
    pub faults: FaultStats,
    /// Huge page counters
    pub huge: HugeStats,
    /// Compression counters
    pub compression: CompressionStats,
    /// Deduplication counters
    pub dedup: DedupStats,
    /// Swap counters
    pub swap: SwapStats,
    /// Pressure counters
    pub pressure: PressureStats,
}

/// Result of one background pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackgroundOutcome {
    /// Deduplication result
    pub dedup: DedupOutcome,
    /// Pages compressed
    pub compressed: u64,
    /// Stopped early at a cancellation point
    pub cancelled: bool,
}

struct SpaceState {
    next_id: u64,
    /// Keyed by start address
    vmas: BTreeMap<u64, Vma>,
    ids: HashMap<VmaId, u64>,
    frames: FrameTable,
    swap: SwapArea,
    commit: CommitAccounting,
    mode: PagingMode,
    deny_allocations: bool,
    last_pressure_step: Option<PressureStep>,
    faults: FaultStats,
    huge: HugeStats,
    compression: CompressionStats,
    dedup: DedupStats,
    pressure: PressureStats,
}

impl SpaceState {
    fn containing(&self, addr: VirtAddr) -> Option<u64> {
        self.vmas
            .range(..=addr.0)
            .next_back()
            .filter(|(_, vma)| vma.range.contains(addr))
            .map(|(&start, _)| start)
    }

    fn conflicting(&self, range: &AddrRange) -> Option<VmaId> {
        self.vmas
            .range(..range.end().0)
            .next_back()
            .filter(|(_, vma)| vma.range.overlaps(range))
            .map(|(_, vma)| vma.id)
    }
}

/// Address space manager
pub struct VmManager {
    provider: Arc<dyn FrameProvider>,
    config: RwLock<VmConfig>,
    hasher: Box<dyn PageHasher>,
    codec: Box<dyn Codec>,
    locator: RwLock<Option<Arc<dyn CoreLocator>>>,
    state: Mutex<SpaceState>,
}

impl VmManager {
    /// Empty address space over `provider`
    pub fn new(provider: Arc<dyn FrameProvider>, config: VmConfig) -> VmResult<Self> {
        config.validate()?;
        log::info!(
            "VM: address space over {} frames, overcommit {:?}, swap {} slots",
            provider.total_frames(),
            config.overcommit,
            config.swap_slots
        );
        Ok(Self {
            provider,
            hasher: Box::new(Fnv1aHasher),
            codec: Box::new(RleCodec),
            locator: RwLock::new(None),
            state: Mutex::new(SpaceState {
                next_id: 1,
                vmas: BTreeMap::new(),
                ids: HashMap::new(),
                frames: FrameTable::new(),
                swap: SwapArea::new(config.swap_slots),
                commit: CommitAccounting::new(config.overcommit, config.overcommit_ratio_percent),
                mode: PagingMode::FourLevel,
                deny_allocations: false,
                last_pressure_step: None,
                faults: FaultStats::default(),
                huge: HugeStats::default(),
                compression: CompressionStats::default(),
                dedup: DedupStats::default(),
                pressure: PressureStats::default(),
            }),
            config: RwLock::new(config),
        })
    }

    /// Replace the deduplication hasher
    pub fn with_hasher(mut self, hasher: Box<dyn PageHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Replace the compression codec
    pub fn with_codec(mut self, codec: Box<dyn Codec>) -> Self {
        log::debug!("VM: compression codec {}", codec.name());
        self.codec = codec;
        self
    }

    /// Source of the faulting core for frame placement
    pub fn set_locator(&self, locator: Arc<dyn CoreLocator>) {
        *self.locator.write() = Some(locator);
    }

    /// Current settings
    pub fn config(&self) -> VmConfig {
        *self.config.read()
    }

    /// Switch background compression on or off
    pub fn set_compression_enabled(&self, enabled: bool) {
        self.config.write().compression_enabled = enabled;
    }

    fn current_core(&self) -> Option<CoreId> {
        self.locator.read().as_ref().and_then(|l| l.current_core())
    }

    // ------------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------------

    /// Create a mapping over `range`
    pub fn map(&self, range: AddrRange, flags: VmaFlags, backing: Backing, prefer_huge: bool) -> VmResult<VmaId> {
        let config = self.config();
        flags.validate(config.write_implies_read)?;

        let mut st = self.state.lock();
        if let Some(existing) = st.conflicting(&range) {
            return Err(VmError::AddressConflict { existing });
        }

        let charged = flags.contains(VmaFlags::WRITE) && !flags.contains(VmaFlags::SHARED) && backing.is_anonymous();
        let committed = if charged { range.pages() } else { 0 };
        if committed > 0 {
            if st.deny_allocations {
                st.pressure.denied += 1;
                return Err(VmError::AllocationDenied);
            }
            let frames = self.provider.total_frames();
            let swap = st.swap.capacity() as u64;
            st.commit.charge(committed, frames, swap)?;
        }

        let mode = PagingMode::for_end(range.end());
        if mode > st.mode {
            log::info!("VM: paging mode {} -> {} for {}", st.mode, mode, range);
            st.mode = mode;
        }

        let id = VmaId(st.next_id);
        st.next_id += 1;
        let huge_eligible = (prefer_huge || flags.contains(VmaFlags::HUGE))
            && !flags.contains(VmaFlags::NO_HUGE)
            && backing.is_anonymous();
        st.vmas.insert(
            range.start().0,
            Vma {
                id,
                range,
                flags,
                backing,
                huge_eligible,
                committed,
                accesses: 0,
                last_access_ns: 0,
                pages: BTreeMap::new(),
                huge: BTreeMap::new(),
            },
        );
        st.ids.insert(id, range.start().0);
        log::debug!("VM: mapped {} as {} ({:?})", range, id, flags);
        Ok(id)
    }

    /// Remove a mapping and release everything behind it
    pub fn unmap(&self, id: VmaId) -> VmResult<()> {
        let config = self.config();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let start = st.ids.remove(&id).ok_or(VmError::UnknownVma(id))?;
        let vma = st.vmas.remove(&start).ok_or(VmError::UnknownVma(id))?;

        for page in vma.pages.values() {
            match &page.state {
                PageState::Resident(pfn) => self.release_frame(&mut st.frames, *pfn),
                PageState::Compressed(c) => {
                    st.compression.stored_bytes =
                        st.compression.stored_bytes.saturating_sub(c.stored_bytes() as u64);
                },
                PageState::Swapped(slot) => st.swap.release(*slot),
            }
        }
        for range in vma.huge.values() {
            self.provider.free_frames(*range);
        }
        st.commit.release(vma.committed);
        log::debug!("VM: unmapped {} {}", id, vma.range);

        if st.deny_allocations && !self.under_pressure(&config) {
            st.deny_allocations = false;
            log::info!("VM: pressure cleared, allocations resumed");
        }
        Ok(())
    }

    /// Mapping containing `addr`
    pub fn lookup(&self, addr: VirtAddr) -> Option<VmaInfo> {
        let st = self.state.lock();
        let start = st.containing(addr)?;
        st.vmas.get(&start).map(Vma::info)
    }

    /// Mapping by id
    pub fn vma(&self, id: VmaId) -> VmResult<VmaInfo> {
        let st = self.state.lock();
        st.ids
            .get(&id)
            .and_then(|start| st.vmas.get(start))
            .map(Vma::info)
            .ok_or(VmError::UnknownVma(id))
    }

    /// Every mapping, by address
    pub fn vmas(&self) -> Vec<VmaInfo> {
        self.state.lock().vmas.values().map(Vma::info).collect()
    }

    /// Page-table depth in use
    pub fn paging_mode(&self) -> PagingMode {
        self.state.lock().mode
    }

    /// Physical address of `addr` if its page is resident; never faults
    pub fn translate(&self, addr: VirtAddr) -> Option<u64> {
        let st = self.state.lock();
        let start = st.containing(addr)?;
        let pfn = st.vmas.get(&start)?.pages.get(&Vma::vpn(addr))?.pfn()?;
        Some(pfn * PAGE_SIZE + addr.page_offset())
    }

    // ------------------------------------------------------------------------
    // Fault path
    // ------------------------------------------------------------------------

    /// Access `addr`, faulting the page in as needed
    pub fn touch(&self, addr: VirtAddr, access: Access, now_ns: u64) -> VmResult<Translation> {
        let config = self.config();
        let mut st = self.state.lock();
        self.touch_locked(&mut st, addr, access, now_ns, &config)
            .map(|(_, translation)| translation)
    }

    /// Copy `out.len()` bytes starting at `addr`; must stay inside one page
    pub fn read_page(&self, addr: VirtAddr, out: &mut [u8], now_ns: u64) -> VmResult<()> {
        let offset = addr.page_offset() as usize;
        if offset + out.len() > PAGE_SIZE as usize {
            return Err(VmError::InvalidRange);
        }
        let config = self.config();
        let mut st = self.state.lock();
        let (pfn, _) = self.touch_locked(&mut st, addr, Access::Read, now_ns, &config)?;
        out.copy_from_slice(&st.frames.bytes(pfn)[offset..offset + out.len()]);
        Ok(())
    }

    /// Store `data` starting at `addr`; must stay inside one page
    pub fn write_page(&self, addr: VirtAddr, data: &[u8], now_ns: u64) -> VmResult<()> {
        let offset = addr.page_offset() as usize;
        if offset + data.len() > PAGE_SIZE as usize {
            return Err(VmError::InvalidRange);
        }
        let config = self.config();
        let mut st = self.state.lock();
        let (pfn, _) = self.touch_locked(&mut st, addr, Access::Write, now_ns, &config)?;
        let frame = st.frames.bytes_mut(pfn).ok_or(VmError::Corrupted(addr))?;
        frame[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn touch_locked(
        &self,
        st: &mut SpaceState,
        addr: VirtAddr,
        access: Access,
        now_ns: u64,
        config: &VmConfig,
    ) -> VmResult<(u64, Translation)> {
        let start = st.containing(addr).ok_or(VmError::NotMapped(addr))?;
        let vpn = Vma::vpn(addr);
        let (flags, backing, existing) = {
            let vma = st.vmas.get(&start).ok_or(VmError::NotMapped(addr))?;
            (vma.flags, vma.backing, vma.pages.get(&vpn).map(|p| p.state.clone()))
        };
        if !access.permitted_by(flags) {
            st.faults.permission_denied += 1;
            return Err(VmError::PermissionDenied { addr, access });
        }

        let near = self.current_core();
        let (pfn, fault) = match existing {
            Some(PageState::Resident(pfn)) if access != Access::Write || st.frames.refs(pfn) <= 1 => {
                (pfn, FaultKind::Hit)
            },
            Some(PageState::Resident(_)) => {
                let frame = self.alloc_frame(st, near, now_ns, config)?;
                // Relief may have remapped the page; copy from where it is now.
                let src = st
                    .vmas
                    .get(&start)
                    .and_then(|v| v.pages.get(&vpn))
                    .and_then(Page::pfn)
                    .ok_or(VmError::Corrupted(addr))?;
                let data: Box<[u8]> = st.frames.bytes(src).into();
                st.frames.insert(frame.start_pfn, frame.node, false);
                st.frames.set_data(frame.start_pfn, data);
                self.release_frame(&mut st.frames, src);
                st.faults.copy_on_write += 1;
                st.dedup.cow_breaks += 1;
                (frame.start_pfn, FaultKind::CopyOnWrite)
            },
            None => {
                let frame = self.alloc_frame(st, near, now_ns, config)?;
                st.frames.insert(frame.start_pfn, frame.node, false);
                st.faults.demand_zero += 1;
                if !backing.is_anonymous() {
                    st.faults.file_backed += 1;
                }
                (frame.start_pfn, FaultKind::DemandZero)
            },
            Some(PageState::Compressed(compressed)) => {
                let frame = self.alloc_frame(st, near, now_ns, config)?;
                st.frames.insert(frame.start_pfn, frame.node, false);
                if let CompressedPage::Encoded(data) = &compressed {
                    let restored = match st.frames.bytes_mut(frame.start_pfn) {
                        Some(out) => self.codec.decompress(data, out),
                        None => false,
                    };
                    if !restored {
                        self.release_frame(&mut st.frames, frame.start_pfn);
                        log::error!("VM: compressed page at {} failed to decode", addr);
                        return Err(VmError::Corrupted(addr));
                    }
                }
                st.compression.stored_bytes =
                    st.compression.stored_bytes.saturating_sub(compressed.stored_bytes() as u64);
                st.compression.decompressed += 1;
                st.faults.decompressed += 1;
                (frame.start_pfn, FaultKind::Decompressed)
            },
            Some(PageState::Swapped(slot)) => {
                let frame = self.alloc_frame(st, near, now_ns, config)?;
                st.frames.insert(frame.start_pfn, frame.node, false);
                match st.swap.load(slot) {
                    Some(data) => st.frames.set_data(frame.start_pfn, data),
                    None => {
                        self.release_frame(&mut st.frames, frame.start_pfn);
                        log::error!("VM: swap slot {} for {} is empty", slot.0, addr);
                        return Err(VmError::Corrupted(addr));
                    },
                }
                st.faults.swapped_in += 1;
                (frame.start_pfn, FaultKind::SwappedIn)
            },
        };
        if fault != FaultKind::Hit {
            st.faults.faults += 1;
        }

        if let Some(vma) = st.vmas.get_mut(&start) {
            let page = vma.pages.entry(vpn).or_insert_with(|| Page::resident(pfn, now_ns));
            page.state = PageState::Resident(pfn);
            page.accesses = page.accesses.saturating_add(1);
            page.last_access_ns = now_ns;
            vma.accesses += 1;
            vma.last_access_ns = now_ns;
        }

        if fault != FaultKind::Hit {
            self.try_promote(st, start, vpn, near, config);
        }

        let vma = st.vmas.get(&start).ok_or(VmError::NotMapped(addr))?;
        let pfn = vma.pages.get(&vpn).and_then(Page::pfn).unwrap_or(pfn);
        let translation = Translation {
            phys: pfn * PAGE_SIZE + addr.page_offset(),
            fault,
            huge: vma.in_huge_window(vpn),
            node: st.frames.get(pfn).map_or(NodeId(0), |f| f.node),
        };
        Ok((pfn, translation))
    }

    /// One frame for a fault; runs the pressure ladder once if none is free
    fn alloc_frame(
        &self,
        st: &mut SpaceState,
        near: Option<CoreId>,
        now_ns: u64,
        config: &VmConfig,
    ) -> VmResult<PageRange> {
        if st.deny_allocations {
            st.pressure.denied += 1;
            return Err(VmError::AllocationDenied);
        }
        if let Some(frame) = self.provider.alloc_frames(1, 1, near) {
            return Ok(frame);
        }
        self.relieve_locked(st, now_ns, true, config);
        if st.deny_allocations {
            st.pressure.denied += 1;
            return Err(VmError::AllocationDenied);
        }
        self.provider.alloc_frames(1, 1, near).ok_or(VmError::OutOfMemory)
    }

    fn release_frame(&self, frames: &mut FrameTable, pfn: u64) {
        if let Some(frame) = frames.unshare(pfn) {
            if !frame.huge {
                self.provider.free_frames(PageRange {
                    start_pfn: pfn,
                    pages: 1,
                    node: frame.node,
                });
            }
        }
    }

    /// Promote the huge window around `vpn` if it is complete and a
    /// contiguous aligned run is free; otherwise leave base pages alone.
    fn try_promote(&self, st: &mut SpaceState, start: u64, vpn: u64, near: Option<CoreId>, config: &VmConfig) {
        if !cfg!(feature = "huge_pages") || !config.huge_pages {
            return;
        }
        let SpaceState {
            vmas, frames, huge, ..
        } = st;
        let Some(vma) = vmas.get_mut(&start) else {
            return;
        };
        if !vma.huge_eligible {
            return;
        }
        let window = Vma::huge_window(vpn);
        let first = window * HUGE_PAGE_FRAMES;
        let (lo, hi) = (Vma::vpn(vma.range.start()), Vma::vpn(vma.range.end()));
        if vma.huge.contains_key(&window) || first < lo || first + HUGE_PAGE_FRAMES > hi {
            return;
        }
        let complete = (first..first + HUGE_PAGE_FRAMES).all(|v| {
            matches!(vma.pages.get(&v).and_then(Page::pfn), Some(pfn) if frames.refs(pfn) == 1)
        });
        if !complete {
            return;
        }

        let Some(range) = self.provider.alloc_frames(HUGE_PAGE_FRAMES, HUGE_PAGE_FRAMES, near) else {
            huge.fallbacks += 1;
            log::debug!("VM: no contiguous run for huge page at {:#x}", first * PAGE_SIZE);
            return;
        };
        for i in 0..HUGE_PAGE_FRAMES {
            let Some(page) = vma.pages.get_mut(&(first + i)) else {
                continue;
            };
            let Some(old) = page.pfn() else {
                continue;
            };
            let data = frames.take_data(old);
            self.release_frame(frames, old);
            let new = range.start_pfn + i;
            frames.insert(new, range.node, true);
            if let Some(data) = data {
                frames.set_data(new, data);
            }
            page.state = PageState::Resident(new);
        }
        vma.huge.insert(window, range);
        huge.promotions += 1;
        log::debug!("VM: promoted {:#x} to a huge page on {}", first * PAGE_SIZE, range.node);
    }

    // ------------------------------------------------------------------------
    // Background passes
    // ------------------------------------------------------------------------

    /// Deduplicate then compress cold pages, then start a new access period
    pub fn background_pass(&self, cancel: &CancelToken) -> BackgroundOutcome {
        let config = self.config();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let mut outcome = BackgroundOutcome::default();

        if config.dedup_enabled {
            outcome.dedup = self.dedup_locked(st, config.cold_access_threshold, Some(cancel));
            outcome.cancelled = outcome.dedup.cancelled;
        }
        if config.compression_enabled && !outcome.cancelled {
            let (compressed, cancelled) = self.compress_locked(st, config.cold_access_threshold, Some(cancel));
            outcome.compressed = compressed;
            outcome.cancelled = cancelled;
        }
        if !outcome.cancelled {
            for vma in st.vmas.values_mut() {
                for page in vma.pages.values_mut() {
                    page.accesses = 0;
                }
            }
        }
        outcome
    }

    /// Merge identical cold pages
    pub fn deduplicate(&self, cancel: &CancelToken) -> DedupOutcome {
        let threshold = self.config().cold_access_threshold;
        let mut st = self.state.lock();
        self.dedup_locked(&mut st, threshold, Some(cancel))
    }

    /// Compress cold pages; returns pages compressed
    pub fn compress_cold(&self, cancel: &CancelToken) -> u64 {
        let threshold = self.config().cold_access_threshold;
        let mut st = self.state.lock();
        self.compress_locked(&mut st, threshold, Some(cancel)).0
    }

    fn dedup_locked(&self, st: &mut SpaceState, threshold: u32, cancel: Option<&CancelToken>) -> DedupOutcome {
        let SpaceState {
            vmas, frames, dedup, ..
        } = st;
        let mut outcome = DedupOutcome::default();
        let mut index: HashMap<u64, Vec<u64>> = HashMap::new();
        dedup.passes += 1;

        'vmas: for vma in vmas.values_mut() {
            if vma.pinned() {
                continue;
            }
            let Vma { pages, huge, .. } = vma;
            for (&vpn, page) in pages.iter_mut() {
                if cancel.is_some_and(CancelToken::is_cancelled) {
                    outcome.cancelled = true;
                    break 'vmas;
                }
                let Some(pfn) = page.pfn() else {
                    continue;
                };
                if page.accesses >= threshold || huge.contains_key(&Vma::huge_window(vpn)) {
                    continue;
                }
                outcome.scanned += 1;

                let hash = self.hasher.hash(frames.bytes(pfn));
                let bucket = index.entry(hash).or_default();
                if bucket.contains(&pfn) {
                    continue;
                }
                let mut collided = false;
                let mut target = None;
                for &canonical in bucket.iter() {
                    if frames.bytes(canonical) == frames.bytes(pfn) {
                        target = Some(canonical);
                        break;
                    }
                    collided = true;
                }
                match target {
                    Some(canonical) => {
                        frames.share(canonical);
                        page.state = PageState::Resident(canonical);
                        self.release_frame(frames, pfn);
                        outcome.merged += 1;
                    },
                    None => {
                        if collided {
                            outcome.collisions += 1;
                            log::warn!(
                                "VM: hash {:#018x} matched differing content at {:#x}; merge aborted",
                                hash,
                                vpn * PAGE_SIZE
                            );
                        }
                        bucket.push(pfn);
                    },
                }
            }
        }

        dedup.scanned += outcome.scanned;
        dedup.merged += outcome.merged;
        dedup.collisions += outcome.collisions;
        outcome
    }

    fn compress_locked(&self, st: &mut SpaceState, threshold: u32, cancel: Option<&CancelToken>) -> (u64, bool) {
        let SpaceState {
            vmas,
            frames,
            compression,
            ..
        } = st;
        let mut count = 0;
        for vma in vmas.values_mut() {
            if vma.pinned() {
                continue;
            }
            let Vma { pages, huge, .. } = vma;
            for (&vpn, page) in pages.iter_mut() {
                if cancel.is_some_and(CancelToken::is_cancelled) {
                    return (count, true);
                }
                let Some(pfn) = page.pfn() else {
                    continue;
                };
                if page.accesses >= threshold || frames.refs(pfn) != 1 || huge.contains_key(&Vma::huge_window(vpn)) {
                    continue;
                }
                let bytes = frames.bytes(pfn);
                let compressed = if is_zero_page(bytes) {
                    compression.zero_pages += 1;
                    CompressedPage::Zero
                } else {
                    match self.codec.compress(bytes) {
                        Some(data) => CompressedPage::Encoded(data),
                        None => {
                            compression.incompressible += 1;
                            continue;
                        },
                    }
                };
                compression.compressed += 1;
                compression.stored_bytes += compressed.stored_bytes() as u64;
                page.state = PageState::Compressed(compressed);
                self.release_frame(frames, pfn);
                count += 1;
            }
        }
        (count, false)
    }

    fn swap_out_locked(&self, st: &mut SpaceState, threshold: u32, max_pages: u64) -> u64 {
        let SpaceState {
            vmas, frames, swap, ..
        } = st;
        let mut count = 0;
        for vma in vmas.values_mut() {
            if vma.pinned() {
                continue;
            }
            let Vma { pages, huge, .. } = vma;
            for (&vpn, page) in pages.iter_mut() {
                if count >= max_pages || !swap.has_space() {
                    return count;
                }
                let Some(pfn) = page.pfn() else {
                    continue;
                };
                if page.accesses >= threshold || frames.refs(pfn) != 1 || huge.contains_key(&Vma::huge_window(vpn)) {
                    continue;
                }
                let Ok(slot) = swap.store(frames.bytes(pfn)) else {
                    return count;
                };
                page.state = PageState::Swapped(slot);
                self.release_frame(frames, pfn);
                count += 1;
            }
        }
        count
    }

    // ------------------------------------------------------------------------
    // Pressure
    // ------------------------------------------------------------------------

    fn pressure_target(&self, config: &VmConfig) -> u64 {
        let total = self.provider.total_frames() as f32;
        (total * config.pressure_free_ratio) as u64
    }

    fn under_pressure(&self, config: &VmConfig) -> bool {
        self.provider.free_frame_count() < self.pressure_target(config)
    }

    /// Free frames below the watermark?
    pub fn is_under_pressure(&self) -> bool {
        self.under_pressure(&self.config())
    }

    /// Escalate through the pressure ladder until relieved; `None` when
    /// there was no pressure
    pub fn relieve_pressure(&self, now_ns: u64) -> Option<PressureStep> {
        let config = self.config();
        let mut st = self.state.lock();
        self.relieve_locked(&mut st, now_ns, false, &config)
    }

    fn relieve_locked(&self, st: &mut SpaceState, now_ns: u64, force: bool, config: &VmConfig) -> Option<PressureStep> {
        if !force && !self.under_pressure(config) {
            if st.deny_allocations {
                st.deny_allocations = false;
                log::info!("VM: pressure cleared, allocations resumed");
            }
            return None;
        }
        st.pressure.episodes += 1;
        let threshold = config.cold_access_threshold;

        let mut last = PressureStep::ReclaimCompressed;
        for step in PressureStep::ALL {
            last = step;
            match step {
                PressureStep::ReclaimCompressed => {
                    if config.compression_enabled {
                        let (n, _) = self.compress_locked(st, threshold, None);
                        log::info!("VM: pressure step {}: {} pages compressed", step, n);
                    }
                },
                PressureStep::Deduplicate => {
                    if config.dedup_enabled {
                        let outcome = self.dedup_locked(st, threshold, None);
                        log::info!("VM: pressure step {}: {} pages merged", step, outcome.merged);
                    }
                },
                PressureStep::SwapOut => {
                    let free = self.provider.free_frame_count();
                    let need = self.pressure_target(config).saturating_sub(free).max(1);
                    let n = self.swap_out_locked(st, threshold, need);
                    log::info!("VM: pressure step {}: {} pages swapped out", step, n);
                },
                PressureStep::DenyAllocations => {
                    st.deny_allocations = true;
                    log::warn!("VM: memory pressure unresolved at {} ns, denying allocations", now_ns);
                },
            }
            if step != PressureStep::DenyAllocations
                && !self.under_pressure(config)
                && self.provider.free_frame_count() > 0
            {
                break;
            }
        }
        st.pressure.steps[last.index()] += 1;
        st.last_pressure_step = Some(last);
        Some(last)
    }

    /// Last pressure step taken, if any
    pub fn last_pressure_step(&self) -> Option<PressureStep> {
        self.state.lock().last_pressure_step
    }

    /// Are allocations being denied?
    pub fn allocations_denied(&self) -> bool {
        self.state.lock().deny_allocations
    }

    /// Periodic work: pressure check and relief
    pub fn tick(&self, now_ns: u64) -> Option<PressureStep> {
        self.relieve_pressure(now_ns)
    }

    /// Counters and sizes
    pub fn stats(&self) -> VmStats {
        let st = self.state.lock();
        VmStats {
            vmas: st.vmas.len(),
            paging_mode: st.mode,
            frames_held: st.frames.len(),
            shared_frames: st.frames.shared(),
            committed_pages: st.commit.committed(),
            allocations_denied: st.deny_allocations,
            faults: st.faults,
            huge: st.huge,
            compression: st.compression,
            dedup: st.dedup,
            swap: st.swap.stats(),
            pressure: st.pressure,
        }
    }
}

impl core::fmt::Debug for VmManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmManager")
            .field("config", &*self.config.read())
            .field("stats", &self.stats())
            .finish()
    }
}
