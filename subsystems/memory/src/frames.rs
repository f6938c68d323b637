//! Physical frames: where they come from and what they hold.

use alloc::boxed::Box;

use hashbrown::HashMap;
use helix_numa::{AllocPolicy, NumaManager, PageRange, PAGE_SIZE};
use helix_topology::{CoreId, NodeId};

/// Source of physical frames
pub trait FrameProvider: Send + Sync {
    /// `pages` contiguous frames starting on an `align`-frame boundary,
    /// placed close to `near` when given
    fn alloc_frames(&self, pages: u64, align: u64, near: Option<CoreId>) -> Option<PageRange>;

    /// Give frames back
    fn free_frames(&self, range: PageRange);

    /// Frames managed
    fn total_frames(&self) -> u64;

    /// Frames free now
    fn free_frame_count(&self) -> u64;
}

impl FrameProvider for NumaManager {
    fn alloc_frames(&self, pages: u64, align: u64, near: Option<CoreId>) -> Option<PageRange> {
        let caller = near.and_then(|core| self.topology().node_of(core));
        self.allocate_frames(pages, align, AllocPolicy::Auto, caller).ok()
    }

    fn free_frames(&self, range: PageRange) {
        if let Err(err) = self.free(range) {
            log::warn!("VM: returning {} failed: {}", range, err);
        }
    }

    fn total_frames(&self) -> u64 {
        self.all_node_stats().iter().map(|s| s.total_pages).sum()
    }

    fn free_frame_count(&self) -> u64 {
        self.all_node_stats().iter().map(|s| s.free_pages).sum()
    }
}

const PAGE_BYTES: usize = PAGE_SIZE as usize;

static ZERO_PAGE: [u8; PAGE_BYTES] = [0; PAGE_BYTES];

/// One frame in use by the address space
#[derive(Debug)]
pub(crate) struct Frame {
    /// `None` until first written; reads as zeros
    data: Option<Box<[u8]>>,
    /// Pages mapping this frame
    pub refs: u32,
    pub node: NodeId,
    /// Part of a huge allocation, freed with its window
    pub huge: bool,
}

/// Content and sharing of every frame the address space holds
#[derive(Debug, Default)]
pub(crate) struct FrameTable {
    frames: HashMap<u64, Frame>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pfn: u64, node: NodeId, huge: bool) {
        self.frames.insert(
            pfn,
            Frame {
                data: None,
                refs: 1,
                node,
                huge,
            },
        );
    }

    pub fn get(&self, pfn: u64) -> Option<&Frame> {
        self.frames.get(&pfn)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn shared(&self) -> usize {
        self.frames.values().filter(|f| f.refs > 1).count()
    }

    pub fn refs(&self, pfn: u64) -> u32 {
        self.frames.get(&pfn).map_or(0, |f| f.refs)
    }

    pub fn bytes(&self, pfn: u64) -> &[u8] {
        match self.frames.get(&pfn).and_then(|f| f.data.as_deref()) {
            Some(data) => data,
            None => &ZERO_PAGE,
        }
    }

    /// Writable content; materialises a zero page on first use
    pub fn bytes_mut(&mut self, pfn: u64) -> Option<&mut [u8]> {
        let frame = self.frames.get_mut(&pfn)?;
        let data = frame
            .data
            .get_or_insert_with(|| alloc::vec![0u8; PAGE_BYTES].into_boxed_slice());
        Some(&mut data[..])
    }

    pub fn set_data(&mut self, pfn: u64, data: Box<[u8]>) {
        if let Some(frame) = self.frames.get_mut(&pfn) {
            frame.data = Some(data);
        }
    }

    pub fn take_data(&mut self, pfn: u64) -> Option<Box<[u8]>> {
        self.frames.get_mut(&pfn)?.data.take()
    }

    pub fn share(&mut self, pfn: u64) {
        if let Some(frame) = self.frames.get_mut(&pfn) {
            frame.refs += 1;
        }
    }

    /// Drop one reference; returns the frame once nothing maps it
    pub fn unshare(&mut self, pfn: u64) -> Option<Frame> {
        let frame = self.frames.get_mut(&pfn)?;
        frame.refs = frame.refs.saturating_sub(1);
        if frame.refs == 0 {
            self.frames.remove(&pfn)
        } else {
            None
        }
    }
}
