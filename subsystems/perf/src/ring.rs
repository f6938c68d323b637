//! Per-core sample ring.
//!
//! Fixed-capacity ring with one writer and any number of readers. Each slot
//! is a small seqlock built from atomics: the writer makes the slot's
//! sequence odd, stores the packed sample, then makes it even again.
//! Readers retry while the sequence is odd or changed under them, and drop
//! a slot whose stored index shows it was already overwritten by a later
//! lap.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

use helix_topology::{CoreId, PowerState};

use crate::error::{PerfError, PerfResult};
use crate::sample::PerfSample;

const WORDS: usize = 6;

#[derive(Debug)]
struct Slot {
    seq: AtomicU64,
    words: [AtomicU64; WORDS],
}

impl Slot {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            words: Default::default(),
        }
    }
}

fn pack(index: u64, s: &PerfSample) -> [u64; WORDS] {
    let pair = |lo: f32, hi: f32| u64::from(lo.to_bits()) | (u64::from(hi.to_bits()) << 32);
    [
        index,
        s.timestamp_ns,
        (u64::from(s.core.0) << 8) | s.power_state as u64,
        pair(s.utilization, s.ipc),
        pair(s.cache_miss_rate, s.memory_bandwidth),
        u64::from(s.temperature_c.to_bits()),
    ]
}

fn unpack(w: &[u64; WORDS]) -> PerfSample {
    let lo = |v: u64| f32::from_bits(v as u32);
    let hi = |v: u64| f32::from_bits((v >> 32) as u32);
    let power = (w[2] & 0xff) as usize;
    PerfSample {
        core: CoreId((w[2] >> 8) as u32),
        timestamp_ns: w[1],
        utilization: lo(w[3]),
        ipc: hi(w[3]),
        cache_miss_rate: lo(w[4]),
        memory_bandwidth: hi(w[4]),
        temperature_c: lo(w[5]),
        power_state: PowerState::ALL[power.min(PowerState::ALL.len() - 1)],
    }
}

/// Sample ring of one core
#[derive(Debug)]
pub struct SampleRing {
    core: CoreId,
    slots: Box<[Slot]>,
    /// Samples ever written
    head: AtomicU64,
    writer: AtomicBool,
}

impl SampleRing {
    /// Empty ring holding up to `capacity` samples (at least one)
    pub fn new(core: CoreId, capacity: usize) -> Arc<Self> {
        let slots: Vec<Slot> = (0..capacity.max(1)).map(|_| Slot::new()).collect();
        Arc::new(Self {
            core,
            slots: slots.into_boxed_slice(),
            head: AtomicU64::new(0),
            writer: AtomicBool::new(false),
        })
    }

    /// Claim the single writer
    pub fn claim_writer(self: &Arc<Self>) -> PerfResult<RingWriter> {
        if self
            .writer
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(PerfError::WriterClaimed(self.core));
        }
        Ok(RingWriter { ring: Arc::clone(self) })
    }

    /// Core the ring belongs to
    #[inline]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Retained samples at most
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Samples ever written
    #[inline]
    pub fn written(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Samples currently retained
    pub fn len(&self) -> usize {
        (self.written() as usize).min(self.capacity())
    }

    /// Nothing written yet
    pub fn is_empty(&self) -> bool {
        self.written() == 0
    }

    /// Sample number `index`, if still retained
    pub fn get(&self, index: u64) -> Option<PerfSample> {
        let slot = &self.slots[(index % self.slots.len() as u64) as usize];
        loop {
            let before = slot.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                core::hint::spin_loop();
                continue;
            }
            let mut words = [0u64; WORDS];
            for (dst, src) in words.iter_mut().zip(slot.words.iter()) {
                *dst = src.load(Ordering::Relaxed);
            }
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) != before {
                core::hint::spin_loop();
                continue;
            }
            return (before != 0 && words[0] == index).then(|| unpack(&words));
        }
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<PerfSample> {
        let head = self.written();
        if head == 0 {
            return None;
        }
        self.get(head - 1)
    }

    /// Up to `max` most recent samples, oldest first
    pub fn snapshot(&self, max: usize) -> Vec<PerfSample> {
        let head = self.written();
        let n = (max.min(self.capacity()) as u64).min(head);
        (head - n..head).filter_map(|i| self.get(i)).collect()
    }
}

/// Exclusive write access to a [`SampleRing`]; released on drop
#[derive(Debug)]
pub struct RingWriter {
    ring: Arc<SampleRing>,
}

impl RingWriter {
    /// Ring being written
    pub fn ring(&self) -> &Arc<SampleRing> {
        &self.ring
    }

    /// Commit one sample, overwriting the oldest when full
    pub fn push(&mut self, sample: &PerfSample) {
        let ring = &*self.ring;
        let index = ring.head.load(Ordering::Relaxed);
        let slot = &ring.slots[(index % ring.slots.len() as u64) as usize];
        let words = pack(index, sample);

        let seq = slot.seq.load(Ordering::Relaxed);
        slot.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (dst, src) in slot.words.iter().zip(words.iter()) {
            dst.store(*src, Ordering::Relaxed);
        }
        slot.seq.store(seq.wrapping_add(2), Ordering::Release);
        ring.head.store(index + 1, Ordering::Release);
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.ring.writer.store(false, Ordering::Release);
    }
}
