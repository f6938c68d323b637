//! False-sharing detection.
//!
//! Writes are bucketed per cache line over a tumbling window. A line is
//! reported when at least two domains wrote disjoint byte ranges of it and
//! the line's write count reached the threshold. Reports are advisory:
//! nothing here changes the layout of running code.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use helix_topology::CacheDomainId;

use crate::error::{CoherencyError, CoherencyResult};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Detector settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FalseSharingConfig {
    /// Line size in bytes (power of two, at most 128)
    pub line_size: usize,
    /// Window length (ns)
    pub window_ns: u64,
    /// Writes to one line within a window needed to report it
    pub write_threshold: u32,
}

impl FalseSharingConfig {
    /// Default settings: 64-byte lines, 10 ms window, 64 writes
    pub const fn new() -> Self {
        Self {
            line_size: 64,
            window_ns: 10_000_000,
            write_threshold: 64,
        }
    }

    /// Check invariants
    pub fn validate(&self) -> CoherencyResult<()> {
        if !self.line_size.is_power_of_two() || self.line_size < 8 || self.line_size > 128 {
            return Err(CoherencyError::InvalidConfig("line_size must be a power of two in 8..=128"));
        }
        if self.window_ns == 0 {
            return Err(CoherencyError::InvalidConfig("window_ns must be non-zero"));
        }
        if self.write_threshold == 0 {
            return Err(CoherencyError::InvalidConfig("write_threshold must be non-zero"));
        }
        Ok(())
    }
}

impl Default for FalseSharingConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// REPORTS
// ============================================================================

/// One domain writing a contended line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offender {
    /// Writing domain
    pub domain: CacheDomainId,
    /// Bit `i` set if byte `i` of the line was written
    pub offset_mask: u128,
    /// Writes in the window
    pub writes: u32,
}

/// Line written at distinct offsets by several domains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FalseSharingReport {
    /// Line address
    pub line_addr: u64,
    /// Domains involved, ascending id
    pub offenders: Vec<Offender>,
    /// Start of the window the report covers (ns)
    pub window_start_ns: u64,
    /// Some write crossed into the next line
    pub straddles: bool,
}

impl FalseSharingReport {
    /// Total writes across offenders
    pub fn total_writes(&self) -> u64 {
        self.offenders.iter().map(|o| o.writes as u64).sum()
    }
}

/// Layout change that would remove the contention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingAction {
    /// Pad each hot field to its own line
    PadToLine,
    /// Split the structure into per-domain parts
    SplitHotFields,
    /// Align the structure to a line boundary
    Realign,
}

/// Offline remediation advice derived from a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingAdvice {
    /// Line concerned
    pub line_addr: u64,
    /// Suggested change
    pub action: PaddingAction,
    /// Extra bytes the change costs
    pub padding_bytes: usize,
}

impl PaddingAdvice {
    /// Suggest a fix. Narrow fields get padded, wide ones split, and
    /// writes straddling lines ask for realignment.
    pub fn from_report(report: &FalseSharingReport, line_size: usize) -> Self {
        let widest = report
            .offenders
            .iter()
            .map(|o| o.offset_mask.count_ones() as usize)
            .max()
            .unwrap_or(0);
        let (action, padding_bytes) = if report.straddles {
            (PaddingAction::Realign, line_size)
        } else if widest <= 16 {
            let extra = report.offenders.len().saturating_sub(1) * line_size;
            (PaddingAction::PadToLine, extra)
        } else {
            (PaddingAction::SplitHotFields, line_size)
        };
        Self {
            line_addr: report.line_addr,
            action,
            padding_bytes,
        }
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

#[derive(Debug, Default, Clone)]
struct LineWrites {
    /// Per domain: (mask, writes)
    by_domain: BTreeMap<CacheDomainId, (u128, u32)>,
    total: u32,
    straddles: bool,
}

/// Windowed false-sharing detector
#[derive(Debug)]
pub struct FalseSharingDetector {
    config: FalseSharingConfig,
    window_start_ns: u64,
    lines: BTreeMap<u64, LineWrites>,
    pending: Vec<FalseSharingReport>,
    reports_emitted: u64,
}

impl FalseSharingDetector {
    /// Detector with validated settings
    pub fn new(config: FalseSharingConfig) -> CoherencyResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            window_start_ns: 0,
            lines: BTreeMap::new(),
            pending: Vec::new(),
            reports_emitted: 0,
        })
    }

    /// Settings
    pub fn config(&self) -> &FalseSharingConfig {
        &self.config
    }

    /// Reports emitted so far
    pub fn reports_emitted(&self) -> u64 {
        self.reports_emitted
    }

    /// Record a write of `len` bytes at `addr`
    pub fn record_write(&mut self, domain: CacheDomainId, addr: u64, len: usize, now_ns: u64) {
        self.roll(now_ns);
        let line_size = self.config.line_size as u64;
        let mut cursor = addr;
        let end = addr.saturating_add(len.max(1) as u64);
        let straddles = (addr & !(line_size - 1)) != ((end - 1) & !(line_size - 1));

        while cursor < end {
            let line = cursor & !(line_size - 1);
            let first = (cursor - line) as u32;
            let last = ((end - line).min(line_size)) as u32;
            let mask = span_mask(first, last);

            let entry = self.lines.entry(line).or_default();
            let slot = entry.by_domain.entry(domain).or_insert((0, 0));
            slot.0 |= mask;
            slot.1 = slot.1.saturating_add(1);
            entry.total = entry.total.saturating_add(1);
            entry.straddles |= straddles;
            cursor = line + line_size;
        }
    }

    /// Close the window if it has elapsed and drain reports
    pub fn poll(&mut self, now_ns: u64) -> Vec<FalseSharingReport> {
        self.roll(now_ns);
        core::mem::take(&mut self.pending)
    }

    fn roll(&mut self, now_ns: u64) {
        if now_ns < self.window_start_ns.saturating_add(self.config.window_ns) {
            return;
        }
        let lines = core::mem::take(&mut self.lines);
        let window_start = self.window_start_ns;
        for (line_addr, writes) in lines {
            if let Some(report) = self.evaluate(line_addr, &writes, window_start) {
                log::debug!(
                    "FalseSharing: line {:#x} contended by {} domains",
                    line_addr,
                    report.offenders.len()
                );
                self.reports_emitted += 1;
                self.pending.push(report);
            }
        }
        // Align to window boundaries so idle periods do not stretch windows.
        let elapsed = now_ns - self.window_start_ns;
        self.window_start_ns += elapsed - elapsed % self.config.window_ns;
    }

    fn evaluate(&self, line_addr: u64, writes: &LineWrites, window_start_ns: u64) -> Option<FalseSharingReport> {
        if writes.total < self.config.write_threshold || writes.by_domain.len() < 2 {
            return None;
        }
        let offenders: Vec<Offender> = writes
            .by_domain
            .iter()
            .filter(|(d, (mask, _))| {
                writes
                    .by_domain
                    .iter()
                    .any(|(other, (other_mask, _))| other != *d && other_mask & mask == 0)
            })
            .map(|(&domain, &(offset_mask, writes))| Offender {
                domain,
                offset_mask,
                writes,
            })
            .collect();
        if offenders.len() < 2 {
            return None;
        }
        Some(FalseSharingReport {
            line_addr,
            offenders,
            window_start_ns,
            straddles: writes.straddles,
        })
    }
}

/// Bits `first..last` set
#[inline]
fn span_mask(first: u32, last: u32) -> u128 {
    let width = last - first;
    let ones = if width >= 128 { u128::MAX } else { (1u128 << width) - 1 };
    ones << first
}
