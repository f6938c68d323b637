//! Coherency directory: the line states of a set of cache domains.

use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::error::{CoherencyError, CoherencyResult};
use crate::line::line_of;
use crate::protocol::CoherencyProtocol;
use crate::state::{BusAction, LineState, Transition};

/// Per-protocol counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoherencyStats {
    /// State changes, local and snooped
    pub transitions: u64,
    /// Peer copies invalidated
    pub invalidations: u64,
    /// Peer copies updated in place
    pub updates: u64,
    /// Dirty lines written back
    pub write_backs: u64,
    /// Lines supplied cache-to-cache
    pub cache_to_cache: u64,
    /// Accesses satisfied without bus traffic
    pub hits: u64,
    /// Accesses that needed the bus
    pub misses: u64,
    /// Single-writer invariant violations observed
    pub violations: u64,
}

impl CoherencyStats {
    /// Fraction of accesses that hit
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Line states of `domains` cache domains under one protocol
#[derive(Debug)]
pub struct CoherencyDirectory {
    protocol: CoherencyProtocol,
    domains: usize,
    lines: HashMap<u64, Vec<LineState>>,
    stats: CoherencyStats,
}

impl CoherencyDirectory {
    /// Empty directory
    pub fn new(protocol: CoherencyProtocol, domains: usize) -> Self {
        Self {
            protocol,
            domains,
            lines: HashMap::new(),
            stats: CoherencyStats::default(),
        }
    }

    /// Protocol in use
    #[inline(always)]
    pub fn protocol(&self) -> CoherencyProtocol {
        self.protocol
    }

    /// Number of domains tracked
    #[inline(always)]
    pub fn domains(&self) -> usize {
        self.domains
    }

    /// Counters so far
    #[inline(always)]
    pub fn stats(&self) -> CoherencyStats {
        self.stats
    }

    /// State of a line in one domain
    pub fn state(&self, domain: usize, addr: u64) -> LineState {
        self.lines
            .get(&line_of(addr))
            .and_then(|states| states.get(domain).copied())
            .unwrap_or(LineState::Invalid)
    }

    /// Domains holding a valid copy
    pub fn holders(&self, addr: u64) -> Vec<usize> {
        self.lines
            .get(&line_of(addr))
            .map(|states| {
                states
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.is_valid())
                    .map(|(d, _)| d)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Domain reads `addr`
    pub fn read(&mut self, domain: usize, addr: u64) -> CoherencyResult<LineState> {
        self.access(domain, addr, false)
    }

    /// Domain writes `addr`
    pub fn write(&mut self, domain: usize, addr: u64) -> CoherencyResult<LineState> {
        self.access(domain, addr, true)
    }

    /// Domain drops its copy, writing back dirty data
    pub fn evict(&mut self, domain: usize, addr: u64) -> CoherencyResult<()> {
        self.check_domain(domain)?;
        let line = line_of(addr);
        if let Some(states) = self.lines.get_mut(&line) {
            let state = states[domain];
            if state.is_valid() {
                if state.is_dirty() {
                    self.stats.write_backs += 1;
                }
                states[domain] = LineState::Invalid;
                self.stats.transitions += 1;
            }
            if states.iter().all(|s| !s.is_valid()) {
                self.lines.remove(&line);
            }
        }
        Ok(())
    }

    fn check_domain(&self, domain: usize) -> CoherencyResult<()> {
        if domain < self.domains {
            Ok(())
        } else {
            Err(CoherencyError::UnknownDomain {
                domain,
                domains: self.domains,
            })
        }
    }

    fn access(&mut self, domain: usize, addr: u64, write: bool) -> CoherencyResult<LineState> {
        self.check_domain(domain)?;
        let protocol = self.protocol;
        let domains = self.domains;
        let line = line_of(addr);
        let states = self
            .lines
            .entry(line)
            .or_insert_with(|| vec![LineState::Invalid; domains]);

        let shared_elsewhere = states
            .iter()
            .enumerate()
            .any(|(d, s)| d != domain && s.is_valid());
        let local = if write {
            protocol.on_local_write(states[domain], shared_elsewhere)
        } else {
            protocol.on_local_read(states[domain], shared_elsewhere)
        };

        let mut stats = self.stats;
        if local.is_hit() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        for action in &local.actions {
            let Some(snoop) = action.snoop() else { continue };
            for (peer, state) in states.iter_mut().enumerate() {
                if peer == domain || !state.is_valid() {
                    continue;
                }
                let t: Transition = protocol.on_remote_snoop(*state, snoop);
                record_snoop(&mut stats, *state, &t);
                *state = t.next;
            }
        }
        if states[domain] != local.next {
            stats.transitions += 1;
        }
        states[domain] = local.next;

        if !single_writer_holds(states) {
            stats.violations += 1;
            log::error!("Coherency: {} line {:#x} has conflicting writers", protocol, line);
            debug_assert!(false, "single-writer invariant violated");
        }
        self.stats = stats;
        Ok(local.next)
    }
}

fn record_snoop(stats: &mut CoherencyStats, before: LineState, t: &Transition) {
    if t.next != before {
        stats.transitions += 1;
    }
    if t.next == LineState::Invalid {
        stats.invalidations += 1;
    } else if t.next == before {
        stats.updates += 1;
    }
    for action in &t.actions {
        match action {
            BusAction::Flush => {
                stats.write_backs += 1;
                stats.cache_to_cache += 1;
            },
            BusAction::Supply => stats.cache_to_cache += 1,
            _ => {},
        }
    }
}

/// At most one Modified copy, and a Modified copy is the only copy
fn single_writer_holds(states: &[LineState]) -> bool {
    let modified = states.iter().filter(|&&s| s == LineState::Modified).count();
    let owned = states.iter().filter(|&&s| s == LineState::Owned).count();
    let valid = states.iter().filter(|s| s.is_valid()).count();
    modified <= 1 && owned <= 1 && (modified == 0 || valid == 1)
}
