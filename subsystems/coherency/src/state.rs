//! Line states, bus events and transition results.

use arrayvec::ArrayVec;
use core::fmt;

/// Most bus actions a single transition can require
pub const MAX_BUS_ACTIONS: usize = 2;

/// Cache line state.
///
/// Each protocol uses a subset. Update protocols reuse the names: Dragon's
/// Sc/Sm/E/M are `Shared`/`Owned`/`Exclusive`/`Modified`, Firefly's VE/S/D
/// are `Exclusive`/`Shared`/`Modified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LineState {
    /// Dirty, sole copy
    Modified,
    /// Dirty, other shared copies may exist; this cache answers reads
    Owned,
    /// Clean, sole copy
    Exclusive,
    /// Clean or owner-backed copy, others may exist
    Shared,
    /// Not present
    #[default]
    Invalid,
    /// Shared copy designated to answer reads
    Forward,
}

impl LineState {
    /// Short protocol letter
    pub const fn letter(self) -> char {
        match self {
            LineState::Modified => 'M',
            LineState::Owned => 'O',
            LineState::Exclusive => 'E',
            LineState::Shared => 'S',
            LineState::Invalid => 'I',
            LineState::Forward => 'F',
        }
    }

    /// Holds a copy of the line
    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        !matches!(self, LineState::Invalid)
    }

    /// Holds data newer than memory
    #[inline(always)]
    pub const fn is_dirty(self) -> bool {
        matches!(self, LineState::Modified | LineState::Owned)
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Transaction observed on the bus from another domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnoopEvent {
    /// Another domain reads the line
    BusRead,
    /// Another domain reads with intent to modify
    BusReadExclusive,
    /// Another domain upgrades its shared copy
    BusUpgrade,
    /// Another domain broadcasts a write (update protocols)
    BusUpdate,
}

/// Action a transition requires from the cache controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusAction {
    /// Fetch the line for reading
    IssueRead,
    /// Fetch the line for writing, invalidating other copies
    IssueReadExclusive,
    /// Invalidate other copies without fetching
    IssueUpgrade,
    /// Broadcast the written word to other copies
    IssueUpdate,
    /// Write the line back to memory and supply it
    Flush,
    /// Supply the line cache-to-cache
    Supply,
}

impl BusAction {
    /// The snoop peers observe for an issued action; `None` for replies
    pub const fn snoop(self) -> Option<SnoopEvent> {
        match self {
            BusAction::IssueRead => Some(SnoopEvent::BusRead),
            BusAction::IssueReadExclusive => Some(SnoopEvent::BusReadExclusive),
            BusAction::IssueUpgrade => Some(SnoopEvent::BusUpgrade),
            BusAction::IssueUpdate => Some(SnoopEvent::BusUpdate),
            BusAction::Flush | BusAction::Supply => None,
        }
    }
}

/// Result of one protocol step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the event
    pub next: LineState,
    /// Bus actions, in issue order
    pub actions: ArrayVec<BusAction, MAX_BUS_ACTIONS>,
}

impl Transition {
    /// Step with no bus traffic
    #[inline]
    pub fn silent(next: LineState) -> Self {
        Self {
            next,
            actions: ArrayVec::new(),
        }
    }

    /// Step with one bus action
    #[inline]
    pub fn with(next: LineState, action: BusAction) -> Self {
        let mut t = Self::silent(next);
        t.actions.push(action);
        t
    }

    /// Step with two bus actions
    #[inline]
    pub fn with_two(next: LineState, first: BusAction, second: BusAction) -> Self {
        let mut t = Self::with(next, first);
        t.actions.push(second);
        t
    }

    /// Did the step need the bus?
    #[inline]
    pub fn is_hit(&self) -> bool {
        self.actions.is_empty()
    }
}
