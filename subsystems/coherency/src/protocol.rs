//! Coherency protocols.
//!
//! A closed set of strategies sharing one transition contract. Every
//! protocol matches every (state, event) pair exhaustively; states outside a
//! protocol's subset are normalised before use.

use core::fmt;

use crate::state::{BusAction, LineState, SnoopEvent, Transition};

use BusAction::*;
use LineState::*;

/// Selectable coherency protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CoherencyProtocol {
    /// Invalidation based, four states
    #[default]
    Mesi,
    /// MESI plus a dirty shared Owner
    Moesi,
    /// MESI plus a clean Forwarder
    Mesif,
    /// Update based, no Invalid transitions on writes
    Dragon,
    /// Update based with write-through of shared lines
    Firefly,
}

impl CoherencyProtocol {
    /// Every protocol
    pub const ALL: [CoherencyProtocol; 5] = [
        CoherencyProtocol::Mesi,
        CoherencyProtocol::Moesi,
        CoherencyProtocol::Mesif,
        CoherencyProtocol::Dragon,
        CoherencyProtocol::Firefly,
    ];

    /// States this protocol uses
    pub const fn states(self) -> &'static [LineState] {
        match self {
            CoherencyProtocol::Mesi => &[Modified, Exclusive, Shared, Invalid],
            CoherencyProtocol::Moesi => &[Modified, Owned, Exclusive, Shared, Invalid],
            CoherencyProtocol::Mesif => &[Modified, Exclusive, Shared, Invalid, Forward],
            CoherencyProtocol::Dragon => &[Modified, Owned, Exclusive, Shared, Invalid],
            CoherencyProtocol::Firefly => &[Modified, Exclusive, Shared, Invalid],
        }
    }

    /// Is the state part of this protocol?
    pub fn supports(self, state: LineState) -> bool {
        self.states().contains(&state)
    }

    /// Map a foreign state onto the closest one this protocol has
    pub const fn normalize(self, state: LineState) -> LineState {
        match (self, state) {
            (CoherencyProtocol::Mesi | CoherencyProtocol::Firefly, Owned) => Modified,
            (CoherencyProtocol::Mesif, Owned) => Modified,
            (CoherencyProtocol::Mesi | CoherencyProtocol::Moesi, Forward) => Shared,
            (CoherencyProtocol::Dragon | CoherencyProtocol::Firefly, Forward) => Shared,
            (_, s) => s,
        }
    }

    /// Update protocols keep peer copies valid on writes
    pub const fn is_update_based(self) -> bool {
        matches!(self, CoherencyProtocol::Dragon | CoherencyProtocol::Firefly)
    }

    /// Local processor reads the line.
    ///
    /// `shared_elsewhere` tells whether any other domain holds a copy.
    pub fn on_local_read(self, state: LineState, shared_elsewhere: bool) -> Transition {
        let state = self.normalize(state);
        match state {
            Invalid => {
                let next = match (self, shared_elsewhere) {
                    (_, false) => Exclusive,
                    (CoherencyProtocol::Mesif, true) => Forward,
                    (_, true) => Shared,
                };
                Transition::with(next, IssueRead)
            },
            Modified | Owned | Exclusive | Shared | Forward => Transition::silent(state),
        }
    }

    /// Local processor writes the line
    pub fn on_local_write(self, state: LineState, shared_elsewhere: bool) -> Transition {
        let state = self.normalize(state);
        match self {
            CoherencyProtocol::Mesi | CoherencyProtocol::Moesi | CoherencyProtocol::Mesif => {
                match state {
                    Modified => Transition::silent(Modified),
                    Exclusive => Transition::silent(Modified),
                    Shared | Owned | Forward => Transition::with(Modified, IssueUpgrade),
                    Invalid => Transition::with(Modified, IssueReadExclusive),
                }
            },
            CoherencyProtocol::Dragon => match state {
                Modified | Exclusive => Transition::silent(Modified),
                Shared | Owned | Forward => {
                    if shared_elsewhere {
                        Transition::with(Owned, IssueUpdate)
                    } else {
                        Transition::silent(Modified)
                    }
                },
                Invalid => {
                    if shared_elsewhere {
                        Transition::with_two(Owned, IssueRead, IssueUpdate)
                    } else {
                        Transition::with(Modified, IssueRead)
                    }
                },
            },
            CoherencyProtocol::Firefly => match state {
                Modified | Exclusive => Transition::silent(Modified),
                Shared | Owned | Forward => {
                    if shared_elsewhere {
                        Transition::with(Shared, IssueUpdate)
                    } else {
                        Transition::silent(Modified)
                    }
                },
                Invalid => {
                    if shared_elsewhere {
                        Transition::with_two(Shared, IssueRead, IssueUpdate)
                    } else {
                        Transition::with(Modified, IssueRead)
                    }
                },
            },
        }
    }

    /// Another domain's transaction is observed on the bus
    pub fn on_remote_snoop(self, state: LineState, event: SnoopEvent) -> Transition {
        let state = self.normalize(state);
        if state == Invalid {
            return Transition::silent(Invalid);
        }
        match self {
            CoherencyProtocol::Mesi => match event {
                SnoopEvent::BusRead => match state {
                    Modified => Transition::with(Shared, Flush),
                    _ => Transition::silent(Shared),
                },
                SnoopEvent::BusReadExclusive | SnoopEvent::BusUpgrade | SnoopEvent::BusUpdate => {
                    invalidate(state)
                },
            },
            CoherencyProtocol::Moesi => match event {
                SnoopEvent::BusRead => match state {
                    Modified | Owned => Transition::with(Owned, Supply),
                    _ => Transition::silent(Shared),
                },
                SnoopEvent::BusReadExclusive | SnoopEvent::BusUpgrade | SnoopEvent::BusUpdate => {
                    invalidate(state)
                },
            },
            CoherencyProtocol::Mesif => match event {
                SnoopEvent::BusRead => match state {
                    Modified => Transition::with(Shared, Flush),
                    Forward | Exclusive => Transition::with(Shared, Supply),
                    _ => Transition::silent(Shared),
                },
                SnoopEvent::BusReadExclusive => match state {
                    Forward | Exclusive => Transition::with(Invalid, Supply),
                    _ => invalidate(state),
                },
                SnoopEvent::BusUpgrade | SnoopEvent::BusUpdate => invalidate(state),
            },
            CoherencyProtocol::Dragon => match event {
                SnoopEvent::BusRead => match state {
                    Modified | Owned => Transition::with(Owned, Supply),
                    _ => Transition::silent(Shared),
                },
                // The writer becomes owner; every other copy is a clean sharer.
                SnoopEvent::BusUpdate => Transition::silent(Shared),
                SnoopEvent::BusReadExclusive | SnoopEvent::BusUpgrade => invalidate(state),
            },
            CoherencyProtocol::Firefly => match event {
                SnoopEvent::BusRead => match state {
                    Modified => Transition::with(Shared, Flush),
                    _ => Transition::silent(Shared),
                },
                SnoopEvent::BusUpdate => match state {
                    Modified => Transition::with(Shared, Flush),
                    _ => Transition::silent(Shared),
                },
                SnoopEvent::BusReadExclusive | SnoopEvent::BusUpgrade => invalidate(state),
            },
        }
    }
}

#[inline]
fn invalidate(state: LineState) -> Transition {
    if state.is_dirty() {
        Transition::with(Invalid, Flush)
    } else {
        Transition::silent(Invalid)
    }
}

impl fmt::Display for CoherencyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoherencyProtocol::Mesi => "MESI",
            CoherencyProtocol::Moesi => "MOESI",
            CoherencyProtocol::Mesif => "MESIF",
            CoherencyProtocol::Dragon => "Dragon",
            CoherencyProtocol::Firefly => "Firefly",
        };
        f.write_str(name)
    }
}
