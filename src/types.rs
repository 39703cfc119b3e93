// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use num_traits::{FromPrimitive, ToPrimitive};
use std::fmt::{self, Display};

// TableIndex is a trait for all types that can serve as an index into a table.
// It is common to use these types as indices into tables, so this trait allows
// any type implementing To and FromPrimitive to be used as table indices.
pub trait TableIndex {
    fn as_index(self) -> usize;
    fn from_index(idx: usize) -> Self;
}

impl<T> TableIndex for T
where
    T: FromPrimitive + ToPrimitive,
{
    fn as_index(self) -> usize {
        self.to_u32().unwrap() as usize
    }

    fn from_index(idx: usize) -> T {
        <T as FromPrimitive>::from_u64(idx as u64).unwrap()
    }
}

/// A logical engine slot. At most one live session exists per slot; the
/// white and black slots play the respective sides while the analysis slot
/// evaluates positions without owning a side to move.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum SlotColor {
    White,
    Black,
    Analysis,
}

pub static SLOT_COLORS: [SlotColor; 3] = [SlotColor::White, SlotColor::Black, SlotColor::Analysis];

impl SlotColor {
    /// The wire form of a slot is its stable integer index.
    pub fn as_wire(self) -> &'static str {
        match self {
            SlotColor::White => "0",
            SlotColor::Black => "1",
            SlotColor::Analysis => "2",
        }
    }

    pub fn from_wire(s: &str) -> Option<SlotColor> {
        match s {
            "0" => Some(SlotColor::White),
            "1" => Some(SlotColor::Black),
            "2" => Some(SlotColor::Analysis),
            _ => None,
        }
    }
}

impl Display for SlotColor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SlotColor::White => "white",
            SlotColor::Black => "black",
            SlotColor::Analysis => "analysis",
        };
        f.write_str(name)
    }
}

/// One of the four wire protocols an engine may speak. UCI is the canonical
/// dialect used by the UI; the others differ in coordinate addressing, move
/// syntax, or FEN convention and are reconciled by the notation module.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum Dialect {
    Uci,
    UciCyclone,
    Usi,
    Ucci,
}

impl Dialect {
    pub fn from_wire(s: &str) -> Option<Dialect> {
        match s {
            "UCI" => Some(Dialect::Uci),
            "UCI_CYCLONE" => Some(Dialect::UciCyclone),
            "USI" => Some(Dialect::Usi),
            "UCCI" => Some(Dialect::Ucci),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Dialect::Uci => "UCI",
            Dialect::UciCyclone => "UCI_CYCLONE",
            Dialect::Usi => "USI",
            Dialect::Ucci => "UCCI",
        }
    }

    /// The token written to a freshly spawned engine to begin the handshake.
    pub fn init_token(self) -> &'static str {
        match self {
            Dialect::Uci | Dialect::UciCyclone => "uci",
            Dialect::Usi => "usi",
            Dialect::Ucci => "ucci",
        }
    }

    /// The line an engine emits once it has finished identifying itself.
    pub fn ok_token(self) -> &'static str {
        match self {
            Dialect::Uci | Dialect::UciCyclone => "uciok",
            Dialect::Usi => "usiok",
            Dialect::Ucci => "ucciok",
        }
    }

    pub fn quit_command(self) -> &'static str {
        "quit"
    }

    pub fn new_game_command(self) -> &'static str {
        match self {
            Dialect::Uci | Dialect::UciCyclone => "ucinewgame",
            Dialect::Usi => "usinewgame",
            Dialect::Ucci => "uccinewgame",
        }
    }

    /// Keyword introducing a full board description in a `position` command.
    pub fn position_keyword(self) -> &'static str {
        match self {
            Dialect::Usi => "sfen",
            _ => "fen",
        }
    }

    /// UCCI omits the `name`/`value` keywords from `setoption`.
    pub fn terse_setoption(self) -> bool {
        self == Dialect::Ucci
    }

    /// Dialects whose FEN convention flips the side to move and run-length
    /// encodes the piece-in-hand section.
    pub fn uses_alternate_fen(self) -> bool {
        match self {
            Dialect::Uci => false,
            Dialect::UciCyclone | Dialect::Usi | Dialect::Ucci => true,
        }
    }

    /// Dialects addressed from the opposite board corner, requiring the
    /// reversed-coordinate remap for move lists.
    pub fn reversed_coordinates(self) -> bool {
        match self {
            Dialect::Usi | Dialect::Ucci => true,
            Dialect::Uci | Dialect::UciCyclone => false,
        }
    }
}

impl Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Identifies one tracked engine instance: the descriptor id plus the slot
/// it occupies. All transport routing is keyed on this pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub id: String,
    pub slot: SlotColor,
}

impl EngineKey {
    pub fn new(id: &str, slot: SlotColor) -> EngineKey {
        EngineKey {
            id: id.to_owned(),
            slot,
        }
    }
}

impl Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.slot)
    }
}

bitflags! {
    /// Capabilities an engine declares during the handshake.
    pub struct EngineCapabilities: u8 {
        const NONE = 0;
        const PONDER = 0b0000_0001;
        const FISCHER_RANDOM = 0b0000_0010;
    }
}

#[cfg(test)]
mod tests {
    use super::{Dialect, SlotColor, TableIndex, SLOT_COLORS};

    #[test]
    fn slot_wire_round_trip() {
        for &slot in &SLOT_COLORS {
            assert_eq!(Some(slot), SlotColor::from_wire(slot.as_wire()));
        }
        assert_eq!(None, SlotColor::from_wire("3"));
    }

    #[test]
    fn slot_table_index() {
        assert_eq!(0, SlotColor::White.as_index());
        assert_eq!(2, SlotColor::Analysis.as_index());
        assert_eq!(SlotColor::Black, SlotColor::from_index(1));
    }

    #[test]
    fn dialect_tokens() {
        assert_eq!(Some(Dialect::UciCyclone), Dialect::from_wire("UCI_CYCLONE"));
        assert_eq!("usi", Dialect::Usi.init_token());
        assert_eq!("ucciok", Dialect::Ucci.ok_token());
        assert_eq!("sfen", Dialect::Usi.position_keyword());
        assert!(Dialect::Ucci.reversed_coordinates());
        assert!(!Dialect::UciCyclone.reversed_coordinates());
        assert!(Dialect::UciCyclone.uses_alternate_fen());
    }
}
