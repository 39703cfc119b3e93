// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pure, stateless translation between the canonical UCI notation and the
//! alternate wire dialects, parameterized by board width and height. Every
//! function returns `None` on malformed input; callers must not apply the
//! result in that case.

use crate::types::Dialect;

/// One-letter files cap the supported board span in either dimension.
pub const MAX_BOARD_SPAN: u32 = 26;

/// Converts a canonical FEN-like string into the alternate-dialect form:
/// side to move is flipped, the bracketed piece-in-hand section is
/// run-length encoded, and every other field is copied verbatim.
///
/// The transform assumes one-letter files (width <= 26), which makes it
/// byte-for-byte reversible: the board field is untouched and the hand
/// encoding is unambiguous for piece letters.
pub fn fen_to_alternate_fen(fen: &str) -> Option<String> {
    let fields: Vec<&str> = fen.split_whitespace().collect();
    if fields.len() != 6 && fields.len() != 7 {
        return None;
    }

    let board = convert_board_field(fields[0])?;
    let side = match fields[1] {
        "w" => "b",
        "b" => "w",
        _ => return None,
    };

    let mut out = String::with_capacity(fen.len());
    out.push_str(&board);
    out.push(' ');
    out.push_str(side);
    for field in &fields[2..] {
        out.push(' ');
        out.push_str(field);
    }

    Some(out)
}

/// Converts a canonical FEN into the form expected by `dialect`, which is
/// a verbatim copy unless the dialect uses the alternate convention.
pub fn convert_fen(fen: &str, dialect: Dialect) -> Option<String> {
    if dialect.uses_alternate_fen() {
        fen_to_alternate_fen(fen)
    } else {
        Some(fen.to_owned())
    }
}

fn convert_board_field(board: &str) -> Option<String> {
    let open = board.find('[');
    let close = board.find(']');
    match (open, close) {
        (None, None) => Some(board.to_owned()),
        (Some(open), Some(close)) if open < close => {
            let mut out = String::with_capacity(board.len());
            out.push_str(&board[..open]);
            out.push('[');
            out.push_str(&run_length_encode(&board[open + 1..close]));
            out.push(']');
            out.push_str(&board[close + 1..]);
            Some(out)
        }
        // One bracket without the other, or a close before an open.
        _ => None,
    }
}

/// Encodes repeated characters as `char` + `count` when the count exceeds
/// one; single occurrences stay bare. `QQQN` becomes `Q3N`.
fn run_length_encode(hand: &str) -> String {
    let mut out = String::with_capacity(hand.len());
    let mut chars = hand.chars().peekable();
    while let Some(c) = chars.next() {
        let mut count = 1usize;
        while chars.peek() == Some(&c) {
            chars.next();
            count += 1;
        }
        out.push(c);
        if count > 1 {
            out.push_str(&count.to_string());
        }
    }

    out
}

/// Converts a whitespace-separated move list from one dialect to another for
/// a board of the given dimensions. Returns `None` when any token is
/// malformed, carries a coordinate outside the board, or uses a feature the
/// target dialect cannot express (promotion/demotion/drops under UCCI).
pub fn convert_move_list(
    moves: &str,
    from: Dialect,
    to: Dialect,
    width: u32,
    height: u32,
) -> Option<String> {
    if width == 0 || height == 0 || width > MAX_BOARD_SPAN || height > MAX_BOARD_SPAN {
        return None;
    }
    if !supported_pair(from, to) {
        return None;
    }

    // The remap is self-inverse, so it applies exactly once whenever the two
    // dialects address the board from opposite corners.
    let remap = from.reversed_coordinates() != to.reversed_coordinates();

    let mut out = String::with_capacity(moves.len());
    for token in moves.split_whitespace() {
        let parsed = parse_token(token, from, width, height)?;
        let rendered = render_token(&parsed, to, remap, width, height)?;
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&rendered);
    }

    Some(out)
}

/// Converts a single square between the canonical and reversed addressings.
/// The remap is its own inverse, so it serves both directions.
pub fn convert_square(file: u32, rank: u32, width: u32, height: u32) -> Option<(u32, u32)> {
    if file >= width || rank < 1 || rank > height {
        return None;
    }
    Some((width - 1 - file, height + 1 - rank))
}

fn supported_pair(from: Dialect, to: Dialect) -> bool {
    if from == to {
        return true;
    }
    match (from, to) {
        // Cyclone shares the canonical move syntax.
        (Dialect::Uci, Dialect::UciCyclone) | (Dialect::UciCyclone, Dialect::Uci) => true,
        (Dialect::Uci, Dialect::Usi) | (Dialect::Usi, Dialect::Uci) => true,
        (Dialect::Uci, Dialect::Ucci) | (Dialect::Ucci, Dialect::Uci) => true,
        _ => false,
    }
}

/// A move token decomposed into dialect-independent parts: an optional drop
/// piece, the coordinate run, and optional promotion markers.
struct MoveToken {
    drop_piece: Option<String>,
    squares: Vec<(u32, u32)>,
    promo_mark: Option<char>,
    promo_piece: Option<char>,
}

fn drop_marker(dialect: Dialect) -> Option<char> {
    match dialect {
        Dialect::Uci | Dialect::UciCyclone => Some('@'),
        Dialect::Usi => Some('*'),
        Dialect::Ucci => None,
    }
}

/// USI places the promotion mark at the start of the token; the canonical
/// dialect places it at the end. This asymmetry is the crux of the
/// conversion.
fn mark_leads(dialect: Dialect) -> bool {
    dialect == Dialect::Usi
}

fn parse_token(token: &str, from: Dialect, width: u32, height: u32) -> Option<MoveToken> {
    let mut rest = token;
    let mut promo_mark = None;

    if mark_leads(from) {
        if rest.starts_with('+') || rest.starts_with('-') {
            promo_mark = rest.chars().next();
            rest = &rest[1..];
        }
    } else if rest.ends_with('+') || rest.ends_with('-') {
        promo_mark = rest.chars().last();
        rest = &rest[..rest.len() - 1];
    }

    // A trailing lowercase letter directly after a rank digit names the
    // promotion piece (`e7e8q`).
    let mut promo_piece = None;
    let bytes = rest.as_bytes();
    if bytes.len() >= 2
        && bytes[bytes.len() - 1].is_ascii_lowercase()
        && bytes[bytes.len() - 2].is_ascii_digit()
    {
        promo_piece = rest.chars().last();
        rest = &rest[..rest.len() - 1];
    }

    let mut drop_piece = None;
    if let Some(marker) = drop_marker(from) {
        if let Some(at) = rest.find(marker) {
            if at == 0 {
                return None;
            }
            drop_piece = Some(rest[..at].to_owned());
            rest = &rest[at + 1..];
        }
    }

    let squares = parse_coordinate_run(rest, width, height)?;
    // A drop names exactly one destination; anything else is a from/to pair,
    // possibly with gated squares appended. A single bare square is not a
    // move, even when a stray trailing letter parsed as a promotion piece.
    if drop_piece.is_some() {
        if squares.len() != 1 {
            return None;
        }
    } else if squares.len() < 2 {
        return None;
    }

    Some(MoveToken {
        drop_piece,
        squares,
        promo_mark,
        promo_piece,
    })
}

/// Splits a coordinate run into alternating letter/number groups and
/// validates both counts and bounds. Files are one letter each; ranks may
/// span multiple digits (`a10`).
fn parse_coordinate_run(run: &str, width: u32, height: u32) -> Option<Vec<(u32, u32)>> {
    let mut squares = Vec::new();
    let mut chars = run.chars().peekable();
    while let Some(c) = chars.next() {
        if !c.is_ascii_lowercase() {
            return None;
        }
        let file = c as u32 - 'a' as u32;

        let mut rank = 0u32;
        let mut digits = 0;
        while let Some(&d) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            chars.next();
            rank = rank.checked_mul(10)?.checked_add(d as u32 - '0' as u32)?;
            digits += 1;
        }
        // Unequal letter/number group counts.
        if digits == 0 {
            return None;
        }
        if file >= width || rank < 1 || rank > height {
            return None;
        }
        squares.push((file, rank));
    }

    Some(squares)
}

fn render_token(token: &MoveToken, to: Dialect, remap: bool, width: u32, height: u32) -> Option<String> {
    // UCCI speaks simple two-square moves only: signal failure rather than
    // silently dropping the unsupported suffix.
    if to == Dialect::Ucci
        && (token.promo_mark.is_some() || token.promo_piece.is_some() || token.drop_piece.is_some())
    {
        return None;
    }

    let mut out = String::new();
    if mark_leads(to) {
        if let Some(mark) = token.promo_mark {
            out.push(mark);
        }
    }
    if let Some(ref piece) = token.drop_piece {
        out.push_str(piece);
        out.push(drop_marker(to)?);
    }
    for &(file, rank) in &token.squares {
        let (file, rank) = if remap {
            convert_square(file, rank, width, height)?
        } else {
            (file, rank)
        };
        out.push((b'a' + file as u8) as char);
        out.push_str(&rank.to_string());
    }
    if let Some(piece) = token.promo_piece {
        out.push(piece);
    }
    if !mark_leads(to) {
        if let Some(mark) = token.promo_mark {
            out.push(mark);
        }
    }

    Some(out)
}
