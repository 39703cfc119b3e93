// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Parsers for the lines an engine writes: identification, option
//! declarations, bestmove claims, and search info. All of these are
//! engine-controlled input, so every parser degrades to `None` instead of
//! panicking.

use regex::Regex;

use crate::registry::{EngineOption, OptionKind};

lazy_static! {
    // UCCI omits the `name` keyword from option declarations.
    static ref OPTION_RE: Regex = Regex::new(
        r"^option\s+(?:name\s+)?(.+?)\s+type\s+(check|spin|combo|button|string)(.*)$"
    )
    .unwrap();
    static ref BESTMOVE_RE: Regex =
        Regex::new(r"^bestmove\s+(\S+)(?:\s+ponder\s+(\S+))?").unwrap();
    static ref ID_RE: Regex = Regex::new(r"^id\s+(name|author)\s+(.+)$").unwrap();
    static ref VARIANT_OPTION_RE: Regex = Regex::new(r"(?i)^(uci_|usi_)?variant$").unwrap();
    static ref PONDER_OPTION_RE: Regex = Regex::new(r"(?i)^(uci_|usi_)?ponder$").unwrap();
    static ref FISCHER_OPTION_RE: Regex = Regex::new(r"(?i)^(uci_)?chess960$").unwrap();
}

/// True for the option names that control pondering (`Ponder`,
/// `USI_Ponder`).
pub fn is_ponder_option(name: &str) -> bool {
    PONDER_OPTION_RE.is_match(name)
}

/// True for the combo option whose value set declares the engine's
/// supported variants (`UCI_Variant` and friends).
pub fn is_variant_option(name: &str) -> bool {
    VARIANT_OPTION_RE.is_match(name)
}

/// True for the option that enables Fischer-Random castling rules.
pub fn is_fischer_option(name: &str) -> bool {
    FISCHER_OPTION_RE.is_match(name)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdKind {
    Name,
    Author,
}

pub fn parse_id_line(line: &str) -> Option<(IdKind, &str)> {
    let caps = ID_RE.captures(line)?;
    let kind = match caps.get(1)?.as_str() {
        "name" => IdKind::Name,
        _ => IdKind::Author,
    };
    Some((kind, caps.get(2)?.as_str().trim()))
}

/// Parses an `option name ... type ...` declaration into a typed option.
/// Button options carry no value; check/string carry a default; spin adds
/// min/max bounds; combo adds the allowed value set.
pub fn parse_option_line(line: &str) -> Option<EngineOption> {
    let caps = OPTION_RE.captures(line)?;
    let name = caps.get(1)?.as_str().trim();
    let kind = OptionKind::from_token(caps.get(2)?.as_str())?;
    let rest = caps.get(3).map_or("", |m| m.as_str());

    let mut option = EngineOption::new(name, kind);
    if kind == OptionKind::Button {
        return Some(option);
    }

    // Values may contain spaces, so accumulate tokens until the next
    // keyword rather than taking a single token.
    let mut field: Option<&str> = None;
    let mut value = String::new();
    let mut flush = |option: &mut EngineOption, field: Option<&str>, value: &mut String| {
        let value = std::mem::replace(value, String::new());
        match field {
            Some("default") => {
                // `<empty>` is how some engines spell an empty string default.
                option.default = Some(if value == "<empty>" { String::new() } else { value });
            }
            Some("min") => option.min = value.parse().ok(),
            Some("max") => option.max = value.parse().ok(),
            Some("var") => option.choices.push(value),
            _ => {}
        }
    };

    for token in rest.split_whitespace() {
        match token {
            "default" | "min" | "max" | "var" => {
                flush(&mut option, field, &mut value);
                field = Some(token);
            }
            _ => {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(token);
            }
        }
    }
    flush(&mut option, field, &mut value);

    Some(option)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BestMoveLine {
    pub mv: String,
    pub ponder: Option<String>,
}

pub fn parse_bestmove_line(line: &str) -> Option<BestMoveLine> {
    let caps = BESTMOVE_RE.captures(line.trim())?;
    Some(BestMoveLine {
        mv: caps.get(1)?.as_str().to_owned(),
        ponder: caps.get(2).map(|m| m.as_str().to_owned()),
    })
}

/// One `info ... score ... pv ...` update. Bound-only lines (lowerbound /
/// upperbound) are flagged so callers can skip them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfoUpdate {
    pub multipv: usize,
    pub depth: u32,
    pub seldepth: u32,
    pub mate: bool,
    pub score: i64,
    pub bound: bool,
    pub pv: Vec<String>,
}

/// Parses a search info line. Returns `None` for lines that do not carry
/// both a score and a principal variation.
pub fn parse_info_line(line: &str) -> Option<InfoUpdate> {
    let line = line.trim();
    if !line.starts_with("info") {
        return None;
    }

    let mut update = InfoUpdate {
        multipv: 1,
        depth: 0,
        seldepth: 0,
        mate: false,
        score: 0,
        bound: false,
        pv: Vec::new(),
    };
    let mut saw_score = false;

    let mut tokens = line.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        match token {
            "depth" => update.depth = next_number(&mut tokens)?,
            "seldepth" => update.seldepth = next_number(&mut tokens)?,
            "multipv" => update.multipv = next_number(&mut tokens)?,
            "score" => {
                match tokens.next()? {
                    "cp" => {
                        update.mate = false;
                        update.score = tokens.next()?.parse().ok()?;
                    }
                    "mate" => {
                        update.mate = true;
                        update.score = tokens.next()?.parse().ok()?;
                    }
                    _ => return None,
                }
                saw_score = true;
                if let Some(&bound) = tokens.peek() {
                    if bound == "lowerbound" || bound == "upperbound" {
                        update.bound = true;
                        tokens.next();
                    }
                }
            }
            "pv" => {
                update.pv = tokens.map(str::to_owned).collect();
                break;
            }
            _ => {}
        }
    }

    if !saw_score || update.pv.is_empty() {
        return None;
    }
    Some(update)
}

fn next_number<'a, I, N>(tokens: &mut I) -> Option<N>
where
    I: Iterator<Item = &'a str>,
    N: std::str::FromStr,
{
    tokens.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::{
        is_fischer_option, is_ponder_option, is_variant_option, parse_bestmove_line,
        parse_id_line, parse_info_line, parse_option_line, IdKind,
    };
    use crate::registry::OptionKind;

    #[test]
    fn id_lines() {
        assert_eq!(
            Some((IdKind::Name, "Fairy-Stockfish 14")),
            parse_id_line("id name Fairy-Stockfish 14")
        );
        assert_eq!(
            Some((IdKind::Author, "the Stockfish team")),
            parse_id_line("id author the Stockfish team")
        );
        assert_eq!(None, parse_id_line("info string hello"));
    }

    #[test]
    fn spin_option() {
        let option = parse_option_line("option name Threads type spin default 1 min 1 max 512")
            .unwrap();
        assert_eq!("Threads", option.name);
        assert_eq!(OptionKind::Spin, option.kind);
        assert_eq!(Some("1"), option.default.as_deref());
        assert_eq!(Some(1), option.min);
        assert_eq!(Some(512), option.max);
    }

    #[test]
    fn combo_option_with_spaced_values() {
        let option = parse_option_line(
            "option name UCI_Variant type combo default chess var chess var crazyhouse var king of the hill",
        )
        .unwrap();
        assert_eq!(OptionKind::Combo, option.kind);
        assert_eq!(Some("chess"), option.default.as_deref());
        assert_eq!(
            vec!["chess", "crazyhouse", "king of the hill"],
            option.choices
        );
    }

    #[test]
    fn button_option_carries_no_value() {
        let option = parse_option_line("option name Clear Hash type button").unwrap();
        assert_eq!("Clear Hash", option.name);
        assert_eq!(OptionKind::Button, option.kind);
        assert_eq!(None, option.default);
    }

    #[test]
    fn string_option_empty_default() {
        let option =
            parse_option_line("option name EvalFile type string default <empty>").unwrap();
        assert_eq!(Some(""), option.default.as_deref());
    }

    #[test]
    fn ucci_option_without_name_keyword() {
        let option = parse_option_line("option usemillisec type check default true").unwrap();
        assert_eq!("usemillisec", option.name);
        assert_eq!(OptionKind::Check, option.kind);
    }

    #[test]
    fn option_name_predicates() {
        assert!(is_ponder_option("Ponder"));
        assert!(is_ponder_option("USI_Ponder"));
        assert!(!is_ponder_option("PonderTime"));
        assert!(is_variant_option("UCI_Variant"));
        assert!(is_variant_option("variant"));
        assert!(!is_variant_option("VariantBook"));
        assert!(is_fischer_option("UCI_Chess960"));
        assert!(!is_fischer_option("UCI_Variant"));
    }

    #[test]
    fn bestmove_lines() {
        let parsed = parse_bestmove_line("bestmove e2e4 ponder e7e5").unwrap();
        assert_eq!("e2e4", parsed.mv);
        assert_eq!(Some("e7e5"), parsed.ponder.as_deref());

        let parsed = parse_bestmove_line("bestmove resign").unwrap();
        assert_eq!("resign", parsed.mv);
        assert_eq!(None, parsed.ponder);

        assert_eq!(None, parse_bestmove_line("info depth 1"));
    }

    #[test]
    fn info_line_with_cp_score() {
        let update = parse_info_line(
            "info depth 20 seldepth 32 multipv 2 score cp -35 nodes 12345 pv e7e5 g1f3",
        )
        .unwrap();
        assert_eq!(2, update.multipv);
        assert_eq!(20, update.depth);
        assert_eq!(32, update.seldepth);
        assert!(!update.mate);
        assert_eq!(-35, update.score);
        assert!(!update.bound);
        assert_eq!(vec!["e7e5", "g1f3"], update.pv);
    }

    #[test]
    fn info_line_with_mate_score() {
        let update =
            parse_info_line("info depth 12 score mate -3 pv d8h4 g2g3 h4g3").unwrap();
        assert!(update.mate);
        assert_eq!(-3, update.score);
    }

    #[test]
    fn bound_lines_are_flagged() {
        let update =
            parse_info_line("info depth 9 score cp 51 lowerbound pv e2e4").unwrap();
        assert!(update.bound);
    }

    #[test]
    fn lines_without_score_or_pv_are_skipped() {
        assert_eq!(None, parse_info_line("info depth 5 nodes 100"));
        assert_eq!(None, parse_info_line("info depth 5 score cp 10 nodes 3"));
        assert_eq!(None, parse_info_line("info string NNUE evaluation enabled"));
        assert_eq!(None, parse_info_line("bestmove e2e4"));
    }

    #[test]
    fn missing_multipv_defaults_to_one() {
        let update = parse_info_line("info depth 3 score cp 10 pv e2e4").unwrap();
        assert_eq!(1, update.multipv);
    }
}
