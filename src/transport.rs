// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The framed wire format shared by the UI client and the process host.
//! One message per frame; fields are joined by unescaped `|` characters and
//! frames are newline-delimited on the stream, so `\`, `|`, and newlines
//! inside fields are escaped. Messages are decoded exactly once at this
//! boundary into a closed enum; malformed frames produce a `DecodeError`
//! that callers log and drop.

use std::fmt::{self, Display};

use crate::types::{Dialect, SlotColor};

/// Operation names carried by `Message::Error`.
pub const OP_ENGINE_TIMEOUT: &str = "ENGINE_TIMEOUT";
pub const OP_ENGINE_SPAWN: &str = "ENGINE_SPAWN";
pub const OP_ENGINE_CRASH: &str = "ENGINE_CRASH";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Handshake nonce, client to host.
    Connect { code: String },
    /// Handshake complete, client to host.
    ReadyOk,
    /// Spawn (or replace) an engine process under (id, slot).
    LoadEngine {
        id: String,
        slot: SlotColor,
        dialect: Dialect,
        command: String,
        workdir: String,
        timeout_ms: u64,
    },
    /// Graceful shutdown of one engine.
    ExitEngine { id: String, slot: SlotColor },
    /// Forward one line to the engine's stdin.
    PostMessage {
        id: String,
        slot: SlotColor,
        text: String,
    },
    /// Rename a live engine key.
    ChangeId {
        old_id: String,
        slot: SlotColor,
        new_id: String,
    },
    GetEngineList,
    SaveEngineList { blob: String },
    /// Raw process output, host to client.
    EngineStdout {
        id: String,
        slot: SlotColor,
        chunk: String,
    },
    EngineStderr {
        id: String,
        slot: SlotColor,
        chunk: String,
    },
    /// The engine emitted its protocol-ok token while loading.
    EngineReady { id: String, slot: SlotColor },
    IdChanged { id: String, slot: SlotColor },
    /// Load/timeout/crash failure for the named operation.
    Error {
        operation: String,
        id: String,
        slot: SlotColor,
    },
    EngineList { blob: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    EmptyFrame,
    UnknownTag(String),
    WrongFieldCount { tag: String, expected: usize, actual: usize },
    InvalidSlot(String),
    InvalidDialect(String),
    InvalidNumber(String),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::EmptyFrame => write!(f, "empty frame"),
            DecodeError::UnknownTag(tag) => write!(f, "unknown tag `{}`", tag),
            DecodeError::WrongFieldCount {
                tag,
                expected,
                actual,
            } => write!(
                f,
                "tag `{}` expects {} fields, got {}",
                tag, expected, actual
            ),
            DecodeError::InvalidSlot(s) => write!(f, "invalid slot `{}`", s),
            DecodeError::InvalidDialect(s) => write!(f, "invalid dialect `{}`", s),
            DecodeError::InvalidNumber(s) => write!(f, "invalid number `{}`", s),
        }
    }
}

impl Message {
    pub fn encode(&self) -> String {
        let (tag, fields): (&str, Vec<&str>) = match self {
            Message::Connect { code } => ("CONNECT", vec![code]),
            Message::ReadyOk => ("READYOK", vec![]),
            Message::LoadEngine {
                id,
                slot,
                dialect,
                command,
                workdir,
                timeout_ms,
            } => {
                return join_frame(
                    "LOAD_ENGINE",
                    &[
                        id,
                        slot.as_wire(),
                        dialect.wire_name(),
                        command,
                        workdir,
                        &timeout_ms.to_string(),
                    ],
                );
            }
            Message::ExitEngine { id, slot } => ("EXIT_ENGINE", vec![id.as_str(), slot.as_wire()]),
            Message::PostMessage { id, slot, text } => {
                ("POST_MSG", vec![id.as_str(), slot.as_wire(), text.as_str()])
            }
            Message::ChangeId {
                old_id,
                slot,
                new_id,
            } => (
                "CHANGE_ID",
                vec![old_id.as_str(), slot.as_wire(), new_id.as_str()],
            ),
            Message::GetEngineList => ("GET_ENGINE_LIST", vec![]),
            Message::SaveEngineList { blob } => ("SAVE_ENGINE_LIST", vec![blob.as_str()]),
            Message::EngineStdout { id, slot, chunk } => (
                "ENGINE_STDOUT",
                vec![id.as_str(), slot.as_wire(), chunk.as_str()],
            ),
            Message::EngineStderr { id, slot, chunk } => (
                "ENGINE_STDERR",
                vec![id.as_str(), slot.as_wire(), chunk.as_str()],
            ),
            Message::EngineReady { id, slot } => {
                ("ENGINE_READY", vec![id.as_str(), slot.as_wire()])
            }
            Message::IdChanged { id, slot } => ("ID_CHANGED", vec![id.as_str(), slot.as_wire()]),
            Message::Error {
                operation,
                id,
                slot,
            } => (
                "ERROR",
                vec![operation.as_str(), id.as_str(), slot.as_wire()],
            ),
            Message::EngineList { blob } => ("ENGINE_LIST", vec![blob.as_str()]),
        };

        join_frame(tag, &fields)
    }

    pub fn decode(frame: &str) -> Result<Message, DecodeError> {
        let parts = split_frame(frame);
        let (tag, fields) = parts
            .split_first()
            .ok_or(DecodeError::EmptyFrame)?;
        if tag.is_empty() {
            return Err(DecodeError::EmptyFrame);
        }

        let expect = |n: usize| -> Result<(), DecodeError> {
            if fields.len() == n {
                Ok(())
            } else {
                Err(DecodeError::WrongFieldCount {
                    tag: tag.clone(),
                    expected: n,
                    actual: fields.len(),
                })
            }
        };

        let msg = match tag.as_str() {
            "CONNECT" => {
                expect(1)?;
                Message::Connect {
                    code: fields[0].clone(),
                }
            }
            "READYOK" => {
                expect(0)?;
                Message::ReadyOk
            }
            "LOAD_ENGINE" => {
                expect(6)?;
                Message::LoadEngine {
                    id: fields[0].clone(),
                    slot: parse_slot(&fields[1])?,
                    dialect: Dialect::from_wire(&fields[2])
                        .ok_or_else(|| DecodeError::InvalidDialect(fields[2].clone()))?,
                    command: fields[3].clone(),
                    workdir: fields[4].clone(),
                    timeout_ms: fields[5]
                        .parse()
                        .map_err(|_| DecodeError::InvalidNumber(fields[5].clone()))?,
                }
            }
            "EXIT_ENGINE" => {
                expect(2)?;
                Message::ExitEngine {
                    id: fields[0].clone(),
                    slot: parse_slot(&fields[1])?,
                }
            }
            "POST_MSG" => {
                expect(3)?;
                Message::PostMessage {
                    id: fields[0].clone(),
                    slot: parse_slot(&fields[1])?,
                    text: fields[2].clone(),
                }
            }
            "CHANGE_ID" => {
                expect(3)?;
                Message::ChangeId {
                    old_id: fields[0].clone(),
                    slot: parse_slot(&fields[1])?,
                    new_id: fields[2].clone(),
                }
            }
            "GET_ENGINE_LIST" => {
                expect(0)?;
                Message::GetEngineList
            }
            "SAVE_ENGINE_LIST" => {
                expect(1)?;
                Message::SaveEngineList {
                    blob: fields[0].clone(),
                }
            }
            "ENGINE_STDOUT" => {
                expect(3)?;
                Message::EngineStdout {
                    id: fields[0].clone(),
                    slot: parse_slot(&fields[1])?,
                    chunk: fields[2].clone(),
                }
            }
            "ENGINE_STDERR" => {
                expect(3)?;
                Message::EngineStderr {
                    id: fields[0].clone(),
                    slot: parse_slot(&fields[1])?,
                    chunk: fields[2].clone(),
                }
            }
            "ENGINE_READY" => {
                expect(2)?;
                Message::EngineReady {
                    id: fields[0].clone(),
                    slot: parse_slot(&fields[1])?,
                }
            }
            "ID_CHANGED" => {
                expect(2)?;
                Message::IdChanged {
                    id: fields[0].clone(),
                    slot: parse_slot(&fields[1])?,
                }
            }
            "ERROR" => {
                expect(3)?;
                Message::Error {
                    operation: fields[0].clone(),
                    id: fields[1].clone(),
                    slot: parse_slot(&fields[2])?,
                }
            }
            "ENGINE_LIST" => {
                expect(1)?;
                Message::EngineList {
                    blob: fields[0].clone(),
                }
            }
            _ => return Err(DecodeError::UnknownTag(tag.clone())),
        };

        Ok(msg)
    }
}

fn parse_slot(s: &str) -> Result<SlotColor, DecodeError> {
    SlotColor::from_wire(s).ok_or_else(|| DecodeError::InvalidSlot(s.to_owned()))
}

fn join_frame(tag: &str, fields: &[&str]) -> String {
    let mut out = String::from(tag);
    for field in fields {
        out.push('|');
        out.push_str(&escape_field(field));
    }
    out
}

/// Splits a frame on unescaped `|` separators and unescapes each piece. A
/// trailing lone backslash is dropped rather than escaping nothing.
fn split_frame(frame: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = frame.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some(other) => current.push(other),
                None => {}
            },
            '|' => parts.push(std::mem::replace(&mut current, String::new())),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{escape_field, DecodeError, Message};
    use crate::types::{Dialect, SlotColor};

    fn round_trip(msg: Message) {
        let frame = msg.encode();
        assert!(!frame.contains('\n'), "frame must fit one line: {:?}", frame);
        assert_eq!(Ok(msg), Message::decode(&frame));
    }

    #[test]
    fn encodes_expected_frames() {
        let msg = Message::Error {
            operation: "ENGINE_TIMEOUT".to_owned(),
            id: "stockfish".to_owned(),
            slot: SlotColor::White,
        };
        assert_eq!("ERROR|ENGINE_TIMEOUT|stockfish|0", msg.encode());

        let msg = Message::PostMessage {
            id: "sf".to_owned(),
            slot: SlotColor::Analysis,
            text: "go depth 10".to_owned(),
        };
        assert_eq!("POST_MSG|sf|2|go depth 10", msg.encode());
    }

    #[test]
    fn all_tags_round_trip() {
        round_trip(Message::Connect {
            code: "123456".to_owned(),
        });
        round_trip(Message::ReadyOk);
        round_trip(Message::LoadEngine {
            id: "fairy".to_owned(),
            slot: SlotColor::Black,
            dialect: Dialect::Usi,
            command: "/opt/engines/fairy --largeboards".to_owned(),
            workdir: "/opt/engines".to_owned(),
            timeout_ms: 10000,
        });
        round_trip(Message::ExitEngine {
            id: "fairy".to_owned(),
            slot: SlotColor::Black,
        });
        round_trip(Message::PostMessage {
            id: "fairy".to_owned(),
            slot: SlotColor::White,
            text: "isready".to_owned(),
        });
        round_trip(Message::ChangeId {
            old_id: "a".to_owned(),
            slot: SlotColor::White,
            new_id: "b".to_owned(),
        });
        round_trip(Message::GetEngineList);
        round_trip(Message::SaveEngineList {
            blob: "sf;stockfish;;UCI;Threads=4".to_owned(),
        });
        round_trip(Message::EngineStdout {
            id: "sf".to_owned(),
            slot: SlotColor::White,
            chunk: "info depth 1\nbestmove e2e4\n".to_owned(),
        });
        round_trip(Message::EngineStderr {
            id: "sf".to_owned(),
            slot: SlotColor::White,
            chunk: "warning: no book\n".to_owned(),
        });
        round_trip(Message::EngineReady {
            id: "sf".to_owned(),
            slot: SlotColor::White,
        });
        round_trip(Message::IdChanged {
            id: "sf2".to_owned(),
            slot: SlotColor::Black,
        });
        round_trip(Message::EngineList {
            blob: String::new(),
        });
    }

    #[test]
    fn escapes_separator_characters() {
        round_trip(Message::PostMessage {
            id: "we|ird\\name".to_owned(),
            slot: SlotColor::White,
            text: "line one\nline|two\\".to_owned(),
        });
        assert_eq!("a\\|b\\\\c\\nd", escape_field("a|b\\c\nd"));
    }

    #[test]
    fn escaped_pipe_is_literal() {
        let decoded = Message::decode("CONNECT|ab\\|cd").unwrap();
        assert_eq!(
            Message::Connect {
                code: "ab|cd".to_owned()
            },
            decoded
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(
            Err(DecodeError::UnknownTag("NOPE".to_owned())),
            Message::decode("NOPE|x")
        );
        assert_eq!(Err(DecodeError::EmptyFrame), Message::decode(""));
        assert!(matches!(
            Message::decode("EXIT_ENGINE|onlyid"),
            Err(DecodeError::WrongFieldCount { .. })
        ));
        assert_eq!(
            Err(DecodeError::InvalidSlot("9".to_owned())),
            Message::decode("EXIT_ENGINE|sf|9")
        );
        assert_eq!(
            Err(DecodeError::InvalidDialect("XBOARD".to_owned())),
            Message::decode("LOAD_ENGINE|sf|0|XBOARD|cmd||1000")
        );
        assert_eq!(
            Err(DecodeError::InvalidNumber("soon".to_owned())),
            Message::decode("LOAD_ENGINE|sf|0|UCI|cmd||soon")
        );
    }
}
