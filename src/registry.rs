// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The durable catalogue of configured engines. Descriptors are independent
//! of any running session; a session copies its descriptor on load, so
//! registry edits never retroactively mutate live sessions. The catalogue
//! round-trips to a delimited text blob, one record per engine.

use std::fmt::{self, Display};

use hashbrown::HashMap;

use crate::types::Dialect;

/// The five option types an engine may report during the handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OptionKind {
    Check,
    Spin,
    Combo,
    Button,
    String,
}

impl OptionKind {
    pub fn from_token(token: &str) -> Option<OptionKind> {
        match token {
            "check" => Some(OptionKind::Check),
            "spin" => Some(OptionKind::Spin),
            "combo" => Some(OptionKind::Combo),
            "button" => Some(OptionKind::Button),
            "string" => Some(OptionKind::String),
            _ => None,
        }
    }
}

/// One engine-reported option. The current value is nullable; when present
/// it must satisfy the kind's domain (spin bounds, combo value set).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineOption {
    pub name: String,
    pub kind: OptionKind,
    pub default: Option<String>,
    pub value: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub choices: Vec<String>,
}

impl EngineOption {
    pub fn new(name: &str, kind: OptionKind) -> EngineOption {
        EngineOption {
            name: name.to_owned(),
            kind,
            default: None,
            value: None,
            min: None,
            max: None,
            choices: Vec::new(),
        }
    }

    /// Checks a proposed value against the option's domain.
    pub fn accepts(&self, proposed: &str) -> bool {
        match self.kind {
            OptionKind::Button => false,
            OptionKind::Check => proposed == "true" || proposed == "false",
            OptionKind::Spin => match proposed.parse::<i64>() {
                Ok(n) => {
                    self.min.map_or(true, |min| n >= min) && self.max.map_or(true, |max| n <= max)
                }
                Err(_) => false,
            },
            OptionKind::Combo => self.choices.iter().any(|c| c == proposed),
            OptionKind::String => true,
        }
    }

    /// Sets the current value, enforcing the domain invariant.
    pub fn set_value(&mut self, proposed: &str) -> bool {
        if self.accepts(proposed) {
            self.value = Some(proposed.to_owned());
            true
        } else {
            false
        }
    }

    /// The value to push to the engine: the saved current value when set,
    /// otherwise the engine-reported default.
    pub fn effective(&self) -> Option<&str> {
        self.value.as_deref().or_else(|| self.default.as_deref())
    }
}

/// Identity and launch configuration for one engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineDescriptor {
    pub id: String,
    pub command: String,
    pub workdir: String,
    pub dialect: Dialect,
    pub options: Vec<EngineOption>,
}

impl EngineDescriptor {
    pub fn new(id: &str, command: &str, workdir: &str, dialect: Dialect) -> EngineDescriptor {
        EngineDescriptor {
            id: id.to_owned(),
            command: command.to_owned(),
            workdir: workdir.to_owned(),
            dialect,
            options: Vec::new(),
        }
    }

    pub fn saved_option(&self, name: &str) -> Option<&EngineOption> {
        self.options.iter().find(|o| o.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateId(String),
    UnknownId(String),
    MalformedRecord(usize),
    UnknownDialect(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryError::DuplicateId(id) => write!(f, "duplicate engine id `{}`", id),
            RegistryError::UnknownId(id) => write!(f, "unknown engine id `{}`", id),
            RegistryError::MalformedRecord(line) => write!(f, "malformed record on line {}", line),
            RegistryError::UnknownDialect(d) => write!(f, "unknown dialect `{}`", d),
        }
    }
}

/// In-memory list of descriptors keyed by unique id, preserving insertion
/// order for serialization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineRegistry {
    order: Vec<String>,
    engines: HashMap<String, EngineDescriptor>,
}

impl EngineRegistry {
    pub fn new() -> EngineRegistry {
        EngineRegistry {
            order: Vec::new(),
            engines: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn add(&mut self, descriptor: EngineDescriptor) -> Result<(), RegistryError> {
        if self.engines.contains_key(&descriptor.id) {
            return Err(RegistryError::DuplicateId(descriptor.id));
        }
        self.order.push(descriptor.id.clone());
        self.engines.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    pub fn set(&mut self, descriptor: EngineDescriptor) -> Result<(), RegistryError> {
        if !self.engines.contains_key(&descriptor.id) {
            return Err(RegistryError::UnknownId(descriptor.id));
        }
        self.engines.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<EngineDescriptor, RegistryError> {
        match self.engines.remove(id) {
            Some(descriptor) => {
                self.order.retain(|existing| existing != id);
                Ok(descriptor)
            }
            None => Err(RegistryError::UnknownId(id.to_owned())),
        }
    }

    pub fn get(&self, id: &str) -> Option<&EngineDescriptor> {
        self.engines.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|id| id.as_str())
    }

    /// Serializes the catalogue to the flat blob format: one record per
    /// line, fields separated by `;`, the option list encoded as
    /// comma-separated `name=value` pairs. Only options carrying a current
    /// value are persisted.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for id in &self.order {
            let descriptor = &self.engines[id];
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&escape(&descriptor.id));
            out.push(';');
            out.push_str(&escape(&descriptor.command));
            out.push(';');
            out.push_str(&escape(&descriptor.workdir));
            out.push(';');
            out.push_str(descriptor.dialect.wire_name());
            out.push(';');
            let mut first = true;
            for option in &descriptor.options {
                let value = match option.value {
                    Some(ref value) => value,
                    None => continue,
                };
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&escape(&option.name));
                out.push('=');
                out.push_str(&escape(value));
            }
        }
        out
    }

    /// Parses a blob produced by `serialize`. Restored options carry only a
    /// name and current value (kind `String`); their real types are learned
    /// from the engine at the next handshake and the saved values merged in.
    pub fn deserialize(blob: &str) -> Result<EngineRegistry, RegistryError> {
        let mut registry = EngineRegistry::new();
        for (lineno, record) in blob.lines().enumerate() {
            if record.is_empty() {
                continue;
            }
            let fields = split_escaped(record, ';');
            if fields.len() != 5 {
                return Err(RegistryError::MalformedRecord(lineno + 1));
            }
            let dialect_name = unescape(&fields[3]);
            let dialect = Dialect::from_wire(&dialect_name)
                .ok_or(RegistryError::UnknownDialect(dialect_name))?;
            let mut descriptor = EngineDescriptor::new(
                &unescape(&fields[0]),
                &unescape(&fields[1]),
                &unescape(&fields[2]),
                dialect,
            );
            if !fields[4].is_empty() {
                for pair in split_escaped(&fields[4], ',') {
                    let kv = split_escaped(&pair, '=');
                    if kv.len() != 2 {
                        return Err(RegistryError::MalformedRecord(lineno + 1));
                    }
                    let mut option = EngineOption::new(&unescape(&kv[0]), OptionKind::String);
                    option.value = Some(unescape(&kv[1]));
                    descriptor.options.push(option);
                }
            }
            registry.add(descriptor)?;
        }
        Ok(registry)
    }
}

/// Record separators (`;` `,` `=`), newlines, and the escape character
/// itself are escaped with a backslash on write.
fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' | ';' | ',' | '=' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Splits on an unescaped separator, carrying escape sequences through
/// verbatim. Pieces stay escaped so they can be split again on an inner
/// separator; `unescape` resolves the sequences at the leaf.
fn split_escaped(record: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = record.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push('\\');
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            _ if c == separator => parts.push(std::mem::replace(&mut current, String::new())),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Resolves the escape sequences written by `escape`.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => {}
            },
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{EngineDescriptor, EngineOption, EngineRegistry, OptionKind, RegistryError};
    use crate::types::Dialect;

    fn spin(name: &str, value: i64, min: i64, max: i64) -> EngineOption {
        let mut option = EngineOption::new(name, OptionKind::Spin);
        option.min = Some(min);
        option.max = Some(max);
        option.value = Some(value.to_string());
        option
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let mut registry = EngineRegistry::new();
        registry
            .add(EngineDescriptor::new("sf", "stockfish", "", Dialect::Uci))
            .unwrap();
        assert_eq!(
            Err(RegistryError::DuplicateId("sf".to_owned())),
            registry.add(EngineDescriptor::new("sf", "other", "", Dialect::Uci))
        );
    }

    #[test]
    fn set_requires_existing_id() {
        let mut registry = EngineRegistry::new();
        assert_eq!(
            Err(RegistryError::UnknownId("sf".to_owned())),
            registry.set(EngineDescriptor::new("sf", "stockfish", "", Dialect::Uci))
        );
    }

    #[test]
    fn remove_then_get() {
        let mut registry = EngineRegistry::new();
        registry
            .add(EngineDescriptor::new("sf", "stockfish", "", Dialect::Uci))
            .unwrap();
        assert!(registry.get("sf").is_some());
        registry.remove("sf").unwrap();
        assert!(registry.get("sf").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn spin_domain_enforced() {
        let mut option = spin("Threads", 4, 1, 128);
        assert!(option.set_value("64"));
        assert!(!option.set_value("0"));
        assert!(!option.set_value("129"));
        assert!(!option.set_value("four"));
        assert_eq!(Some("64"), option.effective());
    }

    #[test]
    fn combo_domain_enforced() {
        let mut option = EngineOption::new("UCI_Variant", OptionKind::Combo);
        option.choices = vec!["chess".to_owned(), "crazyhouse".to_owned()];
        assert!(option.set_value("crazyhouse"));
        assert!(!option.set_value("go"));
    }

    #[test]
    fn blob_round_trip() {
        let mut registry = EngineRegistry::new();
        let mut fairy = EngineDescriptor::new(
            "fairy",
            "/opt/engines/fairy-stockfish --largeboards",
            "/opt/engines",
            Dialect::Uci,
        );
        fairy.options.push(spin("Threads", 4, 1, 128));
        fairy.options.push({
            let mut o = EngineOption::new("UCI_Variant", OptionKind::Combo);
            o.choices = vec!["chess".to_owned(), "shogi".to_owned()];
            o.value = Some("shogi".to_owned());
            o
        });
        registry.add(fairy).unwrap();
        registry
            .add(EngineDescriptor::new("elephant", "eleeye.exe", "C:\\engines", Dialect::Ucci))
            .unwrap();

        let blob = registry.serialize();
        let restored = EngineRegistry::deserialize(&blob).unwrap();
        assert_eq!(2, restored.len());
        assert_eq!(
            vec!["fairy", "elephant"],
            restored.ids().collect::<Vec<_>>()
        );

        let fairy = restored.get("fairy").unwrap();
        assert_eq!(Dialect::Uci, fairy.dialect);
        assert_eq!("/opt/engines", fairy.workdir);
        assert_eq!(Some("4"), fairy.saved_option("Threads").unwrap().effective());
        assert_eq!(
            Some("shogi"),
            fairy.saved_option("UCI_Variant").unwrap().effective()
        );

        let elephant = restored.get("elephant").unwrap();
        assert_eq!("C:\\engines", elephant.workdir);
        assert_eq!(Dialect::Ucci, elephant.dialect);
    }

    #[test]
    fn blob_escapes_separators() {
        let mut registry = EngineRegistry::new();
        let mut descriptor = EngineDescriptor::new(
            "odd;id",
            "run --flag=a,b",
            "dir with; semicolon",
            Dialect::Usi,
        );
        let mut option = EngineOption::new("Path=Like,Name", OptionKind::String);
        option.value = Some("a;b,c=d\\e".to_owned());
        descriptor.options.push(option);
        let mut memo = EngineOption::new("Memo", OptionKind::String);
        memo.value = Some("line1\nline2".to_owned());
        descriptor.options.push(memo);
        registry.add(descriptor).unwrap();

        let blob = registry.serialize();
        let restored = EngineRegistry::deserialize(&blob).unwrap();
        let descriptor = restored.get("odd;id").unwrap();
        assert_eq!("run --flag=a,b", descriptor.command);
        assert_eq!(2, descriptor.options.len());
        assert_eq!(
            Some("a;b,c=d\\e"),
            descriptor.saved_option("Path=Like,Name").unwrap().effective()
        );
        assert_eq!(
            Some("line1\nline2"),
            descriptor.saved_option("Memo").unwrap().effective()
        );
    }

    #[test]
    fn options_without_values_are_not_persisted() {
        let mut registry = EngineRegistry::new();
        let mut descriptor = EngineDescriptor::new("sf", "stockfish", "", Dialect::Uci);
        descriptor
            .options
            .push(EngineOption::new("Clear Hash", OptionKind::Button));
        registry.add(descriptor).unwrap();

        let restored = EngineRegistry::deserialize(&registry.serialize()).unwrap();
        assert!(restored.get("sf").unwrap().options.is_empty());
    }

    #[test]
    fn deserialize_rejects_malformed_blobs() {
        assert_eq!(
            Err(RegistryError::MalformedRecord(1)),
            EngineRegistry::deserialize("justone;two")
        );
        assert_eq!(
            Err(RegistryError::UnknownDialect("WINBOARD".to_owned())),
            EngineRegistry::deserialize("id;cmd;;WINBOARD;")
        );
        assert_eq!(
            Err(RegistryError::MalformedRecord(1)),
            EngineRegistry::deserialize("id;cmd;;UCI;novalue")
        );
    }

    #[test]
    fn deserialize_skips_blank_lines() {
        let registry = EngineRegistry::deserialize("\nid;cmd;;UCI;\n\n").unwrap();
        assert_eq!(1, registry.len());
    }
}
