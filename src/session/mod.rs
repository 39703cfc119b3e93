// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Client-side engine sessions. An `EngineSession` owns the protocol
//! conversation with one engine: it drives the identification handshake,
//! negotiates options, translates every move and FEN through the notation
//! layer, and tracks search state so that late or duplicate `bestmove`
//! lines can never be attributed to the wrong search. The `SessionManager`
//! holds one session per slot and routes transport traffic to them.

mod info;

use std::sync::mpsc::Sender;

use arrayvec::ArrayVec;

use crate::notation;
use crate::registry::{EngineDescriptor, EngineOption, OptionKind};
use crate::transport::{Message, OP_ENGINE_TIMEOUT};
use crate::types::{Dialect, EngineCapabilities, SlotColor, TableIndex, SLOT_COLORS};

use self::info::IdKind;

/// Upper bound on tracked multi-PV lines; engine updates beyond this index
/// are dropped.
pub const MAX_MULTIPV: usize = 8;

/// Lifecycle of one session. `Discarded` is terminal; a discarded session
/// ignores all further traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    Loaded,
    Thinking,
    Discarded,
}

/// An engine's claim about the game outcome, delivered in place of a move.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndClaim {
    Resign,
    Win,
    Lose,
}

/// Notifications a session raises toward the UI. Move text in these events
/// is always canonical notation, never the engine's dialect.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    LoadFinished {
        slot: SlotColor,
        id: String,
    },
    LoadFailed {
        slot: SlotColor,
        id: String,
        reason: String,
    },
    /// The engine loaded but cannot play the current variant.
    NotInUse {
        slot: SlotColor,
        id: String,
    },
    /// The engine answered the `isready` issued after an option batch.
    Synchronized {
        slot: SlotColor,
    },
    BestMove {
        slot: SlotColor,
        mv: String,
        ponder: Option<String>,
    },
    GameEndClaim {
        slot: SlotColor,
        claim: EndClaim,
    },
    /// The engine emitted text the notation layer could not translate.
    InvalidNotation {
        slot: SlotColor,
        text: String,
    },
    /// A raw line of engine output, for transcript display.
    EngineOutput {
        slot: SlotColor,
        text: String,
    },
    /// A refreshed evaluation line, already formatted for display.
    EvaluationUpdate {
        slot: SlotColor,
        text: String,
    },
}

/// One tracked principal variation. Invalid records are placeholders kept
/// so the table stays indexable by multi-PV rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PvRecord {
    pub valid: bool,
    pub mate: bool,
    pub score: i64,
    pub depth: u32,
    pub seldepth: u32,
    pub best: String,
    pub ponder: String,
    pub pv: String,
}

impl PvRecord {
    fn invalid() -> PvRecord {
        PvRecord {
            valid: false,
            mate: false,
            score: 0,
            depth: 0,
            seldepth: 0,
            best: String::new(),
            ponder: String::new(),
            pv: String::new(),
        }
    }
}

/// How long the engine should search.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThinkMode {
    Infinite,
    Depth(u32),
    MoveTime(u64),
    Nodes(u64),
    Clock {
        wtime: u64,
        btime: u64,
        winc: u64,
        binc: u64,
        byoyomi: Option<u64>,
    },
}

/// One search request. `ponder_hit` converts a running ponder search into
/// the real one instead of starting a new search.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThinkParams {
    pub mode: ThinkMode,
    pub ponder: bool,
    pub ponder_hit: bool,
}

impl ThinkParams {
    pub fn new(mode: ThinkMode) -> ThinkParams {
        ThinkParams {
            mode,
            ponder: false,
            ponder_hit: false,
        }
    }
}

/// The board state a session reads when composing `position` commands.
/// Implemented by the hosting UI; sessions never own game state.
pub trait BoardQuery {
    /// Canonical FEN plus the canonical move list played from it.
    fn position(&self) -> (String, String);
    /// Board width and height in squares.
    fn dimensions(&self) -> (u32, u32);
    /// The active variant name, e.g. `chess` or `crazyhouse`.
    fn variant(&self) -> String;
    /// Whether Fischer-Random castling rules are in effect.
    fn fischer_random(&self) -> bool;
}

/// Protocol state machine for one loaded engine.
pub struct EngineSession {
    descriptor: EngineDescriptor,
    slot: SlotColor,
    state: SessionState,
    transport: Sender<Message>,
    events: Sender<SessionEvent>,

    // Partial stdout line carried across chunks, CR/LF normalized.
    stdout_buf: String,
    // Identification lines buffered until the dialect's ok token arrives.
    handshake_buf: Vec<String>,
    awaiting_handshake_ready: bool,
    resync_pending: bool,

    name: String,
    author: String,
    options: Vec<EngineOption>,
    variants: Vec<String>,
    variant_option: Option<String>,
    fischer_option: Option<String>,
    capabilities: EngineCapabilities,
    ponder_enabled: bool,
    in_use: bool,

    width: u32,
    height: u32,

    // Searches issued minus bestmoves received. A bestmove arriving at zero
    // is a protocol violation and is dropped rather than decremented.
    outstanding_bestmoves: u32,
    // True only while the newest search is the one whose bestmove the UI
    // will commit; stale bestmoves from superseded searches are logged and
    // dropped.
    searching_for_move: bool,
    pondering: bool,
    ponder_missed: bool,

    multipv: ArrayVec<[PvRecord; MAX_MULTIPV]>,
}

impl EngineSession {
    pub fn new(
        descriptor: EngineDescriptor,
        slot: SlotColor,
        transport: Sender<Message>,
        events: Sender<SessionEvent>,
    ) -> EngineSession {
        EngineSession {
            descriptor,
            slot,
            state: SessionState::Idle,
            transport,
            events,
            stdout_buf: String::new(),
            handshake_buf: Vec::new(),
            awaiting_handshake_ready: false,
            resync_pending: false,
            name: String::new(),
            author: String::new(),
            options: Vec::new(),
            variants: Vec::new(),
            variant_option: None,
            fischer_option: None,
            capabilities: EngineCapabilities::empty(),
            ponder_enabled: false,
            in_use: false,
            width: 8,
            height: 8,
            outstanding_bestmoves: 0,
            searching_for_move: false,
            pondering: false,
            ponder_missed: false,
            multipv: ArrayVec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn slot(&self) -> SlotColor {
        self.slot
    }

    pub fn dialect(&self) -> Dialect {
        self.descriptor.dialect
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn engine_name(&self) -> &str {
        &self.name
    }

    pub fn engine_author(&self) -> &str {
        &self.author
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    pub fn options(&self) -> &[EngineOption] {
        &self.options
    }

    pub fn variants(&self) -> &[String] {
        &self.variants
    }

    /// The live multi-PV table, rank 1 first. Entries may be invalid
    /// placeholders.
    pub fn principal_variations(&self) -> &[PvRecord] {
        &self.multipv
    }

    fn send(&self, message: Message) {
        if self.transport.send(message).is_err() {
            warn!("session {}/{}: transport channel closed", self.descriptor.id, self.slot);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            warn!("session {}/{}: event channel closed", self.descriptor.id, self.slot);
        }
    }

    fn post(&self, text: &str) {
        trace!("session {}/{} -> engine: {}", self.descriptor.id, self.slot, text);
        self.send(Message::PostMessage {
            id: self.descriptor.id.clone(),
            slot: self.slot,
            text: text.to_owned(),
        });
    }

    /// Asks the host to spawn the engine process and begins the handshake.
    pub fn load(&mut self, timeout_ms: u64) {
        self.state = SessionState::Loading;
        self.stdout_buf.clear();
        self.handshake_buf.clear();
        self.awaiting_handshake_ready = false;
        self.resync_pending = false;
        self.in_use = false;
        self.outstanding_bestmoves = 0;
        self.searching_for_move = false;
        self.pondering = false;
        self.ponder_missed = false;
        self.multipv.clear();
        self.send(Message::LoadEngine {
            id: self.descriptor.id.clone(),
            slot: self.slot,
            dialect: self.descriptor.dialect,
            command: self.descriptor.command.clone(),
            workdir: self.descriptor.workdir.clone(),
            timeout_ms,
        });
    }

    /// Handles one transport message, returning false when the message is
    /// keyed to a different engine.
    pub fn handle_message(&mut self, message: &Message, board: &dyn BoardQuery) -> bool {
        match message {
            Message::EngineStdout { id, slot, chunk } if self.matches(id, *slot) => {
                self.on_stdout(chunk, board);
                true
            }
            Message::EngineStderr { id, slot, chunk } if self.matches(id, *slot) => {
                for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
                    self.emit(SessionEvent::EngineOutput {
                        slot: self.slot,
                        text: line.to_owned(),
                    });
                }
                true
            }
            Message::EngineReady { id, slot } if self.matches(id, *slot) => {
                // The host saw the ok token too; the handshake itself is
                // driven off the stdout stream.
                debug!("host confirmed {}/{} ready", id, slot);
                true
            }
            Message::IdChanged { id, slot } if self.matches(id, *slot) => {
                debug!("host confirmed rename to {}/{}", id, slot);
                true
            }
            Message::Error {
                operation,
                id,
                slot,
            } if self.matches(id, *slot) => {
                self.on_host_error(operation);
                true
            }
            _ => false,
        }
    }

    fn matches(&self, id: &str, slot: SlotColor) -> bool {
        id == self.descriptor.id && slot == self.slot
    }

    fn on_host_error(&mut self, operation: &str) {
        if self.state == SessionState::Discarded {
            return;
        }
        let reason = if operation == OP_ENGINE_TIMEOUT {
            "engine never completed the handshake".to_owned()
        } else {
            format!("engine process failed ({})", operation)
        };
        warn!("session {}/{}: {}", self.descriptor.id, self.slot, reason);
        self.state = SessionState::Idle;
        self.in_use = false;
        self.searching_for_move = false;
        self.pondering = false;
        self.outstanding_bestmoves = 0;
        self.emit(SessionEvent::LoadFailed {
            slot: self.slot,
            id: self.descriptor.id.clone(),
            reason,
        });
    }

    fn on_stdout(&mut self, chunk: &str, board: &dyn BoardQuery) {
        if self.state == SessionState::Discarded {
            return;
        }
        self.stdout_buf.push_str(chunk);
        let normalized = self.stdout_buf.replace("\r\n", "\n").replace('\r', "\n");
        self.stdout_buf = normalized;
        while let Some(pos) = self.stdout_buf.find('\n') {
            let line: String = self.stdout_buf[..pos].to_owned();
            self.stdout_buf.drain(..=pos);
            if !line.trim().is_empty() {
                self.process_line(line.trim_end(), board);
            }
        }
    }

    fn process_line(&mut self, line: &str, board: &dyn BoardQuery) {
        trace!("session {}/{} <- engine: {}", self.descriptor.id, self.slot, line);
        self.emit(SessionEvent::EngineOutput {
            slot: self.slot,
            text: line.to_owned(),
        });

        match self.state {
            SessionState::Loading => self.process_handshake_line(line, board),
            SessionState::Loaded | SessionState::Thinking => {
                if line.starts_with("bestmove") {
                    self.on_bestmove(line);
                } else if line.trim() == "readyok" {
                    if self.resync_pending {
                        self.resync_pending = false;
                        self.emit(SessionEvent::Synchronized { slot: self.slot });
                    }
                } else if line.starts_with("info") {
                    self.on_info(line);
                }
            }
            SessionState::Idle | SessionState::Discarded => {
                debug!("ignoring line outside a live session: {}", line)
            }
        }
    }

    fn process_handshake_line(&mut self, line: &str, board: &dyn BoardQuery) {
        let dialect = self.descriptor.dialect;
        if self.awaiting_handshake_ready {
            if line.trim() == "readyok" {
                self.finish_load(board);
            }
            return;
        }
        if line.trim() == dialect.ok_token() {
            self.parse_identification();
            self.awaiting_handshake_ready = true;
            self.post("isready");
        } else {
            self.handshake_buf.push(line.to_owned());
        }
    }

    /// Digests the buffered identification lines: engine name and author,
    /// option declarations, and the capability flags implied by well-known
    /// option names. Saved values from the descriptor are merged in, saved
    /// value winning over engine default.
    fn parse_identification(&mut self) {
        for line in std::mem::replace(&mut self.handshake_buf, Vec::new()) {
            if let Some((kind, value)) = info::parse_id_line(&line) {
                match kind {
                    IdKind::Name => self.name = value.to_owned(),
                    IdKind::Author => self.author = value.to_owned(),
                }
                continue;
            }
            let mut option = match info::parse_option_line(&line) {
                Some(option) => option,
                None => continue,
            };
            if let Some(saved) = self.descriptor.saved_option(&option.name) {
                if let Some(ref value) = saved.value {
                    if !option.set_value(value) {
                        warn!(
                            "saved value `{}` for option `{}` no longer valid, dropping",
                            value, option.name
                        );
                    }
                }
            }
            if info::is_ponder_option(&option.name) {
                self.capabilities |= EngineCapabilities::PONDER;
                self.ponder_enabled = option.effective() == Some("true");
            }
            if info::is_variant_option(&option.name) && option.kind == OptionKind::Combo {
                self.variant_option = Some(option.name.clone());
                self.variants = option.choices.clone();
            }
            if info::is_fischer_option(&option.name) {
                self.capabilities |= EngineCapabilities::FISCHER_RANDOM;
                self.fischer_option = Some(option.name.clone());
            }
            self.options.push(option);
        }
        info!(
            "engine {}/{} identified as `{}` ({} options)",
            self.descriptor.id,
            self.slot,
            self.name,
            self.options.len()
        );
    }

    /// Completes the load once the engine answers `isready`: gate on the
    /// variant, push configuration, start a new game at the current
    /// position.
    fn finish_load(&mut self, board: &dyn BoardQuery) {
        self.awaiting_handshake_ready = false;
        self.state = SessionState::Loaded;
        let (width, height) = board.dimensions();
        self.width = width;
        self.height = height;

        let variant = board.variant();
        let fischer = board.fischer_random();
        if !self.supports(&variant, fischer) {
            info!(
                "engine {}/{} cannot play variant `{}`, leaving unused",
                self.descriptor.id, self.slot, variant
            );
            self.in_use = false;
            self.emit(SessionEvent::NotInUse {
                slot: self.slot,
                id: self.descriptor.id.clone(),
            });
            return;
        }

        self.in_use = true;
        self.push_variant_selection(&variant, fischer);
        self.push_configured_options();
        self.post(self.descriptor.dialect.new_game_command());
        self.send_position(board);
        self.emit(SessionEvent::LoadFinished {
            slot: self.slot,
            id: self.descriptor.id.clone(),
        });
    }

    /// Whether the engine declared support for the variant and, when asked
    /// for, Fischer-Random rules. Engines with no variant option support
    /// plain chess only.
    fn supports(&self, variant: &str, fischer: bool) -> bool {
        let variant_ok = if self.variants.is_empty() {
            variant == "chess"
        } else {
            self.variants.iter().any(|v| v == variant)
        };
        let fischer_ok = !fischer || self.capabilities.contains(EngineCapabilities::FISCHER_RANDOM);
        variant_ok && fischer_ok
    }

    fn push_variant_selection(&mut self, variant: &str, fischer: bool) {
        if let Some(name) = self.variant_option.clone() {
            if let Some(option) = self.options.iter_mut().find(|o| o.name == name) {
                option.set_value(variant);
            }
            self.post_setoption(&name, variant);
        }
        if let Some(name) = self.fischer_option.clone() {
            let value = if fischer { "true" } else { "false" };
            if let Some(option) = self.options.iter_mut().find(|o| o.name == name) {
                option.set_value(value);
            }
            self.post_setoption(&name, value);
        }
    }

    /// Pushes every option carrying a saved value, excluding the variant
    /// and Fischer selectors (pushed by the dedicated path) and buttons
    /// (only ever sent on explicit request).
    fn push_configured_options(&mut self) {
        let variant_option = self.variant_option.clone();
        let fischer_option = self.fischer_option.clone();
        let pending: Vec<(String, String)> = self
            .options
            .iter()
            .filter(|o| o.kind != OptionKind::Button)
            .filter(|o| Some(&o.name) != variant_option.as_ref())
            .filter(|o| Some(&o.name) != fischer_option.as_ref())
            .filter_map(|o| {
                o.value
                    .as_ref()
                    .map(|value| (o.name.clone(), value.clone()))
            })
            .collect();
        for (name, value) in pending {
            self.post_setoption(&name, &value);
        }
    }

    fn post_setoption(&self, name: &str, value: &str) {
        let text = if self.descriptor.dialect.terse_setoption() {
            format!("setoption {} {}", name, value)
        } else {
            format!("setoption name {} value {}", name, value)
        };
        self.post(&text);
    }

    /// Applies and pushes a batch of option values, then issues `isready`
    /// so the UI learns when the engine has absorbed them.
    pub fn set_options(&mut self, values: &[(String, String)]) {
        if self.state != SessionState::Loaded && self.state != SessionState::Thinking {
            warn!("set_options ignored: {}/{} not loaded", self.descriptor.id, self.slot);
            return;
        }
        for (name, value) in values {
            self.set_option(name, value);
        }
        self.resync_pending = true;
        self.post("isready");
    }

    /// Applies one option value, enforcing the declared domain. Rejected
    /// values are logged and never reach the engine.
    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        let accepted = match self.options.iter_mut().find(|o| o.name == name) {
            Some(option) => option.set_value(value),
            None => {
                warn!("engine {}/{} has no option `{}`", self.descriptor.id, self.slot, name);
                return false;
            }
        };
        if !accepted {
            warn!(
                "value `{}` rejected for option `{}` on {}/{}",
                value, name, self.descriptor.id, self.slot
            );
            return false;
        }
        if info::is_ponder_option(name) {
            self.ponder_enabled = value == "true";
        }
        self.post_setoption(name, value);
        true
    }

    /// Presses a button option.
    pub fn press_button(&mut self, name: &str) -> bool {
        match self.options.iter().find(|o| o.name == name) {
            Some(option) if option.kind == OptionKind::Button => {
                let text = if self.descriptor.dialect.terse_setoption() {
                    format!("setoption {}", name)
                } else {
                    format!("setoption name {}", name)
                };
                self.post(&text);
                true
            }
            _ => {
                warn!("`{}` is not a button option on {}/{}", name, self.descriptor.id, self.slot);
                false
            }
        }
    }

    /// Renames the live engine key, keeping the host's routing table in
    /// step. All subsequent traffic uses the new id.
    pub fn rename(&mut self, new_id: &str) {
        if self.state == SessionState::Idle || self.state == SessionState::Discarded {
            self.descriptor.id = new_id.to_owned();
            return;
        }
        self.send(Message::ChangeId {
            old_id: self.descriptor.id.clone(),
            slot: self.slot,
            new_id: new_id.to_owned(),
        });
        self.descriptor.id = new_id.to_owned();
    }

    /// A snapshot of the descriptor with the negotiated options folded in,
    /// suitable for persisting back to the registry.
    pub fn descriptor_snapshot(&self) -> EngineDescriptor {
        let mut descriptor = self.descriptor.clone();
        descriptor.options = self.options.clone();
        descriptor
    }

    /// Sends the current board position, translated into the engine's
    /// dialect. Returns false when the notation layer rejects the input.
    pub fn set_position(&mut self, board: &dyn BoardQuery) -> bool {
        if !self.in_use
            || (self.state != SessionState::Loaded && self.state != SessionState::Thinking)
        {
            return false;
        }
        if self.state == SessionState::Thinking {
            // The search no longer matches the board; its result must not
            // be committed when it arrives.
            self.searching_for_move = false;
            self.interrupt_search();
        }
        let (width, height) = board.dimensions();
        self.width = width;
        self.height = height;
        self.multipv.clear();
        self.send_position(board)
    }

    fn send_position(&mut self, board: &dyn BoardQuery) -> bool {
        let dialect = self.descriptor.dialect;
        let (fen, moves) = board.position();

        let fen = match notation::convert_fen(&fen, dialect) {
            Some(fen) => fen,
            None => {
                warn!("unconvertible FEN for {}/{}: {}", self.descriptor.id, self.slot, fen);
                self.emit(SessionEvent::InvalidNotation {
                    slot: self.slot,
                    text: fen,
                });
                return false;
            }
        };
        let moves = if moves.trim().is_empty() {
            String::new()
        } else {
            match notation::convert_move_list(&moves, Dialect::Uci, dialect, self.width, self.height)
            {
                Some(moves) => moves,
                None => {
                    warn!(
                        "unconvertible move list for {}/{}: {}",
                        self.descriptor.id, self.slot, moves
                    );
                    self.emit(SessionEvent::InvalidNotation {
                        slot: self.slot,
                        text: moves,
                    });
                    return false;
                }
            }
        };

        let mut command = format!("position {} {}", dialect.position_keyword(), fen);
        if !moves.is_empty() {
            command.push_str(" moves ");
            command.push_str(&moves);
        }
        self.post(&command);
        true
    }

    /// Re-gates the session on a new variant selection. Returns false (and
    /// marks the session unused) when the engine cannot play it.
    pub fn set_variant(&mut self, board: &dyn BoardQuery) -> bool {
        if self.state == SessionState::Idle
            || self.state == SessionState::Loading
            || self.state == SessionState::Discarded
        {
            return false;
        }
        if self.state == SessionState::Thinking {
            self.searching_for_move = false;
            self.interrupt_search();
        }
        let variant = board.variant();
        let fischer = board.fischer_random();
        if !self.supports(&variant, fischer) {
            info!(
                "engine {}/{} cannot play variant `{}`, marking unused",
                self.descriptor.id, self.slot, variant
            );
            self.in_use = false;
            self.emit(SessionEvent::NotInUse {
                slot: self.slot,
                id: self.descriptor.id.clone(),
            });
            return false;
        }
        self.in_use = true;
        self.push_variant_selection(&variant, fischer);
        self.post(self.descriptor.dialect.new_game_command());
        let (width, height) = board.dimensions();
        self.width = width;
        self.height = height;
        self.multipv.clear();
        self.send_position(board)
    }

    /// Starts (or converts) a search. `ponder_hit` requires a live ponder
    /// search; any other mode sends a fresh `go`.
    pub fn start_thinking(&mut self, params: ThinkParams) {
        if !self.in_use
            || (self.state != SessionState::Loaded && self.state != SessionState::Thinking)
        {
            warn!("start_thinking ignored: {}/{} not ready", self.descriptor.id, self.slot);
            return;
        }

        if params.ponder_hit {
            if !self.pondering {
                warn!("ponderhit without a ponder search on {}/{}", self.descriptor.id, self.slot);
                return;
            }
            self.pondering = false;
            self.searching_for_move = true;
            self.post("ponderhit");
            return;
        }

        // A new search supersedes any still-running one; its eventual
        // bestmove is absorbed by the outstanding counter.
        if self.state == SessionState::Thinking {
            self.post("stop");
        }

        self.multipv.clear();
        self.pondering = params.ponder;
        self.ponder_missed = false;
        self.searching_for_move = !params.ponder;
        self.outstanding_bestmoves += 1;
        self.state = SessionState::Thinking;
        let command = self.go_command(&params);
        self.post(&command);
    }

    fn go_command(&self, params: &ThinkParams) -> String {
        let mut command = String::from("go");
        if params.ponder {
            command.push_str(" ponder");
        }
        match params.mode {
            ThinkMode::Infinite => command.push_str(" infinite"),
            ThinkMode::Depth(depth) => command.push_str(&format!(" depth {}", depth)),
            ThinkMode::MoveTime(ms) => command.push_str(&format!(" movetime {}", ms)),
            ThinkMode::Nodes(nodes) => command.push_str(&format!(" nodes {}", nodes)),
            ThinkMode::Clock {
                wtime,
                btime,
                winc,
                binc,
                byoyomi,
            } => match self.descriptor.dialect {
                // USI clocks are black-first and may carry a byoyomi
                // period in place of increments.
                Dialect::Usi => {
                    command.push_str(&format!(" btime {} wtime {}", btime, wtime));
                    match byoyomi {
                        Some(byoyomi) => command.push_str(&format!(" byoyomi {}", byoyomi)),
                        None => command.push_str(&format!(" binc {} winc {}", binc, winc)),
                    }
                }
                // UCCI engines receive only the mover's clock.
                Dialect::Ucci => {
                    let (time, increment) = match self.slot {
                        SlotColor::Black => (btime, binc),
                        _ => (wtime, winc),
                    };
                    command.push_str(&format!(" time {} increment {}", time, increment));
                }
                Dialect::Uci | Dialect::UciCyclone => {
                    command.push_str(&format!(
                        " wtime {} btime {} winc {} binc {}",
                        wtime, btime, winc, binc
                    ));
                }
            },
        }
        command
    }

    /// Stops a running search. A healthy ponder search survives unless
    /// `interrupt_pondering` is set or the game is not clock-driven; a
    /// missed ponder is always stopped.
    pub fn stop_thinking(&mut self, interrupt_pondering: bool, clock_driven: bool) {
        if self.state != SessionState::Thinking {
            return;
        }
        if self.pondering
            && self.ponder_enabled
            && !self.ponder_missed
            && !interrupt_pondering
            && clock_driven
        {
            debug!("leaving {}/{} pondering", self.descriptor.id, self.slot);
            return;
        }
        self.interrupt_search();
    }

    /// Marks the current ponder search as missed: the opponent played a
    /// different move, so its result must be discarded and the search
    /// stopped.
    pub fn note_ponder_miss(&mut self) {
        if !self.pondering {
            return;
        }
        self.ponder_missed = true;
        self.searching_for_move = false;
        self.interrupt_search();
    }

    fn interrupt_search(&mut self) {
        self.post("stop");
        // The engine still owes a bestmove; the counter stays up until it
        // arrives and the state reflects that.
    }

    fn on_bestmove(&mut self, line: &str) {
        if self.outstanding_bestmoves == 0 {
            warn!(
                "unsolicited bestmove from {}/{}: {}",
                self.descriptor.id, self.slot, line
            );
            return;
        }
        self.outstanding_bestmoves -= 1;
        let committing = self.searching_for_move && self.outstanding_bestmoves == 0;
        if self.outstanding_bestmoves == 0 {
            self.state = SessionState::Loaded;
            self.pondering = false;
        }
        if !committing {
            debug!(
                "dropping bestmove from a superseded search on {}/{}",
                self.descriptor.id, self.slot
            );
            return;
        }
        self.searching_for_move = false;

        let parsed = match info::parse_bestmove_line(line) {
            Some(parsed) => parsed,
            None => {
                warn!("malformed bestmove from {}/{}: {}", self.descriptor.id, self.slot, line);
                return;
            }
        };

        match parsed.mv.as_str() {
            "resign" => {
                self.emit(SessionEvent::GameEndClaim {
                    slot: self.slot,
                    claim: EndClaim::Resign,
                });
                return;
            }
            "win" => {
                self.emit(SessionEvent::GameEndClaim {
                    slot: self.slot,
                    claim: EndClaim::Win,
                });
                return;
            }
            "lose" => {
                self.emit(SessionEvent::GameEndClaim {
                    slot: self.slot,
                    claim: EndClaim::Lose,
                });
                return;
            }
            "(none)" | "none" | "0000" => {
                warn!("engine {}/{} claims no move exists", self.descriptor.id, self.slot);
                return;
            }
            _ => {}
        }

        let mv = match self.to_canonical(&parsed.mv) {
            Some(mv) => mv,
            None => {
                warn!(
                    "untranslatable bestmove `{}` from {}/{}",
                    parsed.mv, self.descriptor.id, self.slot
                );
                self.emit(SessionEvent::InvalidNotation {
                    slot: self.slot,
                    text: parsed.mv,
                });
                return;
            }
        };
        let ponder = parsed.ponder.as_deref().and_then(|p| self.to_canonical(p));
        self.emit(SessionEvent::BestMove {
            slot: self.slot,
            mv,
            ponder,
        });
    }

    fn to_canonical(&self, moves: &str) -> Option<String> {
        notation::convert_move_list(
            moves,
            self.descriptor.dialect,
            Dialect::Uci,
            self.width,
            self.height,
        )
    }

    fn on_info(&mut self, line: &str) {
        let update = match info::parse_info_line(line) {
            Some(update) => update,
            None => return,
        };
        // Bound lines are transient search noise, not settled evaluations.
        if update.bound {
            return;
        }
        if update.multipv == 0 || update.multipv > MAX_MULTIPV {
            debug!("discarding multipv rank {} from {}/{}", update.multipv, self.descriptor.id, self.slot);
            return;
        }
        let raw_pv = update.pv.join(" ");
        let pv = match self.to_canonical(&raw_pv) {
            Some(pv) => pv,
            None => {
                // Untranslatable move text must never surface as canonical.
                warn!(
                    "dropping untranslatable pv `{}` from {}/{}",
                    raw_pv, self.descriptor.id, self.slot
                );
                self.emit(SessionEvent::InvalidNotation {
                    slot: self.slot,
                    text: raw_pv,
                });
                return;
            }
        };
        while self.multipv.len() < update.multipv {
            self.multipv.push(PvRecord::invalid());
        }

        let mut canonical_moves = pv.split_whitespace();
        let best = canonical_moves.next().unwrap_or("").to_owned();
        let ponder = canonical_moves.next().unwrap_or("").to_owned();

        let record = PvRecord {
            valid: true,
            mate: update.mate,
            score: update.score,
            depth: update.depth,
            seldepth: update.seldepth,
            best,
            ponder,
            pv: pv.clone(),
        };
        self.multipv[update.multipv - 1] = record;

        let score = if update.mate {
            format!("mate {}", update.score)
        } else {
            format!("cp {}", update.score)
        };
        self.emit(SessionEvent::EvaluationUpdate {
            slot: self.slot,
            text: format!(
                "multipv {} depth {} score {} pv {}",
                update.multipv, update.depth, score, pv
            ),
        });
    }

    /// Retires the session. A best-effort exit is sent to the host; all
    /// further traffic is ignored.
    pub fn discard(&mut self) {
        if self.state == SessionState::Discarded {
            return;
        }
        if self.state != SessionState::Idle {
            self.send(Message::ExitEngine {
                id: self.descriptor.id.clone(),
                slot: self.slot,
            });
        }
        self.state = SessionState::Discarded;
        self.in_use = false;
    }

    /// Marks the session dead without talking to the host, for use when
    /// the transport itself is gone.
    pub fn abandon(&mut self) {
        self.state = SessionState::Discarded;
        self.in_use = false;
    }
}

/// One session per slot, routing inbound transport traffic to whichever
/// session owns the message key.
pub struct SessionManager {
    transport: Sender<Message>,
    events: Sender<SessionEvent>,
    sessions: [Option<EngineSession>; 3],
}

impl SessionManager {
    pub fn new(transport: Sender<Message>, events: Sender<SessionEvent>) -> SessionManager {
        SessionManager {
            transport,
            events,
            sessions: [None, None, None],
        }
    }

    /// Opens the transport conversation with a random handshake nonce.
    pub fn connect(&self) {
        let code: u32 = rand::random::<u32>() % 1_000_000;
        if self
            .transport
            .send(Message::Connect {
                code: format!("{:06}", code),
            })
            .is_err()
        {
            warn!("transport channel closed during connect");
            return;
        }
        let _ = self.transport.send(Message::ReadyOk);
    }

    /// Installs a new session in the slot, discarding any previous one,
    /// and starts loading its engine.
    pub fn assign(&mut self, slot: SlotColor, descriptor: EngineDescriptor, timeout_ms: u64) {
        if let Some(existing) = self.sessions[slot.as_index()].as_mut() {
            existing.discard();
        }
        let mut session = EngineSession::new(
            descriptor,
            slot,
            self.transport.clone(),
            self.events.clone(),
        );
        session.load(timeout_ms);
        self.sessions[slot.as_index()] = Some(session);
    }

    pub fn remove(&mut self, slot: SlotColor) {
        if let Some(session) = self.sessions[slot.as_index()].as_mut() {
            session.discard();
        }
        self.sessions[slot.as_index()] = None;
    }

    pub fn session(&self, slot: SlotColor) -> Option<&EngineSession> {
        self.sessions[slot.as_index()].as_ref()
    }

    pub fn session_mut(&mut self, slot: SlotColor) -> Option<&mut EngineSession> {
        self.sessions[slot.as_index()].as_mut()
    }

    /// Routes one inbound message to the session that owns its key.
    pub fn handle_message(&mut self, message: &Message, board: &dyn BoardQuery) {
        for slot in &SLOT_COLORS {
            if let Some(session) = self.sessions[slot.as_index()].as_mut() {
                if session.handle_message(message, board) {
                    return;
                }
            }
        }
        debug!("no session claimed inbound message: {:?}", message);
    }

    /// Abandons every session after the transport drops; the host reaps
    /// the orphaned processes on its side.
    pub fn on_transport_lost(&mut self) {
        for slot in &SLOT_COLORS {
            if let Some(session) = self.sessions[slot.as_index()].as_mut() {
                session.abandon();
            }
        }
    }
}
