// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The remote process manager. One `ProcessHost` serves one transport
//! connection and owns every engine process spawned for it. Each process
//! gets its own stdout/stderr reader threads so a slow or silent engine
//! never stalls delivery of another engine's output, and a waiter thread
//! enforces the load timeout. Routing back to the client is keyed at send
//! time, so a CHANGE_ID rename applies to messages produced after it.

mod process;

pub use self::process::{spawn_engine, terminate_process_tree};

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ChildStdin;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;

use crate::transport::{Message, OP_ENGINE_CRASH, OP_ENGINE_SPAWN, OP_ENGINE_TIMEOUT};
use crate::types::{Dialect, EngineKey, SlotColor};

/// How long a politely-quit engine gets before the hard kill.
const EXIT_GRACE_MS: u64 = 1500;

/// Lifecycle of one tracked engine process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    NotLoaded,
    Loading,
    Loaded,
    Timeout,
    Crashed,
    Exiting,
}

/// Shared between the process table entry and the threads serving one
/// process. The key lives here so reader threads tag output with the
/// current key even after a rename.
struct ProcTag {
    key: EngineKey,
    state: ProcessState,
}

struct EngineProc {
    tag: Arc<Mutex<ProcTag>>,
    // Lines queue through a channel to a per-process writer thread, so a
    // process that stops draining stdin can never stall the dispatch path
    // for the other engines on the connection.
    stdin: Sender<String>,
    pid: u32,
    dialect: Dialect,
}

#[derive(Clone)]
pub struct ProcessHost {
    procs: Arc<Mutex<HashMap<EngineKey, EngineProc>>>,
    outbound: Sender<Message>,
    registry_path: PathBuf,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessHost {
    pub fn new(outbound: Sender<Message>, registry_path: PathBuf) -> ProcessHost {
        ProcessHost {
            procs: Arc::new(Mutex::new(HashMap::new())),
            outbound,
            registry_path,
        }
    }

    /// Dispatches one decoded client message. Host-to-client tags arriving
    /// here indicate a confused peer and are logged and dropped.
    pub fn handle(&self, msg: Message) {
        match msg {
            Message::LoadEngine {
                id,
                slot,
                dialect,
                command,
                workdir,
                timeout_ms,
            } => self.load(&id, slot, dialect, &command, &workdir, timeout_ms),
            Message::PostMessage { id, slot, text } => self.post(&id, slot, &text),
            Message::ExitEngine { id, slot } => self.exit(&id, slot),
            Message::ChangeId {
                old_id,
                slot,
                new_id,
            } => self.change_id(&old_id, slot, &new_id),
            Message::GetEngineList => self.send_engine_list(),
            Message::SaveEngineList { blob } => self.save_engine_list(&blob),
            // CONNECT is validated before dispatch; READYOK needs no reply.
            Message::Connect { .. } | Message::ReadyOk => {}
            other => warn!("dropping unexpected client message: {:?}", other),
        }
    }

    /// Spawns a process under (id, slot), replacing any existing process
    /// under that key, writes the dialect's initialization token, and starts
    /// the reader and timeout threads.
    pub fn load(
        &self,
        id: &str,
        slot: SlotColor,
        dialect: Dialect,
        command: &str,
        workdir: &str,
        timeout_ms: u64,
    ) {
        let key = EngineKey::new(id, slot);
        if let Some(old) = lock(&self.procs).remove(&key) {
            warn!("load of {} replaces a live process (pid {})", key, old.pid);
            lock(&old.tag).state = ProcessState::NotLoaded;
            terminate_process_tree(old.pid);
        }

        let mut child = match spawn_engine(command, workdir) {
            Ok(child) => child,
            Err(e) => {
                error!("failed to spawn `{}` for {}: {}", command, key, e);
                self.send_error(OP_ENGINE_SPAWN, &key);
                return;
            }
        };
        let pid = child.id();
        info!("spawned {} as pid {} ({})", key, pid, dialect);

        // Stdio handles are piped by spawn_engine, so these always exist.
        let mut stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => return,
        };
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => return,
        };
        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => return,
        };

        if let Err(e) = writeln!(stdin, "{}", dialect.init_token()) {
            error!("failed to write init token to {}: {}", key, e);
            terminate_process_tree(pid);
            self.send_error(OP_ENGINE_SPAWN, &key);
            return;
        }

        let tag = Arc::new(Mutex::new(ProcTag {
            key: key.clone(),
            state: ProcessState::Loading,
        }));
        let (stdin_tx, stdin_rx) = channel();
        lock(&self.procs).insert(
            key.clone(),
            EngineProc {
                tag: tag.clone(),
                stdin: stdin_tx,
                pid,
                dialect,
            },
        );

        Self::spawn_stdin_writer(stdin, stdin_rx, tag.clone());
        self.spawn_stdout_reader(stdout, tag.clone(), dialect);
        self.spawn_stderr_reader(stderr, tag.clone());
        self.spawn_load_timer(tag, pid, timeout_ms);

        // Reap the child once it exits so no zombie lingers.
        thread::Builder::new()
            .name("engine-reaper".to_owned())
            .spawn(move || {
                let _ = child.wait();
            })
            .ok();
    }

    /// Queues one line for the process's stdin; a no-op when the process is
    /// not loaded.
    pub fn post(&self, id: &str, slot: SlotColor, text: &str) {
        let key = EngineKey::new(id, slot);
        let procs = lock(&self.procs);
        let proc = match procs.get(&key) {
            Some(proc) => proc,
            None => {
                debug!("post to unloaded engine {} dropped", key);
                return;
            }
        };
        match lock(&proc.tag).state {
            ProcessState::Loading | ProcessState::Loaded => {}
            state => {
                debug!("post to {} in state {:?} dropped", key, state);
                return;
            }
        }
        if proc.stdin.send(text.to_owned()).is_err() {
            warn!("write to {} failed: stdin writer gone", key);
        }
    }

    /// Requests a graceful shutdown: the dialect quit command now, a hard
    /// kill after the grace period if the process lingers. Idempotent.
    pub fn exit(&self, id: &str, slot: SlotColor) {
        let key = EngineKey::new(id, slot);
        let (tag, pid) = {
            let procs = lock(&self.procs);
            let proc = match procs.get(&key) {
                Some(proc) => proc,
                None => {
                    debug!("exit of unloaded engine {} ignored", key);
                    return;
                }
            };
            {
                let mut tag = lock(&proc.tag);
                if tag.state == ProcessState::Exiting {
                    return;
                }
                tag.state = ProcessState::Exiting;
            }
            let quit = proc.dialect.quit_command();
            if proc.stdin.send(quit.to_owned()).is_err() {
                debug!("quit write to {} failed: stdin writer gone", key);
            }
            (proc.tag.clone(), proc.pid)
        };

        info!("engine {} exiting, grace period {}ms", key, EXIT_GRACE_MS);
        let host = self.clone();
        thread::Builder::new()
            .name(format!("exit-{}", key))
            .spawn(move || {
                thread::sleep(Duration::from_millis(EXIT_GRACE_MS));
                let current_key = lock(&tag).key.clone();
                let mut procs = lock(&host.procs);
                let same = procs
                    .get(&current_key)
                    .map_or(false, |proc| Arc::ptr_eq(&proc.tag, &tag));
                if same {
                    procs.remove(&current_key);
                    terminate_process_tree(pid);
                }
            })
            .ok();
    }

    /// Moves bookkeeping to a new key. Reader threads pick up the rename
    /// through the shared tag, so later output is tagged with the new id.
    pub fn change_id(&self, old_id: &str, slot: SlotColor, new_id: &str) {
        let old_key = EngineKey::new(old_id, slot);
        let new_key = EngineKey::new(new_id, slot);
        let mut procs = lock(&self.procs);
        match procs.remove(&old_key) {
            Some(proc) => {
                lock(&proc.tag).key = new_key.clone();
                procs.insert(new_key.clone(), proc);
                drop(procs);
                info!("renamed engine {} to {}", old_key, new_key);
                self.send(Message::IdChanged {
                    id: new_id.to_owned(),
                    slot,
                });
            }
            None => warn!("rename of unknown engine {} ignored", old_key),
        }
    }

    /// Kills every process owned by this connection. Called on transport
    /// loss; no engine process may outlive its client.
    pub fn shutdown(&self) {
        let procs: Vec<(EngineKey, EngineProc)> = lock(&self.procs).drain().collect();
        if procs.is_empty() {
            return;
        }
        info!("transport lost, killing {} engine process(es)", procs.len());
        for (key, proc) in procs {
            lock(&proc.tag).state = ProcessState::NotLoaded;
            terminate_process_tree(proc.pid);
            debug!("killed {} (pid {})", key, proc.pid);
        }
    }

    /// Current state of a tracked key, for bookkeeping inspection.
    pub fn state(&self, id: &str, slot: SlotColor) -> ProcessState {
        let key = EngineKey::new(id, slot);
        lock(&self.procs)
            .get(&key)
            .map_or(ProcessState::NotLoaded, |proc| lock(&proc.tag).state)
    }

    fn send_engine_list(&self) {
        let blob = fs::read_to_string(&self.registry_path).unwrap_or_default();
        self.send(Message::EngineList { blob });
    }

    fn save_engine_list(&self, blob: &str) {
        if let Err(e) = fs::write(&self.registry_path, blob) {
            error!(
                "failed to save engine list to {}: {}",
                self.registry_path.display(),
                e
            );
        }
    }

    fn send(&self, msg: Message) {
        // A send failure means the client is gone; teardown follows from
        // the connection handler.
        let _ = self.outbound.send(msg);
    }

    fn send_error(&self, operation: &str, key: &EngineKey) {
        self.send(Message::Error {
            operation: operation.to_owned(),
            id: key.id.clone(),
            slot: key.slot,
        });
    }

    /// Owns the child's stdin. The thread ends when the queue disconnects
    /// (the process was dropped from the table) or a write fails, which also
    /// closes the pipe.
    fn spawn_stdin_writer(mut stdin: ChildStdin, rx: Receiver<String>, tag: Arc<Mutex<ProcTag>>) {
        thread::Builder::new()
            .name("engine-stdin".to_owned())
            .spawn(move || {
                for line in rx {
                    if let Err(e) = writeln!(stdin, "{}", line) {
                        let key = lock(&tag).key.clone();
                        warn!("write to {} failed: {}", key, e);
                        break;
                    }
                }
            })
            .ok();
    }

    fn spawn_stdout_reader<R: Read + Send + 'static>(
        &self,
        mut stdout: R,
        tag: Arc<Mutex<ProcTag>>,
        dialect: Dialect,
    ) {
        let host = self.clone();
        thread::Builder::new()
            .name("engine-stdout".to_owned())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                let mut line_buf = String::new();
                loop {
                    let n = match stdout.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();

                    let (key, state) = {
                        let tag = lock(&tag);
                        (tag.key.clone(), tag.state)
                    };
                    host.send(Message::EngineStdout {
                        id: key.id.clone(),
                        slot: key.slot,
                        chunk: chunk.clone(),
                    });

                    // While loading, watch for the protocol-ok token; seeing
                    // it marks the key LOADED and cancels the timeout.
                    if state == ProcessState::Loading {
                        line_buf.push_str(&chunk);
                        let ready = line_buf
                            .split('\n')
                            .map(|line| line.trim_end_matches('\r').trim())
                            .any(|line| line == dialect.ok_token());
                        if ready {
                            lock(&tag).state = ProcessState::Loaded;
                            info!("engine {} is ready ({})", key, dialect.ok_token());
                            host.send(Message::EngineReady {
                                id: key.id,
                                slot: key.slot,
                            });
                            line_buf.clear();
                        } else if let Some(last_newline) = line_buf.rfind('\n') {
                            // Retain only the trailing partial line.
                            line_buf.drain(..=last_newline);
                        }
                    }
                }

                // EOF. An exit we asked for, a timeout kill, or a replace is
                // expected bookkeeping; anything else is a crash.
                let mut tag = lock(&tag);
                match tag.state {
                    ProcessState::Loading | ProcessState::Loaded => {
                        warn!("engine {} exited unexpectedly", tag.key);
                        tag.state = ProcessState::Crashed;
                        let key = tag.key.clone();
                        drop(tag);
                        host.send(Message::Error {
                            operation: OP_ENGINE_CRASH.to_owned(),
                            id: key.id,
                            slot: key.slot,
                        });
                    }
                    _ => {}
                }
            })
            .ok();
    }

    fn spawn_stderr_reader<R: Read + Send + 'static>(&self, mut stderr: R, tag: Arc<Mutex<ProcTag>>) {
        let host = self.clone();
        thread::Builder::new()
            .name("engine-stderr".to_owned())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match stderr.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let key = lock(&tag).key.clone();
                    host.send(Message::EngineStderr {
                        id: key.id,
                        slot: key.slot,
                        chunk: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    });
                }
            })
            .ok();
    }

    /// Firing the timer is a cancellation of the in-flight load: a process
    /// that never signalled readiness, as opposed to one that crashed.
    fn spawn_load_timer(&self, tag: Arc<Mutex<ProcTag>>, pid: u32, timeout_ms: u64) {
        let host = self.clone();
        thread::Builder::new()
            .name("engine-load-timer".to_owned())
            .spawn(move || {
                thread::sleep(Duration::from_millis(timeout_ms));
                let key = {
                    let mut tag = lock(&tag);
                    if tag.state != ProcessState::Loading {
                        return;
                    }
                    tag.state = ProcessState::Timeout;
                    tag.key.clone()
                };
                warn!(
                    "engine {} never signalled readiness within {}ms, killing pid {}",
                    key, timeout_ms, pid
                );
                host.send(Message::Error {
                    operation: OP_ENGINE_TIMEOUT.to_owned(),
                    id: key.id,
                    slot: key.slot,
                });
                terminate_process_tree(pid);
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcessHost, ProcessState};
    use crate::transport::{Message, OP_ENGINE_TIMEOUT};
    use crate::types::{Dialect, SlotColor};
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Duration;

    fn host() -> (ProcessHost, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel();
        (ProcessHost::new(tx, PathBuf::from("/nonexistent/engines.txt")), rx)
    }

    #[test]
    fn post_to_unloaded_engine_is_noop() {
        let (host, _rx) = host();
        host.post("ghost", SlotColor::White, "isready");
        assert_eq!(ProcessState::NotLoaded, host.state("ghost", SlotColor::White));
    }

    #[test]
    fn exit_of_unloaded_engine_is_idempotent() {
        let (host, _rx) = host();
        host.exit("ghost", SlotColor::Black);
        host.exit("ghost", SlotColor::Black);
    }

    #[test]
    fn spawn_failure_surfaces_as_error() {
        let (host, rx) = host();
        host.load(
            "missing",
            SlotColor::White,
            Dialect::Uci,
            "/nonexistent/engine-binary",
            "",
            1000,
        );
        let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            Message::Error {
                operation: "ENGINE_SPAWN".to_owned(),
                id: "missing".to_owned(),
                slot: SlotColor::White,
            },
            msg
        );
        assert_eq!(ProcessState::NotLoaded, host.state("missing", SlotColor::White));
    }

    #[cfg(unix)]
    #[test]
    fn silent_engine_times_out_with_exactly_one_error() {
        let (host, rx) = host();
        // cat never emits a protocol-ok token.
        host.load("quiet", SlotColor::Analysis, Dialect::Uci, "cat", "", 200);

        let mut errors = Vec::new();
        while let Ok(msg) = rx.recv_timeout(Duration::from_millis(1500)) {
            if let Message::Error { .. } = msg {
                errors.push(msg);
            }
        }
        assert_eq!(
            vec![Message::Error {
                operation: OP_ENGINE_TIMEOUT.to_owned(),
                id: "quiet".to_owned(),
                slot: SlotColor::Analysis,
            }],
            errors
        );
        assert_eq!(ProcessState::Timeout, host.state("quiet", SlotColor::Analysis));
    }

    #[cfg(unix)]
    #[test]
    fn ok_token_marks_engine_ready() {
        let (host, rx) = host();
        host.load("echoer", SlotColor::White, Dialect::Uci, "echo uciok", "", 5000);

        let mut saw_stdout = false;
        loop {
            let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            match msg {
                Message::EngineStdout { ref chunk, .. } => {
                    saw_stdout = saw_stdout || chunk.contains("uciok");
                }
                Message::EngineReady { ref id, slot } => {
                    assert_eq!("echoer", id);
                    assert_eq!(SlotColor::White, slot);
                    break;
                }
                other => panic!("unexpected message before ready: {:?}", other),
            }
        }
        assert!(saw_stdout);
    }

    #[cfg(unix)]
    #[test]
    fn posts_to_a_stalled_engine_do_not_block_the_dispatcher() {
        let (host, _rx) = host();
        // sleep never reads stdin, so the OS pipe fills almost immediately;
        // posts must keep returning anyway.
        host.load("sleepy", SlotColor::White, Dialect::Uci, "sleep 60", "", 60_000);
        let line = "setoption name Hash value 16 ".repeat(512);
        let start = std::time::Instant::now();
        for _ in 0..256 {
            host.post("sleepy", SlotColor::White, &line);
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        host.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_discards_all_processes() {
        let (host, _rx) = host();
        host.load("one", SlotColor::White, Dialect::Uci, "cat", "", 60_000);
        host.load("two", SlotColor::Black, Dialect::Uci, "cat", "", 60_000);
        host.shutdown();
        assert_eq!(ProcessState::NotLoaded, host.state("one", SlotColor::White));
        assert_eq!(ProcessState::NotLoaded, host.state("two", SlotColor::Black));
    }
}
