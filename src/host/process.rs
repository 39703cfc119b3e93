// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Platform primitives for engine process management: spawning with piped
//! stdio and forced termination of a whole process tree.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Spawns an engine process with piped stdin/stdout/stderr. When `workdir`
/// is empty the working directory defaults to the directory the command's
/// executable lives in.
pub fn spawn_engine(command: &str, workdir: &str) -> io::Result<Child> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty engine command"))?;

    let mut cmd = Command::new(program);
    cmd.args(parts);
    if let Some(dir) = effective_workdir(program, workdir) {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.spawn()
}

fn effective_workdir(program: &str, workdir: &str) -> Option<PathBuf> {
    if !workdir.is_empty() {
        return Some(PathBuf::from(workdir));
    }
    Path::new(program)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Forcibly kills a process and everything it spawned. Engines are third
/// party binaries that may ignore the polite quit command, so this is the
/// hard kill path of last resort.
#[cfg(windows)]
pub fn terminate_process_tree(pid: u32) {
    let result = Command::new("taskkill")
        .args(&["/PID", &pid.to_string(), "/T", "/F"])
        .output();
    if let Err(e) = result {
        warn!("taskkill of process {} failed: {}", pid, e);
    }
}

#[cfg(not(windows))]
pub fn terminate_process_tree(pid: u32) {
    let result = Command::new("kill").args(&["-9", &pid.to_string()]).output();
    if let Err(e) = result {
        warn!("kill -9 of process {} failed: {}", pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::effective_workdir;
    use std::path::PathBuf;

    #[test]
    fn explicit_workdir_wins() {
        assert_eq!(
            Some(PathBuf::from("/tmp")),
            effective_workdir("/opt/engines/stockfish", "/tmp")
        );
    }

    #[test]
    fn workdir_defaults_to_command_directory() {
        assert_eq!(
            Some(PathBuf::from("/opt/engines")),
            effective_workdir("/opt/engines/stockfish", "")
        );
    }

    #[test]
    fn bare_command_gets_no_workdir() {
        assert_eq!(None, effective_workdir("stockfish", ""));
    }
}
