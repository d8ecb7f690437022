//! Listener handoff to a successor process.
//!
//! The running process clears close-on-exec on its listening socket and
//! starts a fresh copy of itself with the descriptor number in
//! `CONVEYOR_LISTEN_FD`. The successor adopts the socket and starts
//! accepting while this process drains. Pending connections in the
//! socket backlog are never dropped because the socket is never closed.

use std::ffi::OsString;
use std::io;
use std::os::fd::RawFd;
use std::process::{Child, Command};

use crate::net::listener::set_inheritable;

/// Environment variable carrying the inherited descriptor number.
pub const LISTEN_FD_ENV: &str = "CONVEYOR_LISTEN_FD";

/// Build the command that starts a successor adopting `fd`.
pub fn successor_command(fd: RawFd) -> io::Result<Command> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .args(successor_args(std::env::args_os().skip(1)))
        .env(LISTEN_FD_ENV, fd.to_string());
    Ok(command)
}

/// Current arguments minus any explicit `--fd`, which would otherwise
/// shadow the descriptor passed through the environment.
fn successor_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    let mut kept = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--fd" {
            args.next();
            continue;
        }
        if arg.to_str().is_some_and(|a| a.starts_with("--fd=")) {
            continue;
        }
        kept.push(arg);
    }
    kept
}

/// Make the listening descriptor inheritable and start the successor.
pub fn spawn_successor(fd: RawFd) -> io::Result<Child> {
    set_inheritable(fd)?;
    successor_command(fd)?.spawn()
}
