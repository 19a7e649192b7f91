//! Operator key commands read from the terminal.

use rollcall_core::{Command, CommandSource};
use std::io::{BufRead, ErrorKind};
use std::sync::mpsc::{self, Receiver, TryRecvError};

/// Map one line of operator input to a command.
pub fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "s" | "S" => Some(Command::Scan),
        "q" | "Q" => Some(Command::Quit),
        _ => None,
    }
}

/// Line-oriented commands from any reader, delivered without blocking the
/// capture loop. A closed input counts as a quit.
pub struct LineCommands {
    rx: Receiver<String>,
}

impl LineCommands {
    /// Read `reader` on a background thread. Bytes that are not UTF-8 are
    /// replaced rather than ending the input; only EOF or an I/O error does.
    pub fn spawn<R: BufRead + Send + 'static>(mut reader: R) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("rollcall-input".into())
            .spawn(move || {
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&buf).into_owned();
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "operator input failed");
                            break;
                        }
                    }
                }
            })?;
        Ok(Self { rx })
    }

    /// Commands typed on stdin, one per line.
    pub fn stdin() -> std::io::Result<Self> {
        Self::spawn(std::io::BufReader::new(std::io::stdin()))
    }
}

impl CommandSource for LineCommands {
    fn poll(&mut self) -> Option<Command> {
        loop {
            match self.rx.try_recv() {
                Ok(line) => match parse_command(&line) {
                    Some(cmd) => return Some(cmd),
                    None => {
                        tracing::debug!(input = %line, "unrecognised command; use 's' to scan or 'q' to quit");
                    }
                },
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    tracing::info!("input closed");
                    return Some(Command::Quit);
                }
            }
        }
    }
}
