// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Blocking client for the sccd control socket. Commands are tagged, so
//! server push messages (events, log lines, controller lists) arriving
//! between a request and its reply are buffered and handed out through
//! [SccClient::next_event].

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon refused: {0}")]
    CommandFailed(String),
    #[error("connection closed")]
    Disconnected,
}

/// A message pushed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Input from a locked or observed source.
    Input {
        controller: String,
        source: String,
        values: Vec<i32>,
    },
    Log(String),
    CurrentProfile(String),
    Reconfigured,
    Controller {
        id: String,
        kind: String,
        flags: u32,
        description: String,
    },
    ControllerCount(u32),
    /// Anything this library doesn't recognize, verbatim.
    Other(String),
}

fn parse_event(line: &str) -> Event {
    let (kind, rest) = line.split_once(' ').unwrap_or((line, ""));
    match kind {
        "Event:" => {
            let mut it = rest.split_whitespace();
            let (Some(controller), Some(source)) = (it.next(), it.next()) else {
                return Event::Other(line.to_owned());
            };
            Event::Input {
                controller: controller.to_owned(),
                source: source.to_owned(),
                values: it.filter_map(|v| v.parse().ok()).collect(),
            }
        }
        "Log:" => Event::Log(rest.to_owned()),
        "Current" if rest.starts_with("profile: ") => {
            Event::CurrentProfile(rest["profile: ".len()..].to_owned())
        }
        "Reconfigured." => Event::Reconfigured,
        "Controller" if rest.starts_with("Count: ") => {
            match rest["Count: ".len()..].parse() {
                Ok(n) => Event::ControllerCount(n),
                Err(_) => Event::Other(line.to_owned()),
            }
        }
        "Controller:" => {
            let mut it = rest.splitn(4, ' ');
            let (Some(id), Some(kind), Some(flags)) = (it.next(), it.next(), it.next()) else {
                return Event::Other(line.to_owned());
            };
            let Ok(flags) = flags.parse() else {
                return Event::Other(line.to_owned());
            };
            Event::Controller {
                id: id.to_owned(),
                kind: kind.to_owned(),
                flags,
                description: it.next().unwrap_or("").to_owned(),
            }
        }
        _ => Event::Other(line.to_owned()),
    }
}

pub fn default_socket_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("scc").join("daemon.socket"))
}

pub struct SccClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_tag: u32,
    pending: VecDeque<Event>,
}

impl SccClient {
    /// Connects to the daemon at the default socket path.
    pub fn connect() -> Result<SccClient, ClientError> {
        let path = default_socket_path().ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "cannot determine the socket path",
            ))
        })?;
        Self::connect_to(&path)
    }

    pub fn connect_to(path: &Path) -> Result<SccClient, ClientError> {
        Ok(Self::over(UnixStream::connect(path)?))
    }

    /// Wraps an already-connected stream. Useful for tests.
    pub fn over(stream: UnixStream) -> SccClient {
        let writer = stream.try_clone().expect("cloning a unix stream");
        SccClient {
            reader: BufReader::new(stream),
            writer,
            next_tag: 0,
            pending: VecDeque::new(),
        }
    }

    fn read_line(&mut self) -> Result<String, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Disconnected);
        }
        Ok(line.trim_end_matches(['\n', '\r']).to_owned())
    }

    /// Sends one command and blocks until its reply arrives, pumping any
    /// push messages into the event queue in the meantime.
    pub fn request(&mut self, command: &str) -> Result<(), ClientError> {
        self.next_tag += 1;
        let tag = format!("#sccc{}", self.next_tag);
        trace!(tag, command, "request");

        self.writer
            .write_all(format!("{} {}\n", tag, command).as_bytes())?;

        loop {
            let line = self.read_line()?;
            match line.strip_prefix(&tag).and_then(|r| r.strip_prefix(' ')) {
                Some("OK.") => return Ok(()),
                Some(reply) => {
                    let why = reply.strip_prefix("Fail: ").unwrap_or(reply);
                    return Err(ClientError::CommandFailed(why.to_owned()));
                }
                None => self.pending.push_back(parse_event(&line)),
            }
        }
    }

    /// Blocks until the next push message.
    pub fn next_event(&mut self) -> Result<Event, ClientError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }

        let line = self.read_line()?;
        Ok(parse_event(&line))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    fn scripted(script: &'static str) -> SccClient {
        let (local, mut remote) = UnixStream::pair().unwrap();
        std::thread::spawn(move || {
            // Wait for a request line, then play the script.
            use std::io::BufRead;
            let mut reader = BufReader::new(remote.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();

            let tag = line.split_whitespace().next().unwrap().to_owned();
            let script = script.replace("{tag}", &tag);
            remote.write_all(script.as_bytes()).unwrap();
        });
        SccClient::over(local)
    }

    #[test]
    fn request_reads_tagged_replies() {
        let mut client = scripted("{tag} OK.\n");
        client.request("Rescan.").unwrap();
    }

    #[test]
    fn failures_carry_the_reason() {
        let mut client = scripted("{tag} Fail: Cannot lock A\n");
        match client.request("Lock: A") {
            Err(ClientError::CommandFailed(why)) => assert_eq!(why, "Cannot lock A"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn push_messages_are_buffered_during_requests() {
        let mut client = scripted("Event: sc1 A 1\nLog: hello\n{tag} OK.\n");
        client.request("Lock: A").unwrap();

        assert_eq!(
            client.next_event().unwrap(),
            Event::Input {
                controller: "sc1".to_owned(),
                source: "A".to_owned(),
                values: vec![1],
            }
        );
        assert_eq!(client.next_event().unwrap(), Event::Log("hello".to_owned()));
    }

    #[test]
    fn parses_push_message_shapes() {
        assert_eq!(
            parse_event("Event: sc1 LPAD 100 -200"),
            Event::Input {
                controller: "sc1".to_owned(),
                source: "LPAD".to_owned(),
                values: vec![100, -200],
            }
        );
        assert_eq!(
            parse_event("Current profile: Desktop"),
            Event::CurrentProfile("Desktop".to_owned())
        );
        assert_eq!(parse_event("Reconfigured."), Event::Reconfigured);
        assert_eq!(parse_event("Controller Count: 2"), Event::ControllerCount(2));
        assert_eq!(
            parse_event("Controller: sc123 sc 0 <SCByCable 123>"),
            Event::Controller {
                id: "sc123".to_owned(),
                kind: "sc".to_owned(),
                flags: 0,
                description: "<SCByCable 123>".to_owned(),
            }
        );
        assert_eq!(
            parse_event("Gibberish"),
            Event::Other("Gibberish".to_owned())
        );
    }
}
