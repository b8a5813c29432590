// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::io::{Read, Write};

use mio::Token;
use tracing::{debug, warn};

use crate::daemon::MapperKey;

const CLIENT_BUFFER_SIZE: usize = 10240;

/// One connection on the control socket.
pub struct Client {
    pub stream: mio::net::UnixStream,
    pub token: Token,
    /// The mapper (controller) this client addresses; the default mapper
    /// until `Controller:` says otherwise.
    pub mapper: MapperKey,
    /// Tag from the last command, echoed before the reply.
    pub tag: Option<String>,
    /// Marked instead of dropped immediately, so any code path may still
    /// attempt sends (which become no-ops) without liveness checks. Reaped
    /// at the end of the mainloop iteration.
    pub should_be_dropped: bool,
    /// Subscribed to the log stream via `Log.`.
    pub wants_log: bool,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
}

impl Client {
    pub fn new(stream: mio::net::UnixStream, mapper: MapperKey) -> Client {
        Client {
            stream,
            token: Token(usize::MAX),
            mapper,
            tag: None,
            should_be_dropped: false,
            wants_log: false,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
        }
    }

    /// Reads whatever is available and returns the complete lines received.
    /// EOF or a read error marks the client for dropping.
    pub fn read_lines(&mut self) -> Vec<String> {
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    debug!("client hung up");
                    self.should_be_dropped = true;
                    break;
                }
                Ok(n) => {
                    self.rbuf.extend_from_slice(&buf[..n]);
                    if self.rbuf.len() > CLIENT_BUFFER_SIZE {
                        warn!("client sent an overlong line; dropping it");
                        self.should_be_dropped = true;
                        return Vec::new();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("client read failed: {}", e);
                    self.should_be_dropped = true;
                    break;
                }
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.rbuf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.rbuf.drain(..=pos).collect();
            match String::from_utf8(line) {
                Ok(s) => lines.push(s.trim_end_matches(['\n', '\r']).to_owned()),
                Err(_) => warn!("ignoring non-utf8 line from client"),
            }
        }
        lines
    }

    /// Queues a message. The caller includes the newline. Sends to a client
    /// marked for dropping go nowhere.
    pub fn send(&mut self, msg: &str) {
        if self.should_be_dropped {
            return;
        }

        self.wbuf.extend_from_slice(msg.as_bytes());
        self.flush_out();
    }

    pub fn flush_out(&mut self) {
        while !self.wbuf.is_empty() {
            match self.stream.write(&self.wbuf) {
                Ok(0) => {
                    self.should_be_dropped = true;
                    return;
                }
                Ok(n) => {
                    self.wbuf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("client write failed: {}", e);
                    self.should_be_dropped = true;
                    return;
                }
            }
        }
    }
}
