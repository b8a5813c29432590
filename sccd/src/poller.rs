// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::os::fd::RawFd;
use std::time;

use anyhow::bail;
use hashbrown::HashMap;
use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::daemon::{ClientKey, ControllerKey};

/// What a readable token means to the mainloop. The set is closed; dispatch
/// happens with a plain match in `Daemon::run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSource {
    ControlListener,
    Client(ClientKey),
    RemotePad,
    EvdevController(ControllerKey),
    Waker,
}

/// Readiness multiplexer over `mio::Poll`, keyed by token. Each mainloop
/// tick waits up to the scheduler's sleep budget and dispatches whatever
/// became readable. Callbacks run in the mainloop thread with no lock held.
pub struct Poller {
    poll: mio::Poll,
    sources: HashMap<Token, PollSource>,
    fd_tokens: HashMap<RawFd, Token>,
    next_token: usize,
}

impl Poller {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Poller {
            poll: mio::Poll::new()?,
            sources: HashMap::new(),
            fd_tokens: HashMap::new(),
            next_token: 0,
        })
    }

    fn next(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Registers a mio source (socket, listener) for read-readiness.
    pub fn add(
        &mut self,
        source: &mut dyn mio::event::Source,
        what: PollSource,
    ) -> anyhow::Result<Token> {
        let token = self.next();
        self.poll
            .registry()
            .register(source, token, Interest::READABLE)?;
        self.sources.insert(token, what);
        Ok(token)
    }

    /// Registers a raw file descriptor (evdev devices). Registering the same
    /// fd twice is an error.
    pub fn add_fd(&mut self, fd: RawFd, what: PollSource) -> anyhow::Result<Token> {
        if self.fd_tokens.contains_key(&fd) {
            bail!("fd {} is already being monitored", fd);
        }

        let token = self.next();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.sources.insert(token, what);
        self.fd_tokens.insert(fd, token);
        Ok(token)
    }

    pub fn remove(&mut self, source: &mut dyn mio::event::Source, token: Token) {
        let _ = self.poll.registry().deregister(source);
        self.sources.remove(&token);
    }

    pub fn remove_fd(&mut self, fd: RawFd) {
        let Some(token) = self.fd_tokens.remove(&fd) else {
            return;
        };

        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        self.sources.remove(&token);
    }

    pub fn lookup(&self, token: Token) -> Option<PollSource> {
        self.sources.get(&token).copied()
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// A waker other threads (the signal handler) can use to interrupt a
    /// poll in progress.
    pub fn waker(&mut self) -> std::io::Result<mio::Waker> {
        let token = self.next();
        let waker = mio::Waker::new(self.poll.registry(), token)?;
        self.sources.insert(token, PollSource::Waker);
        Ok(waker)
    }

    pub fn poll(
        &mut self,
        events: &mut mio::Events,
        timeout: time::Duration,
    ) -> std::io::Result<()> {
        self.poll.poll(events, Some(timeout))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn duplicate_fd_registration_fails() {
        let mut poller = Poller::new().unwrap();
        let (_a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        poller.add_fd(fd, PollSource::RemotePad).unwrap();
        assert!(poller.add_fd(fd, PollSource::RemotePad).is_err());
    }

    #[test]
    fn readable_fd_reports_its_source() {
        let mut poller = Poller::new().unwrap();
        let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        poller.add_fd(fd, PollSource::RemotePad).unwrap();
        a.write_all(b"x").unwrap();

        let mut events = mio::Events::with_capacity(8);
        poller
            .poll(&mut events, time::Duration::from_millis(500))
            .unwrap();

        let sources: Vec<_> = events
            .iter()
            .filter_map(|e| poller.lookup(e.token()))
            .collect();
        assert_eq!(sources, vec![PollSource::RemotePad]);
    }

    #[test]
    fn removed_fd_can_be_added_again() {
        let mut poller = Poller::new().unwrap();
        let (_a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        poller.add_fd(fd, PollSource::RemotePad).unwrap();
        poller.remove_fd(fd);
        poller.add_fd(fd, PollSource::RemotePad).unwrap();
    }
}
