// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mio-backed readiness host.
//!
//! [`EventLoop`] owns the `mio::Poll`; [`MioHost`] holds a cloned registry and
//! is handed to the engine as its [`ReadinessHost`]. Connection indices travel
//! through `mio::Token` so notifications map straight back to a [`ConnIndex`].

use std::io;

use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Registry, Token};

use super::{Descriptor, EventMask, Interest, ReadinessHost, UserTag};
use crate::conn::ConnIndex;
use crate::error::{Error, Result};
use crate::reliability::Deadline;

/// Default number of events fetched per wait.
const DEFAULT_EVENT_CAPACITY: usize = 128;

fn to_mio(interest: Interest) -> MioInterest {
    match (interest.is_readable(), interest.is_writable()) {
        (_, false) => MioInterest::READABLE,
        (false, true) => MioInterest::WRITABLE,
        (true, true) => MioInterest::READABLE | MioInterest::WRITABLE,
    }
}

fn to_token(index: ConnIndex) -> Token {
    Token(index.to_token() as usize)
}

fn from_token(token: Token) -> ConnIndex {
    ConnIndex::from_token(token.0 as u64)
}

/// [`ReadinessHost`] implementation over a `mio::Registry`.
#[derive(Debug)]
pub struct MioHost {
    registry: Registry,
}

impl MioHost {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

impl ReadinessHost for MioHost {
    fn add(
        &mut self,
        descriptor: Descriptor,
        index: ConnIndex,
        interest: Interest,
        _tag: UserTag,
    ) -> io::Result<()> {
        log::trace!("[POLL] add fd={} index={:?} {:?}", descriptor, index, interest);
        self.registry
            .register(&mut SourceFd(&descriptor), to_token(index), to_mio(interest))
    }

    fn modify(
        &mut self,
        descriptor: Descriptor,
        index: ConnIndex,
        interest: Interest,
        _tag: UserTag,
    ) -> io::Result<()> {
        log::trace!("[POLL] modify fd={} index={:?} {:?}", descriptor, index, interest);
        self.registry
            .reregister(&mut SourceFd(&descriptor), to_token(index), to_mio(interest))
    }

    fn remove(
        &mut self,
        descriptor: Descriptor,
        index: ConnIndex,
        _tag: UserTag,
    ) -> io::Result<()> {
        log::trace!("[POLL] remove fd={} index={:?}", descriptor, index);
        self.registry.deregister(&mut SourceFd(&descriptor))
    }
}

/// Caller-owned poll loop driving one subscriber context.
pub struct EventLoop {
    poll: Poll,
    events: Events,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    /// Create a host sharing this loop's registry.
    pub fn host(&self) -> io::Result<MioHost> {
        Ok(MioHost::new(self.poll.registry().try_clone()?))
    }

    /// Block until readiness or `deadline`.
    ///
    /// Returns `Error::Timeout` when the deadline elapses without events. A
    /// failing wait is returned as `Error::Io` and should end the session.
    pub fn wait(&mut self, deadline: Deadline) -> Result<Vec<(ConnIndex, EventMask)>> {
        match self.poll.poll(&mut self.events, deadline.as_timeout()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        }

        if self.events.is_empty() {
            return Err(Error::Timeout);
        }

        Ok(self
            .events
            .iter()
            .map(|event| {
                let mask = EventMask {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    hangup: event.is_error()
                        || (event.is_read_closed() && event.is_write_closed()),
                };
                (from_token(event.token()), mask)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    #[test]
    fn test_interest_mapping() {
        assert_eq!(to_mio(Interest::READABLE), MioInterest::READABLE);
        assert_eq!(to_mio(Interest::WRITABLE), MioInterest::WRITABLE);
        assert_eq!(
            to_mio(Interest::READABLE.add(Interest::WRITABLE)),
            MioInterest::READABLE | MioInterest::WRITABLE
        );
    }

    #[test]
    fn test_wait_times_out_without_events() {
        let mut event_loop = EventLoop::new().expect("poll");
        let result = event_loop.wait(Deadline::After(Duration::from_millis(1)));
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn test_registered_socket_reports_index() {
        let mut event_loop = EventLoop::new().expect("poll");
        let mut host = event_loop.host().expect("registry clone");

        let receiver = UdpSocket::bind("127.0.0.1:0").expect("bind");
        receiver.set_nonblocking(true).expect("nonblocking");
        let sender = UdpSocket::bind("127.0.0.1:0").expect("bind");

        host.add(
            receiver.as_raw_fd(),
            ConnIndex::Multicast,
            Interest::READABLE,
            UserTag(7),
        )
        .expect("register");

        sender
            .send_to(b"ping", receiver.local_addr().unwrap())
            .expect("send");

        let events = event_loop
            .wait(Deadline::After(Duration::from_secs(2)))
            .expect("event");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, ConnIndex::Multicast);
        assert!(events[0].1.readable);

        host.remove(receiver.as_raw_fd(), ConnIndex::Multicast, UserTag(7))
            .expect("deregister");
    }
}
