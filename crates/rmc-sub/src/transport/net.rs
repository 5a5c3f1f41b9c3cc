// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network transport: UDP multicast receive socket plus non-blocking TCP
//! backchannel streams.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

use super::{ReadResult, Transport};
use crate::config::{SubscriberConfig, MAX_DATAGRAM_SIZE, STREAM_READ_CHUNK};
use crate::conn::{ConnIndex, SlotId};
use crate::readiness::Descriptor;

/// Socket-backed [`Transport`].
pub struct NetTransport {
    multicast: Option<UdpSocket>,
    multicast_fd: Descriptor,
    group: Ipv4Addr,
    iface: Ipv4Addr,
    streams: HashMap<SlotId, TcpStream>,
    recv_buf: Vec<u8>,
}

impl NetTransport {
    /// Bind the multicast port and join the configured group.
    pub fn new(config: &SubscriberConfig) -> io::Result<Self> {
        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_reuse_address(true)?;
        if config.reuse_port {
            set_reuseport(&socket2)?;
        }
        socket2.set_nonblocking(true)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.multicast_port);
        socket2.bind(&bind_addr.into())?;

        let socket: UdpSocket = socket2.into();
        socket.join_multicast_v4(&config.multicast_group, &config.multicast_iface)?;
        socket.set_multicast_loop_v4(true)?;
        log::debug!(
            "[NET] join_multicast_v4({}) on {} port {}",
            config.multicast_group,
            config.multicast_iface,
            config.multicast_port
        );

        Ok(Self {
            multicast_fd: socket.as_raw_fd(),
            multicast: Some(socket),
            group: config.multicast_group,
            iface: config.multicast_iface,
            streams: HashMap::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    /// Local address of the multicast socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.multicast {
            Some(socket) => socket.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "multicast socket closed")),
        }
    }

    fn read_multicast(&mut self) -> io::Result<ReadResult> {
        let Some(socket) = &self.multicast else {
            return Ok(ReadResult::Closed);
        };
        match socket.recv_from(&mut self.recv_buf) {
            Ok((n, from)) => Ok(ReadResult::Data {
                bytes: self.recv_buf[..n].to_vec(),
                from,
                // Datagram sockets give no cheap backlog hint; keep reading
                // until the socket reports empty.
                more_pending: true,
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadResult::Empty),
            Err(e) => Err(e),
        }
    }

    fn read_stream(&mut self, slot: SlotId) -> io::Result<ReadResult> {
        let Some(stream) = self.streams.get_mut(&slot) else {
            return Ok(ReadResult::Closed);
        };
        let chunk = &mut self.recv_buf[..STREAM_READ_CHUNK];
        match stream.read(chunk) {
            Ok(0) => Ok(ReadResult::Closed),
            Ok(n) => Ok(ReadResult::Data {
                bytes: chunk[..n].to_vec(),
                from: stream.peer_addr()?,
                more_pending: n == chunk.len(),
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadResult::Empty),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadResult::Empty),
            Err(e) => Err(e),
        }
    }
}

impl Transport for NetTransport {
    fn multicast_descriptor(&self) -> Descriptor {
        self.multicast_fd
    }

    fn read(&mut self, index: ConnIndex) -> io::Result<ReadResult> {
        match index {
            ConnIndex::Multicast => self.read_multicast(),
            ConnIndex::Unicast(slot) => self.read_stream(slot),
        }
    }

    fn write(&mut self, slot: SlotId, bytes: &[u8]) -> io::Result<usize> {
        let stream = self
            .streams
            .get_mut(&slot)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no stream for slot"))?;
        match stream.write(bytes) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    fn connect(&mut self, slot: SlotId, addr: SocketAddr) -> io::Result<Descriptor> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let stream: TcpStream = socket.into();
        let fd = stream.as_raw_fd();
        log::debug!("[NET] connecting slot {} to {} (fd={})", slot.index(), addr, fd);
        if let Some(old) = self.streams.insert(slot, stream) {
            let _ = old.shutdown(Shutdown::Both);
        }
        Ok(fd)
    }

    fn close(&mut self, index: ConnIndex) {
        match index {
            ConnIndex::Multicast => {
                if let Some(socket) = self.multicast.take() {
                    if let Err(e) = socket.leave_multicast_v4(&self.group, &self.iface) {
                        log::debug!("[NET] leave_multicast_v4({}) failed: {}", self.group, e);
                    }
                    log::debug!("[NET] multicast socket closed");
                }
            }
            ConnIndex::Unicast(slot) => {
                if let Some(stream) = self.streams.remove(&slot) {
                    let _ = stream.shutdown(Shutdown::Both);
                    log::debug!("[NET] slot {} closed", slot.index());
                }
            }
        }
    }
}

/// Set SO_REUSEPORT so several subscribers on one host can share the port.
fn set_reuseport(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with valid fd, standard socket option, and correctly sized optval pointer
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
