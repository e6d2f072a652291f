//! Dual-stack UDP channel: one bound socket per address family plus
//! its statistics counters.
//!
//! A channel owns its socket for the whole process lifetime. Sockets
//! are created with socket2 (address reuse, buffer sizes, outgoing
//! TTL/Hop-Limit, v6-only), then the per-packet TTL/Hop-Limit is
//! requested as ancillary control data via IP_RECVTTL or
//! IPV6_RECVHOPLIMIT, and the socket is handed to tokio for readiness
//! notifications. Receives run inside the socket's `try_io` hook so a
//! would-block result clears tokio's cached readiness; the recvmsg
//! call and the control-message walk go through libc directly, since
//! nix 0.29 exposes no receive-side TTL/Hop-Limit variants.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UdpSocket;

use crate::configuration::SocketOptions;
use crate::payload::{self, MessageType, PayloadError, ProbePayload, PAYLOAD_SIZE};

/// Address family of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFamily {
    Ipv4,
    Ipv6,
}

impl ChannelFamily {
    /// The payload `ip_version` value for targets this channel serves.
    pub fn ip_version(self) -> u8 {
        match self {
            ChannelFamily::Ipv4 => 4,
            ChannelFamily::Ipv6 => 6,
        }
    }

    fn wildcard(self, port: u16) -> SocketAddr {
        match self {
            ChannelFamily::Ipv4 => (Ipv4Addr::UNSPECIFIED, port).into(),
            ChannelFamily::Ipv6 => (Ipv6Addr::UNSPECIFIED, port).into(),
        }
    }
}

impl std::fmt::Display for ChannelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            ChannelFamily::Ipv4 => write!(f, "IPv4"),
            ChannelFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Channel operation errors.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Socket creation, option or bind failure. Fatal at startup.
    #[error("socket setup failed: {0}")]
    Setup(#[from] std::io::Error),

    /// A send system call failed.
    #[error("send failed: {0}")]
    Send(std::io::Error),

    /// The kernel accepted fewer bytes than the payload size.
    #[error("short send: {sent} of {expected} bytes")]
    ShortSend { sent: usize, expected: usize },

    /// A receive system call failed.
    #[error("receive failed: {0}")]
    Receive(std::io::Error),

    /// The datagram did not fit the receive buffer.
    #[error("datagram truncated")]
    Truncated,

    /// No datagram was pending after a readiness notification.
    /// Not an error condition and never counted.
    #[error("receive would block")]
    WouldBlock,

    /// The datagram failed payload validation.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Per-channel statistics. Each counter is mutated only by the unit
/// owning the channel, so plain integers suffice; they reset only at
/// channel creation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelCounters {
    pub received_total: u64,
    pub recv_network_errors: u64,
    pub recv_size_errors: u64,
    pub recv_magic_errors: u64,
    pub recv_version_errors: u64,
    pub recv_type_errors: u64,
    pub sent_total: u64,
    pub send_network_errors: u64,
}

impl std::fmt::Display for ChannelCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "received={} recv_errors(network={} size={} magic={} version={} type={}) sent={} send_errors={}",
            self.received_total,
            self.recv_network_errors,
            self.recv_size_errors,
            self.recv_magic_errors,
            self.recv_version_errors,
            self.recv_type_errors,
            self.sent_total,
            self.send_network_errors,
        )
    }
}

/// One bound UDP socket plus its counters.
pub struct Channel {
    name: String,
    family: ChannelFamily,
    socket: UdpSocket,
    /// Owned and mutated exclusively by the channel's owning unit.
    pub counters: ChannelCounters,
}

impl Channel {
    /// Creates and binds a channel on the wildcard address.
    ///
    /// Applies address reuse, buffer sizes and the outgoing
    /// TTL/Hop-Limit, requests per-packet TTL via ancillary data, and
    /// disables IPv4-mapped traffic on IPv6 sockets.
    ///
    /// # Errors
    /// Any socket-level failure here is a setup error and fatal to the
    /// caller.
    pub fn open(family: ChannelFamily, options: &SocketOptions) -> Result<Self, ChannelError> {
        let domain = match family {
            ChannelFamily::Ipv4 => Domain::IPV4,
            ChannelFamily::Ipv6 => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(options.recv_buffer)?;
        socket.set_send_buffer_size(options.send_buffer)?;

        match family {
            ChannelFamily::Ipv4 => socket.set_ttl(options.ttl as u32)?,
            ChannelFamily::Ipv6 => {
                socket.set_only_v6(true)?;
                socket.set_unicast_hops_v6(options.ttl as u32)?;
            }
        }

        socket.bind(&family.wildcard(options.port).into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        request_recv_ttl(&std_socket, family)?;

        let socket = UdpSocket::from_std(std_socket)?;
        let name = format!("{} channel", family);
        log::debug!("{} bound to {}", name, socket.local_addr()?);

        Ok(Channel {
            name,
            family,
            socket,
            counters: ChannelCounters::default(),
        })
    }

    pub fn family(&self) -> ChannelFamily {
        self.family
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The OS-assigned local port; meaningful after a port-0 bind.
    pub fn assigned_port(&self) -> Result<u16, ChannelError> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Waits until the socket is ready for a receive attempt.
    pub async fn readable(&self) -> std::io::Result<()> {
        self.socket.readable().await
    }

    /// Encodes and sends one payload. Short or failed sends increment
    /// the send error counter; the caller decides whether that is
    /// fatal.
    pub async fn send(
        &mut self,
        payload: &ProbePayload,
        destination: SocketAddr,
    ) -> Result<(), ChannelError> {
        let buf = payload.to_bytes();
        match self.socket.send_to(&buf, destination).await {
            Ok(n) if n == buf.len() => {
                self.counters.sent_total += 1;
                Ok(())
            }
            Ok(n) => {
                self.counters.send_network_errors += 1;
                Err(ChannelError::ShortSend {
                    sent: n,
                    expected: buf.len(),
                })
            }
            Err(e) => {
                self.counters.send_network_errors += 1;
                Err(ChannelError::Send(e))
            }
        }
    }

    /// Receives one datagram without blocking, extracts the observed
    /// TTL/Hop-Limit from ancillary data (0 if unavailable), and
    /// validates it against `expected`.
    ///
    /// The receive goes through `try_io`, so an empty socket both
    /// returns `WouldBlock` and clears the readiness the caller
    /// observed; the next `readable()` blocks until a new datagram
    /// arrives.
    ///
    /// Every failure mode increments exactly one counter:
    /// network, size (truncation or length mismatch), magic, version
    /// or type. `WouldBlock` is the no-datagram case and counts
    /// nothing.
    pub fn receive(
        &mut self,
        expected: MessageType,
    ) -> Result<(ProbePayload, SocketAddr, u8), ChannelError> {
        // Room for one oversized datagram so truncation is detectable.
        let mut buf = [0u8; PAYLOAD_SIZE * 2];
        let fd = self.socket.as_raw_fd();

        let datagram = match self
            .socket
            .try_io(Interest::READABLE, || recv_datagram(fd, &mut buf))
        {
            Ok(datagram) => datagram,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(ChannelError::WouldBlock)
            }
            Err(e) => {
                self.counters.recv_network_errors += 1;
                return Err(ChannelError::Receive(e));
            }
        };

        let peer = match datagram.peer {
            Some(addr) => addr,
            None => {
                self.counters.recv_network_errors += 1;
                return Err(ChannelError::Receive(io::ErrorKind::InvalidData.into()));
            }
        };

        if datagram.truncated {
            self.counters.recv_size_errors += 1;
            return Err(ChannelError::Truncated);
        }

        match payload::verify(&buf[..datagram.len], expected) {
            Ok(payload) => {
                self.counters.received_total += 1;
                Ok((payload, peer, datagram.ttl))
            }
            Err(e) => {
                match e {
                    PayloadError::SizeMismatch(_) => self.counters.recv_size_errors += 1,
                    PayloadError::BadMagic(_) => self.counters.recv_magic_errors += 1,
                    PayloadError::BadVersion(_) => self.counters.recv_version_errors += 1,
                    PayloadError::BadType(_) => self.counters.recv_type_errors += 1,
                }
                Err(ChannelError::Payload(e))
            }
        }
    }

    /// Logs the accumulated counters. Called at shutdown regardless of
    /// outcome.
    pub fn log_counters(&self) {
        log::info!("{}: {}", self.name, self.counters);
    }
}

/// Enables delivery of the per-packet TTL/Hop-Limit as a control
/// message. nix does not expose these options, so libc is used
/// directly.
fn request_recv_ttl(
    socket: &std::net::UdpSocket,
    family: ChannelFamily,
) -> Result<(), ChannelError> {
    let fd = socket.as_raw_fd();
    let enable: libc::c_int = 1;

    let result = match family {
        ChannelFamily::Ipv4 => unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_RECVTTL,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        },
        ChannelFamily::Ipv6 => unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_RECVHOPLIMIT,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        },
    };

    if result < 0 {
        return Err(ChannelError::Setup(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// One received datagram before payload validation.
struct RawDatagram {
    len: usize,
    truncated: bool,
    ttl: u8,
    peer: Option<SocketAddr>,
}

/// One non-blocking recvmsg with room for ancillary data. EAGAIN
/// surfaces as a WouldBlock io error, which is what lets `try_io`
/// clear the readiness cache.
fn recv_datagram(fd: RawFd, buf: &mut [u8]) -> io::Result<RawDatagram> {
    let mut peer_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut cmsg_buf = [0u8; 64];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // SAFETY: msghdr is plain data; every pointer below references a
    // local that outlives the recvmsg call.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut peer_storage as *mut libc::sockaddr_storage as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let received = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(RawDatagram {
        len: received as usize,
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        ttl: ttl_from_cmsgs(&msg).unwrap_or(0),
        peer: peer_from_storage(&peer_storage),
    })
}

/// Walks the control-message chain for the received TTL or Hop Limit.
fn ttl_from_cmsgs(msg: &libc::msghdr) -> Option<u8> {
    // SAFETY: cmsg pointers come from CMSG_FIRSTHDR/CMSG_NXTHDR over a
    // msghdr populated by a successful recvmsg; NULL terminates the
    // chain.
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let header = unsafe { *cmsg };
        let is_ttl = (header.cmsg_level == libc::IPPROTO_IP && header.cmsg_type == libc::IP_TTL)
            || (header.cmsg_level == libc::IPPROTO_IPV6
                && header.cmsg_type == libc::IPV6_HOPLIMIT);
        if is_ttl {
            let value =
                unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int) };
            // Carried as int; valid range is 0-255
            return Some(value.clamp(0, 255) as u8);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}

fn peer_from_storage(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the kernel filled the storage with a sockaddr_in
            // for AF_INET.
            let v4 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
            Some((ip, u16::from_be(v4.sin_port)).into())
        }
        libc::AF_INET6 => {
            // SAFETY: as above, with sockaddr_in6 for AF_INET6.
            let v6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
            Some(std::net::SocketAddrV6::new(ip, u16::from_be(v6.sin6_port), 0, 0).into())
        }
        _ => None,
    }
}
