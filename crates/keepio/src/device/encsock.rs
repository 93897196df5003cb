// SPDX-License-Identifier: Apache-2.0

//! Enclave sockets
//!
//! A stream socket stack that never leaves the enclave. Connections are pairs of bounded
//! byte pipes. Every state change broadcasts on the [`Notifier`], which blocking calls and
//! epoll wait on.

use super::{Backend, Device};
use crate::notify::Notifier;

use core::ffi::{c_int, c_ulong};
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};

use libc::{
    AF_INET, AF_INET6, EADDRINUSE, EAFNOSUPPORT, EAGAIN, EBADF, ECONNREFUSED, EINVAL, EISCONN,
    ENOPROTOOPT, ENOTCONN, ENOTTY, EPIPE, EPROTONOSUPPORT, ESOCKTNOSUPPORT, IPPROTO_TCP,
    MSG_DONTWAIT, MSG_PEEK, MSG_WAITALL, SHUT_RD, SHUT_RDWR, SHUT_WR, SOCK_CLOEXEC,
    SOCK_NONBLOCK, SOCK_STREAM, SOL_SOCKET,
};
use postern::item::epoll::Events;
use postern::Result;
use spin::{Mutex, MutexGuard};
use tracing::trace;

/// Bytes a connection buffers in each direction.
pub const PIPE_CAPACITY: usize = 256 * 1024;

const EPHEMERAL_FIRST: u16 = 49152;
const EPHEMERAL_COUNT: u16 = 16384;

fn unspecified(family: c_int) -> IpAddr {
    match family {
        AF_INET6 => Ipv6Addr::UNSPECIFIED.into(),
        _ => Ipv4Addr::UNSPECIFIED.into(),
    }
}

fn loopback(family: c_int) -> IpAddr {
    match family {
        AF_INET6 => Ipv6Addr::LOCALHOST.into(),
        _ => Ipv4Addr::LOCALHOST.into(),
    }
}

fn family_of(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    }
}

#[derive(Default)]
struct Ports {
    bound: HashSet<SocketAddr>,
    listeners: HashMap<SocketAddr, Weak<Endpoint>>,
    next: u16,
}

impl Ports {
    fn in_use(&self, addr: &SocketAddr) -> bool {
        self.bound.iter().any(|bound| {
            bound.port() == addr.port()
                && family_of(bound) == family_of(addr)
                && (bound.ip() == addr.ip()
                    || bound.ip().is_unspecified()
                    || addr.ip().is_unspecified())
        })
    }
}

/// The enclave socket stack.
pub struct Stack {
    notifier: Arc<Notifier>,
    ports: Mutex<Ports>,
}

impl Stack {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            notifier,
            ports: Mutex::new(Ports::default()),
        }
    }

    /// Claims `addr`, picking an ephemeral port for port 0.
    fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut ports = self.ports.lock();
        if addr.port() != 0 {
            if ports.in_use(&addr) {
                return Err(EADDRINUSE);
            }
            ports.bound.insert(addr);
            return Ok(addr);
        }

        for _ in 0..EPHEMERAL_COUNT {
            let port = EPHEMERAL_FIRST + ports.next;
            ports.next = (ports.next + 1) % EPHEMERAL_COUNT;
            let candidate = SocketAddr::new(addr.ip(), port);
            if !ports.in_use(&candidate) {
                ports.bound.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(EADDRINUSE)
    }

    fn listen(&self, addr: SocketAddr, endpoint: Weak<Endpoint>) {
        self.ports.lock().listeners.insert(addr, endpoint);
    }

    fn unbind(&self, addr: &SocketAddr) {
        let mut ports = self.ports.lock();
        ports.bound.remove(addr);
        ports.listeners.remove(addr);
    }

    fn listener(&self, addr: &SocketAddr) -> Option<Arc<Endpoint>> {
        let any = SocketAddr::new(unspecified(family_of(addr)), addr.port());
        let ports = self.ports.lock();
        ports
            .listeners
            .get(addr)
            .or_else(|| ports.listeners.get(&any))
            .and_then(Weak::upgrade)
    }
}

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    /// The writer is done
    eof: bool,
    /// The reader is gone
    broken: bool,
}

type Pipe = Arc<Mutex<PipeState>>;

#[derive(Default)]
enum Phase {
    #[default]
    Idle,
    Listening {
        backlog: usize,
        pending: VecDeque<Arc<Endpoint>>,
    },
    Connected {
        peer: SocketAddr,
        rx: Pipe,
        tx: Pipe,
    },
    Closed,
}

#[derive(Default)]
struct State {
    phase: Phase,
    /// The socket name
    local: Option<SocketAddr>,
    /// The address claimed from the stack, released on close
    binding: Option<SocketAddr>,
    reuseaddr: bool,
    nodelay: bool,
    shut_rd: bool,
    shut_wr: bool,
}

struct Endpoint {
    stack: Arc<Stack>,
    family: c_int,
    nonblocking: AtomicBool,
    state: Mutex<State>,
}

impl Endpoint {
    fn new(stack: Arc<Stack>, family: c_int, nonblocking: bool, state: State) -> Self {
        Self {
            stack,
            family,
            nonblocking: AtomicBool::new(nonblocking),
            state: Mutex::new(state),
        }
    }

    /// Locks the state of an open socket.
    fn open(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state.lock();
        match state.phase {
            Phase::Closed => Err(EBADF),
            _ => Ok(state),
        }
    }

    fn notify(&self) {
        self.stack.notifier.broadcast();
    }

    /// Tears the socket down, returning whether it was open.
    fn release(&self) -> bool {
        let (phase, binding) = {
            let mut state = self.state.lock();
            if let Phase::Closed = state.phase {
                return false;
            }
            let phase = core::mem::replace(&mut state.phase, Phase::Closed);
            (phase, state.binding.take())
        };

        match phase {
            Phase::Connected { rx, tx, .. } => {
                for pipe in [rx, tx] {
                    let mut pipe = pipe.lock();
                    pipe.eof = true;
                    pipe.broken = true;
                }
            }
            Phase::Listening { pending, .. } => {
                for conn in pending {
                    conn.release();
                }
            }
            _ => {}
        }
        if let Some(binding) = binding {
            self.stack.unbind(&binding);
        }
        self.notify();
        true
    }

    /// Claims an ephemeral address on `ip` unless the socket already has a name.
    fn ensure_bound(&self, ip: IpAddr) -> Result<SocketAddr> {
        if let Some(local) = self.open()?.local {
            return Ok(local);
        }
        let addr = self.stack.bind(SocketAddr::new(ip, 0))?;
        let mut state = self.state.lock();
        state.local = Some(addr);
        state.binding = Some(addr);
        Ok(addr)
    }

    fn enqueue(&self, conn: Arc<Endpoint>) -> Result<()> {
        let mut state = self.state.lock();
        match &mut state.phase {
            Phase::Listening { backlog, pending } if pending.len() < *backlog => {
                pending.push_back(conn);
                Ok(())
            }
            _ => Err(ECONNREFUSED),
        }
    }

    fn pop_pending(&self) -> Result<Option<Arc<Endpoint>>> {
        let mut state = self.state.lock();
        match &mut state.phase {
            Phase::Listening { pending, .. } => Ok(pending.pop_front()),
            Phase::Closed => Err(EBADF),
            _ => Err(EINVAL),
        }
    }

    fn pipes(&self) -> Result<(Pipe, Pipe, bool, bool)> {
        let state = self.open()?;
        match &state.phase {
            Phase::Connected { rx, tx, .. } => {
                Ok((rx.clone(), tx.clone(), state.shut_rd, state.shut_wr))
            }
            _ => Err(ENOTCONN),
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// The enclave socket template.
#[derive(Clone)]
pub(crate) struct EncSockets {
    stack: Arc<Stack>,
}

impl EncSockets {
    pub fn new(stack: Arc<Stack>) -> Self {
        Self { stack }
    }

    pub fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> Result<Device> {
        if domain != AF_INET && domain != AF_INET6 {
            return Err(EAFNOSUPPORT);
        }
        if ty & !(SOCK_NONBLOCK | SOCK_CLOEXEC) != SOCK_STREAM {
            return Err(ESOCKTNOSUPPORT);
        }
        if protocol != 0 && protocol != IPPROTO_TCP {
            return Err(EPROTONOSUPPORT);
        }

        let endpoint = Endpoint::new(
            self.stack.clone(),
            domain,
            ty & SOCK_NONBLOCK != 0,
            State::default(),
        );
        Ok(EncSocket::wrap(Arc::new(endpoint)))
    }
}

fn int_opt(value: c_int, len: usize) -> Result<Vec<u8>> {
    if len < size_of::<c_int>() {
        return Err(EINVAL);
    }
    Ok(value.to_ne_bytes().to_vec())
}

fn parse_int_opt(value: &[u8]) -> Result<c_int> {
    let bytes = value.get(..size_of::<c_int>()).ok_or(EINVAL)?;
    let mut raw = [0u8; size_of::<c_int>()];
    raw.copy_from_slice(bytes);
    Ok(c_int::from_ne_bytes(raw))
}

/// An enclave socket.
#[derive(Clone)]
pub(crate) struct EncSocket {
    endpoint: Arc<Endpoint>,
}

impl EncSocket {
    fn wrap(endpoint: Arc<Endpoint>) -> Device {
        Device::new(Backend::EncSocket(Self { endpoint }))
    }

    fn nonblocking(&self) -> bool {
        self.endpoint.nonblocking.load(Ordering::Relaxed)
    }

    fn check_family(&self, addr: &SocketAddr) -> Result<()> {
        match family_of(addr) == self.endpoint.family {
            true => Ok(()),
            false => Err(EAFNOSUPPORT),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv(buf, 0)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.send(buf, 0)
    }

    /// Supports `FIONREAD`, returning the number of buffered bytes.
    #[allow(clippy::unnecessary_cast)]
    pub fn ioctl(&self, request: c_ulong, _arg: usize) -> Result<usize> {
        if request != libc::FIONREAD as c_ulong {
            return Err(ENOTTY);
        }
        let state = self.endpoint.open()?;
        match &state.phase {
            Phase::Connected { rx, .. } => Ok(rx.lock().data.len()),
            Phase::Listening { .. } => Err(EINVAL),
            _ => Ok(0),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self.endpoint.release() {
            true => Ok(()),
            false => Err(EBADF),
        }
    }

    /// Computes the events the socket is ready for.
    pub fn ready(&self) -> Events {
        let (rx, tx, shut_rd, shut_wr) = {
            let state = self.endpoint.state.lock();
            match &state.phase {
                Phase::Connected { rx, tx, .. } => {
                    (rx.clone(), tx.clone(), state.shut_rd, state.shut_wr)
                }
                Phase::Listening { pending, .. } if !pending.is_empty() => return Events::IN,
                Phase::Closed => return Events::HUP,
                _ => return Events::empty(),
            }
        };

        let mut events = Events::empty();
        let (readable, eof) = {
            let rx = rx.lock();
            (!rx.data.is_empty(), rx.eof)
        };
        if readable || eof || shut_rd {
            events |= Events::IN;
        }
        if eof {
            events |= Events::RDHUP;
        }

        let (writable, broken) = {
            let tx = tx.lock();
            (tx.data.len() < PIPE_CAPACITY, tx.broken)
        };
        if writable && !broken && !shut_wr {
            events |= Events::OUT;
        }
        if eof && (broken || shut_wr) {
            events |= Events::HUP;
        }
        events
    }

    pub fn shutdown(&self, how: c_int) -> Result<()> {
        if how != SHUT_RD && how != SHUT_WR && how != SHUT_RDWR {
            return Err(EINVAL);
        }
        let (rx, tx) = {
            let mut state = self.endpoint.open()?;
            let pipes = match &state.phase {
                Phase::Connected { rx, tx, .. } => (rx.clone(), tx.clone()),
                _ => return Err(ENOTCONN),
            };
            state.shut_rd |= how != SHUT_WR;
            state.shut_wr |= how != SHUT_RD;
            pipes
        };

        if how != SHUT_WR {
            rx.lock().eof = true;
        }
        if how != SHUT_RD {
            tx.lock().eof = true;
        }
        self.endpoint.notify();
        Ok(())
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.check_family(&addr)?;
        if self.endpoint.open()?.local.is_some() {
            return Err(EINVAL);
        }
        let addr = self.endpoint.stack.bind(addr)?;
        let mut state = self.endpoint.state.lock();
        state.local = Some(addr);
        state.binding = Some(addr);
        trace!(%addr, "bind enclave socket");
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> Result<()> {
        let local = self
            .endpoint
            .ensure_bound(unspecified(self.endpoint.family))?;
        let backlog = usize::try_from(backlog.clamp(1, libc::SOMAXCONN)).unwrap_or(1);
        {
            let mut state = self.endpoint.open()?;
            match &mut state.phase {
                Phase::Idle => {
                    state.phase = Phase::Listening {
                        backlog,
                        pending: VecDeque::new(),
                    }
                }
                Phase::Listening { backlog: old, .. } => *old = backlog,
                _ => return Err(EINVAL),
            }
        }
        self.endpoint
            .stack
            .listen(local, Arc::downgrade(&self.endpoint));
        trace!(%local, backlog, "listen enclave socket");
        Ok(())
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.check_family(&addr)?;
        match self.endpoint.open()?.phase {
            Phase::Idle => {}
            Phase::Connected { .. } => return Err(EISCONN),
            _ => return Err(EINVAL),
        }

        let listener = self.endpoint.stack.listener(&addr).ok_or(ECONNREFUSED)?;
        let local = self.endpoint.ensure_bound(loopback(self.endpoint.family))?;
        let server_name = match listener.state.lock().local {
            Some(name) if !name.ip().is_unspecified() => name,
            _ => addr,
        };

        let upstream = Pipe::default();
        let downstream = Pipe::default();
        let server = State {
            phase: Phase::Connected {
                peer: local,
                rx: upstream.clone(),
                tx: downstream.clone(),
            },
            local: Some(server_name),
            ..Default::default()
        };
        let server = Endpoint::new(self.endpoint.stack.clone(), listener.family, false, server);

        {
            // The listener is never this endpoint, which is idle.
            let mut state = self.endpoint.open()?;
            if !matches!(state.phase, Phase::Idle) {
                return Err(EISCONN);
            }
            listener.enqueue(Arc::new(server))?;
            state.phase = Phase::Connected {
                peer: server_name,
                rx: downstream,
                tx: upstream,
            };
        }
        trace!(%local, peer = %server_name, "connect enclave socket");
        self.endpoint.notify();
        Ok(())
    }

    pub fn accept(&self, flags: c_int) -> Result<(Device, Option<SocketAddr>)> {
        if flags & !(SOCK_NONBLOCK | SOCK_CLOEXEC) != 0 {
            return Err(EINVAL);
        }

        let conn = match self.endpoint.pop_pending()? {
            Some(conn) => conn,
            None if self.nonblocking() => return Err(EAGAIN),
            None => self
                .endpoint
                .stack
                .notifier
                .wait_until(None, || self.endpoint.pop_pending().transpose())
                .unwrap_or(Err(EAGAIN))?,
        };

        conn.nonblocking
            .store(flags & SOCK_NONBLOCK != 0, Ordering::Relaxed);
        let peer = match &conn.state.lock().phase {
            Phase::Connected { peer, .. } => Some(*peer),
            _ => None,
        };
        self.endpoint.notify();
        Ok((Self::wrap(conn), peer))
    }

    pub fn recv(&self, buf: &mut [u8], flags: c_int) -> Result<usize> {
        let (rx, _, shut_rd, _) = self.endpoint.pipes()?;
        if shut_rd || buf.is_empty() {
            return Ok(0);
        }

        let peek = flags & MSG_PEEK != 0;
        let waitall = flags & MSG_WAITALL != 0 && !peek;
        let dontwait = flags & MSG_DONTWAIT != 0 || self.nonblocking();

        let mut done = 0;
        loop {
            let (n, eof) = {
                let mut pipe = rx.lock();
                let n = pipe.data.len().min(buf.len() - done);
                for (dst, src) in buf[done..done + n].iter_mut().zip(pipe.data.iter()) {
                    *dst = *src;
                }
                if !peek {
                    pipe.data.drain(..n);
                }
                (n, pipe.eof)
            };
            done += n;
            if n > 0 && !peek {
                self.endpoint.notify();
            }

            if done == buf.len() || (done > 0 && !waitall) || eof {
                return Ok(done);
            }
            if dontwait {
                return match done {
                    0 => Err(EAGAIN),
                    done => Ok(done),
                };
            }

            self.endpoint.stack.notifier.wait_until(None, || {
                let pipe = rx.lock();
                (!pipe.data.is_empty() || pipe.eof).then_some(())
            });
        }
    }

    pub fn send(&self, buf: &[u8], flags: c_int) -> Result<usize> {
        let (_, tx, _, shut_wr) = self.endpoint.pipes()?;
        if shut_wr {
            return Err(EPIPE);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let dontwait = flags & MSG_DONTWAIT != 0 || self.nonblocking();

        loop {
            let sent = {
                let mut pipe = tx.lock();
                if pipe.broken {
                    return Err(EPIPE);
                }
                let n = (PIPE_CAPACITY - pipe.data.len()).min(buf.len());
                pipe.data.extend(&buf[..n]);
                n
            };
            if sent > 0 {
                self.endpoint.notify();
                return Ok(sent);
            }
            if dontwait {
                return Err(EAGAIN);
            }

            self.endpoint.stack.notifier.wait_until(None, || {
                let pipe = tx.lock();
                (pipe.broken || pipe.data.len() < PIPE_CAPACITY).then_some(())
            });
        }
    }

    pub fn getsockopt(&self, level: c_int, name: c_int, len: usize) -> Result<Vec<u8>> {
        let state = self.endpoint.open()?;
        let value = match (level, name) {
            (SOL_SOCKET, libc::SO_ERROR) => 0,
            (SOL_SOCKET, libc::SO_TYPE) => SOCK_STREAM,
            (SOL_SOCKET, libc::SO_DOMAIN) => self.endpoint.family,
            (SOL_SOCKET, libc::SO_REUSEADDR) => state.reuseaddr.into(),
            (SOL_SOCKET, libc::SO_ACCEPTCONN) => {
                matches!(state.phase, Phase::Listening { .. }).into()
            }
            (SOL_SOCKET, libc::SO_RCVBUF | libc::SO_SNDBUF) => PIPE_CAPACITY as c_int,
            (IPPROTO_TCP, libc::TCP_NODELAY) => state.nodelay.into(),
            _ => return Err(ENOPROTOOPT),
        };
        int_opt(value, len)
    }

    pub fn setsockopt(&self, level: c_int, name: c_int, value: &[u8]) -> Result<()> {
        let value = parse_int_opt(value)?;
        let mut state = self.endpoint.open()?;
        match (level, name) {
            (SOL_SOCKET, libc::SO_REUSEADDR) => state.reuseaddr = value != 0,
            (SOL_SOCKET, libc::SO_RCVBUF | libc::SO_SNDBUF) => {}
            (IPPROTO_TCP, libc::TCP_NODELAY) => state.nodelay = value != 0,
            _ => return Err(ENOPROTOOPT),
        }
        Ok(())
    }

    pub fn getsockname(&self) -> Result<Option<SocketAddr>> {
        let state = self.endpoint.open()?;
        let unbound = SocketAddr::new(unspecified(self.endpoint.family), 0);
        Ok(Some(state.local.unwrap_or(unbound)))
    }

    pub fn getpeername(&self) -> Result<Option<SocketAddr>> {
        match self.endpoint.open()?.phase {
            Phase::Connected { peer, .. } => Ok(Some(peer)),
            _ => Err(ENOTCONN),
        }
    }
}
