// SPDX-License-Identifier: Apache-2.0

//! Host socket proxy

use super::{Backend, Device};
use crate::link::{HostFd, HostLink};

use core::ffi::c_int;
use std::net::SocketAddr;
use std::sync::Arc;

use postern::guest::call::socket;
use postern::item::Family;
use postern::Result;

/// The host socket template.
#[derive(Clone, Debug)]
pub(crate) struct HostSockets {
    link: Arc<HostLink>,
}

impl HostSockets {
    pub fn new(link: Arc<HostLink>) -> Self {
        Self { link }
    }

    pub fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> Result<Device> {
        let fd = self.link.execute(socket::Socket {
            domain,
            ty,
            protocol,
        })?;
        Ok(HostSocket::wrap(self.link.clone(), fd))
    }
}

/// A host socket.
#[derive(Clone, Debug)]
pub(crate) struct HostSocket {
    fd: Arc<HostFd>,
}

impl HostSocket {
    fn wrap(link: Arc<HostLink>, fd: c_int) -> Device {
        let fd = Arc::new(HostFd::new(link, Family::Socket, fd));
        Device::new(Backend::HostSocket(Self { fd }))
    }

    fn link(&self) -> &Arc<HostLink> {
        self.fd.link()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv(buf, 0)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.send(buf, 0)
    }

    pub fn close(&self) -> Result<()> {
        self.fd.close()
    }

    pub fn host_fd(&self) -> Result<c_int> {
        self.fd.get()
    }

    pub fn shutdown(&self, how: c_int) -> Result<()> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Shutdown { fd, how })
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Connect { fd, addr })
    }

    pub fn accept(&self, flags: c_int) -> Result<(Device, Option<SocketAddr>)> {
        let fd = self.fd.get()?;
        let (conn, addr) = self.link().execute(socket::Accept { fd, flags })?;
        Ok((Self::wrap(self.link().clone(), conn), addr))
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Bind { fd, addr })
    }

    pub fn listen(&self, backlog: c_int) -> Result<()> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Listen { fd, backlog })
    }

    pub fn recv(&self, buf: &mut [u8], flags: c_int) -> Result<usize> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Recv { fd, buf, flags })
    }

    pub fn send(&self, buf: &[u8], flags: c_int) -> Result<usize> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Send { fd, buf, flags })
    }

    pub fn getsockopt(&self, level: c_int, name: c_int, len: usize) -> Result<Vec<u8>> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Getsockopt {
            fd,
            level,
            name,
            len,
        })
    }

    pub fn setsockopt(&self, level: c_int, name: c_int, value: &[u8]) -> Result<()> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Setsockopt {
            fd,
            level,
            name,
            value,
        })
    }

    pub fn getsockname(&self) -> Result<Option<SocketAddr>> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Getsockname { fd })
    }

    pub fn getpeername(&self) -> Result<Option<SocketAddr>> {
        let fd = self.fd.get()?;
        self.link().execute(socket::Getpeername { fd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{link, Recorder};

    use libc::{AF_INET, EBADF, SOCK_STREAM};
    use postern::item::socket::Op;

    #[test]
    fn read_is_recv() {
        let host = Arc::new(Recorder::default());
        let sockets = HostSockets::new(link(host.clone()));
        let socket = sockets.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        assert_eq!(socket.host_fd(), Ok(0));
        socket.read(&mut [0; 8]).unwrap();
        socket.write(b"ping").unwrap();
        socket.close().unwrap();
        assert_eq!(socket.write(b"ping"), Err(EBADF));

        let ops: Vec<_> = host.ops().into_iter().map(|(_, op, _)| op).collect();
        assert_eq!(
            ops,
            [
                Op::Socket as usize,
                Op::Recv as usize,
                Op::Send as usize,
                Op::Close as usize
            ]
        );
    }

    #[test]
    fn accepted_connections_are_independent() {
        let host = Arc::new(Recorder::default());
        let sockets = HostSockets::new(link(host.clone()));
        let listener = sockets.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let (conn, _) = listener.accept(0).unwrap();
        drop(listener);
        assert_eq!(conn.host_fd(), Ok(0));
        drop(conn);

        let closes = host
            .ops()
            .into_iter()
            .filter(|&(_, op, _)| op == Op::Close as usize)
            .count();
        assert_eq!(closes, 2);
    }
}
