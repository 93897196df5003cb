// SPDX-License-Identifier: Apache-2.0
#![cfg(target_os = "linux")]

use core::ffi::c_int;
use std::env::temp_dir;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::thread;

use libc::{
    AF_INET, AI_NUMERICHOST, AI_NUMERICSERV, EBADF, ENOENT, EOVERFLOW, NI_NUMERICHOST,
    NI_NUMERICSERV, O_CREAT, O_RDWR, SEEK_SET, SOCK_STREAM, SOL_SOCKET, SO_REUSEADDR,
};
use postern::guest::call::epoll::CtlOp;
use postern::guest::call::{epoll, fs, resolver, socket};
use postern::guest::{Call, Channel};
use postern::host::Executor;
use postern::item::epoll::{Event, Events};
use postern::item::resolver::Hints;
use postern::item::{Family, HEADER_SIZE};
use serial_test::serial;

fn channel(family: Family) -> Channel {
    Channel::new(family, HEADER_SIZE + 64 * 1024)
}

fn exec<C: Call>(channel: &Channel, host: &Executor, call: C) -> postern::Result<C::Collected> {
    channel.execute(host, call)
}

fn scratch(name: &str) -> Vec<u8> {
    let path = temp_dir().join(format!("postern-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    let _ = std::fs::remove_file(&path);
    path.into_os_string().into_encoded_bytes()
}

#[test]
#[serial]
fn fs_file() {
    let host = Executor::new();
    let ch = channel(Family::Fs);
    let path = scratch("file");

    let fd = exec(
        &ch,
        &host,
        fs::Open {
            path: &path,
            flags: O_CREAT | O_RDWR,
            mode: 0o600,
        },
    )
    .unwrap();
    assert!(fd >= 0);

    assert_eq!(exec(&ch, &host, fs::Write { fd, buf: b"hello world" }), Ok(11));
    assert_eq!(
        exec(
            &ch,
            &host,
            fs::Lseek {
                fd,
                offset: 6,
                whence: SEEK_SET
            }
        ),
        Ok(6)
    );

    let mut buf = [0u8; 16];
    assert_eq!(exec(&ch, &host, fs::Read { fd, buf: &mut buf }), Ok(5));
    assert_eq!(&buf[..5], b"world");

    let stat = exec(&ch, &host, fs::Fstat { fd }).unwrap();
    assert!(stat.is_file());
    assert_eq!(stat.size, 11);

    exec(&ch, &host, fs::Ftruncate { fd, length: 5 }).unwrap();
    assert_eq!(exec(&ch, &host, fs::StatPath { path: &path }).unwrap().size, 5);
    exec(&ch, &host, fs::Close { fd }).unwrap();
    assert_eq!(exec(&ch, &host, fs::Close { fd }), Err(EBADF));

    let mut renamed = path.clone();
    renamed.extend_from_slice(b".renamed");
    exec(
        &ch,
        &host,
        fs::Rename {
            old: &path,
            new: &renamed,
        },
    )
    .unwrap();
    assert_eq!(exec(&ch, &host, fs::StatPath { path: &path }), Err(ENOENT));

    exec(
        &ch,
        &host,
        fs::Truncate {
            path: &renamed,
            length: 0,
        },
    )
    .unwrap();
    exec(&ch, &host, fs::Unlink { path: &renamed }).unwrap();
    assert_eq!(exec(&ch, &host, fs::Unlink { path: &renamed }), Err(ENOENT));
}

#[test]
#[serial]
fn fs_dir() {
    let host = Executor::new();
    let ch = channel(Family::Fs);
    let dir = scratch("dir");

    exec(&ch, &host, fs::Mkdir { path: &dir, mode: 0o700 }).unwrap();
    assert!(exec(&ch, &host, fs::StatPath { path: &dir }).unwrap().is_dir());

    let mut file = dir.clone();
    file.extend_from_slice(b"/entry");
    let fd = exec(
        &ch,
        &host,
        fs::Open {
            path: &file,
            flags: O_CREAT | O_RDWR,
            mode: 0o600,
        },
    )
    .unwrap();
    exec(&ch, &host, fs::Close { fd }).unwrap();

    let mut link = dir.clone();
    link.extend_from_slice(b"/link");
    exec(
        &ch,
        &host,
        fs::Link {
            old: &file,
            new: &link,
        },
    )
    .unwrap();

    let handle = exec(&ch, &host, fs::Opendir { path: &dir }).unwrap();
    let mut names = Vec::new();
    while let Some(entry) = exec(&ch, &host, fs::Readdir { handle }).unwrap() {
        names.push(entry.name().unwrap().to_vec());
    }
    names.sort();
    assert_eq!(
        names,
        [b".".to_vec(), b"..".to_vec(), b"entry".to_vec(), b"link".to_vec()]
    );
    exec(&ch, &host, fs::Closedir { handle }).unwrap();
    assert_eq!(exec(&ch, &host, fs::Readdir { handle }), Err(EBADF));

    exec(&ch, &host, fs::Unlink { path: &file }).unwrap();
    exec(&ch, &host, fs::Unlink { path: &link }).unwrap();
    exec(&ch, &host, fs::Rmdir { path: &dir }).unwrap();
}

#[test]
#[serial]
fn socket_connect() {
    let host = Executor::new();
    let ch = channel(Family::Socket);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").unwrap();
    });

    let fd = exec(
        &ch,
        &host,
        socket::Socket {
            domain: AF_INET,
            ty: SOCK_STREAM,
            protocol: 0,
        },
    )
    .unwrap();
    exec(&ch, &host, socket::Connect { fd, addr }).unwrap();
    assert_eq!(exec(&ch, &host, socket::Getpeername { fd }), Ok(Some(addr)));
    assert_eq!(
        exec(
            &ch,
            &host,
            socket::Send {
                fd,
                buf: b"ping",
                flags: 0
            }
        ),
        Ok(4)
    );

    let mut buf = [0u8; 4];
    let mut read = 0;
    while read < buf.len() {
        let n = exec(
            &ch,
            &host,
            socket::Recv {
                fd,
                buf: &mut buf[read..],
                flags: 0,
            },
        )
        .unwrap();
        assert_ne!(n, 0);
        read += n;
    }
    assert_eq!(&buf, b"pong");

    exec(&ch, &host, socket::Close { fd }).unwrap();
    server.join().unwrap();
}

#[test]
#[serial]
fn socket_accept() {
    let host = Executor::new();
    let ch = channel(Family::Socket);

    let fd = exec(
        &ch,
        &host,
        socket::Socket {
            domain: AF_INET,
            ty: SOCK_STREAM,
            protocol: 0,
        },
    )
    .unwrap();
    exec(
        &ch,
        &host,
        socket::Setsockopt {
            fd,
            level: SOL_SOCKET,
            name: SO_REUSEADDR,
            value: &1i32.to_ne_bytes(),
        },
    )
    .unwrap();
    let value = exec(
        &ch,
        &host,
        socket::Getsockopt {
            fd,
            level: SOL_SOCKET,
            name: SO_REUSEADDR,
            len: 4,
        },
    )
    .unwrap();
    assert_ne!(value, [0; 4]);

    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    exec(&ch, &host, socket::Bind { fd, addr: any }).unwrap();
    exec(&ch, &host, socket::Listen { fd, backlog: 1 }).unwrap();
    let addr = exec(&ch, &host, socket::Getsockname { fd }).unwrap().unwrap();
    assert_ne!(addr.port(), 0);

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hi").unwrap();
        stream.local_addr().unwrap()
    });

    let (conn, peer) = exec(&ch, &host, socket::Accept { fd, flags: 0 }).unwrap();
    let local = client.join().unwrap();
    assert_eq!(peer, Some(local));

    let mut buf = [0u8; 2];
    let n = exec(
        &ch,
        &host,
        socket::Recv {
            fd: conn,
            buf: &mut buf,
            flags: libc::MSG_WAITALL,
        },
    )
    .unwrap();
    assert_eq!(&buf[..n], b"hi");

    exec(&ch, &host, socket::Shutdown { fd: conn, how: libc::SHUT_RDWR }).unwrap();
    exec(&ch, &host, socket::Close { fd: conn }).unwrap();
    exec(&ch, &host, socket::Close { fd }).unwrap();
}

#[test]
#[serial]
fn epoll_wait() {
    let host = Executor::new();
    let ch = channel(Family::Epoll);

    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let fd: c_int = sock.as_raw_fd();

    let epfd = exec(&ch, &host, epoll::Create1 { flags: 0 }).unwrap();
    exec(
        &ch,
        &host,
        epoll::Ctl {
            epfd,
            op: CtlOp::Add,
            fd,
            event: Some(Event::new(Events::IN, 7)),
        },
    )
    .unwrap();

    let wait = || epoll::Wait {
        epfd,
        maxevents: 4,
        timeout: 0,
    };
    assert_eq!(exec(&ch, &host, wait()), Ok(vec![]));

    peer.send_to(b"x", sock.local_addr().unwrap()).unwrap();
    let events = exec(
        &ch,
        &host,
        epoll::Wait {
            epfd,
            maxevents: 4,
            timeout: 1000,
        },
    )
    .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, 7);
    assert!(events[0].events().contains(Events::IN));

    exec(
        &ch,
        &host,
        epoll::Ctl {
            epfd,
            op: CtlOp::Del,
            fd,
            event: None,
        },
    )
    .unwrap();
    assert_eq!(exec(&ch, &host, wait()), Ok(vec![]));

    exec(&ch, &host, epoll::Close { epfd }).unwrap();

    let other = exec(&ch, &host, epoll::Create { size: 1 }).unwrap();
    exec(&ch, &host, epoll::ShutdownDevice).unwrap();
    assert_eq!(exec(&ch, &host, epoll::Close { epfd: other }), Err(EBADF));
}

#[test]
fn resolver_numeric() {
    let host = Executor::new();
    let ch = channel(Family::Resolver);

    let hints = Hints {
        flags: AI_NUMERICHOST | AI_NUMERICSERV,
        family: AF_INET,
        socktype: SOCK_STREAM,
        protocol: 0,
    };
    let list = exec(
        &ch,
        &host,
        resolver::Getaddrinfo {
            node: Some(&b"127.0.0.1"[..]),
            service: Some(&b"8080"[..]),
            hints: Some(hints),
        },
    )
    .unwrap();
    let addrs: Vec<_> = list.iter().filter_map(|ai| ai.socket_addr()).collect();
    assert_eq!(addrs, ["127.0.0.1:8080".parse::<SocketAddr>().unwrap()]);

    let (name, serv) = exec(
        &ch,
        &host,
        resolver::Getnameinfo {
            addr: "127.0.0.1:8080".parse().unwrap(),
            flags: NI_NUMERICHOST | NI_NUMERICSERV,
        },
    )
    .unwrap();
    assert_eq!(name, b"127.0.0.1");
    assert_eq!(serv, b"8080");

    exec(&ch, &host, resolver::Shutdown).unwrap();
}

#[test]
fn resolver_overflow() {
    let host = Executor::new();
    // Too small for even a single record.
    let ch = Channel::new(Family::Resolver, HEADER_SIZE + 64);

    let call = || resolver::Getaddrinfo {
        node: Some(&b"127.0.0.1"[..]),
        service: None,
        hints: Some(Hints {
            flags: AI_NUMERICHOST,
            family: AF_INET,
            socktype: SOCK_STREAM,
            protocol: 0,
        }),
    };

    // The host reports the room it needs, which may take more than one round to learn.
    let mut grown = 0;
    let list = loop {
        match exec(&ch, &host, call()) {
            Err(EOVERFLOW) if grown < 3 => {
                let required = ch.required().unwrap();
                assert!(required > ch.capacity());
                ch.grow(required).unwrap();
                grown += 1;
            }
            other => break other.unwrap(),
        }
    };
    assert!(grown > 0);
    assert_eq!(list.len(), 1);
    for ai in &list {
        let bytes = ai.addr_bytes().unwrap();
        let buf = list.as_bytes().as_ptr_range();
        assert!(buf.contains(&bytes.as_ptr()));
    }
}
