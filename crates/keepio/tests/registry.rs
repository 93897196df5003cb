// SPDX-License-Identifier: Apache-2.0
#![cfg(target_os = "linux")]

use std::env::temp_dir;
use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keepio::config::{DeviceName, HostEntry, Mount};
use keepio::table::DEVID_HOST_FILESYSTEM;
use keepio::{Config, Context, Kind, Registry, AF_ENCLAVE};
use libc::{
    AF_INET, AI_CANONNAME, AI_NUMERICHOST, EBADF, ENOENT, EOVERFLOW, EROFS, NI_NAMEREQD,
    NI_NUMERICHOST, O_CREAT, O_RDONLY, O_RDWR, O_WRONLY, SOCK_STREAM,
};
use postern::host::Executor;
use postern::item::epoll::{Event, Events};
use postern::item::resolver::Hints;
use postern::item::{Family, HEADER_SIZE};
use serial_test::serial;

fn scratch(name: &str) -> PathBuf {
    let path = temp_dir().join(format!("keepio-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn mount(device: DeviceName, source: &str, target: &str, readonly: bool) -> Mount {
    Mount {
        device,
        source: source.into(),
        target: target.into(),
        readonly,
    }
}

fn registry(config: Config) -> Registry {
    let registry = Registry::new(&config, Arc::new(Executor::new()));
    registry.device_init().unwrap();
    registry
}

#[test]
#[serial]
fn host_files() {
    let dir = scratch("files");
    let registry = registry(Config {
        mounts: vec![
            mount(DeviceName::EnclaveFs, "/", "/", false),
            mount(DeviceName::HostFs, dir.to_str().unwrap(), "/scratch", false),
        ],
        ..Default::default()
    });
    let ctx = Context::new();

    let fd = registry
        .open(&ctx, "/scratch/a.txt", O_CREAT | O_RDWR, 0o600)
        .unwrap();
    assert_eq!(registry.write(&ctx, fd, b"from the enclave"), Ok(16));
    assert_eq!(registry.fstat(&ctx, fd).unwrap().size, 16);
    registry.close(&ctx, fd).unwrap();
    assert_eq!(
        std::fs::read(dir.join("a.txt")).unwrap(),
        b"from the enclave"
    );

    registry
        .rename(&ctx, "/scratch/a.txt", "/scratch/b.txt")
        .unwrap();
    registry.mkdir(&ctx, "/scratch/sub", 0o755).unwrap();
    assert!(dir.join("sub").is_dir());

    let stream = registry.opendir(&ctx, "/scratch").unwrap();
    let mut names = vec![];
    while let Some(entry) = registry.readdir(&ctx, stream).unwrap() {
        names.push(entry.name);
    }
    names.sort();
    assert_eq!(names, [".", "..", "b.txt", "sub"]);
    registry.closedir(&ctx, stream).unwrap();

    // `/scratch2` is not below `/scratch`.
    assert_eq!(registry.stat(&ctx, "/scratch2").err(), Some(ENOENT));
    registry.mkdir(&ctx, "/scratch2", 0o755).unwrap();
    assert!(registry.stat(&ctx, "/scratch2").unwrap().is_dir());
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 2);

    registry.unlink(&ctx, "/scratch/b.txt").unwrap();
    registry.rmdir(&ctx, "/scratch/sub").unwrap();
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

    registry.device_shutdown();
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
#[serial]
fn default_host_mount() {
    let registry = registry(Config::default());
    let ctx = Context::new();

    assert!(registry.stat(&ctx, "/host/tmp").unwrap().is_dir());
    assert_eq!(
        registry.open(&ctx, "/host/tmp/x", O_CREAT | O_WRONLY, 0o600),
        Err(EROFS)
    );
    assert_eq!(ctx.errno(), EROFS);

    // Read-only access still reaches the host.
    let fd = registry.open(&ctx, "/host/proc/self/stat", O_RDONLY, 0).unwrap();
    let mut buf = [0; 64];
    assert!(registry.read(&ctx, fd, &mut buf).unwrap() > 0);
    let device = registry.fds().get_fd_device(fd).unwrap();
    assert_eq!(device.kind(), Kind::HostFile);
    assert!(device.host_fd().unwrap() >= 0);
    drop(device);
    registry.close(&ctx, fd).unwrap();
    assert_eq!(registry.close(&ctx, fd), Err(EBADF));

    // `/hostile` lives in the enclave.
    registry.mkdir(&ctx, "/hostile", 0o700).unwrap();
    assert!(registry.stat(&ctx, "/hostile").unwrap().is_dir());

    // Remount the host root writable elsewhere, then take it down again.
    registry.mkdir(&ctx, "/rw", 0o700).unwrap();
    registry
        .mount(&ctx, DEVID_HOST_FILESYSTEM, "/tmp", "/rw", Default::default())
        .unwrap();
    assert_eq!(registry.mounts().paths(), ["/", "/host", "/rw"]);
    registry.unmount(&ctx, DEVID_HOST_FILESYSTEM, "/rw").unwrap();
    assert_eq!(registry.mounts().paths(), ["/", "/host"]);

    registry.device_shutdown();
}

#[test]
#[serial]
fn mount_round_trip() {
    let data = scratch("data");
    let data2 = scratch("data2");
    std::fs::write(data2.join("kept.txt"), b"kept").unwrap();
    let registry = registry(Config {
        mounts: vec![
            mount(DeviceName::EnclaveFs, "/", "/", false),
            mount(DeviceName::HostFs, data2.to_str().unwrap(), "/data2", false),
        ],
        ..Default::default()
    });
    let ctx = Context::new();
    registry.mkdir(&ctx, "/data", 0o755).unwrap();
    let before = registry.mounts().paths();
    assert_eq!(before, ["/", "/data2"]);

    // A source the host cannot provide leaves the table alone.
    let missing = data.join("missing");
    let ret = registry.mount(
        &ctx,
        DEVID_HOST_FILESYSTEM,
        missing.to_str().unwrap(),
        "/data",
        Default::default(),
    );
    assert!(ret.is_err());
    assert_eq!(registry.mounts().paths(), before);

    registry
        .mount(
            &ctx,
            DEVID_HOST_FILESYSTEM,
            data.to_str().unwrap(),
            "/data",
            Default::default(),
        )
        .unwrap();
    assert_eq!(registry.mounts().paths(), ["/", "/data2", "/data"]);
    let fd = registry
        .open(&ctx, "/data/new.txt", O_CREAT | O_WRONLY, 0o600)
        .unwrap();
    registry.close(&ctx, fd).unwrap();
    assert!(data.join("new.txt").is_file());
    assert!(registry.stat(&ctx, "/data2/kept.txt").unwrap().is_file());

    registry.unmount(&ctx, DEVID_HOST_FILESYSTEM, "/data").unwrap();
    assert_eq!(registry.mounts().paths(), before);
    assert_eq!(registry.stat(&ctx, "/data/new.txt").err(), Some(ENOENT));
    assert!(registry.stat(&ctx, "/data").unwrap().is_dir());
    assert!(registry.stat(&ctx, "/data2/kept.txt").unwrap().is_file());
    assert_eq!(registry.host_link().arena_hint(Family::Fs), None);

    registry.device_shutdown();
    for dir in [data, data2] {
        std::fs::remove_dir_all(dir).unwrap();
    }
}

#[test]
#[serial]
fn host_sockets_and_epoll() {
    let registry = registry(Config::default());
    let ctx = Context::new();

    let listener = registry.socket(&ctx, AF_INET, SOCK_STREAM, 0).unwrap();
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    registry.bind(&ctx, listener, any).unwrap();
    registry.listen(&ctx, listener, 4).unwrap();
    let addr = registry.getsockname(&ctx, listener).unwrap().unwrap();
    assert_ne!(addr.port(), 0);

    let mut client = TcpStream::connect(addr).unwrap();
    let (conn, peer) = registry.accept(&ctx, listener, 0).unwrap();
    assert_eq!(peer, Some(client.local_addr().unwrap()));
    let device = registry.fds().get_fd_device(conn).unwrap();
    assert_eq!(device.kind(), Kind::HostSocket);
    drop(device);

    let epfd = registry.epoll_create(&ctx, 1).unwrap();
    let event = Event::new(Events::IN, 7);
    registry
        .epoll_ctl(&ctx, epfd, libc::EPOLL_CTL_ADD, conn, Some(event))
        .unwrap();
    assert_eq!(registry.epoll_wait(&ctx, epfd, 8, 0), Ok(vec![]));

    client.write_all(b"ping").unwrap();
    assert_eq!(registry.epoll_wait(&ctx, epfd, 8, 5000), Ok(vec![event]));
    let mut buf = [0; 8];
    assert_eq!(registry.recv(&ctx, conn, &mut buf, 0), Ok(4));
    assert_eq!(&buf[..4], b"ping");
    assert_eq!(registry.send(&ctx, conn, b"pong", 0), Ok(4));

    registry
        .epoll_ctl(&ctx, epfd, libc::EPOLL_CTL_DEL, conn, None)
        .unwrap();
    for fd in [epfd, conn, listener] {
        registry.close(&ctx, fd).unwrap();
    }
    registry.device_shutdown();
}

#[test]
#[serial]
fn enclave_sockets_across_threads() {
    let registry = Arc::new(registry(Config::default()));
    let ctx = Context::new();
    let domain = AF_ENCLAVE | AF_INET;
    let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

    let listener = registry.socket(&ctx, domain, SOCK_STREAM, 0).unwrap();
    registry.bind(&ctx, listener, addr).unwrap();
    registry.listen(&ctx, listener, 1).unwrap();
    let epfd = registry.epoll_create1(&ctx, libc::EPOLL_CLOEXEC).unwrap();
    let event = Event::new(Events::IN, listener as u64);
    registry
        .epoll_ctl(&ctx, epfd, libc::EPOLL_CTL_ADD, listener, Some(event))
        .unwrap();

    let server = {
        let registry = registry.clone();
        thread::spawn(move || {
            let ctx = Context::new();
            assert_eq!(registry.epoll_wait(&ctx, epfd, 1, -1), Ok(vec![event]));
            let (conn, _) = registry.accept(&ctx, listener, 0).unwrap();
            let mut buf = [0; 5];
            assert_eq!(registry.recv(&ctx, conn, &mut buf, libc::MSG_WAITALL), Ok(5));
            registry.send(&ctx, conn, &buf, 0).unwrap();
            registry.close(&ctx, conn).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    let client = registry.socket(&ctx, domain, SOCK_STREAM, 0).unwrap();
    registry.connect(&ctx, client, addr).unwrap();
    registry.send(&ctx, client, b"hello", 0).unwrap();
    let mut buf = [0; 5];
    assert_eq!(registry.recv(&ctx, client, &mut buf, libc::MSG_WAITALL), Ok(5));
    assert_eq!(&buf, b"hello");
    server.join().unwrap();

    // The server closed its end.
    assert_eq!(registry.recv(&ctx, client, &mut buf, 0), Ok(0));
    for fd in [client, epfd, listener] {
        registry.close(&ctx, fd).unwrap();
    }
    registry.device_shutdown();
}

#[test]
#[serial]
fn resolver_chain() {
    let vault: IpAddr = "10.0.0.7".parse().unwrap();
    let registry = registry(Config {
        hosts: vec![HostEntry {
            name: "vault.keep".into(),
            addr: vault,
        }],
        ..Default::default()
    });
    let ctx = Context::new();
    let hints = Hints {
        flags: AI_CANONNAME,
        family: AF_INET,
        socktype: SOCK_STREAM,
        protocol: 0,
    };

    let list = registry
        .getaddrinfo(&ctx, Some("VAULT.keep"), Some("443"), Some(&hints))
        .unwrap();
    let records: Vec<_> = list.iter().collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].socket_addr(), Some(SocketAddr::new(vault, 443)));
    assert_eq!(records[0].canonname(), Some(&b"VAULT.keep"[..]));

    // Numeric nodes never leave the enclave, whatever the host knows.
    let hints = Hints {
        flags: AI_NUMERICHOST,
        ..Default::default()
    };
    let list = registry
        .getaddrinfo(&ctx, Some("192.0.2.1"), None, Some(&hints))
        .unwrap();
    let numeric: IpAddr = "192.0.2.1".parse().unwrap();
    assert!(!list.is_empty());
    assert!(list
        .iter()
        .all(|record| record.socket_addr().map(|a| a.ip()) == Some(numeric)));

    assert_eq!(
        registry.getnameinfo(&ctx, SocketAddr::new(vault, 443), NI_NAMEREQD),
        Ok(("vault.keep".into(), "443".into()))
    );
    assert_eq!(
        registry.getnameinfo(&ctx, SocketAddr::new(vault, 443), NI_NUMERICHOST),
        Ok(("10.0.0.7".into(), "443".into()))
    );
    let localhost = "127.0.0.1:22".parse().unwrap();
    assert_eq!(
        registry.getnameinfo(&ctx, localhost, 0),
        Ok(("localhost".into(), "22".into()))
    );

    registry.device_shutdown();
}

#[test]
#[serial]
fn arena_growth() {
    let mut config = Config::default();
    config.arenas.fs = HEADER_SIZE + 512;
    let registry = registry(config);
    let ctx = Context::new();

    let dir = scratch("arena");
    let nested = dir.join(vec!["x".repeat(100); 10].join("/"));
    std::fs::create_dir_all(&nested).unwrap();
    let long = format!("/host{}", nested.to_str().unwrap());

    assert_eq!(registry.stat(&ctx, &long), Err(EOVERFLOW));
    let hint = registry.arena_hint(Family::Fs).unwrap();
    assert!(hint > HEADER_SIZE + 1000);
    assert_eq!(registry.arena_hint(Family::Socket), None);

    registry.grow_arena(&ctx, Family::Fs, hint).unwrap();
    assert_eq!(registry.arena_hint(Family::Fs), None);
    assert!(registry.stat(&ctx, &long).unwrap().is_dir());

    registry.device_shutdown();
    std::fs::remove_dir_all(dir).unwrap();
}
