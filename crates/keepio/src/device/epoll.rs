// SPDX-License-Identifier: Apache-2.0

//! Epoll
//!
//! An instance watches devices by enclave descriptor. Host-backed members are also
//! registered with a host epoll instance, created on first use, whose results are fed into
//! the members' ready-state. Enclave members report readiness themselves and broadcast on
//! the [`Notifier`].

use super::{Backend, Capabilities, Device};
use crate::link::{HostFd, HostLink};
use crate::notify::{deadline, Notifier};

use core::ffi::c_int;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use libc::{EBADF, EEXIST, EINVAL, ENOENT, EPERM, EPOLL_CLOEXEC};
use postern::guest::call::epoll::{self as call, CtlOp};
use postern::item::epoll::{Event, Events, MAX_EVENTS};
use postern::item::Family;
use postern::Result;
use spin::Mutex;
use tracing::{debug, trace};

/// Longest a wait over host and enclave members blocks before polling the host again.
const MIXED_SLICE: Duration = Duration::from_millis(10);

/// The state of an epoll instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing is watched
    Created,
    /// One or more devices are watched
    Armed,
    /// A caller is blocked in `epoll_wait`
    Waiting,
    /// Terminal
    Closed,
}

/// The epoll template.
#[derive(Clone)]
pub(crate) struct EpollDev {
    link: Arc<HostLink>,
    notifier: Arc<Notifier>,
}

impl EpollDev {
    pub fn new(link: Arc<HostLink>, notifier: Arc<Notifier>) -> Self {
        Self { link, notifier }
    }

    fn instance(&self) -> Device {
        let inner = Inner {
            link: self.link.clone(),
            notifier: self.notifier.clone(),
            ctl: StdMutex::new(()),
            interest: Mutex::new(Interest::default()),
            waiters: AtomicUsize::new(0),
        };
        Device::new(Backend::Epoll(Epoll {
            inner: Arc::new(inner),
        }))
    }

    pub fn create(&self, size: c_int) -> Result<Device> {
        if size <= 0 {
            return Err(EINVAL);
        }
        Ok(self.instance())
    }

    pub fn create1(&self, flags: c_int) -> Result<Device> {
        if flags & !EPOLL_CLOEXEC != 0 {
            return Err(EINVAL);
        }
        Ok(self.instance())
    }

    /// Closes every epoll instance the host keeps for this side.
    pub fn shutdown(&self, _how: c_int) -> Result<()> {
        self.link.execute(call::ShutdownDevice)
    }
}

struct Watch {
    target: Weak<Device>,
    host: bool,
    events: Events,
    data: u64,
    disabled: bool,
}

#[derive(Default)]
struct Interest {
    watches: BTreeMap<c_int, Watch>,
    host: Option<Arc<HostFd>>,
    revision: u64,
    closed: bool,
}

struct Inner {
    link: Arc<HostLink>,
    notifier: Arc<Notifier>,
    /// Serializes `ctl`, which may cross to the host
    ctl: StdMutex<()>,
    interest: Mutex<Interest>,
    waiters: AtomicUsize,
}

/// A live member of a wait.
struct Member {
    fd: c_int,
    device: Arc<Device>,
    host: bool,
    events: Events,
    data: u64,
}

struct Snapshot {
    members: Vec<Member>,
    host: Option<Arc<HostFd>>,
    revision: u64,
}

enum Outcome {
    Ready(Vec<Event>),
    Changed,
}

/// Counts a caller as waiting for as long as it lives.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::AcqRel);
        Self(waiters)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn remaining(deadline: Option<Instant>) -> c_int {
    match deadline {
        None => -1,
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now()).as_millis();
            c_int::try_from(left).unwrap_or(c_int::MAX)
        }
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// An epoll instance.
#[derive(Clone)]
pub(crate) struct Epoll {
    inner: Arc<Inner>,
}

impl Epoll {
    pub fn state(&self) -> Result<State> {
        let interest = self.inner.interest.lock();
        Ok(if interest.closed {
            State::Closed
        } else if self.inner.waiters.load(Ordering::Acquire) > 0 {
            State::Waiting
        } else if interest.watches.is_empty() {
            State::Created
        } else {
            State::Armed
        })
    }

    /// Returns the host epoll instance, creating it on first use.
    fn host(&self) -> Result<Arc<HostFd>> {
        if let Some(host) = self.inner.interest.lock().host.clone() {
            return Ok(host);
        }

        let epfd = self.inner.link.execute(call::Create1 {
            flags: EPOLL_CLOEXEC,
        })?;
        let host = Arc::new(HostFd::new(self.inner.link.clone(), Family::Epoll, epfd));
        let mut interest = self.inner.interest.lock();
        if interest.closed {
            drop(interest);
            return Err(EBADF);
        }
        interest.host = Some(host.clone());
        trace!(epfd, "created host epoll instance");
        Ok(host)
    }

    pub fn ctl(
        &self,
        op: CtlOp,
        fd: c_int,
        target: &Arc<Device>,
        event: Option<Event>,
    ) -> Result<()> {
        let _serial = self
            .inner
            .ctl
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let exists = {
            let interest = self.inner.interest.lock();
            if interest.closed {
                return Err(EBADF);
            }
            interest.watches.contains_key(&fd)
        };
        match (op, exists) {
            (CtlOp::Add, true) => return Err(EEXIST),
            (CtlOp::Mod | CtlOp::Del, false) => return Err(ENOENT),
            _ => {}
        }
        if !target.capabilities().contains(Capabilities::READY_STATE) {
            return Err(EPERM);
        }
        let event = match (op, event) {
            (CtlOp::Del, _) => None,
            (_, Some(event)) => Some(event),
            (_, None) => return Err(EINVAL),
        };

        let host_fd = target.host_fd().ok();
        if let Some(host_fd) = host_fd {
            let epfd = self.host()?.get()?;
            // The host stays level-triggered, delivery semantics are applied here.
            let mask = Events::ONESHOT | Events::ET;
            let host_event = event.map(|e| Event::new(e.events() - mask, fd as u64));
            let ret = self.inner.link.execute(call::Ctl {
                epfd,
                op,
                fd: host_fd,
                event: host_event,
            });
            match (op, ret) {
                (CtlOp::Del, Err(err)) => debug!(fd, host_fd, err, "host epoll removal failed"),
                (_, ret) => ret?,
            }
        }

        {
            let mut interest = self.inner.interest.lock();
            if interest.closed {
                return Err(EBADF);
            }
            match event {
                None => {
                    interest.watches.remove(&fd);
                }
                Some(event) => {
                    let watch = Watch {
                        target: Arc::downgrade(target),
                        host: host_fd.is_some(),
                        events: event.events(),
                        data: event.data,
                        disabled: false,
                    };
                    interest.watches.insert(fd, watch);
                }
            }
            interest.revision += 1;
        }
        trace!(fd, ?op, "epoll interest changed");
        self.inner.notifier.broadcast();
        Ok(())
    }

    /// Collects the live, enabled watches, forgetting watches of dropped devices.
    fn snapshot(&self) -> Result<Snapshot> {
        let mut interest = self.inner.interest.lock();
        if interest.closed {
            return Err(EBADF);
        }

        let mut members = Vec::with_capacity(interest.watches.len());
        interest.watches.retain(|&fd, watch| match watch.target.upgrade() {
            None => false,
            Some(device) => {
                if !watch.disabled {
                    members.push(Member {
                        fd,
                        device,
                        host: watch.host,
                        events: watch.events,
                        data: watch.data,
                    });
                }
                true
            }
        });
        Ok(Snapshot {
            members,
            host: interest.host.clone(),
            revision: interest.revision,
        })
    }

    /// Delivers the events of ready members, at most `maxevents`.
    fn collect(&self, members: &[Member], maxevents: usize) -> Vec<Event> {
        let mut events = Vec::new();
        for member in members {
            if events.len() == maxevents {
                break;
            }
            let ready = member.device.ready_state().unwrap_or_default();
            let hits = ready & (member.events | Events::ALWAYS);
            if hits.is_empty() {
                continue;
            }

            if member.host {
                member.device.consume_ready(hits);
            }
            if member.events.contains(Events::ONESHOT) {
                if let Some(watch) = self.inner.interest.lock().watches.get_mut(&member.fd) {
                    watch.disabled = true;
                }
            }
            events.push(Event::new(hits, member.data));
        }
        events
    }

    /// Waits on the host, feeding results into the members. Returns whether any arrived.
    fn poll_host(&self, snapshot: &Snapshot, maxevents: usize, timeout: c_int) -> Result<bool> {
        let Some(host) = &snapshot.host else {
            return Ok(false);
        };
        let epfd = host.get()?;
        let delivered = self.inner.link.execute(call::Wait {
            epfd,
            maxevents,
            timeout,
        })?;

        let mut fed = false;
        for event in delivered {
            let member = snapshot
                .members
                .iter()
                .find(|m| m.host && m.fd as u64 == event.data);
            if let Some(member) = member {
                fed |= member.device.notify(event.events()).is_ok();
            }
        }
        if fed {
            self.inner.notifier.broadcast();
        }
        Ok(fed)
    }

    pub fn wait(&self, maxevents: usize, timeout: c_int) -> Result<Vec<Event>> {
        if maxevents == 0 || maxevents > MAX_EVENTS {
            return Err(EINVAL);
        }
        let deadline = deadline(timeout);
        let _waiting = Waiting::enter(&self.inner.waiters);

        loop {
            let snapshot = self.snapshot()?;
            let events = self.collect(&snapshot.members, maxevents);
            if !events.is_empty() {
                return Ok(events);
            }

            let host = snapshot.members.iter().any(|m| m.host);
            let enclave = snapshot.members.iter().any(|m| !m.host);
            if host {
                let timeout = if enclave { 0 } else { remaining(deadline) };
                if self.poll_host(&snapshot, maxevents, timeout)? {
                    continue;
                }
            }
            if expired(deadline) {
                return Ok(Vec::new());
            }

            let until = match host {
                false => deadline,
                true => {
                    let slice = Instant::now() + MIXED_SLICE;
                    Some(deadline.map_or(slice, |deadline| deadline.min(slice)))
                }
            };
            let outcome = self.inner.notifier.wait_until(until, || {
                {
                    let interest = self.inner.interest.lock();
                    if interest.closed || interest.revision != snapshot.revision {
                        return Some(Outcome::Changed);
                    }
                }
                let events = self.collect(&snapshot.members, maxevents);
                (!events.is_empty()).then_some(Outcome::Ready(events))
            });
            if let Some(Outcome::Ready(events)) = outcome {
                return Ok(events);
            }
        }
    }

    pub fn close(&self) -> Result<()> {
        let host = {
            let mut interest = self.inner.interest.lock();
            if interest.closed {
                return Err(EBADF);
            }
            interest.closed = true;
            interest.revision += 1;
            interest.watches.clear();
            interest.host.take()
        };
        self.inner.notifier.broadcast();
        match host {
            Some(host) => host.close(),
            None => Ok(()),
        }
    }

    pub fn shutdown(&self, _how: c_int) -> Result<()> {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{encfs, encsock};
    use crate::testing::{link, Recorder};

    use std::thread;

    use libc::{AF_INET, SOCK_STREAM};
    use postern::item::epoll::Op;

    struct Fixture {
        stack: Arc<encsock::Stack>,
        host: Arc<Recorder>,
        epoll: Device,
    }

    impl Fixture {
        fn new() -> Self {
            let notifier = Arc::new(Notifier::new());
            let host = Arc::new(Recorder::default());
            let template = Device::epoll(link(host.clone()), notifier.clone());
            Self {
                stack: Arc::new(encsock::Stack::new(notifier.clone())),
                epoll: template.epoll_create1(0).unwrap(),
                host,
            }
        }

        fn listener(&self) -> (Arc<Device>, std::net::SocketAddr) {
            let sockets = Device::enclave_sockets(self.stack.clone());
            let listener = sockets.socket(AF_INET, SOCK_STREAM, 0).unwrap();
            listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
            listener.listen(4).unwrap();
            let addr = listener.getsockname().unwrap().unwrap();
            (Arc::new(listener), addr)
        }

        fn connect(&self, addr: std::net::SocketAddr) -> Device {
            let sockets = Device::enclave_sockets(self.stack.clone());
            let client = sockets.socket(AF_INET, SOCK_STREAM, 0).unwrap();
            client.connect(addr).unwrap();
            client
        }
    }

    #[test]
    fn create_flags() {
        let host = Arc::new(Recorder::default());
        let template = Device::epoll(link(host.clone()), Arc::new(Notifier::new()));
        assert_eq!(template.epoll_create(0).map(|_| ()), Err(EINVAL));
        assert_eq!(template.epoll_create1(1).map(|_| ()), Err(EINVAL));
        let epoll = template.epoll_create1(EPOLL_CLOEXEC).unwrap();
        assert_eq!(epoll.epoll_state(), Ok(State::Created));
        assert!(host.ops().is_empty());

        template.shutdown(0).unwrap();
        assert_eq!(
            host.ops(),
            [(Family::Epoll, Op::ShutdownDevice as usize, postern::NULL)]
        );
    }

    #[test]
    fn state_machine() {
        let fx = Fixture::new();
        let (listener, _) = fx.listener();
        let event = Some(Event::new(Events::IN, 7));

        fx.epoll.epoll_ctl(CtlOp::Add, 7, &listener, event).unwrap();
        assert_eq!(fx.epoll.epoll_state(), Ok(State::Armed));
        assert_eq!(fx.epoll.epoll_ctl(CtlOp::Add, 7, &listener, event), Err(EEXIST));
        assert_eq!(fx.epoll.epoll_ctl(CtlOp::Mod, 8, &listener, event), Err(ENOENT));
        assert_eq!(fx.epoll.epoll_ctl(CtlOp::Add, 9, &listener, None), Err(EINVAL));

        fx.epoll.epoll_ctl(CtlOp::Del, 7, &listener, None).unwrap();
        assert_eq!(fx.epoll.epoll_state(), Ok(State::Created));

        fx.epoll.close().unwrap();
        assert_eq!(fx.epoll.epoll_state(), Ok(State::Closed));
        assert_eq!(fx.epoll.close(), Err(EBADF));
        assert_eq!(fx.epoll.epoll_wait(1, 0), Err(EBADF));
        assert_eq!(fx.epoll.epoll_ctl(CtlOp::Add, 7, &listener, event), Err(EBADF));
    }

    #[test]
    fn rejects_files() {
        let fx = Fixture::new();
        let volume = Arc::new(encfs::Volume::new(Arc::new(encfs::NullSealer)));
        let file = Device::enclave_filesystem(volume)
            .open("/f", libc::O_CREAT | libc::O_RDWR, 0o600)
            .unwrap();
        let event = Some(Event::new(Events::IN, 0));
        assert_eq!(
            fx.epoll.epoll_ctl(CtlOp::Add, 3, &Arc::new(file), event),
            Err(EPERM)
        );
        assert_eq!(fx.epoll.epoll_wait(0, 0), Err(EINVAL));
        assert_eq!(fx.epoll.epoll_wait(MAX_EVENTS + 1, 0), Err(EINVAL));
    }

    #[test]
    fn enclave_readiness() {
        let fx = Fixture::new();
        let (listener, addr) = fx.listener();
        fx.epoll
            .epoll_ctl(CtlOp::Add, 3, &listener, Some(Event::new(Events::IN, 33)))
            .unwrap();
        assert_eq!(fx.epoll.epoll_wait(8, 0), Ok(vec![]));

        let client = fx.connect(addr);
        let events = fx.epoll.epoll_wait(8, -1).unwrap();
        assert_eq!(events, vec![Event::new(Events::IN, 33)]);

        // Level-triggered until accepted.
        assert_eq!(fx.epoll.epoll_wait(8, 0).unwrap().len(), 1);
        let (server, _) = listener.accept(0).unwrap();
        assert_eq!(fx.epoll.epoll_wait(8, 0), Ok(vec![]));

        let server = Arc::new(server);
        fx.epoll
            .epoll_ctl(
                CtlOp::Add,
                4,
                &server,
                Some(Event::new(Events::IN | Events::ONESHOT, 44)),
            )
            .unwrap();
        client.write(b"ping").unwrap();
        assert_eq!(
            fx.epoll.epoll_wait(8, 10),
            Ok(vec![Event::new(Events::IN, 44)])
        );
        assert_eq!(fx.epoll.epoll_wait(8, 0), Ok(vec![]));

        fx.epoll
            .epoll_ctl(CtlOp::Mod, 4, &server, Some(Event::new(Events::IN, 45)))
            .unwrap();
        assert_eq!(
            fx.epoll.epoll_wait(8, 0),
            Ok(vec![Event::new(Events::IN, 45)])
        );
    }

    #[test]
    fn wakes_waiter() {
        let fx = Arc::new(Fixture::new());
        let (listener, addr) = fx.listener();
        fx.epoll
            .epoll_ctl(CtlOp::Add, 3, &listener, Some(Event::new(Events::IN, 3)))
            .unwrap();

        let waiter = {
            let fx = fx.clone();
            thread::spawn(move || fx.epoll.epoll_wait(4, 5_000))
        };

        for _ in 0..500 {
            if fx.epoll.epoll_state() == Ok(State::Waiting) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(fx.epoll.epoll_state(), Ok(State::Waiting));

        let _client = fx.connect(addr);
        assert_eq!(
            waiter.join().unwrap(),
            Ok(vec![Event::new(Events::IN, 3)])
        );
        assert_eq!(fx.epoll.epoll_state(), Ok(State::Armed));
    }

    #[test]
    fn forgets_dropped_devices() {
        let fx = Fixture::new();
        let (listener, _) = fx.listener();
        fx.epoll
            .epoll_ctl(CtlOp::Add, 3, &listener, Some(Event::new(Events::IN, 3)))
            .unwrap();
        drop(listener);
        assert_eq!(fx.epoll.epoll_wait(1, 0), Ok(vec![]));
        assert_eq!(fx.epoll.epoll_state(), Ok(State::Created));
    }

    #[test]
    fn host_members() {
        let fx = Fixture::new();
        let stdout = Arc::new(Device::host_stdio(link(fx.host.clone()), 1));

        fx.epoll
            .epoll_ctl(CtlOp::Add, 1, &stdout, Some(Event::new(Events::OUT, 1)))
            .unwrap();
        assert_eq!(fx.epoll.epoll_wait(4, 0), Ok(vec![]));

        stdout.notify(Events::OUT).unwrap();
        assert_eq!(
            fx.epoll.epoll_wait(4, 0),
            Ok(vec![Event::new(Events::OUT, 1)])
        );
        // Host-reported readiness is consumed by delivery.
        assert_eq!(stdout.ready_state(), Ok(Events::empty()));

        fx.epoll.close().unwrap();
        let ops: Vec<_> = fx.host.ops().into_iter().map(|(_, op, _)| op).collect();
        assert_eq!(
            ops,
            [
                Op::Create1 as usize,
                Op::CtlAdd as usize,
                Op::Wait as usize,
                Op::Close as usize
            ]
        );
    }
}
