// SPDX-License-Identifier: Apache-2.0

//! Name resolvers
//!
//! The enclave resolver answers from numeric addresses, `localhost` and the configured
//! static entries without leaving the enclave. The host resolver forwards to the host.

use crate::config::HostEntry;
use crate::link::HostLink;

use core::ffi::c_int;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use libc::{
    AF_INET, AF_INET6, AF_UNSPEC, AI_ADDRCONFIG, AI_ALL, AI_CANONNAME, AI_NUMERICHOST,
    AI_NUMERICSERV, AI_PASSIVE, AI_V4MAPPED, EAFNOSUPPORT, EILSEQ, EINVAL, ENOENT,
    ESOCKTNOSUPPORT, IPPROTO_TCP, IPPROTO_UDP, NI_DGRAM, NI_NAMEREQD, NI_NOFQDN, NI_NUMERICHOST,
    NI_NUMERICSERV, SOCK_DGRAM, SOCK_STREAM,
};
use postern::guest::call::resolver;
use postern::guest::AddrInfoList;
use postern::item::resolver::Hints;
use postern::Result;

/// Static entries of the enclave resolver
pub type Hosts = Vec<HostEntry>;

const AI_KNOWN: c_int = AI_PASSIVE
    | AI_CANONNAME
    | AI_NUMERICHOST
    | AI_NUMERICSERV
    | AI_V4MAPPED
    | AI_ALL
    | AI_ADDRCONFIG;

const NI_KNOWN: c_int = NI_NUMERICHOST | NI_NUMERICSERV | NI_NOFQDN | NI_NAMEREQD | NI_DGRAM;

const LOCALHOST: &str = "localhost";

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| EILSEQ)
}

/// The host resolver.
#[derive(Clone, Debug)]
pub(crate) struct HostResolver {
    link: Arc<HostLink>,
}

impl HostResolver {
    pub fn new(link: Arc<HostLink>) -> Self {
        Self { link }
    }

    pub fn getaddrinfo(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: Option<&Hints>,
    ) -> Result<AddrInfoList> {
        self.link.execute(resolver::Getaddrinfo {
            node: node.map(str::as_bytes),
            service: service.map(str::as_bytes),
            hints: hints.copied(),
        })
    }

    pub fn getnameinfo(&self, addr: SocketAddr, flags: c_int) -> Result<(String, String)> {
        let (host, serv) = self.link.execute(resolver::Getnameinfo { addr, flags })?;
        Ok((utf8(host)?, utf8(serv)?))
    }

    /// Releases the resolver state the host keeps for this side.
    pub fn shutdown(&self, _how: c_int) -> Result<()> {
        self.link.execute(resolver::Shutdown)
    }
}

/// The enclave resolver.
#[derive(Clone, Debug)]
pub(crate) struct EncResolver {
    hosts: Arc<Hosts>,
}

impl EncResolver {
    pub fn new(hosts: Hosts) -> Self {
        Self {
            hosts: Arc::new(hosts),
        }
    }

    /// Returns the addresses `name` resolves to, in order.
    fn lookup(&self, name: &str) -> Vec<IpAddr> {
        if name.eq_ignore_ascii_case(LOCALHOST) {
            return vec![Ipv4Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into()];
        }
        self.hosts
            .iter()
            .filter(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.addr)
            .collect()
    }

    /// Returns the name `addr` resolves back to.
    fn reverse(&self, addr: IpAddr) -> Option<String> {
        if addr.is_loopback() {
            return Some(LOCALHOST.into());
        }
        self.hosts
            .iter()
            .find(|entry| entry.addr == addr)
            .map(|entry| entry.name.clone())
    }

    pub fn getaddrinfo(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: Option<&Hints>,
    ) -> Result<AddrInfoList> {
        if node.is_none() && service.is_none() {
            return Err(ENOENT);
        }
        let hints = hints.copied().unwrap_or_default();
        if hints.flags & !AI_KNOWN != 0 {
            return Err(EINVAL);
        }
        let family = hints.family;
        if family != AF_UNSPEC && family != AF_INET && family != AF_INET6 {
            return Err(EAFNOSUPPORT);
        }
        let socktypes: &[c_int] = match hints.socktype {
            0 => &[SOCK_STREAM, SOCK_DGRAM],
            SOCK_STREAM => &[SOCK_STREAM],
            SOCK_DGRAM => &[SOCK_DGRAM],
            _ => return Err(ESOCKTNOSUPPORT),
        };

        let port = match service {
            None => 0,
            Some(service) => service.parse::<u16>().map_err(|_| ENOENT)?,
        };

        let addrs = match node {
            None if hints.flags & AI_PASSIVE != 0 => {
                vec![Ipv4Addr::UNSPECIFIED.into(), Ipv6Addr::UNSPECIFIED.into()]
            }
            None => vec![Ipv4Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into()],
            Some(node) => match node.parse::<IpAddr>() {
                Ok(addr) => vec![addr],
                Err(_) if hints.flags & AI_NUMERICHOST != 0 => return Err(ENOENT),
                Err(_) => self.lookup(node),
            },
        };

        let mut selected: Vec<IpAddr> = addrs
            .iter()
            .copied()
            .filter(|addr| match family {
                AF_INET => addr.is_ipv4(),
                AF_INET6 => addr.is_ipv6(),
                _ => true,
            })
            .collect();
        if family == AF_INET6 && hints.flags & AI_V4MAPPED != 0 {
            let mapped = addrs.iter().filter_map(|addr| match addr {
                IpAddr::V4(v4) => Some(IpAddr::V6(v4.to_ipv6_mapped())),
                IpAddr::V6(_) => None,
            });
            if selected.is_empty() || hints.flags & AI_ALL != 0 {
                selected.extend(mapped);
            }
        }
        if selected.is_empty() {
            return Err(ENOENT);
        }

        let entries = selected.into_iter().flat_map(|ip| {
            socktypes.iter().map(move |&socktype| {
                let protocol = match (hints.protocol, socktype) {
                    (0, SOCK_STREAM) => IPPROTO_TCP,
                    (0, _) => IPPROTO_UDP,
                    (protocol, _) => protocol,
                };
                (SocketAddr::new(ip, port), socktype, protocol)
            })
        });
        let canonname = match node {
            Some(node) if hints.flags & AI_CANONNAME != 0 => Some(node.as_bytes()),
            _ => None,
        };
        Ok(AddrInfoList::build(entries, canonname))
    }

    pub fn getnameinfo(&self, addr: SocketAddr, flags: c_int) -> Result<(String, String)> {
        if flags & !NI_KNOWN != 0 {
            return Err(EINVAL);
        }

        let host = match flags & NI_NUMERICHOST {
            0 => self.reverse(addr.ip()),
            _ => None,
        };
        let host = match host {
            Some(name) if flags & NI_NOFQDN != 0 => match name.split_once('.') {
                Some((short, _)) => short.into(),
                None => name,
            },
            Some(name) => name,
            None if flags & NI_NAMEREQD != 0 => return Err(ENOENT),
            None => addr.ip().to_string(),
        };
        Ok((host, addr.port().to_string()))
    }
}
