// SPDX-License-Identifier: Apache-2.0

//! Owned address info chains.
//!
//! The host answers `getaddrinfo` with a chain of [`AddrInfo`] records, whose `addr`,
//! `canonname` and `next` fields are byte offsets into the output region. [`AddrInfoList`]
//! copies that region into its own buffer and keeps only ranges into the copy, which are
//! validated once at decode time. Nothing host-relative survives decoding.

use crate::item::resolver::{AddrInfo, MAX_ADDRINFO};
use crate::item::socket::{decode_addr, encode_addr, SOCKADDR_SIZE};
use crate::plain::Plain;
use crate::{Result, NULL};

use core::mem::size_of;
use core::ops::Range;
use std::net::SocketAddr;

use libc::EFAULT;
use tracing::error;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    flags: i32,
    family: i32,
    socktype: i32,
    protocol: i32,
    addr: Option<Range<usize>>,
    canonname: Option<Range<usize>>,
    next: Option<usize>,
}

/// Enclave-owned copy of an address info chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddrInfoList {
    buf: Vec<u8>,
    entries: Vec<Entry>,
}

/// Borrowed view of one record of an [`AddrInfoList`].
#[derive(Clone, Copy, Debug)]
pub struct AddrInfoRef<'a> {
    list: &'a AddrInfoList,
    entry: &'a Entry,
}

impl<'a> AddrInfoRef<'a> {
    #[inline]
    pub fn flags(&self) -> i32 {
        self.entry.flags
    }

    #[inline]
    pub fn family(&self) -> i32 {
        self.entry.family
    }

    #[inline]
    pub fn socktype(&self) -> i32 {
        self.entry.socktype
    }

    #[inline]
    pub fn protocol(&self) -> i32 {
        self.entry.protocol
    }

    /// Returns the raw socket address bytes, as a slice of the list's own buffer.
    #[inline]
    pub fn addr_bytes(&self) -> Option<&'a [u8]> {
        self.entry.addr.clone().map(|r| &self.list.buf[r])
    }

    /// Returns the decoded socket address, if it is of a supported family.
    #[inline]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addr_bytes().and_then(|b| decode_addr(b).ok())
    }

    /// Returns the canonical name without its terminating NUL byte.
    #[inline]
    pub fn canonname(&self) -> Option<&'a [u8]> {
        self.entry.canonname.clone().map(|r| &self.list.buf[r])
    }
}

/// Iterator following the `next` links of an [`AddrInfoList`].
#[derive(Clone, Debug)]
pub struct Iter<'a> {
    list: &'a AddrInfoList,
    next: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = AddrInfoRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.list.entries.get(self.next?)?;
        self.next = entry.next;
        Some(AddrInfoRef {
            list: self.list,
            entry,
        })
    }
}

fn invalid<T>(what: &str, value: u64) -> Result<T> {
    error!(value, "host returned invalid address info {what}");
    Err(EFAULT)
}

/// Checks a host-written offset and length against a buffer of `len` bytes.
fn range(offset: u64, size: usize, len: usize) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(size)?;
    (end <= len).then_some(start..end)
}

impl AddrInfoList {
    /// Decodes the chain starting at offset `head` of the host-written `region`.
    ///
    /// `head` equal to [`NULL`] yields an empty list. Every offset and length is checked
    /// against `region`, chains are bounded by [`MAX_ADDRINFO`] records and cycles are
    /// rejected. Any violation fails with [`EFAULT`].
    pub fn decode(region: &[u8], head: usize) -> Result<Self> {
        let buf = region.to_vec();
        let mut entries: Vec<Entry> = Vec::new();
        let mut visited: Vec<u64> = Vec::new();
        let mut next = head as u64;

        while next != NULL as u64 {
            if visited.contains(&next) {
                return invalid("cycle", next);
            }
            if visited.len() == MAX_ADDRINFO {
                return invalid("chain length", visited.len() as _);
            }
            visited.push(next);

            let record = match range(next, size_of::<AddrInfo>(), buf.len()) {
                Some(record) => record,
                None => return invalid("record offset", next),
            };
            let ai = match AddrInfo::read_from(&buf[record]) {
                Some(ai) => ai,
                None => return invalid("record offset", next),
            };

            let addr = match ai.addr {
                a if a == NULL as u64 => None,
                _ if ai.addrlen as usize > SOCKADDR_SIZE => {
                    return invalid("address length", ai.addrlen as _)
                }
                a => match range(a, ai.addrlen as _, buf.len()) {
                    Some(r) => Some(r),
                    None => return invalid("address offset", a),
                },
            };

            let canonname = match ai.canonname {
                c if c == NULL as u64 => None,
                c => {
                    let start = match range(c, 0, buf.len()) {
                        Some(r) => r.start,
                        None => return invalid("canonical name offset", c),
                    };
                    match buf[start..].iter().position(|b| *b == 0) {
                        Some(len) => Some(start..start + len),
                        None => return invalid("canonical name", c),
                    }
                }
            };

            let index = entries.len();
            if let Some(last) = entries.last_mut() {
                last.next = Some(index);
            }
            entries.push(Entry {
                flags: ai.flags,
                family: ai.family,
                socktype: ai.socktype,
                protocol: ai.protocol,
                addr,
                canonname,
                next: None,
            });
            next = ai.next;
        }

        Ok(Self { buf, entries })
    }

    /// Builds a list out of resolved addresses, attaching `canonname` to the first record.
    ///
    /// Each item is `(addr, socktype, protocol)`.
    pub fn build(
        addrs: impl IntoIterator<Item = (SocketAddr, i32, i32)>,
        canonname: Option<&[u8]>,
    ) -> Self {
        let mut list = Self::default();
        for (addr, socktype, protocol) in addrs {
            let (bytes, len) = encode_addr(&addr);
            let start = list.buf.len();
            list.buf.extend_from_slice(&bytes[..len]);

            let canonname = match canonname {
                Some(name) if list.entries.is_empty() => {
                    let start = list.buf.len();
                    list.buf.extend_from_slice(name);
                    list.buf.push(0);
                    Some(start..start + name.len())
                }
                _ => None,
            };

            let index = list.entries.len();
            if let Some(last) = list.entries.last_mut() {
                last.next = Some(index);
            }
            list.entries.push(Entry {
                flags: 0,
                family: match addr {
                    SocketAddr::V4(_) => libc::AF_INET,
                    SocketAddr::V6(_) => libc::AF_INET6,
                },
                socktype,
                protocol,
                addr: Some(start..start + len),
                canonname,
                next: None,
            });
        }
        list
    }

    /// Returns an iterator walking the chain from its head.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            next: (!self.entries.is_empty()).then_some(0),
        }
    }

    /// Returns the number of records in the chain.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the buffer all records refer into.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl<'a> IntoIterator for &'a AddrInfoList {
    type Item = AddrInfoRef<'a>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(addr: u64, addrlen: u32, canonname: u64, next: u64) -> AddrInfo {
        AddrInfo {
            flags: 0,
            family: libc::AF_INET,
            socktype: libc::SOCK_STREAM,
            protocol: 0,
            addrlen,
            reserved: 0,
            addr,
            canonname,
            next,
        }
    }

    fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    const NIL: u64 = NULL as u64;

    #[test]
    fn empty() {
        let list = AddrInfoList::decode(&[0; 64], NULL).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn chain() {
        let addrs: [SocketAddr; 3] = [
            "10.0.0.1:80".parse().unwrap(),
            "[::1]:443".parse().unwrap(),
            "192.0.2.9:53".parse().unwrap(),
        ];
        let mut region = vec![0u8; 320];

        // Records out of order: 208 -> 0 -> 104.
        let (bytes, len) = encode_addr(&addrs[0]);
        put(&mut region, 256, &bytes[..len]);
        put(&mut region, 280, b"chain.test\0");
        put(&mut region, 208, record(256, len as _, 280, 0).as_bytes());

        let (bytes, len) = encode_addr(&addrs[1]);
        put(&mut region, 48, &bytes[..len]);
        let mut second = record(48, len as _, NIL, 104);
        second.family = libc::AF_INET6;
        put(&mut region, 0, second.as_bytes());

        let (bytes, len) = encode_addr(&addrs[2]);
        put(&mut region, 152, &bytes[..len]);
        put(&mut region, 104, record(152, len as _, NIL, NIL).as_bytes());

        let list = AddrInfoList::decode(&region, 208).unwrap();
        drop(region);

        let entries: Vec<_> = list.iter().collect();
        assert_eq!(entries.len(), 3);
        for (entry, addr) in entries.iter().zip(addrs) {
            assert_eq!(entry.socket_addr(), Some(addr));
        }
        assert_eq!(entries[0].canonname(), Some(&b"chain.test"[..]));
        assert_eq!(entries[1].canonname(), None);
        assert_eq!(entries[1].family(), libc::AF_INET6);
    }

    #[test]
    fn out_of_bounds() {
        let mut buf = vec![0u8; 128];

        // Record does not fit.
        assert_eq!(AddrInfoList::decode(&buf, 100).unwrap_err(), EFAULT);

        // Address beyond the region.
        put(&mut buf, 0, record(120, 16, NIL, NIL).as_bytes());
        assert_eq!(AddrInfoList::decode(&buf, 0).unwrap_err(), EFAULT);

        // Address length beyond a socket address.
        put(
            &mut buf,
            0,
            record(48, SOCKADDR_SIZE as u32 + 1, NIL, NIL).as_bytes(),
        );
        assert_eq!(AddrInfoList::decode(&buf, 0).unwrap_err(), EFAULT);

        // Canonical name without NUL.
        buf[48..].fill(b'a');
        put(&mut buf, 0, record(NIL, 0, 48, NIL).as_bytes());
        assert_eq!(AddrInfoList::decode(&buf, 0).unwrap_err(), EFAULT);

        // Offsets that overflow.
        put(&mut buf, 0, record(u64::MAX - 1, 16, NIL, NIL).as_bytes());
        assert_eq!(AddrInfoList::decode(&buf, 0).unwrap_err(), EFAULT);
    }

    #[test]
    fn cycle() {
        let mut buf = vec![0u8; 96];
        put(&mut buf, 0, record(NIL, 0, NIL, 48).as_bytes());
        put(&mut buf, 48, record(NIL, 0, NIL, 0).as_bytes());
        assert_eq!(AddrInfoList::decode(&buf, 0).unwrap_err(), EFAULT);

        put(&mut buf, 48, record(NIL, 0, NIL, 48).as_bytes());
        assert_eq!(AddrInfoList::decode(&buf, 0).unwrap_err(), EFAULT);
    }

    #[test]
    fn too_long() {
        let size = size_of::<AddrInfo>();
        let mut buf = vec![0u8; size * (MAX_ADDRINFO + 1)];
        for i in 0..=MAX_ADDRINFO {
            let next = if i == MAX_ADDRINFO {
                NIL
            } else {
                ((i + 1) * size) as u64
            };
            put(&mut buf, i * size, record(NIL, 0, NIL, next).as_bytes());
        }
        assert_eq!(AddrInfoList::decode(&buf, 0).unwrap_err(), EFAULT);
        assert_eq!(
            AddrInfoList::decode(&buf, size).map(|l| l.len()),
            Ok(MAX_ADDRINFO)
        );
    }

    #[test]
    fn build() {
        let addrs: [(SocketAddr, i32, i32); 2] = [
            ("10.0.0.1:80".parse().unwrap(), libc::SOCK_STREAM, 0),
            ("[::1]:80".parse().unwrap(), libc::SOCK_DGRAM, 0),
        ];
        let list = AddrInfoList::build(addrs, Some(&b"example.test"[..]));
        let entries: Vec<_> = list.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].canonname(), Some(&b"example.test"[..]));
        assert_eq!(entries[0].socket_addr(), Some(addrs[0].0));
        assert_eq!(entries[1].canonname(), None);
        assert_eq!(entries[1].family(), libc::AF_INET6);
        assert_eq!(entries[1].socket_addr(), Some(addrs[1].0));
    }
}
