//! rtnetlink wire decoding.
//!
//! Turns raw netlink datagrams into canonical [`NetlinkEvent`] values. A
//! datagram may carry several netlink messages; each is length-checked once,
//! then fixed-width reads use unchecked unaligned loads. Netlink is
//! host-byte-order, so all reads are native-endian.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use super::event::{AttrMap, EventKind, NetlinkEvent, ATTR_UNSET};

/// Netlink message header size (`struct nlmsghdr`).
const NLMSG_HDR_SIZE: usize = 16;
/// Route message header size (`struct rtmsg`).
const RTMSG_SIZE: usize = 12;
/// Traffic-control message header size (`struct tcmsg`).
const TCMSG_SIZE: usize = 20;
/// Attribute header size (`struct rtattr`).
const RTA_HDR_SIZE: usize = 4;

// Attribute types from linux/rtnetlink.h.
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RTA_PRIORITY: u16 = 6;
const RTA_PREFSRC: u16 = 7;
const TCA_KIND: u16 = 1;

/// Errors raised while decoding a netlink message.
///
/// These are soft from the monitor's point of view: a bad message is logged
/// at debug level and skipped, the stream keeps flowing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("netlink message too short: {size} bytes")]
    Truncated { size: usize },

    #[error("message length {claimed} exceeds datagram remainder {avail}")]
    BadLength { claimed: usize, avail: usize },

    #[error("reading {what}: unexpected end of data")]
    PayloadTruncated { what: &'static str },
}

/// Resolves an interface index to its name.
///
/// Injected so the decoder stays a pure function of its input in tests; the
/// production resolver asks the OS.
pub type IfNameResolver = fn(u32) -> String;

/// Resolve an interface index via `if_indextoname(3)`, falling back to
/// `if<N>` when the index is unknown (e.g. the device was already deleted).
pub fn resolve_ifname(ifindex: u32) -> String {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    // SAFETY: buf is IF_NAMESIZE bytes, as if_indextoname requires.
    let ret = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr().cast::<libc::c_char>()) };
    if ret.is_null() {
        return format!("if{ifindex}");
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Stateless decoder for rtnetlink datagrams.
#[derive(Clone, Copy)]
pub struct Classifier {
    resolve: IfNameResolver,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// Classifier backed by the OS interface-name lookup.
    pub fn new() -> Self {
        Self {
            resolve: resolve_ifname,
        }
    }

    /// Classifier with an injected interface-name resolver (tests).
    pub fn with_resolver(resolve: IfNameResolver) -> Self {
        Self { resolve }
    }

    /// Decode every message in a datagram, in kernel order.
    ///
    /// Unknown message types are skipped; malformed messages are logged at
    /// debug and skipped; `noqueue` qdisc events are filtered out here so
    /// they never reach the session state machine.
    pub fn classify_datagram(&self, data: &[u8], timestamp_ms: i64) -> Vec<NetlinkEvent> {
        let mut events = Vec::new();
        let mut rest = data;

        while rest.len() >= NLMSG_HDR_SIZE {
            let msg_len = read_u32_ne(rest, 0) as usize;
            if msg_len < NLMSG_HDR_SIZE {
                tracing::debug!(msg_len, "netlink message claims impossible length");
                break;
            }
            if msg_len > rest.len() {
                tracing::debug!(
                    error = %ParseError::BadLength { claimed: msg_len, avail: rest.len() },
                    "skipping truncated netlink datagram tail",
                );
                break;
            }

            match self.classify_message(&rest[..msg_len], timestamp_ms) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "netlink message parse error"),
            }

            let advance = nlmsg_align(msg_len);
            if advance >= rest.len() {
                break;
            }
            rest = &rest[advance..];
        }

        events
    }

    /// Decode a single netlink message (header included).
    ///
    /// Returns `Ok(None)` for message types the monitor does not observe and
    /// for filtered events (`noqueue` qdiscs).
    fn classify_message(
        &self,
        msg: &[u8],
        timestamp_ms: i64,
    ) -> Result<Option<NetlinkEvent>, ParseError> {
        if msg.len() < NLMSG_HDR_SIZE {
            return Err(ParseError::Truncated { size: msg.len() });
        }

        let msg_type = read_u16_ne(msg, 4);
        let Some(kind) = EventKind::from_nlmsg_type(msg_type) else {
            return Ok(None);
        };

        let payload = &msg[NLMSG_HDR_SIZE..];
        let attrs = if kind.is_route() {
            self.parse_route_payload(payload)?
        } else {
            let attrs = self.parse_qdisc_payload(payload)?;
            // noqueue is the kernel's default no-op qdisc; it says nothing
            // about disturbances and would otherwise fire on every link flap.
            if attrs.get("kind").is_some_and(|k| k == "noqueue") {
                tracing::trace!(kind = %kind, "dropping noqueue qdisc event");
                return Ok(None);
            }
            attrs
        };

        Ok(Some(NetlinkEvent {
            timestamp_ms,
            kind,
            attrs,
        }))
    }

    /// Decode an `rtmsg` payload plus attributes into the canonical map.
    fn parse_route_payload(&self, payload: &[u8]) -> Result<AttrMap, ParseError> {
        if payload.len() < RTMSG_SIZE {
            return Err(ParseError::PayloadTruncated { what: "rtmsg" });
        }

        let family = read_u8(payload, 0);
        let dst_len = read_u8(payload, 1);

        let mut attrs = AttrMap::new();
        attrs.insert("family".to_string(), family.to_string());
        attrs.insert("table".to_string(), read_u8(payload, 4).to_string());
        attrs.insert(
            "protocol".to_string(),
            route_protocol_name(read_u8(payload, 5)),
        );
        attrs.insert("scope".to_string(), route_scope_name(read_u8(payload, 6)));
        attrs.insert("type".to_string(), route_type_name(read_u8(payload, 7)));

        for (rta_type, data) in AttrIter::new(&payload[RTMSG_SIZE..]) {
            match rta_type {
                RTA_DST => {
                    let addr = ip_to_string(data, family);
                    let value = if addr == ATTR_UNSET {
                        addr
                    } else {
                        format!("{addr}/{dst_len}")
                    };
                    attrs.insert("dst".to_string(), value);
                }
                RTA_GATEWAY => {
                    attrs.insert("gateway".to_string(), ip_to_string(data, family));
                }
                RTA_PREFSRC => {
                    attrs.insert("prefsrc".to_string(), ip_to_string(data, family));
                }
                RTA_OIF => {
                    if data.len() >= 4 {
                        let ifindex = read_u32_ne(data, 0);
                        attrs.insert("ifindex".to_string(), ifindex.to_string());
                        attrs.insert("interface".to_string(), (self.resolve)(ifindex));
                    }
                }
                RTA_PRIORITY => {
                    if data.len() >= 4 {
                        attrs.insert("priority".to_string(), read_u32_ne(data, 0).to_string());
                    }
                }
                _ => {}
            }
        }

        // A route without RTA_DST is the default route.
        attrs
            .entry("dst".to_string())
            .or_insert_with(|| "default".to_string());
        attrs
            .entry("gateway".to_string())
            .or_insert_with(|| ATTR_UNSET.to_string());
        attrs
            .entry("interface".to_string())
            .or_insert_with(|| ATTR_UNSET.to_string());

        Ok(attrs)
    }

    /// Decode a `tcmsg` payload plus attributes into the canonical map.
    fn parse_qdisc_payload(&self, payload: &[u8]) -> Result<AttrMap, ParseError> {
        if payload.len() < TCMSG_SIZE {
            return Err(ParseError::PayloadTruncated { what: "tcmsg" });
        }

        let ifindex = read_u32_ne(payload, 4);

        let mut attrs = AttrMap::new();
        attrs.insert("family".to_string(), read_u8(payload, 0).to_string());
        attrs.insert("ifindex".to_string(), ifindex.to_string());
        attrs.insert("interface".to_string(), (self.resolve)(ifindex));
        attrs.insert("handle".to_string(), read_u32_ne(payload, 8).to_string());
        attrs.insert("parent".to_string(), read_u32_ne(payload, 12).to_string());

        for (rta_type, data) in AttrIter::new(&payload[TCMSG_SIZE..]) {
            if rta_type == TCA_KIND {
                let kind = cstr_to_string(data);
                attrs.insert(
                    "is_netem".to_string(),
                    if kind == "netem" { "true" } else { "false" }.to_string(),
                );
                attrs.insert("kind".to_string(), kind);
            }
        }

        attrs
            .entry("kind".to_string())
            .or_insert_with(|| "unknown".to_string());
        attrs
            .entry("is_netem".to_string())
            .or_insert_with(|| "false".to_string());

        Ok(attrs)
    }
}

/// Iterator over `rtattr` entries in an attribute block.
struct AttrIter<'a> {
    rest: &'a [u8],
}

impl<'a> AttrIter<'a> {
    fn new(block: &'a [u8]) -> Self {
        Self { rest: block }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < RTA_HDR_SIZE {
            return None;
        }

        let rta_len = read_u16_ne(self.rest, 0) as usize;
        let rta_type = read_u16_ne(self.rest, 2);
        if rta_len < RTA_HDR_SIZE || rta_len > self.rest.len() {
            // Malformed attribute; stop rather than misinterpret the tail.
            return None;
        }

        let data = &self.rest[RTA_HDR_SIZE..rta_len];
        let advance = rta_align(rta_len).min(self.rest.len());
        self.rest = &self.rest[advance..];

        Some((rta_type, data))
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < data.len());
    // Safety: callers verify payload lengths before reading fixed offsets.
    unsafe { *data.as_ptr().add(offset) }
}

#[inline(always)]
fn read_u16_ne(data: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_ne(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via upfront checks.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

fn rta_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Render a binary address according to the route family; anything that is
/// not IPv4 or IPv6 yields the sentinel.
fn ip_to_string(data: &[u8], family: u8) -> String {
    match i32::from(family) {
        libc::AF_INET => {
            if let Ok(octets) = <[u8; 4]>::try_from(data) {
                return Ipv4Addr::from(octets).to_string();
            }
        }
        libc::AF_INET6 => {
            if let Ok(octets) = <[u8; 16]>::try_from(data) {
                return Ipv6Addr::from(octets).to_string();
            }
        }
        _ => {}
    }
    ATTR_UNSET.to_string()
}

/// Decode a NUL-terminated attribute payload (e.g. TCA_KIND).
fn cstr_to_string(data: &[u8]) -> String {
    let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..len]).into_owned()
}

// Names for the fixed rtmsg fields, from linux/rtnetlink.h. Unlisted values
// fall back to their numeric form.

fn route_protocol_name(protocol: u8) -> String {
    match protocol {
        0 => "unspec".to_string(),
        1 => "redirect".to_string(),
        2 => "kernel".to_string(),
        3 => "boot".to_string(),
        4 => "static".to_string(),
        other => other.to_string(),
    }
}

fn route_scope_name(scope: u8) -> String {
    match scope {
        0 => "universe".to_string(),
        200 => "site".to_string(),
        253 => "link".to_string(),
        254 => "host".to_string(),
        255 => "nowhere".to_string(),
        other => other.to_string(),
    }
}

fn route_type_name(rtype: u8) -> String {
    match rtype {
        0 => "unspec".to_string(),
        1 => "unicast".to_string(),
        2 => "local".to_string(),
        3 => "broadcast".to_string(),
        4 => "anycast".to_string(),
        5 => "multicast".to_string(),
        6 => "blackhole".to_string(),
        7 => "unreachable".to_string(),
        8 => "prohibit".to_string(),
        other => other.to_string(),
    }
}
