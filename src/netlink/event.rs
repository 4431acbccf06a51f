use std::collections::BTreeMap;
use std::fmt;

/// Attribute map attached to every canonical event.
///
/// Kept as string→string so the monitor stays agnostic of which kernel
/// attributes a given message carried, and so records serialize directly.
pub type AttrMap = BTreeMap<String, String>;

/// Sentinel for an expected attribute the kernel message did not carry.
pub const ATTR_UNSET: &str = "N/A";

/// EventKind identifies the kind of rtnetlink notification.
/// Raw values are the `nlmsg_type` constants from `linux/rtnetlink.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventKind {
    RouteAdd = 24,  // RTM_NEWROUTE
    RouteDel = 25,  // RTM_DELROUTE
    QdiscAdd = 36,  // RTM_NEWQDISC
    QdiscDel = 37,  // RTM_DELQDISC
    QdiscGet = 38,  // RTM_GETQDISC
}

impl EventKind {
    /// Returns the canonical record/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RouteAdd => "ROUTE_ADD",
            Self::RouteDel => "ROUTE_DEL",
            Self::QdiscAdd => "QDISC_ADD",
            Self::QdiscDel => "QDISC_DEL",
            Self::QdiscGet => "QDISC_GET",
        }
    }

    /// Convert from a raw netlink message type.
    pub fn from_nlmsg_type(v: u16) -> Option<Self> {
        match v {
            24 => Some(Self::RouteAdd),
            25 => Some(Self::RouteDel),
            36 => Some(Self::QdiscAdd),
            37 => Some(Self::QdiscDel),
            38 => Some(Self::QdiscGet),
            _ => None,
        }
    }

    /// True for the two route-table kinds.
    pub const fn is_route(self) -> bool {
        matches!(self, Self::RouteAdd | Self::RouteDel)
    }

    /// True for the three traffic-control kinds.
    pub const fn is_qdisc(self) -> bool {
        matches!(self, Self::QdiscAdd | Self::QdiscDel | Self::QdiscGet)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical event delivered by the netlink source.
///
/// `timestamp_ms` is stamped on ingest (wall clock, UTC); downstream
/// components never re-read the clock for ordering decisions.
#[derive(Debug, Clone)]
pub struct NetlinkEvent {
    pub timestamp_ms: i64,
    pub kind: EventKind,
    pub attrs: AttrMap,
}

impl NetlinkEvent {
    /// Attribute lookup with the `"N/A"` sentinel for missing keys.
    pub fn attr_or_unset(&self, key: &str) -> &str {
        self.attrs.get(key).map_or(ATTR_UNSET, String::as_str)
    }

    /// True when the event carries a netem qdisc.
    pub fn is_netem(&self) -> bool {
        self.attrs.get("is_netem").is_some_and(|v| v == "true")
    }
}
