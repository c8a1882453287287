// kafkagate/src/blacklist.rs
//
// IPv4 reject list for the socket listeners. Sources present here are
// dropped right after accept, before any worker handoff.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

/// Set of blacklisted IPv4 source addresses.
#[derive(Debug, Default, Clone)]
pub struct Blacklist {
    addrs: HashSet<Ipv4Addr>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: Ipv4Addr) {
        self.addrs.insert(addr);
    }

    /// Non-IPv4 peers are never blacklisted; the list is v4-only.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.addrs.contains(v4),
            IpAddr::V6(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_only_listed_v4() {
        let mut bl = Blacklist::new();
        bl.add(Ipv4Addr::new(10, 0, 0, 1));
        assert!(bl.contains(&"10.0.0.1".parse().unwrap()));
        assert!(!bl.contains(&"10.0.0.2".parse().unwrap()));
        assert!(!bl.contains(&"::1".parse().unwrap()));
    }
}
