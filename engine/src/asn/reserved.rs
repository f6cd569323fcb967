use std::net::IpAddr;
use std::sync::OnceLock;

use ip_network::IpNetwork;

/// Description attached to synthetic entries for reserved address space.
pub const RESERVED_DESCRIPTION: &str = "Reserved Network Address Blocks";

/// Address blocks that never belong to a routable autonomous system.
/// Consulted before the longest-prefix table on every lookup.
const RESERVED_CIDRS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "64:ff9b::/96",
    "100::/64",
    "2001::/32",
    "2001:db8::/32",
    "2002::/16",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

fn table() -> &'static Vec<IpNetwork> {
    static TABLE: OnceLock<Vec<IpNetwork>> = OnceLock::new();
    TABLE.get_or_init(|| {
        RESERVED_CIDRS
            .iter()
            .map(|cidr| cidr.parse().expect("reserved CIDR table entry"))
            .collect()
    })
}

/// The most specific reserved block containing `addr`, if any.
pub fn find(addr: IpAddr) -> Option<IpNetwork> {
    table()
        .iter()
        .filter(|network| network.contains(addr))
        .max_by_key(|network| network.netmask())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documentation_ranges_are_reserved() {
        let network = find("192.0.2.1".parse().unwrap()).unwrap();
        assert_eq!(network.to_string(), "192.0.2.0/24");

        let network = find("203.0.113.7".parse().unwrap()).unwrap();
        assert_eq!(network.to_string(), "203.0.113.0/24");
    }

    #[test]
    fn routable_space_is_not_reserved() {
        assert!(find("8.8.8.8".parse().unwrap()).is_none());
        assert!(find("2606:4700::1111".parse().unwrap()).is_none());
    }

    #[test]
    fn v6_local_ranges_are_reserved() {
        assert!(find("fe80::1".parse().unwrap()).is_some());
        assert!(find("::1".parse().unwrap()).is_some());
    }
}
