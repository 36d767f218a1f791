use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use crate::connection::Protocol;

/// Socket row from /proc/net/{tcp,udp}[6]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEntry {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub uid: u32,
    pub inode: u64,
}

pub fn read_net_entries(proc_root: &Path, protocol: Protocol) -> Vec<NetEntry> {
    let files: [&str; 2] = match protocol {
        Protocol::Tcp => ["net/tcp", "net/tcp6"],
        Protocol::Udp => ["net/udp", "net/udp6"],
    };

    let mut entries = Vec::new();
    for name in files {
        if let Ok(file) = File::open(proc_root.join(name)) {
            let reader = BufReader::new(file);
            for line in reader.lines().skip(1).map_while(Result::ok) {
                if let Some(entry) = parse_net_line(&line) {
                    entries.push(entry);
                }
            }
        }
    }
    entries
}

pub(crate) fn parse_net_line(line: &str) -> Option<NetEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (local_addr, local_port) = parse_hex_address(parts[1])?;
    let (remote_addr, remote_port) = parse_hex_address(parts[2])?;
    let uid = parts[7].parse::<u32>().ok()?;
    let inode = parts[9].parse::<u64>().ok()?;

    Some(NetEntry {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        uid,
        inode,
    })
}

/// Addresses are printed as native-endian 32-bit words. IPv4-mapped IPv6
/// addresses (dual-stack sockets) come back as plain IPv4.
fn parse_hex_address(s: &str) -> Option<(IpAddr, u16)> {
    let (hex_addr, hex_port) = s.split_once(':')?;
    let port = u16::from_str_radix(hex_port, 16).ok()?;

    match hex_addr.len() {
        8 => {
            let word = u32::from_str_radix(hex_addr, 16).ok()?;
            Some((IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes())), port))
        }
        32 => {
            let mut octets = [0u8; 16];
            for i in 0..4 {
                let word = u32::from_str_radix(hex_addr.get(i * 8..(i + 1) * 8)?, 16).ok()?;
                octets[i * 4..(i + 1) * 4].copy_from_slice(&word.to_ne_bytes());
            }
            let v6 = Ipv6Addr::from(octets);
            let ip = match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            };
            Some((ip, port))
        }
        _ => None,
    }
}

#[cfg(all(test, target_endian = "little"))]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_row() {
        let line = "   0: 0A01A8C0:9C40 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 5555 1 0000000000000000 20 4 30 10 -1";
        let entry = parse_net_line(line).unwrap();
        assert_eq!(entry.local_addr, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(entry.local_port, 40000);
        assert_eq!(entry.remote_addr, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(entry.remote_port, 443);
        assert_eq!(entry.uid, 1000);
        assert_eq!(entry.inode, 5555);
    }

    #[test]
    fn parses_ipv6_and_unmaps_ipv4() {
        let (ip, port) = parse_hex_address("00000000000000000000000001000000:0035").unwrap();
        assert_eq!(ip, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(port, 53);

        let (ip, _) = parse_hex_address("0000000000000000FFFF00000100007F:0050").unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn short_rows_are_skipped() {
        assert!(parse_net_line("  sl  local_address rem_address").is_none());
    }
}
