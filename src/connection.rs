//! Connection descriptors: what the interceptor saw, plus who sent it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn from_ip_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Identity of the process owning a socket, as far as /proc could tell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub name: String,
    pub exe_path: String,
    pub args: Vec<String>,
    /// Executables of the ancestors, nearest parent first.
    #[serde(default)]
    pub parent_paths: Vec<String>,
}

impl ProcessInfo {
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Immutable description of one intercepted connection.
///
/// Built by the interceptor from packet headers, then enriched with the
/// resolved host name and process identity before it is shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub protocol: Protocol,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub direction: Direction,
    pub timestamp: SystemTime,
    #[serde(default)]
    pub dst_host: Option<String>,
    #[serde(default)]
    pub process: Option<ProcessInfo>,
}

impl ConnectionDescriptor {
    pub fn new(
        protocol: Protocol,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        direction: Direction,
    ) -> Self {
        Self {
            protocol,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            direction,
            timestamp: SystemTime::now(),
            dst_host: None,
            process: None,
        }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.dst_host = host;
        self
    }

    pub fn with_process(mut self, process: Option<ProcessInfo>) -> Self {
        self.process = process;
        self
    }

    /// The peer on the far side of the connection.
    pub fn remote(&self) -> (IpAddr, u16) {
        match self.direction {
            Direction::Outbound => (self.dst_ip, self.dst_port),
            Direction::Inbound => (self.src_ip, self.src_port),
        }
    }

    /// The socket owned by a local process.
    pub fn local(&self) -> (IpAddr, u16) {
        match self.direction {
            Direction::Outbound => (self.src_ip, self.src_port),
            Direction::Inbound => (self.dst_ip, self.dst_port),
        }
    }

    pub fn process_path(&self) -> Option<&str> {
        self.process
            .as_ref()
            .map(|p| p.exe_path.as_str())
            .filter(|p| !p.is_empty())
    }

    pub fn is_ipv6(&self) -> bool {
        self.dst_ip.is_ipv6()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let app = self.process_path().unwrap_or("unknown");
        let host = self.dst_host.as_deref().unwrap_or("");
        write!(
            f,
            "{} {}:{} -> {}:{} {} ({})",
            self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port, host, app
        )
    }
}

#[cfg(test)]
pub(crate) fn sample(dst_port: u16) -> ConnectionDescriptor {
    ConnectionDescriptor::new(
        Protocol::Tcp,
        "192.168.1.10".parse().unwrap(),
        40000,
        "93.184.216.34".parse().unwrap(),
        dst_port,
        Direction::Outbound,
    )
}

#[cfg(test)]
pub(crate) fn sample_process(path: &str) -> ProcessInfo {
    ProcessInfo {
        pid: 4242,
        ppid: 1,
        uid: 1000,
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        exe_path: path.to_string(),
        args: vec![path.to_string()],
        parent_paths: vec!["/usr/lib/systemd/systemd".to_string()],
    }
}
