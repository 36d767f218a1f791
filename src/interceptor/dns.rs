//! DNS answer tracking: remembers which name each resolved address was
//! looked up under, so connections can be matched by host.

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::RData;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const MIN_TTL_SECS: u32 = 60;
const MAX_TTL_SECS: u32 = 3600;

struct DnsEntry {
    host: String,
    expires: Instant,
}

#[derive(Default)]
pub struct DnsCache {
    entries: RwLock<HashMap<IpAddr, DnsEntry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ip: IpAddr, host: String, ttl: u32) {
        let ttl = Duration::from_secs(ttl.clamp(MIN_TTL_SECS, MAX_TTL_SECS) as u64);
        self.entries.write().insert(
            ip,
            DnsEntry {
                host,
                expires: Instant::now() + ttl,
            },
        );
    }

    pub fn lookup(&self, ip: &IpAddr) -> Option<String> {
        let now = Instant::now();
        self.entries
            .read()
            .get(ip)
            .filter(|e| e.expires > now)
            .map(|e| e.host.clone())
    }

    /// Parse a DNS response and record its A/AAAA answers under the queried
    /// name (CNAME chains collapse onto the name that was asked for).
    /// Returns how many addresses were recorded.
    pub fn record_response(&self, payload: &[u8]) -> usize {
        let msg = match Message::from_vec(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Ignoring unparsable DNS payload: {}", e);
                return 0;
            }
        };
        if msg.message_type() != MessageType::Response {
            return 0;
        }
        let Some(domain) = msg
            .queries()
            .first()
            .map(|q| q.name().to_utf8().trim_end_matches('.').to_lowercase())
        else {
            return 0;
        };

        let mut count = 0;
        for answer in msg.answers() {
            let ip = match answer.data() {
                Some(RData::A(addr)) => IpAddr::V4(**addr),
                Some(RData::AAAA(addr)) => IpAddr::V6(**addr),
                _ => continue,
            };
            debug!("DNS: {} -> {} (TTL {}s)", ip, domain, answer.ttl());
            self.insert(ip, domain.clone(), answer.ttl());
            count += 1;
        }
        count
    }

    pub fn prune(&self) {
        let now = Instant::now();
        self.entries.write().retain(|_, e| e.expires > now);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
