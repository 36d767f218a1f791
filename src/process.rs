//! Process identification module
//! Reads /proc to identify which process owns a network connection.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::connection::{ConnectionDescriptor, ProcessInfo};
use crate::error::{FirewallError, Result};
use crate::proc_parser::{self, NetEntry};

const RESCAN_INTERVAL: Duration = Duration::from_millis(100);
const MAX_PARENT_DEPTH: usize = 16;

/// Resolves the process owning a connection's local socket.
pub trait Attributor: Send + Sync {
    /// `AttributionUnresolved` when no owner could be found; callers carry on
    /// with an unknown process.
    fn attribute(&self, desc: &ConnectionDescriptor) -> Result<ProcessInfo>;
}

#[derive(Default)]
struct InodeIndex {
    inode_to_pid: HashMap<u64, u32>,
    /// Inodes a recent scan did not find, with when it looked.
    misses: HashMap<u64, Instant>,
}

/// Attribution from the socket tables and per-process entries under /proc.
pub struct ProcAttributor {
    root: PathBuf,
    index: Mutex<InodeIndex>,
}

impl ProcAttributor {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: Mutex::new(InodeIndex::default()),
        }
    }

    /// Socket rows for the tuple: exact 4-tuple matches first, then rows
    /// bound to the local port on the same or the unspecified address
    /// (listeners, unconnected UDP).
    fn candidate_sockets(&self, desc: &ConnectionDescriptor) -> Vec<NetEntry> {
        let (local_ip, local_port) = desc.local();
        let (remote_ip, remote_port) = desc.remote();
        let entries = proc_parser::read_net_entries(&self.root, desc.protocol);

        let exact = entries.iter().filter(|e| {
            e.local_addr == local_ip
                && e.local_port == local_port
                && e.remote_addr == remote_ip
                && e.remote_port == remote_port
        });
        let loose = entries.iter().filter(|e| {
            e.local_port == local_port
                && (e.local_addr == local_ip || e.local_addr.is_unspecified())
                && !(e.remote_addr == remote_ip && e.remote_port == remote_port)
        });
        exact
            .chain(loose)
            .filter(|e| e.inode != 0)
            .cloned()
            .collect()
    }

    /// An index miss always rescans, unless this same inode already missed
    /// within `RESCAN_INTERVAL`. New sockets are therefore found at once.
    fn pid_for_inode(&self, inode: u64) -> Option<u32> {
        let mut index = self.index.lock();
        if let Some(pid) = index.inode_to_pid.get(&inode) {
            return Some(*pid);
        }
        let now = Instant::now();
        if index
            .misses
            .get(&inode)
            .map_or(false, |at| now.duration_since(*at) < RESCAN_INTERVAL)
        {
            return None;
        }
        index.inode_to_pid = self.scan_socket_inodes();
        index.misses.retain(|_, at| now.duration_since(*at) < RESCAN_INTERVAL);
        let pid = index.inode_to_pid.get(&inode).copied();
        if pid.is_none() {
            index.misses.insert(inode, now);
        }
        pid
    }

    fn scan_socket_inodes(&self) -> HashMap<u64, u32> {
        let mut map = HashMap::new();
        let Ok(proc_dir) = fs::read_dir(&self.root) else {
            return map;
        };
        for entry in proc_dir.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if let Some(inode) = socket_inode(&link.to_string_lossy()) {
                        map.insert(inode, pid);
                    }
                }
            }
        }
        debug!("Indexed {} socket inodes", map.len());
        map
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn exe_of(&self, pid: u32) -> Option<String> {
        fs::read_link(self.pid_dir(pid).join("exe"))
            .ok()
            .map(|p| clean_exe_path(&p.to_string_lossy()))
    }

    fn read_process(&self, pid: u32, socket_uid: u32) -> Option<ProcessInfo> {
        let dir = self.pid_dir(pid);
        let status = fs::read_to_string(dir.join("status")).ok()?;
        let name = fs::read_to_string(dir.join("comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let args = fs::read(dir.join("cmdline"))
            .map(|raw| split_cmdline(&raw))
            .unwrap_or_default();
        let uid = status_field(&status, "Uid:").unwrap_or(socket_uid);
        let ppid = status_field(&status, "PPid:").unwrap_or(0);

        Some(ProcessInfo {
            pid,
            ppid,
            uid,
            name,
            exe_path: self.exe_of(pid).unwrap_or_default(),
            args,
            parent_paths: self.parent_paths(ppid),
        })
    }

    fn parent_paths(&self, mut ppid: u32) -> Vec<String> {
        let mut paths = Vec::new();
        while ppid > 0 && paths.len() < MAX_PARENT_DEPTH {
            if let Some(exe) = self.exe_of(ppid) {
                paths.push(exe);
            }
            ppid = fs::read_to_string(self.pid_dir(ppid).join("status"))
                .ok()
                .and_then(|s| status_field(&s, "PPid:"))
                .unwrap_or(0);
        }
        paths
    }
}

impl Default for ProcAttributor {
    fn default() -> Self {
        Self::new()
    }
}

impl Attributor for ProcAttributor {
    fn attribute(&self, desc: &ConnectionDescriptor) -> Result<ProcessInfo> {
        for socket in self.candidate_sockets(desc) {
            if let Some(pid) = self.pid_for_inode(socket.inode) {
                if let Some(info) = self.read_process(pid, socket.uid) {
                    return Ok(info);
                }
            }
        }
        Err(FirewallError::AttributionUnresolved(format!(
            "no owner for {} {}:{}",
            desc.protocol,
            desc.local().0,
            desc.local().1
        )))
    }
}

fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

fn status_field(status: &str, key: &str) -> Option<u32> {
    status
        .lines()
        .find(|l| l.starts_with(key))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

fn split_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|a| !a.is_empty())
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect()
}

fn clean_exe_path(path: &str) -> String {
    let path = path.split('\0').next().unwrap_or("");
    path.strip_suffix(" (deleted)").unwrap_or(path).to_string()
}

/// Fixed answers keyed by local port, for tests without real sockets.
#[derive(Default)]
pub struct StaticAttributor {
    by_local_port: Mutex<HashMap<u16, ProcessInfo>>,
}

impl StaticAttributor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, local_port: u16, info: ProcessInfo) {
        self.by_local_port.lock().insert(local_port, info);
    }
}

impl Attributor for StaticAttributor {
    fn attribute(&self, desc: &ConnectionDescriptor) -> Result<ProcessInfo> {
        let port = desc.local().1;
        self.by_local_port
            .lock()
            .get(&port)
            .cloned()
            .ok_or_else(|| FirewallError::AttributionUnresolved(format!("port {}", port)))
    }
}

#[cfg(all(test, target_endian = "little"))]
mod tests {
    use super::*;
    use crate::connection::{sample, Direction};
    use std::os::unix::fs::symlink;
    use std::path::Path;
    use tempfile::TempDir;

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n";

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fake_process(root: &Path, pid: u32, ppid: u32, exe: &str, uid: u32, inode: Option<u64>) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(dir.join("fd")).unwrap();
        symlink(exe, dir.join("exe")).unwrap();
        let name = exe.rsplit('/').next().unwrap();
        write(&dir.join("comm"), &format!("{}\n", name));
        write(&dir.join("cmdline"), &format!("{}\0--flag\0", exe));
        write(
            &dir.join("status"),
            &format!("Name:\t{}\nPPid:\t{}\nUid:\t{}\t{}\t{}\t{}\n", name, ppid, uid, uid, uid, uid),
        );
        if let Some(inode) = inode {
            symlink(format!("socket:[{}]", inode), dir.join("fd").join("3")).unwrap();
        }
    }

    fn fake_proc() -> TempDir {
        let root = TempDir::new().unwrap();
        write(
            &root.path().join("net/tcp"),
            &format!(
                "{}{}\n{}\n",
                HEADER,
                "   0: 0A01A8C0:9C40 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 5555 1 0000000000000000 20 4 30 10 -1",
                "   1: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 7777 1 0000000000000000 20 4 30 10 -1"
            ),
        );
        fake_process(root.path(), 1, 0, "/usr/lib/systemd/systemd", 0, None);
        fake_process(root.path(), 900, 1, "/usr/bin/bash", 1000, None);
        fake_process(root.path(), 4242, 900, "/usr/bin/curl", 1000, Some(5555));
        fake_process(root.path(), 300, 1, "/usr/sbin/sshd", 0, Some(7777));
        root
    }

    #[test]
    fn resolves_outbound_connection_with_ancestry() {
        let root = fake_proc();
        let attributor = ProcAttributor::with_root(root.path());

        let info = attributor.attribute(&sample(443)).unwrap();
        assert_eq!(info.pid, 4242);
        assert_eq!(info.exe_path, "/usr/bin/curl");
        assert_eq!(info.args, vec!["/usr/bin/curl", "--flag"]);
        assert_eq!(info.uid, 1000);
        assert_eq!(info.parent_paths, vec!["/usr/bin/bash", "/usr/lib/systemd/systemd"]);
    }

    #[test]
    fn inbound_connection_falls_back_to_listener() {
        let root = fake_proc();
        let attributor = ProcAttributor::with_root(root.path());
        let mut desc = sample(22);
        desc.direction = Direction::Inbound;
        desc.src_ip = "203.0.113.9".parse().unwrap();
        desc.dst_ip = "192.168.1.10".parse().unwrap();

        let info = attributor.attribute(&desc).unwrap();
        assert_eq!(info.exe_path, "/usr/sbin/sshd");
        assert_eq!(info.uid, 0);
    }

    #[test]
    fn unknown_socket_is_unresolved() {
        let root = fake_proc();
        let attributor = ProcAttributor::with_root(root.path());
        let mut desc = sample(443);
        desc.src_port = 41000;
        assert!(matches!(
            attributor.attribute(&desc),
            Err(FirewallError::AttributionUnresolved(_))
        ));
    }

    #[test]
    fn deleted_binaries_keep_their_path() {
        assert_eq!(clean_exe_path("/usr/bin/app (deleted)"), "/usr/bin/app");
        assert_eq!(socket_inode("socket:[42]"), Some(42));
        assert_eq!(socket_inode("pipe:[42]"), None);
    }

    #[test]
    fn socket_opened_right_after_a_lookup_is_found() {
        let root = fake_proc();
        let attributor = ProcAttributor::with_root(root.path());
        assert_eq!(attributor.attribute(&sample(443)).unwrap().exe_path, "/usr/bin/curl");

        // wget connects from port 41000 a moment later.
        let tcp = root.path().join("net/tcp");
        let mut table = fs::read_to_string(&tcp).unwrap();
        table.push_str("   2: 0A01A8C0:A028 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 6666 1 0000000000000000 20 4 30 10 -1\n");
        fs::write(&tcp, table).unwrap();
        fake_process(root.path(), 5151, 900, "/usr/bin/wget", 1000, Some(6666));

        let mut desc = sample(443);
        desc.src_port = 41000;
        assert_eq!(attributor.attribute(&desc).unwrap().exe_path, "/usr/bin/wget");
    }

    #[test]
    fn repeated_misses_for_one_inode_are_throttled() {
        let root = fake_proc();
        let attributor = ProcAttributor::with_root(root.path());
        assert_eq!(attributor.pid_for_inode(9999), None);
        assert!(attributor.index.lock().misses.contains_key(&9999));

        // The owner appears, but the same inode is not rescanned right away.
        fake_process(root.path(), 6000, 900, "/usr/bin/ssh", 1000, Some(9999));
        assert_eq!(attributor.pid_for_inode(9999), None);
        std::thread::sleep(RESCAN_INTERVAL);
        assert_eq!(attributor.pid_for_inode(9999), Some(6000));
    }
}
