//! Packet interception
//!
//! A worker thread per queue pulls packets from the kernel and keeps each
//! one held until its decision arrives. Decisions run as tasks on the async
//! runtime and are bounded by the maximum hold time; whatever is still
//! undecided by then gets the default verdict.

pub mod dns;
pub mod packet;
pub mod queue;

pub use dns::DnsCache;
pub use queue::NfqSource;

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::connection::Direction;
use crate::verdict::PacketVerdict;

const IDLE_WAIT: Duration = Duration::from_millis(2);

/// Where held packets come from and go back to.
pub trait PacketSource {
    /// The kernel's hold on one packet, released exactly once.
    type Held;

    /// The next packet, or `None` if nothing is waiting right now.
    fn recv(&mut self) -> io::Result<Option<(Self::Held, Vec<u8>)>>;

    fn release(&mut self, held: Self::Held, verdict: PacketVerdict) -> io::Result<()>;
}

/// Decides the fate of one queued packet.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, direction: Direction, payload: Vec<u8>) -> PacketVerdict;
}

#[derive(Debug, Clone)]
pub struct InterceptorSettings {
    pub direction: Direction,
    pub max_hold: Duration,
    pub default_verdict: PacketVerdict,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterceptorStats {
    pub received: u64,
    pub expired: u64,
    pub released_on_shutdown: u64,
}

pub struct Interceptor<S: PacketSource> {
    source: S,
    settings: InterceptorSettings,
    handler: Arc<dyn PacketHandler>,
    runtime: Handle,
    shutdown: Arc<AtomicBool>,
}

impl<S: PacketSource> Interceptor<S> {
    pub fn new(
        source: S,
        settings: InterceptorSettings,
        handler: Arc<dyn PacketHandler>,
        runtime: Handle,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            settings,
            handler,
            runtime,
            shutdown,
        }
    }

    /// Run until the shutdown flag is raised. Packets still held at that
    /// point are released with the default verdict.
    pub fn run(mut self) -> InterceptorStats {
        let (tx, rx) = mpsc::channel::<(u64, PacketVerdict, bool)>();
        let mut held: HashMap<u64, S::Held> = HashMap::new();
        let mut next_id: u64 = 0;
        let mut stats = InterceptorStats::default();

        info!("{:?} interceptor running", self.settings.direction);
        while !self.shutdown.load(Ordering::Relaxed) {
            while let Ok(decided) = rx.try_recv() {
                self.release(&mut held, decided, &mut stats);
            }

            match self.source.recv() {
                Ok(Some((hold, payload))) => {
                    next_id += 1;
                    stats.received += 1;
                    held.insert(next_id, hold);
                    self.dispatch(next_id, payload, tx.clone());
                }
                Ok(None) => {
                    if let Ok(decided) = rx.recv_timeout(IDLE_WAIT) {
                        self.release(&mut held, decided, &mut stats);
                    }
                }
                Err(e) => {
                    warn!("{:?} queue receive error: {}", self.settings.direction, e);
                    std::thread::sleep(IDLE_WAIT);
                }
            }
        }

        let default = self.settings.default_verdict;
        for (_, hold) in held.drain() {
            stats.released_on_shutdown += 1;
            if let Err(e) = self.source.release(hold, default) {
                warn!("Releasing held packet on shutdown: {}", e);
            }
        }
        info!(
            "{:?} interceptor stopped ({} packets, {} released on shutdown)",
            self.settings.direction, stats.received, stats.released_on_shutdown
        );
        stats
    }

    fn dispatch(&self, id: u64, payload: Vec<u8>, tx: mpsc::Sender<(u64, PacketVerdict, bool)>) {
        let handler = Arc::clone(&self.handler);
        let direction = self.settings.direction;
        let max_hold = self.settings.max_hold;
        let default = self.settings.default_verdict;
        self.runtime.spawn(async move {
            let decided = match tokio::time::timeout(max_hold, handler.handle(direction, payload)).await {
                Ok(verdict) => (id, verdict, false),
                Err(_) => (id, default, true),
            };
            // The worker is gone only after shutdown released everything.
            let _ = tx.send(decided);
        });
    }

    fn release(
        &mut self,
        held: &mut HashMap<u64, S::Held>,
        (id, verdict, expired): (u64, PacketVerdict, bool),
        stats: &mut InterceptorStats,
    ) {
        let Some(hold) = held.remove(&id) else {
            return;
        };
        if expired {
            stats.expired += 1;
            debug!("Packet {} held past {:?}, default {:?}", id, self.settings.max_hold, verdict);
        }
        if let Err(e) = self.source.release(hold, verdict) {
            warn!("Failed to release packet {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::packet::tests::tcp_v4;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Clone, Default)]
    struct FakeSource {
        incoming: Arc<Mutex<VecDeque<(u32, Vec<u8>)>>>,
        released: Arc<Mutex<Vec<(u32, PacketVerdict)>>>,
    }

    impl PacketSource for FakeSource {
        type Held = u32;

        fn recv(&mut self) -> io::Result<Option<(u32, Vec<u8>)>> {
            Ok(self.incoming.lock().pop_front())
        }

        fn release(&mut self, held: u32, verdict: PacketVerdict) -> io::Result<()> {
            self.released.lock().push((held, verdict));
            Ok(())
        }
    }

    /// Accepts port 443 at once; never answers for anything else.
    struct PortHandler;

    #[async_trait]
    impl PacketHandler for PortHandler {
        async fn handle(&self, direction: Direction, payload: Vec<u8>) -> PacketVerdict {
            let parsed = packet::parse(&payload, direction).unwrap();
            if parsed.descriptor.dst_port == 443 {
                PacketVerdict::Accept
            } else {
                std::future::pending().await
            }
        }
    }

    fn settings(max_hold: Duration) -> InterceptorSettings {
        InterceptorSettings {
            direction: Direction::Outbound,
            max_hold,
            default_verdict: PacketVerdict::Drop,
        }
    }

    async fn wait_for(source: &FakeSource, n: usize) {
        for _ in 0..500 {
            if source.released.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only {} packets released", source.released.lock().len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undecided_packets_get_the_default_after_max_hold() {
        let source = FakeSource::default();
        source.incoming.lock().push_back((1, tcp_v4(40000, [93, 184, 216, 34], 443)));
        source.incoming.lock().push_back((2, tcp_v4(40001, [93, 184, 216, 34], 22)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let interceptor = Interceptor::new(
            source.clone(),
            settings(Duration::from_millis(100)),
            Arc::new(PortHandler),
            Handle::current(),
            shutdown.clone(),
        );
        let worker = std::thread::spawn(move || interceptor.run());

        wait_for(&source, 2).await;
        shutdown.store(true, Ordering::Relaxed);
        let stats = worker.join().unwrap();

        let released = source.released.lock().clone();
        assert_eq!(released[0], (1, PacketVerdict::Accept));
        assert_eq!(released[1], (2, PacketVerdict::Drop));
        assert_eq!(stats.received, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.released_on_shutdown, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_releases_everything_still_held() {
        let source = FakeSource::default();
        source.incoming.lock().push_back((9, tcp_v4(40000, [10, 0, 0, 1], 22)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let interceptor = Interceptor::new(
            source.clone(),
            settings(Duration::from_secs(60)),
            Arc::new(PortHandler),
            Handle::current(),
            shutdown.clone(),
        );
        let worker = std::thread::spawn(move || interceptor.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::Relaxed);
        let stats = worker.join().unwrap();

        assert_eq!(source.released.lock().as_slice(), &[(9, PacketVerdict::Drop)]);
        assert_eq!(stats.released_on_shutdown, 1);
    }
}
