//! Daemon lifecycle: bring the components up in dependency order, run until
//! SIGINT/SIGTERM, then take them down again.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

use crate::backend::{FilterAdapter, FilterBackend, MemoryBackend, NftBackend};
use crate::broker::DecisionBroker;
use crate::cache::{Fingerprinter, VerdictCache};
use crate::config::Config;
use crate::connection::Direction;
use crate::enforcer::VerdictEnforcer;
use crate::firewall::Firewall;
use crate::interceptor::{
    DnsCache, Interceptor, InterceptorSettings, InterceptorStats, NfqSource, PacketHandler,
};
use crate::process::{Attributor, ProcAttributor};
use crate::registry::{TableRegistry, TeardownOutcome};
use crate::rules::RuleEngine;
use crate::ui::UiServer;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Run the daemon. With `dry_run` the filter backend is the in-memory
/// simulator and no queue is attached.
pub async fn run(config: Config, dry_run: bool) -> Result<()> {
    let backend: Arc<dyn FilterBackend> = if dry_run {
        info!("Dry run: using the in-memory filter backend");
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(NftBackend::new())
    };
    let adapter = Arc::new(FilterAdapter::new(backend, config.commit_timeout()));
    info!("Filter backend: {}", adapter.backend_name());
    let registry = Arc::new(TableRegistry::new(adapter));

    let spec = config.interception();
    let setup = Arc::clone(&registry);
    let result = match tokio::task::spawn_blocking(move || setup.ensure_system_tables(&spec)).await {
        Ok(Ok(())) => serve(&config, dry_run, Arc::clone(&registry)).await,
        Ok(Err(e)) => Err(anyhow::Error::new(e).context("Failed to set up filter tables")),
        Err(e) => Err(anyhow::Error::new(e).context("Table setup task failed")),
    };
    // Also after a failed setup: whatever tables it created are registered.
    teardown(registry).await;
    result
}

async fn serve(config: &Config, dry_run: bool, registry: Arc<TableRegistry>) -> Result<()> {
    let rules = Arc::new(RuleEngine::new());
    if let Err(e) = rules.load_from_file(&config.rules_path) {
        warn!("Failed to load rules from {}: {}", config.rules_path.display(), e);
    }

    let cache = Arc::new(VerdictCache::new(config.default_verdict_ttl()));
    let dns = Arc::new(DnsCache::new());
    let attributor: Arc<dyn Attributor> = Arc::new(ProcAttributor::new());
    let ui = UiServer::new();
    let listener = UiServer::bind(&config.ui_socket).context("Failed to bind the UI socket")?;
    let fingerprinter = Fingerprinter::new(config.fingerprint.clone());
    let enforcer = VerdictEnforcer::new(
        Arc::clone(&registry),
        Arc::clone(&cache),
        fingerprinter.clone(),
    );
    let broker = Arc::new(DecisionBroker::new(
        ui.clone(),
        Arc::clone(&cache),
        Arc::clone(&rules),
        Arc::clone(&enforcer),
        config.broker_settings(),
    ));
    let firewall = Arc::new(Firewall::new(
        rules,
        Arc::clone(&cache),
        fingerprinter,
        Arc::clone(&dns),
        attributor,
        Arc::clone(&broker),
        enforcer,
    ));

    let ui_task = tokio::spawn(ui.serve(listener, Arc::clone(&firewall)));
    let housekeeping = tokio::spawn(housekeeping(cache, dns));

    let shutdown = Arc::new(AtomicBool::new(false));
    let workers = if dry_run {
        info!("Dry run: not attaching to any queue");
        Vec::new()
    } else {
        start_workers(config, firewall, &shutdown).await?
    };

    info!("Ready to process packets!");
    wait_for_signal().await?;
    info!("Shutting down...");

    // Workers release whatever they still hold with the default verdict.
    shutdown.store(true, Ordering::Relaxed);
    for (direction, worker) in workers {
        match tokio::task::spawn_blocking(move || worker.join()).await {
            Ok(Ok(stats)) => info!(
                "{:?} queue: {} packet(s), {} expired, {} released on shutdown",
                direction, stats.received, stats.expired, stats.released_on_shutdown
            ),
            _ => warn!("{:?} queue worker did not stop cleanly", direction),
        }
    }
    broker.shutdown();
    ui_task.abort();
    housekeeping.abort();

    if let Err(e) = std::fs::remove_file(&config.ui_socket) {
        warn!("Failed to remove UI socket: {}", e);
    }
    Ok(())
}

async fn start_workers(
    config: &Config,
    firewall: Arc<Firewall>,
    shutdown: &Arc<AtomicBool>,
) -> Result<Vec<(Direction, thread::JoinHandle<InterceptorStats>)>> {
    let handler: Arc<dyn PacketHandler> = firewall;
    let spec = config.interception();
    let mut queues = vec![(Direction::Outbound, spec.queue_num)];
    if spec.intercept_inbound || spec.intercept_dns {
        queues.push((Direction::Inbound, spec.inbound_queue()));
    }

    let mut workers = Vec::new();
    for (direction, queue_num) in queues {
        let settings = InterceptorSettings {
            direction,
            max_hold: config.max_hold(),
            default_verdict: config.default_packet_verdict(),
        };
        let worker = start_worker(
            queue_num,
            config.fail_open,
            settings,
            Arc::clone(&handler),
            Arc::clone(shutdown),
        )
        .await
        .with_context(|| format!("Failed to attach to NFQUEUE {}", queue_num))?;
        workers.push((direction, worker));
    }
    Ok(workers)
}

/// One thread per queue. The queue is opened on that thread, since held
/// packets never leave it.
async fn start_worker(
    queue_num: u16,
    fail_open: bool,
    settings: InterceptorSettings,
    handler: Arc<dyn PacketHandler>,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<InterceptorStats>> {
    let runtime = Handle::current();
    let (ready_tx, ready_rx) = oneshot::channel();
    let worker = thread::Builder::new()
        .name(format!("nfqueue-{}", queue_num))
        .spawn(move || {
            let source = match NfqSource::open(queue_num, fail_open) {
                Ok(source) => {
                    let _ = ready_tx.send(Ok(()));
                    source
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return InterceptorStats::default();
                }
            };
            Interceptor::new(source, settings, handler, runtime, shutdown).run()
        })?;
    ready_rx.await.context("Queue worker exited during startup")??;
    Ok(worker)
}

async fn housekeeping(cache: Arc<VerdictCache>, dns: Arc<DnsCache>) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        ticker.tick().await;
        let pruned = cache.prune();
        if pruned > 0 {
            debug!("Pruned {} expired verdict(s)", pruned);
        }
        dns.prune();
    }
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

async fn teardown(registry: Arc<TableRegistry>) {
    let outcomes = match tokio::task::spawn_blocking(move || registry.teardown()).await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            error!("Teardown task failed: {}", e);
            return;
        }
    };
    for (table, outcome) in outcomes {
        match outcome {
            TeardownOutcome::Deleted => {}
            TeardownOutcome::ForeignResourcePreserved { foreign_rules } => {
                info!("Left table {} in place ({} foreign rule(s))", table, foreign_rules)
            }
            TeardownOutcome::EnumerationFailed(e) | TeardownOutcome::DeleteFailed(e) => {
                warn!("Table {} not removed: {}", table, e)
            }
        }
    }
}
