//! UI socket server
//!
//! One UI client at a time over a Unix stream socket. Prompts go out as
//! `prompt` messages and come back as `prompt_response`; the same
//! connection carries rule management commands, periodic stats and the
//! stream of decided connections.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};

use crate::broker::Prompter;
use crate::error::{FirewallError, Result};
use crate::firewall::Firewall;
use crate::protocol::{Ack, DaemonMessage, PromptRequest, PromptResponse, UiCommand};

const STATS_INTERVAL: Duration = Duration::from_secs(2);

struct Client {
    id: u64,
    outbox: mpsc::UnboundedSender<DaemonMessage>,
    waiting: HashMap<u64, oneshot::Sender<PromptResponse>>,
}

#[derive(Default)]
pub struct UiServer {
    client: Mutex<Option<Client>>,
    next_client: AtomicU64,
}

/// Root and regular users may drive the firewall; system accounts may not,
/// except the account the daemon itself runs as.
fn peer_allowed(uid: u32) -> bool {
    uid == 0 || uid >= 1000 || uid == unsafe { libc::geteuid() }
}

impl UiServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind the socket, replacing a stale one. A symlink at the path is
    /// never removed.
    pub fn bind(path: &Path) -> Result<UnixListener> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if let Ok(meta) = std::fs::symlink_metadata(path) {
            if meta.file_type().is_symlink() {
                return Err(FirewallError::Config(format!(
                    "socket path {} is a symlink",
                    path.display()
                )));
            }
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        }
        info!("UI socket listening on {}", path.display());
        Ok(listener)
    }

    pub fn is_connected(&self) -> bool {
        self.client.lock().is_some()
    }

    /// Accept UI clients until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, firewall: Arc<Firewall>) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    let firewall = Arc::clone(&firewall);
                    tokio::spawn(async move { server.handle_client(stream, firewall).await });
                }
                Err(e) => {
                    error!("UI socket accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn attach(&self) -> Option<(u64, mpsc::UnboundedReceiver<DaemonMessage>)> {
        let mut client = self.client.lock();
        if client.is_some() {
            return None;
        }
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = mpsc::unbounded_channel();
        *client = Some(Client {
            id,
            outbox,
            waiting: HashMap::new(),
        });
        Some((id, rx))
    }

    /// Forget the client. Its unanswered prompts fail, which the broker
    /// treats like a timeout.
    fn detach(&self, id: u64) {
        let mut client = self.client.lock();
        if client.as_ref().map_or(false, |c| c.id == id) {
            if let Some(gone) = client.take() {
                if !gone.waiting.is_empty() {
                    info!("UI left with {} prompt(s) unanswered", gone.waiting.len());
                }
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream, firewall: Arc<Firewall>) {
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                warn!("Failed to get UI peer credentials: {}", e);
                return;
            }
        };
        if !peer_allowed(uid) {
            warn!("Rejected UI connection from system user (UID: {})", uid);
            return;
        }
        let Some((id, mut outbox)) = self.attach() else {
            warn!("Rejected second UI connection (UID: {})", uid);
            return;
        };
        info!("UI connected (UID: {})", uid);

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut events = firewall.subscribe();
        let mut stats = tokio::time::interval(STATS_INTERVAL);

        loop {
            let outgoing = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.dispatch(&firewall, &line).await,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("UI read error: {}", e);
                        break;
                    }
                },
                Some(message) = outbox.recv() => Some(message),
                event = events.recv() => match event {
                    Ok(event) => Some(DaemonMessage::ConnectionEvent(event)),
                    Err(RecvError::Lagged(missed)) => {
                        debug!("UI missed {} connection event(s)", missed);
                        None
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = stats.tick() => Some(DaemonMessage::StatsUpdate { stats: firewall.stats() }),
            };
            if let Some(message) = outgoing {
                if let Err(e) = send(&mut writer, &message).await {
                    debug!("UI write error: {}", e);
                    break;
                }
            }
        }

        self.detach(id);
        info!("UI disconnected");
    }

    async fn dispatch(&self, firewall: &Firewall, line: &str) -> Option<DaemonMessage> {
        let command: UiCommand = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Malformed UI message: {}", e);
                return Some(DaemonMessage::Ack(Ack {
                    command: "unknown".to_string(),
                    success: false,
                    error: Some(e.to_string()),
                }));
            }
        };

        let ack = match command {
            UiCommand::PromptResponse(response) => {
                self.answer(response);
                return None;
            }
            UiCommand::ListRules => {
                return Some(DaemonMessage::RulesList {
                    rules: firewall.list_rules(),
                })
            }
            UiCommand::AddRule { rule } => Ack::from_result("add_rule", &firewall.add_rule(rule).await),
            UiCommand::UpdateRule { rule } => {
                Ack::from_result("update_rule", &firewall.update_rule(rule).await)
            }
            UiCommand::DeleteRule { name } => {
                Ack::from_result("delete_rule", &firewall.delete_rule(&name).await)
            }
            UiCommand::ReorderRule { name, priority } => Ack::from_result(
                "reorder_rule",
                &firewall.reorder_rule(&name, priority).await,
            ),
            UiCommand::FlushCache => {
                firewall.flush_cache().await;
                Ack::from_result::<(), FirewallError>("flush_cache", &Ok(()))
            }
        };
        Some(DaemonMessage::Ack(ack))
    }

    fn answer(&self, response: PromptResponse) {
        let waiter = self
            .client
            .lock()
            .as_mut()
            .and_then(|c| c.waiting.remove(&response.request_id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => debug!("Answer for unknown or expired request {}", response.request_id),
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, message: &DaemonMessage) -> std::io::Result<()> {
    let mut json = serde_json::to_vec(message)?;
    json.push(b'\n');
    writer.write_all(&json).await
}

#[async_trait]
impl Prompter for UiServer {
    async fn ask(&self, request: PromptRequest) -> Result<PromptResponse> {
        let request_id = request.request_id;
        let rx = {
            let mut client = self.client.lock();
            let Some(client) = client.as_mut() else {
                return Err(FirewallError::Prompt("no UI connected".into()));
            };
            let (tx, rx) = oneshot::channel();
            client.waiting.insert(request_id, tx);
            if client.outbox.send(DaemonMessage::Prompt(request)).is_err() {
                client.waiting.remove(&request_id);
                return Err(FirewallError::Prompt("UI connection closing".into()));
            }
            rx
        };
        rx.await
            .map_err(|_| FirewallError::Prompt("UI disconnected before answering".into()))
    }

    async fn cancel(&self, request_id: u64) {
        if let Some(client) = self.client.lock().as_mut() {
            client.waiting.remove(&request_id);
            let _ = client.outbox.send(DaemonMessage::CancelPrompt { request_id });
        }
    }
}
