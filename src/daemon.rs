//! Daemon wiring: builds every component, spawns the long-lived tasks,
//! and fans one shutdown signal out to all of them.

use crate::api::{self, ApiState};
use crate::config::{self, RuntimeConfig};
use crate::error::{BridgeError, Result};
use crate::gateway::rest::DiscordRest;
use crate::gateway::session::GatewaySession;
use crate::gateway::{ChatPort, DiscordGateway, EventRouter, ThreadCells};
use crate::ide::actuator::platform_actuator;
use crate::ide::{ComposerStore, ConversationSource, MessageInjector};
use crate::interaction::InteractionManager;
use crate::registry::{MappingRegistry, PendingComposer, Resolver};
use crate::watcher::{ChatWatcher, NameSyncWatcher};

use anyhow::Context as _;
use arc_swap::ArcSwap;
use std::hash::{Hash as _, Hasher as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Workspace root this instance serves.
    pub workspace: PathBuf,
    /// Override for the per-workspace state directory.
    pub state_dir: Option<PathBuf>,
    /// Path to the bundled tool-protocol adapter, registered with the
    /// IDE when present.
    pub adapter_path: Option<PathBuf>,
}

/// Initialize tracing: compact console output plus a daily-rolling log
/// file under the instance directory.
pub fn init_tracing(debug: bool, log_dir: Option<&Path>) {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" })
    });
    let console = tracing_subscriber::fmt::layer().compact();

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bridgebot.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            // Leak the guard so the writer lives for the whole process.
            std::mem::forget(guard);
            let file = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
        }
    }
}

/// Per-workspace instance directory (state database, logs). Keyed by
/// folder name plus a hash of the full path so identically named
/// workspaces do not collide.
pub fn instance_dir(workspace: &Path) -> PathBuf {
    let label = workspace_label(workspace);
    let mut hasher = std::hash::DefaultHasher::new();
    workspace.hash(&mut hasher);
    let digest = hasher.finish();
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bridgebot")
        .join(format!("{label}-{digest:016x}"))
}

/// Base name of the workspace folder; doubles as the actuator's window
/// label.
pub fn workspace_label(workspace: &Path) -> String {
    workspace
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_owned())
}

pub async fn run(options: DaemonOptions) -> anyhow::Result<()> {
    let workspace = options
        .workspace
        .canonicalize()
        .with_context(|| format!("workspace not found: {}", options.workspace.display()))?;
    let label = workspace_label(&workspace);
    let instance = options
        .state_dir
        .clone()
        .unwrap_or_else(|| instance_dir(&workspace));

    let registry = Arc::new(MappingRegistry::open(&instance.join("state.redb"))?);
    let config = Arc::new(ArcSwap::from_pointee(RuntimeConfig {
        global: registry.load_global_config()?,
        project: registry.load_project_config()?,
    }));

    let db_path = ComposerStore::discover_state_db(&workspace)
        .context("could not locate the IDE's workspace storage for this folder")?;
    let store = Arc::new(
        ComposerStore::open(&db_path)
            .await
            .context("could not open the IDE state database")?,
    );
    tracing::info!(db = %db_path.display(), "IDE conversation store attached");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    if let Some(adapter) = &options.adapter_path
        && let Some(config_path) = crate::mcp::adapter_config_path()
    {
        match crate::mcp::ensure_adapter_config(&config_path, adapter) {
            Ok(true) => tracing::info!("adapter registration updated, IDE reload required"),
            Ok(false) => {}
            Err(error) => tracing::warn!(%error, "adapter registration failed"),
        }
    }

    let connected = Arc::new(AtomicBool::new(false));
    let pending = Arc::new(PendingComposer::new());
    let injector = Arc::new(MessageInjector::new(platform_actuator(), label.clone()));
    let source: Arc<dyn ConversationSource> = store.clone();

    let token = config::bot_token(registry.load_bot_token()?);
    let mut gateway_handle: Option<Arc<DiscordGateway>> = None;
    let mut reconnect_tx = None;

    let (chat, interactions): (Arc<dyn ChatPort>, Arc<InteractionManager>) = match token {
        Some(token) => {
            let cells = Arc::new(ThreadCells::new());
            let rest = Arc::new(DiscordRest::new(token.clone()));
            let gateway = Arc::new(DiscordGateway::new(
                Arc::clone(&rest),
                Arc::clone(&registry),
                Arc::clone(&config),
                Arc::clone(&cells),
                label.clone(),
            ));
            gateway_handle = Some(Arc::clone(&gateway));
            let chat: Arc<dyn ChatPort> = gateway;
            let interactions = Arc::new(InteractionManager::new(Arc::clone(&chat)));

            let router = Arc::new(EventRouter::new(
                Arc::clone(&chat),
                Arc::clone(&registry),
                Arc::clone(&interactions),
                injector.clone(),
                cells,
                Arc::clone(&connected),
            ));
            let (wire_tx, wire_rx) = mpsc::channel(256);
            tokio::spawn(router.run(wire_rx));

            let session = GatewaySession::new(
                token.clone(),
                Arc::clone(&rest),
                wire_tx.clone(),
                shutdown_rx.clone(),
            );
            let session_task = tokio::spawn(session.run());
            reconnect_tx = Some(spawn_reconnector(
                token,
                rest,
                wire_tx,
                shutdown_rx.clone(),
                session_task,
            ));

            let chat_watcher = Arc::new(ChatWatcher::new(
                Arc::clone(&chat),
                Arc::clone(&source),
                Arc::clone(&registry),
                Arc::clone(&pending),
                Arc::clone(&config),
            ));
            tokio::spawn(chat_watcher.run(shutdown_rx.clone()));

            let name_sync = Arc::new(NameSyncWatcher::new(
                Arc::clone(&chat),
                Arc::clone(&source),
                Arc::clone(&registry),
                store.watch_paths(),
            ));
            if let Err(error) = name_sync.seed_cache().await {
                tracing::warn!(%error, "name cache seeding failed");
            }
            tokio::spawn(name_sync.run(shutdown_rx.clone()));

            (chat, interactions)
        }
        None => {
            // Setup-required: serve the RPC surface (health reports the
            // missing connection) but run no gateway or watchers.
            tracing::warn!(
                "no bot credential found (set DISCORD_BOT_TOKEN); staying in setup-required state"
            );
            let chat: Arc<dyn ChatPort> = Arc::new(OfflineChat);
            let interactions = Arc::new(InteractionManager::new(Arc::clone(&chat)));
            (chat, interactions)
        }
    };

    let state = ApiState {
        chat: Arc::clone(&chat),
        registry: Arc::clone(&registry),
        resolver: Arc::new(Resolver::new(
            Arc::clone(&registry),
            pending,
            Arc::clone(&chat),
            source,
        )),
        interactions,
        delivery: injector,
        config,
        workspace_folders: vec![workspace.to_string_lossy().into_owned()],
        workspace_name: label,
        connected,
        reconnect_tx,
    };

    let (listener, _port) = api::bind_listener().await?;
    api::serve(listener, Arc::new(state), shutdown_rx).await?;

    if let Some(gateway) = gateway_handle {
        gateway.clear_typing().await;
    }
    tracing::info!("daemon stopped");
    Ok(())
}

/// Reconnect channel: spawns a fresh gateway session when signalled,
/// but only after the previous one has fatally exited.
fn spawn_reconnector(
    token: String,
    rest: Arc<DiscordRest>,
    wire_tx: mpsc::Sender<crate::gateway::WireEvent>,
    shutdown_rx: watch::Receiver<bool>,
    mut session_task: tokio::task::JoinHandle<Result<()>>,
) -> mpsc::Sender<()> {
    let (reconnect_tx, mut reconnect_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        while reconnect_rx.recv().await.is_some() {
            if !session_task.is_finished() {
                tracing::info!("gateway session still running, reconnect ignored");
                continue;
            }
            tracing::info!("reconnecting gateway session");
            let session = GatewaySession::new(
                token.clone(),
                Arc::clone(&rest),
                wire_tx.clone(),
                shutdown_rx.clone(),
            );
            session_task = tokio::spawn(session.run());
        }
    });
    reconnect_tx
}

/// Stand-in port while no gateway session exists: every chat operation
/// reports `NotConnected` (stop-typing stays a no-op success).
struct OfflineChat;

#[async_trait::async_trait]
impl ChatPort for OfflineChat {
    async fn create_thread(
        &self,
        _conversation_id: &crate::ConversationId,
        _name: &str,
    ) -> Result<crate::ThreadId> {
        Err(BridgeError::NotConnected)
    }

    async fn post_to_thread(
        &self,
        _thread_id: &crate::ThreadId,
        _text: &str,
        _as_embed: bool,
    ) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn post_plain(
        &self,
        _thread_id: &crate::ThreadId,
        _text: &str,
    ) -> Result<crate::MessageId> {
        Err(BridgeError::NotConnected)
    }

    async fn edit_message(
        &self,
        _thread_id: &crate::ThreadId,
        _message_id: &crate::MessageId,
        _content: &str,
        _components: Option<serde_json::Value>,
    ) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn reply_to_message(
        &self,
        _thread_id: &crate::ThreadId,
        _message_id: &crate::MessageId,
        _text: &str,
    ) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn react(
        &self,
        _thread_id: &crate::ThreadId,
        _message_id: &crate::MessageId,
        _emoji: &str,
    ) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn send_file(
        &self,
        _thread_id: &crate::ThreadId,
        _file: crate::gateway::FilePayload,
        _name: Option<&str>,
        _description: Option<&str>,
    ) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn rename_thread(&self, _thread_id: &crate::ThreadId, _name: &str) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn thread_name(&self, _thread_id: &crate::ThreadId) -> Result<String> {
        Err(BridgeError::NotConnected)
    }

    async fn archive_thread(&self, _thread_id: &crate::ThreadId) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn unarchive_thread(&self, _thread_id: &crate::ThreadId) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn is_thread_archived(&self, _thread_id: &crate::ThreadId) -> Result<Option<bool>> {
        Err(BridgeError::NotConnected)
    }

    async fn start_typing(&self, _thread_id: &crate::ThreadId) -> Result<()> {
        Err(BridgeError::NotConnected)
    }

    async fn stop_typing(&self, _thread_id: &crate::ThreadId) -> Result<()> {
        Ok(())
    }

    async fn respond_interaction(
        &self,
        _interaction_id: &str,
        _token: &str,
        _response: serde_json::Value,
    ) -> Result<()> {
        Err(BridgeError::NotConnected)
    }
}
