//! Shared state handed to every RPC handler.

use crate::config::RuntimeConfig;
use crate::gateway::ChatPort;
use crate::ide::ConversationDelivery;
use crate::interaction::InteractionManager;
use crate::registry::{MappingRegistry, Resolver};

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::mpsc;

pub struct ApiState {
    pub chat: Arc<dyn ChatPort>,
    pub registry: Arc<MappingRegistry>,
    pub resolver: Arc<Resolver>,
    pub interactions: Arc<InteractionManager>,
    pub delivery: Arc<dyn ConversationDelivery>,
    pub config: Arc<ArcSwap<RuntimeConfig>>,
    /// Absolute workspace folder paths served by this instance; the
    /// adapter's discovery handshake matches against these.
    pub workspace_folders: Vec<String>,
    pub workspace_name: String,
    pub connected: Arc<AtomicBool>,
    /// Signals the daemon to re-establish the gateway session.
    pub reconnect_tx: Option<mpsc::Sender<()>>,
}
