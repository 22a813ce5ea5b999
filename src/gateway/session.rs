//! Gateway websocket session.
//!
//! Holds the persistent connection to Discord's Gateway: Hello →
//! Identify (or Resume) → dispatch loop, with a heartbeat task that
//! detects zombie connections and an exponential backoff between
//! reconnect attempts. Dispatches the bridge cares about are relayed to
//! the event router as [`WireEvent`]s; everything else dies here.

use crate::error::{BridgeError, Result};
use crate::gateway::protocol::{self, Frame, close_code, opcode};
use crate::gateway::rest::DiscordRest;
use crate::gateway::WireEvent;

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsReader = futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type WsWriter =
    futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Exponential backoff with full jitter.
struct Backoff {
    base_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl Backoff {
    fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            current_ms: base_ms,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let jittered = fastrand::u64(self.base_ms..=self.current_ms.max(self.base_ms));
        self.current_ms = (self.current_ms * 2).min(self.max_ms);
        Duration::from_millis(jittered)
    }

    fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }
}

/// Resume state carried across reconnects.
#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_url: Option<String>,
}

impl SessionState {
    fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.resume_url.is_some()
    }

    fn clear(&mut self) {
        self.session_id = None;
        self.resume_url = None;
    }
}

enum LoopAction {
    Shutdown,
    Resume,
    Reconnect,
}

pub struct GatewaySession {
    token: String,
    rest: Arc<DiscordRest>,
    events: mpsc::Sender<WireEvent>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    /// Set when READY/RESUMED arrives; the reconnect loop resets its
    /// backoff only after a handshake actually completed.
    handshake_completed: bool,
}

impl GatewaySession {
    pub fn new(
        token: String,
        rest: Arc<DiscordRest>,
        events: mpsc::Sender<WireEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            token,
            rest,
            events,
            shutdown,
            state: SessionState::default(),
            handshake_completed: false,
        }
    }

    /// Run until shutdown or a fatal close code. Reconnects internally.
    pub async fn run(mut self) -> Result<()> {
        let mut backoff = Backoff::new(1_000, 60_000);

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            self.handshake_completed = false;
            match self.connect_and_run().await {
                Ok(LoopAction::Shutdown) => return Ok(()),
                Ok(LoopAction::Resume) => {
                    let delay = Duration::from_millis(fastrand::u64(500..=3_000));
                    tracing::info!(delay_ms = delay.as_millis() as u64, "resuming gateway session");
                    if self.sleep_or_shutdown(delay).await {
                        return Ok(());
                    }
                }
                Ok(LoopAction::Reconnect) => {
                    self.state.clear();
                    let delay = backoff.next_delay();
                    tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting to gateway");
                    self.notify_disconnect("reconnecting").await;
                    if self.sleep_or_shutdown(delay).await {
                        return Ok(());
                    }
                }
                Err(error) if is_fatal(&error) => {
                    tracing::error!(%error, "fatal gateway error");
                    self.notify_disconnect(&error.to_string()).await;
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(%error, "gateway connection error");
                    self.state.clear();
                    let delay = backoff.next_delay();
                    self.notify_disconnect("connection error").await;
                    if self.sleep_or_shutdown(delay).await {
                        return Ok(());
                    }
                }
            }

            if self.handshake_completed {
                backoff.reset();
            }
        }
    }

    async fn connect_and_run(&mut self) -> Result<LoopAction> {
        let base_url = match &self.state.resume_url {
            Some(url) if self.state.can_resume() => url.clone(),
            _ => self.rest.gateway_url().await?,
        };
        let ws_url = format!("{base_url}?v=10&encoding=json");
        tracing::debug!(url = %ws_url, "connecting to gateway");

        let (stream, _response) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|error| BridgeError::Gateway(format!("websocket connect failed: {error}")))?;
        let (writer, mut reader) = stream.split();

        let hello = self.wait_for_hello(&mut reader).await?;

        let sequence = Arc::new(Mutex::new(self.state.sequence));
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(64);
        let (zombie_tx, zombie_rx) = oneshot::channel();

        let heartbeat = tokio::spawn(run_heartbeat(
            hello.heartbeat_interval,
            Arc::clone(&sequence),
            outbound_tx.clone(),
            zombie_tx,
        ));
        let mut writer_task = tokio::spawn(run_writer(writer, outbound_rx));

        let auth = if self.state.can_resume() {
            protocol::resume(
                &self.token,
                self.state.session_id.as_deref().unwrap_or(""),
                self.state.sequence.unwrap_or(0),
            )
        } else {
            protocol::identify(&self.token)
        };
        outbound_tx
            .send(auth)
            .await
            .map_err(|_| BridgeError::Gateway("writer task closed".into()))?;

        let action = self
            .event_loop(&mut reader, &outbound_tx, &sequence, zombie_rx)
            .await;

        heartbeat.abort();
        drop(outbound_tx);
        tokio::select! {
            _ = &mut writer_task => {}
            () = tokio::time::sleep(Duration::from_secs(2)) => writer_task.abort(),
        }

        action
    }

    async fn wait_for_hello(&self, reader: &mut WsReader) -> Result<protocol::Hello> {
        let hello = async {
            loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frame: Frame = serde_json::from_str(&text)?;
                        if frame.op == opcode::HELLO {
                            let data = frame
                                .d
                                .ok_or_else(|| BridgeError::Gateway("hello without data".into()))?;
                            return Ok(serde_json::from_value::<protocol::Hello>(data)?);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        return Err(BridgeError::Gateway(format!("read error: {error}")));
                    }
                    None => {
                        return Err(BridgeError::Gateway("closed before hello".into()));
                    }
                }
            }
        };
        tokio::time::timeout(HELLO_TIMEOUT, hello)
            .await
            .map_err(|_| BridgeError::Timeout)?
    }

    async fn event_loop(
        &mut self,
        reader: &mut WsReader,
        outbound_tx: &mpsc::Sender<Frame>,
        sequence: &Arc<Mutex<Option<u64>>>,
        mut zombie_rx: oneshot::Receiver<()>,
    ) -> Result<LoopAction> {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(LoopAction::Shutdown);
                    }
                }

                _ = &mut zombie_rx => {
                    tracing::warn!("heartbeat ack missed, treating connection as dead");
                    return Ok(self.resume_or_reconnect());
                }

                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let frame: Frame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(error) => {
                                tracing::warn!(%error, "unparseable gateway frame");
                                continue;
                            }
                        };
                        if let Some(action) =
                            self.handle_frame(frame, outbound_tx, sequence).await?
                        {
                            return Ok(action);
                        }
                    }
                    Some(Ok(Message::Close(close))) => {
                        let code = close.as_ref().map_or(1000, |frame| frame.code.into());
                        return self.classify_close(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(%error, "websocket read error");
                        return Ok(self.resume_or_reconnect());
                    }
                    None => {
                        tracing::warn!("websocket stream ended");
                        return Ok(self.resume_or_reconnect());
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        outbound_tx: &mpsc::Sender<Frame>,
        sequence: &Arc<Mutex<Option<u64>>>,
    ) -> Result<Option<LoopAction>> {
        match frame.op {
            opcode::DISPATCH => {
                if let Some(seq) = frame.s {
                    *sequence.lock().await = Some(seq);
                    self.state.sequence = Some(seq);
                }
                self.handle_dispatch(frame).await;
                Ok(None)
            }
            opcode::HEARTBEAT => {
                let seq = *sequence.lock().await;
                let _ = outbound_tx.send(protocol::heartbeat(seq)).await;
                Ok(None)
            }
            opcode::HEARTBEAT_ACK => {
                ACK_PENDING.store(false, std::sync::atomic::Ordering::Relaxed);
                Ok(None)
            }
            opcode::RECONNECT => Ok(Some(LoopAction::Resume)),
            opcode::INVALID_SESSION => {
                let resumable = frame
                    .d
                    .as_ref()
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if resumable {
                    Ok(Some(LoopAction::Resume))
                } else {
                    self.state.clear();
                    Ok(Some(LoopAction::Reconnect))
                }
            }
            _ => Ok(None),
        }
    }

    async fn handle_dispatch(&mut self, frame: Frame) {
        let name = frame.t.as_deref().unwrap_or("");
        match name {
            "READY" => {
                let Some(data) = frame.d else { return };
                match serde_json::from_value::<protocol::Ready>(data) {
                    Ok(ready) => {
                        tracing::info!(
                            session_id = %ready.session_id,
                            bot_user_id = %ready.user.id,
                            "gateway session ready"
                        );
                        self.state.session_id = Some(ready.session_id.clone());
                        self.state.resume_url = Some(ready.resume_gateway_url);
                        self.handshake_completed = true;
                        let _ = self
                            .events
                            .send(WireEvent::Ready {
                                bot_user_id: ready.user.id,
                                session_id: ready.session_id,
                            })
                            .await;
                    }
                    Err(error) => tracing::warn!(%error, "malformed READY payload"),
                }
            }
            "RESUMED" => {
                tracing::info!("gateway session resumed");
                self.handshake_completed = true;
            }
            name if protocol::is_relayed_event(name) => {
                let Some(payload) = frame.d else { return };
                let _ = self
                    .events
                    .send(WireEvent::Dispatch {
                        name: name.to_owned(),
                        payload,
                    })
                    .await;
            }
            _ => {}
        }
    }

    fn classify_close(&mut self, code: u16) -> Result<LoopAction> {
        match code {
            close_code::AUTHENTICATION_FAILED => Err(BridgeError::PermissionDenied(
                "gateway rejected the bot token".into(),
            )),
            close_code::INVALID_INTENTS | close_code::DISALLOWED_INTENTS => {
                Err(BridgeError::Gateway(format!(
                    "gateway intents rejected (close {code}); enable Message Content in the developer portal"
                )))
            }
            1000 | 1001 => {
                self.state.clear();
                Ok(LoopAction::Reconnect)
            }
            _ => {
                tracing::warn!(code, "gateway closed, attempting resume");
                Ok(self.resume_or_reconnect())
            }
        }
    }

    fn resume_or_reconnect(&self) -> LoopAction {
        if self.state.can_resume() {
            LoopAction::Resume
        } else {
            LoopAction::Reconnect
        }
    }

    async fn notify_disconnect(&self, reason: &str) {
        let _ = self
            .events
            .send(WireEvent::Disconnected {
                reason: reason.to_owned(),
            })
            .await;
    }

    /// Returns true when shutdown fired during the sleep.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => *self.shutdown.borrow(),
            () = tokio::time::sleep(duration) => false,
        }
    }
}

/// Heartbeat ACK bookkeeping shared with the frame handler. One gateway
/// session exists per process.
static ACK_PENDING: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

async fn run_heartbeat(
    interval_ms: u64,
    sequence: Arc<Mutex<Option<u64>>>,
    outbound_tx: mpsc::Sender<Frame>,
    zombie_tx: oneshot::Sender<()>,
) {
    ACK_PENDING.store(false, std::sync::atomic::Ordering::Relaxed);

    // Jitter the first beat to avoid a thundering herd on mass restarts.
    let first = interval_ms * u64::from(fastrand::u32(0..1000)) / 1000;
    tokio::time::sleep(Duration::from_millis(first)).await;

    let interval = Duration::from_millis(interval_ms);
    loop {
        if ACK_PENDING.load(std::sync::atomic::Ordering::Relaxed) {
            let _ = zombie_tx.send(());
            return;
        }
        let seq = *sequence.lock().await;
        if outbound_tx.send(protocol::heartbeat(seq)).await.is_err() {
            return;
        }
        ACK_PENDING.store(true, std::sync::atomic::Ordering::Relaxed);
        tokio::time::sleep(interval).await;
    }
}

async fn run_writer(mut writer: WsWriter, mut outbound_rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = outbound_rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(error) => {
                tracing::error!(%error, "failed to serialize gateway frame");
                continue;
            }
        };
        if let Err(error) = writer.send(Message::Text(json.into())).await {
            tracing::debug!(%error, "gateway writer send failed");
            break;
        }
    }
}

fn is_fatal(error: &BridgeError) -> bool {
    matches!(error, BridgeError::PermissionDenied(_))
        || matches!(error, BridgeError::Gateway(message) if message.contains("intents rejected"))
}
