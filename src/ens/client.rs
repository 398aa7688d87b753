//! The streaming client: connection pump, liveness monitor, and the
//! token-aware reconnect ladder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result as AnyResult;
use futures_channel::mpsc::UnboundedSender;
use futures_util::{pin_mut, StreamExt};
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

use crate::config::Config;
use crate::ens::data::ActivityItem;
use crate::ens::frame::FrameDecoder;
use crate::ens::{classify_payload, EnsEvent, EnsEventKind, PayloadClass};
use crate::error::{convert_tungstenite_error, processing_error, EngineError};
use crate::notify::NotifyLevel;
use crate::prelude::SharedNotifier;
use crate::rest::BrokerClient;
use crate::waiters::WaiterRegistry;

/// First reconnect delay; doubles per attempt up to the configured ceiling.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Random extra on top of each reconnect delay.
const RECONNECT_JITTER_MS: u64 = 500;

/// Everything the connection machinery tracks about the live stream.
#[derive(Debug, Default)]
struct StreamState {
    context_id: Option<String>,
    subscription_id: Option<String>,
    last_message_id: Option<u64>,
    last_any_message: Option<Instant>,
    ping_sent_at: Option<Instant>,
    last_ping_ok: Option<Instant>,
    last_rtt: Option<Duration>,
    last_close: Option<String>,
    reconnect_attempts: u32,
    stale_reported: bool,
    episode_notified: Vec<u64>,
}

/// Why the connection pump returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    Shutdown,
    Transport,
    Reconnect { force_new_context: bool },
}

/// Why a connect attempt failed.
#[derive(Debug)]
enum ConnectFailure {
    /// HTTP 409 on the upgrade: the context is unusable, build a new one.
    Conflict,
    /// The server reports too many subscriptions; delete ours and retry.
    SubscriptionLimit,
    /// Anything else; retried on the soft path.
    Other(String),
}

/// The streaming client. Owns no trades — it turns the socket into
/// normalized events for the [`WaiterRegistry`] and keeps itself connected.
#[derive(Debug)]
pub struct EnsClient {
    broker: Arc<BrokerClient>,
    registry: Arc<WaiterRegistry>,
    notifier: SharedNotifier,
    config: Config,
    state: Mutex<StreamState>,
    write_tx: Mutex<Option<UnboundedSender<Message>>>,
    /// Guard so only one reconnect sequence runs at a time.
    reconnecting: AtomicBool,
    wake: Notify,
    shutdown: Arc<AtomicBool>,
}

impl EnsClient {
    /// A client over an authenticated broker session.
    #[must_use]
    pub fn new(
        broker: Arc<BrokerClient>,
        registry: Arc<WaiterRegistry>,
        notifier: SharedNotifier,
        config: Config,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            registry,
            notifier,
            config,
            state: Mutex::new(StreamState::default()),
            write_tx: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown,
        })
    }

    /// Spawn the supervisor (connect/receive/reconnect) and the liveness
    /// monitor. Both run until the shared shutdown flag is set.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let supervisor = {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.supervise().await })
        };
        let monitor = {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.monitor().await })
        };

        vec![supervisor, monitor]
    }

    /// Wake the pump and monitor so a freshly set shutdown flag is noticed.
    pub fn wake_for_shutdown(&self) {
        self.wake.notify_one();
    }

    /// The subscription reference currently held, for deletion at shutdown.
    pub async fn subscription_id(&self) -> Option<String> {
        self.state.lock().await.subscription_id.clone()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------

    async fn supervise(&self) {
        let mut force_new_context = false;

        loop {
            if self.is_shutdown() {
                break;
            }

            if let Err(err) = self.ensure_subscription(force_new_context).await {
                log::error!("ENS subscription setup failed: {err}");
                self.notifier.notify(
                    NotifyLevel::Warning,
                    &format!("ENS subscription setup failed: {err}"),
                );
                self.backoff().await;
                continue;
            }
            force_new_context = false;

            match self.connect_once().await {
                Ok(stream) => {
                    {
                        let mut state = self.state.lock().await;
                        state.reconnect_attempts = 0;
                        state.stale_reported = false;
                        state.episode_notified.clear();
                        state.last_any_message = Some(Instant::now());
                    }
                    log::info!("ENS stream connected");

                    match self.pump(stream).await {
                        PumpExit::Shutdown => break,
                        PumpExit::Reconnect {
                            force_new_context: force,
                        } => force_new_context = force,
                        PumpExit::Transport => {}
                    }
                }
                Err(ConnectFailure::Conflict) => {
                    log::warn!("ENS connect rejected with 409, new context required");
                    force_new_context = true;
                }
                Err(ConnectFailure::SubscriptionLimit) => {
                    log::warn!("subscription limit hit, deleting previous subscription");
                    if let Some(subscription_id) = self.subscription_id().await {
                        if let Err(err) =
                            self.broker.delete_ens_subscription(&subscription_id).await
                        {
                            log::warn!("delete of {subscription_id} failed: {err}");
                        }
                    }
                    force_new_context = true;
                }
                Err(ConnectFailure::Other(err)) => {
                    log::warn!("ENS connect failed: {err}");
                }
            }

            if self.is_shutdown() {
                break;
            }

            self.backoff().await;

            if !force_new_context && !self.prepare_soft_reconnect().await {
                force_new_context = true;
            }
        }

        log::info!("ENS supervisor stopped");
    }

    /// Create the streaming context and subscription when missing or when a
    /// hard reconnect demands fresh ones. A new context discards the resume
    /// message id.
    async fn ensure_subscription(&self, force_new: bool) -> Result<(), EngineError> {
        {
            let state = self.state.lock().await;
            if !force_new && state.subscription_id.is_some() {
                return Ok(());
            }
        }

        let context_id = new_context_id();
        let reference_id = format!("ens-{}", random_lower_alnum(6));

        let subscription = match self
            .broker
            .create_ens_subscription(&context_id, &reference_id)
            .await
        {
            Ok(subscription) => subscription,
            Err(EngineError::Status { status, ref body })
                if body.contains("SubscriptionLimitExceeded") =>
            {
                log::warn!("subscription create hit the limit ({status}), deleting previous");
                if let Some(previous) = self.subscription_id().await {
                    self.broker.delete_ens_subscription(&previous).await?;
                }
                self.broker
                    .create_ens_subscription(&context_id, &reference_id)
                    .await?
            }
            Err(err) => return Err(err),
        };

        let mut state = self.state.lock().await;
        state.context_id = Some(subscription.context_id);
        state.subscription_id = Some(subscription.reference_id);
        state.last_message_id = None;

        Ok(())
    }

    /// Soft path between attempts: refresh the token and re-authorize the
    /// preserved context. `false` asks the caller to fall back to a fresh
    /// context.
    async fn prepare_soft_reconnect(&self) -> bool {
        if let Err(err) = self.broker.refresh_access_token().await {
            log::warn!("token refresh for reconnect failed: {err}");
            return false;
        }

        if self.config.streaming_authorize_enabled {
            let context_id = self.state.lock().await.context_id.clone();
            if let Some(context_id) = context_id {
                if let Err(err) = self.broker.authorize_streaming_context(&context_id).await {
                    log::warn!("stream re-authorization failed: {err}");
                    return false;
                }
            }
        }

        true
    }

    async fn connect_once(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        ConnectFailure,
    > {
        let (context_id, last_message_id) = {
            let state = self.state.lock().await;
            (state.context_id.clone(), state.last_message_id)
        };
        let Some(context_id) = context_id else {
            return Err(ConnectFailure::Other("no streaming context".to_owned()));
        };
        let Some(token) = self.broker.access_token().await else {
            return Err(ConnectFailure::Other("no access token".to_owned()));
        };
        let Some(ref base) = self.config.streaming_url else {
            return Err(ConnectFailure::Other("streaming_url not set".to_owned()));
        };

        let mut url = format!(
            "{}/connect?contextId={context_id}&authorization=BEARER%20{token}",
            base.as_str().trim_end_matches('/')
        );
        if let Some(message_id) = last_message_id {
            url.push_str(&format!("&messageid={message_id}"));
        }

        match connect_async(url).await {
            Ok((stream, _)) => Ok(stream),
            Err(tungstenite::Error::Http(response)) => {
                let body = response
                    .body()
                    .as_ref()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default();

                if response.status().as_u16() == 409 {
                    Err(ConnectFailure::Conflict)
                } else if body.contains("SubscriptionLimitExceeded") {
                    Err(ConnectFailure::SubscriptionLimit)
                } else {
                    Err(ConnectFailure::Other(format!(
                        "upgrade failed with {}: {body}",
                        response.status()
                    )))
                }
            }
            Err(err) => Err(ConnectFailure::Other(err.to_string())),
        }
    }

    /// Exponential backoff with jitter before the next attempt. Single
    /// flight: a concurrent entry waits its own turn rather than stacking.
    async fn backoff(&self) {
        while self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tokio::time::sleep(RECONNECT_BASE_DELAY).await;
            if self.is_shutdown() {
                return;
            }
        }

        let attempts = {
            let mut state = self.state.lock().await;
            state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
            state.reconnect_attempts
        };

        let ceiling = Duration::from_secs(self.config.ens_reconnect_max_delay_seconds.max(1));
        let exp = RECONNECT_BASE_DELAY
            .checked_mul(1 << (attempts - 1).min(16))
            .unwrap_or(ceiling)
            .min(ceiling);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=RECONNECT_JITTER_MS));

        log::info!(
            "reconnect attempt {attempts} in {:?}",
            exp + jitter
        );
        tokio::time::sleep(exp + jitter).await;

        self.reconnecting.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Connection pump
    // ------------------------------------------------------------------

    async fn pump(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> PumpExit {
        let (write_tx, write_rx) = futures_channel::mpsc::unbounded::<Message>();
        *self.write_tx.lock().await = Some(write_tx);

        let (sink, mut read) = stream.split();
        let forward = write_rx.map(Ok).forward(sink);
        pin_mut!(forward);

        let mut decoder = FrameDecoder::new();
        let mut keepalive =
            tokio::time::interval(Duration::from_secs(self.config.ws_ping_interval.max(1)));
        keepalive.reset();

        let exit = loop {
            tokio::select! {
                () = self.wake.notified() => {
                    if self.is_shutdown() {
                        // Close handshake: queue the frame, keep the pump
                        // polling until it is flushed and answered.
                        self.send_message(Message::Close(None)).await;
                        let close_timeout =
                            Duration::from_secs(self.config.ws_close_timeout.max(1));
                        let _ = tokio::time::timeout(close_timeout, async {
                            loop {
                                tokio::select! {
                                    _ = &mut forward => break,
                                    message = read.next() => match message {
                                        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                                        Some(Ok(_)) => {}
                                    }
                                }
                            }
                        })
                        .await;
                        break PumpExit::Shutdown;
                    }
                    if self.stale_now().await {
                        break PumpExit::Reconnect { force_new_context: false };
                    }
                    // Spurious wake; the stream recovered before we noticed.
                }
                _ = keepalive.tick() => {
                    self.send_message(Message::Ping(Vec::new())).await;
                }
                _ = &mut forward => break PumpExit::Transport,
                message = read.next() => match message {
                    None => break PumpExit::Transport,
                    Some(Err(err)) => {
                        let err = convert_tungstenite_error(err);
                        self.state.lock().await.last_close = Some(err.to_string());
                        log::warn!("ENS read failed: {err}");
                        break PumpExit::Transport;
                    }
                    Some(Ok(message)) => match self.handle_message(message, &mut decoder).await {
                        Ok(None) => {}
                        Ok(Some(exit)) => break exit,
                        Err(err) => match processing_error(err) {
                            EngineError::PayloadFormat(format) => {
                                log::error!("unsupported payload format {format}, reconnecting");
                                break PumpExit::Reconnect { force_new_context: false };
                            }
                            err => log::warn!("ENS message dropped: {err}"),
                        }
                    }
                }
            }
        };

        *self.write_tx.lock().await = None;

        exit
    }

    async fn send_message(&self, message: Message) {
        let guard = self.write_tx.lock().await;
        if let Some(ref tx) = *guard {
            if tx.unbounded_send(message).is_err() {
                log::debug!("write pump already gone");
            }
        }
    }

    async fn stale_now(&self) -> bool {
        let state = self.state.lock().await;
        state
            .last_any_message
            .is_some_and(|last| last.elapsed().as_secs() > self.config.ens_stale_seconds)
    }

    async fn handle_message(
        &self,
        message: Message,
        decoder: &mut FrameDecoder,
    ) -> AnyResult<Option<PumpExit>> {
        self.touch().await;

        match message {
            Message::Binary(data) => {
                for frame in decoder.decode(&data)? {
                    self.state.lock().await.last_message_id = Some(frame.message_id);

                    if frame.reference_id == "_heartbeat" {
                        continue;
                    }

                    let payload = frame.payload_json()?;
                    if let Some(exit) = self.process_payload(&payload).await? {
                        return Ok(Some(exit));
                    }
                }
            }
            Message::Text(text) => {
                let payload: serde_json::Value = serde_json::from_str(&text)?;
                return self.process_text_payload(&payload).await;
            }
            Message::Ping(data) => self.send_message(Message::Pong(data)).await,
            Message::Pong(_) => {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.last_rtt = state.ping_sent_at.map(|sent| now - sent);
                state.last_ping_ok = Some(now);
            }
            Message::Close(frame) => {
                self.state.lock().await.last_close =
                    frame.map(|frame| format!("{}: {}", frame.code, frame.reason));
                return Ok(Some(PumpExit::Transport));
            }
            Message::Frame(_) => {}
        }

        Ok(None)
    }

    /// Text frames carry one payload directly, or a list of them; the
    /// `_heartbeat` entries only feed the liveness clock.
    async fn process_text_payload(
        &self,
        payload: &serde_json::Value,
    ) -> AnyResult<Option<PumpExit>> {
        if let Some(items) = payload.as_array() {
            for item in items {
                if is_heartbeat(item) {
                    continue;
                }
                if let Some(exit) = self.process_payload(item).await? {
                    return Ok(Some(exit));
                }
            }
            return Ok(None);
        }

        if is_heartbeat(payload) {
            return Ok(None);
        }

        self.process_payload(payload).await
    }

    async fn process_payload(&self, payload: &serde_json::Value) -> AnyResult<Option<PumpExit>> {
        match classify_payload(payload) {
            PayloadClass::Control(trigger) => {
                log::warn!("control payload `{trigger}`, reconnecting");
                self.notifier.notify(
                    NotifyLevel::Warning,
                    &format!("ENS control message `{trigger}`, rebuilding the stream"),
                );
                Ok(Some(PumpExit::Reconnect {
                    force_new_context: false,
                }))
            }
            PayloadClass::Activity => {
                let items: Vec<ActivityItem> = match payload.get("Data") {
                    Some(data) => serde_json::from_value(data.clone())?,
                    None => match payload.as_array() {
                        Some(_) => serde_json::from_value(payload.clone())?,
                        None => {
                            log::debug!("payload without Data list ignored");
                            Vec::new()
                        }
                    },
                };

                for item in &items {
                    if let Some(event) = item.to_event() {
                        self.dispatch(event).await;
                    }
                }

                Ok(None)
            }
        }
    }

    async fn dispatch(&self, event: EnsEvent) {
        if event.kind == EnsEventKind::OrderStatusChange {
            if let Some(ref order_id) = event.order_id {
                // A canceled TP/SL no longer needs canceling at exit.
                self.broker.remove_related_order(order_id).await;
            }
        }

        log::debug!(
            "ENS event {:?} uic {} order {:?}",
            event.kind,
            event.uic,
            event.order_id
        );
        self.registry.dispatch(event).await;
    }

    async fn touch(&self) {
        let mut state = self.state.lock().await;
        state.last_any_message = Some(Instant::now());
        state.stale_reported = false;
        state.episode_notified.clear();
    }

    // ------------------------------------------------------------------
    // Liveness monitor
    // ------------------------------------------------------------------

    async fn monitor(&self) {
        let interval = Duration::from_secs(self.config.ens_monitor_interval_seconds.max(1));
        let ping_timeout = Duration::from_secs(self.config.ws_ping_timeout.max(1));

        loop {
            tokio::time::sleep(interval).await;
            if self.is_shutdown() {
                break;
            }

            let connected = self.write_tx.lock().await.is_some();
            if connected {
                self.state.lock().await.ping_sent_at = Some(Instant::now());
                self.send_message(Message::Ping(Vec::new())).await;
                tokio::time::sleep(ping_timeout).await;

                let state = self.state.lock().await;
                let answered = match (state.ping_sent_at, state.last_ping_ok) {
                    (Some(sent), Some(ok)) => ok >= sent,
                    _ => false,
                };
                if answered {
                    log::debug!("ENS ping ok, rtt {:?}", state.last_rtt);
                } else {
                    log::warn!("ENS ping unanswered after {ping_timeout:?}");
                }
            }

            self.check_silence().await;

            if self.is_shutdown() {
                break;
            }
        }

        log::info!("ENS monitor stopped");
    }

    /// Threshold notifications and the staleness trigger, one report per
    /// disconnect episode.
    async fn check_silence(&self) {
        let mut state = self.state.lock().await;
        let Some(last) = state.last_any_message else {
            return;
        };
        let silent = last.elapsed().as_secs();

        for &threshold in &self.config.ens_notify_thresholds {
            if silent >= threshold && !state.episode_notified.contains(&threshold) {
                state.episode_notified.push(threshold);
                self.notifier.notify(
                    NotifyLevel::Warning,
                    &format!("no ENS activity for {threshold}s"),
                );
            }
        }

        if silent > self.config.ens_stale_seconds && !state.stale_reported {
            state.stale_reported = true;
            log::warn!(
                "ENS stale after {silent}s: last message id {:?}, last ping ok {:?}, rtt {:?}, close {:?}",
                state.last_message_id,
                state.last_ping_ok.map(|at| at.elapsed()),
                state.last_rtt,
                state.last_close,
            );
            drop(state);
            self.wake.notify_one();
        }
    }
}

/// Heartbeat payloads only feed the liveness clock.
fn is_heartbeat(payload: &serde_json::Value) -> bool {
    payload.get("ReferenceId").and_then(serde_json::Value::as_str) == Some("_heartbeat")
}

/// A fresh streaming context id: `ctx-{last 10 digits of epoch ms}-{8
/// random lowercase alnum}`.
#[must_use]
pub fn new_context_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis()
        .to_string();
    let tail_start = millis.len().saturating_sub(10);

    format!("ctx-{}-{}", &millis[tail_start..], random_lower_alnum(8))
}

/// Random string over `[a-z0-9]`.
fn random_lower_alnum(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();

    (0..len)
        .map(|_| char::from(CHARSET[rng.gen_range(0..CHARSET.len())]))
        .collect()
}
