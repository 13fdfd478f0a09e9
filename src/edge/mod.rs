pub mod worker;
pub use worker::{
    PeerConnectionConfig, PeerConnectionFactory, PeerConnectionHandle, PeerConnectionWorker,
    PeerEvent,
};

use crate::config::{EdgeConfig, SipConfig};
use crate::message::{
    make_client_id, make_request_id, CallClaimedPayload, CallErrorPayload, CallStateSnapshot,
    CallUpdatePayload, ClientId, ConnectionState, ConnectionUpdatePayload, Envelope,
    IncomingCallPayload, MediaCommand, MediaControlPayload, MessageType, RegistrationState,
    RegistrationUpdatePayload, RequestId, ResponsePayload, SipInitResultPayload,
};
use crate::transport::ChannelConnection;
use crate::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_BUS_CAPACITY: usize = 64;

/// Resolved by `initialize()` once the hub has admitted this edge.
#[derive(Debug, Clone)]
pub struct InitializeResult {
    pub client_id: ClientId,
    pub state: CallStateSnapshot,
}

/// Events surfaced to page code. `Message` fires for every inbound envelope;
/// the typed variants fire additionally for the envelopes they cover.
#[derive(Debug, Clone)]
pub enum EdgeEvent {
    StateUpdate(CallStateSnapshot),
    SipInitResult(SipInitResultPayload),
    SipConnectionUpdate(ConnectionUpdatePayload),
    SipRegistrationUpdate(RegistrationUpdatePayload),
    CallUpdate(CallUpdatePayload),
    IncomingCall(IncomingCallPayload),
    CallClaimed(CallClaimedPayload),
    CallError(CallErrorPayload),
    Message(Envelope),
}

type PendingSender = oneshot::Sender<std::result::Result<Value, String>>;

struct EdgeInner {
    client_id: ClientId,
    channel: ChannelConnection,
    config: EdgeConfig,
    pending: Mutex<HashMap<RequestId, PendingSender>>,
    events: broadcast::Sender<EdgeEvent>,
    worker: PeerConnectionWorker,
    cancel_token: CancellationToken,
    usable: AtomicBool,
    closed: AtomicBool,
    ready: watch::Sender<Option<CallStateSnapshot>>,
    sip_initialized: AtomicBool,
    sip_connect_timeout: AtomicU64,
}

/// Per-tab client: opens the channel to the hub, correlates its requests,
/// and exposes the SIP and call API to page code. Also services inbound
/// remote-SDP operations by delegating to the peer-connection worker.
#[derive(Clone)]
pub struct EdgeClient {
    inner: Arc<EdgeInner>,
}

impl EdgeClient {
    /// Builds a client over an already-established channel half. The hub
    /// side must be attached separately (see `Hub::connect`).
    pub fn over(
        channel: ChannelConnection,
        config: EdgeConfig,
        pc_factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let client_id = make_client_id();
        let worker = PeerConnectionWorker::new(
            client_id.clone(),
            pc_factory,
            channel.clone(),
            config.ice_servers.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (ready, _) = watch::channel(None);
        let cancel_token = channel.cancel_token().child_token();
        let client = EdgeClient {
            inner: Arc::new(EdgeInner {
                client_id,
                channel,
                config,
                pending: Mutex::new(HashMap::new()),
                events,
                worker,
                cancel_token,
                usable: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                ready,
                sip_initialized: AtomicBool::new(false),
                sip_connect_timeout: AtomicU64::new(
                    crate::config::DEFAULT_CONNECTION_TIMEOUT_MS,
                ),
            }),
        };
        client.spawn_recv_loop();
        client
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_usable(&self) -> bool {
        self.inner.usable.load(Ordering::SeqCst) && !self.inner.cancel_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.inner.events.subscribe()
    }

    /// Announces this edge to the hub and resolves on the first
    /// `StateUpdate`, taken as hub-ready. On timeout the client is flagged
    /// unusable.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let mut ready_rx = self.inner.ready.subscribe();
        let envelope = Envelope::new(MessageType::ClientConnected)
            .client(self.inner.client_id.clone());
        self.post(envelope)?;

        let wait = async {
            loop {
                if let Some(snapshot) = ready_rx.borrow().clone() {
                    return snapshot;
                }
                if ready_rx.changed().await.is_err() {
                    break;
                }
            }
            CallStateSnapshot::default()
        };
        match timeout(
            Duration::from_millis(self.inner.config.initialize_timeout_ms),
            wait,
        )
        .await
        {
            Ok(state) => Ok(InitializeResult {
                client_id: self.inner.client_id.clone(),
                state,
            }),
            Err(_) => {
                self.inner.usable.store(false, Ordering::SeqCst);
                Err(crate::Error::RequestTimeout("initialize".to_string()))
            }
        }
    }

    /// Typed RPC to the hub. Settles exactly once: with the response data,
    /// with the response error, on timeout, or when the client closes.
    pub async fn request(
        &self,
        action: &str,
        payload: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Value> {
        self.require_usable()?;
        let request_id = make_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);

        let mut envelope = Envelope::new(MessageType::Request)
            .client(self.inner.client_id.clone())
            .request(request_id.clone())
            .action(action);
        if let Some(payload) = payload {
            envelope = envelope.with_raw_payload(payload);
        }
        if let Err(e) = self.post(envelope) {
            self.inner.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        let timeout_ms = timeout_ms.unwrap_or(self.inner.config.request_timeout_ms);
        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(error))) => Err(crate::Error::RequestFailed(error)),
            Ok(Err(_)) => Err(crate::Error::Closed),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&request_id);
                Err(crate::Error::RequestTimeout(action.to_string()))
            }
        }
    }

    /// Applies the SIP configuration on the hub. Resolves on the terminal
    /// `SipInitResult`; intermediate updates never resolve lifecycle calls.
    pub async fn initialize_sip(&self, config: SipConfig) -> Result<bool> {
        self.require_usable()?;
        self.inner
            .sip_connect_timeout
            .store(config.connection_timeout, Ordering::SeqCst);
        let events = self.subscribe();
        let envelope = Envelope::new(MessageType::RequestSipInit)
            .client(self.inner.client_id.clone())
            .with_payload(&config)?;
        self.post(envelope)?;

        let success = self
            .wait_event(
                events,
                self.inner.config.sip_init_timeout_ms,
                "initializeSip",
                |event| match event {
                    EdgeEvent::SipInitResult(result) => Some(result.success),
                    _ => None,
                },
            )
            .await?;
        if success {
            self.inner.sip_initialized.store(true, Ordering::SeqCst);
        }
        Ok(success)
    }

    /// Starts the hub transport. Resolves `true` on `connected`, `false` on
    /// `failed`; `connecting` does not resolve.
    pub async fn connect_sip(&self) -> Result<bool> {
        self.require_sip_initialized()?;
        let events = self.subscribe();
        let envelope =
            Envelope::new(MessageType::RequestConnect).client(self.inner.client_id.clone());
        self.post(envelope)?;
        self.wait_event(
            events,
            self.inner.config.sip_connect_timeout_ms,
            "connectSip",
            |event| match event {
                EdgeEvent::SipConnectionUpdate(update) => match update.state {
                    ConnectionState::Connected => Some(true),
                    ConnectionState::Failed => Some(false),
                    _ => None,
                },
                _ => None,
            },
        )
        .await
    }

    /// Registers the account. Resolves `true` on `registered`, `false` on
    /// `failed`, with the client's connect timeout.
    pub async fn register_sip(&self) -> Result<bool> {
        self.require_sip_initialized()?;
        let events = self.subscribe();
        let envelope =
            Envelope::new(MessageType::RequestRegister).client(self.inner.client_id.clone());
        self.post(envelope)?;
        self.wait_event(
            events,
            self.inner.sip_connect_timeout.load(Ordering::SeqCst),
            "registerSip",
            |event| match event {
                EdgeEvent::SipRegistrationUpdate(update) => match update.state {
                    RegistrationState::Registered => Some(true),
                    RegistrationState::Failed => Some(false),
                    _ => None,
                },
                _ => None,
            },
        )
        .await
    }

    pub async fn unregister_sip(&self) -> Result<bool> {
        self.require_sip_initialized()?;
        let events = self.subscribe();
        let envelope =
            Envelope::new(MessageType::RequestUnregister).client(self.inner.client_id.clone());
        self.post(envelope)?;
        self.wait_event(
            events,
            self.inner.sip_connect_timeout.load(Ordering::SeqCst),
            "unregisterSip",
            |event| match event {
                EdgeEvent::SipRegistrationUpdate(update) => match update.state {
                    RegistrationState::Unregistered => Some(true),
                    RegistrationState::Failed => Some(false),
                    _ => None,
                },
                _ => None,
            },
        )
        .await
    }

    /// Places an outgoing call; resolves with the hub-assigned call id.
    pub async fn make_call(&self, target: &str, options: Option<Value>) -> Result<String> {
        let data = self
            .request(
                "makeCall",
                Some(json!({"target": target, "options": options})),
                None,
            )
            .await?;
        data.get("callId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| crate::Error::ProtocolError("makeCall reply without callId".to_string()))
    }

    pub async fn answer_call(&self, call_id: &str, options: Option<Value>) -> Result<()> {
        self.request(
            "answerCall",
            Some(json!({"callId": call_id, "options": options})),
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn hangup_call(&self, call_id: &str) -> Result<()> {
        self.request("endCall", Some(json!({"callId": call_id})), None)
            .await?;
        Ok(())
    }

    /// In-call DTMF, routed through the hub so the tones ride the call's
    /// media session.
    pub async fn send_dtmf(&self, call_id: &str, tones: &str) -> Result<()> {
        self.request(
            "sendDtmf",
            Some(json!({"callId": call_id, "tones": tones})),
            None,
        )
        .await?;
        Ok(())
    }

    /// Purely local: mutes this tab's audio track without touching the hub.
    pub async fn set_muted(&self, muted: bool) {
        self.inner
            .worker
            .handle_media_control(MediaControlPayload {
                command: MediaCommand::SetMuted,
                muted: Some(muted),
                tones: None,
            })
            .await;
    }

    /// Purely local DTMF on the tab's own audio sender.
    pub async fn send_local_dtmf(&self, tones: &str) {
        self.inner
            .worker
            .handle_media_control(MediaControlPayload {
                command: MediaCommand::SendDtmf,
                muted: None,
                tones: Some(tones.to_string()),
            })
            .await;
    }

    /// Announces departure, rejects all pending requests, releases the
    /// channel, and tears down peer-connection resources.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.usable.store(false, Ordering::SeqCst);
        let envelope = Envelope::new(MessageType::ClientDisconnected)
            .client(self.inner.client_id.clone());
        self.inner.channel.post(envelope);
        // Dropping the senders rejects every pending request as closed.
        self.inner.pending.lock().unwrap().clear();
        self.inner.cancel_token.cancel();
        self.inner.channel.close();
        self.inner.worker.shutdown().await;
    }

    fn require_usable(&self) -> Result<()> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(crate::Error::Closed)
        }
    }

    fn require_sip_initialized(&self) -> Result<()> {
        self.require_usable()?;
        if self.inner.sip_initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(crate::Error::BadState("SIP not initialized".to_string()))
        }
    }

    fn post(&self, envelope: Envelope) -> Result<()> {
        if self.inner.channel.post(envelope) {
            Ok(())
        } else {
            Err(crate::Error::ChannelSendError(
                "channel post failed".to_string(),
            ))
        }
    }

    async fn wait_event<T>(
        &self,
        mut events: broadcast::Receiver<EdgeEvent>,
        timeout_ms: u64,
        operation: &str,
        mut pick: impl FnMut(EdgeEvent) -> Option<T>,
    ) -> Result<T> {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(value) = pick(event) {
                            return Ok(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event bus lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(crate::Error::Closed);
                    }
                }
            }
        };
        match timeout(Duration::from_millis(timeout_ms), wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(crate::Error::RequestTimeout(operation.to_string())),
        }
    }

    fn spawn_recv_loop(&self) {
        let client = self.clone();
        let token = self.inner.cancel_token.clone();
        let Some(mut rx) = self.inner.channel.take_receiver() else {
            warn!("edge channel receiver already taken");
            return;
        };
        tokio::spawn(async move {
            loop {
                select! {
                    _ = token.cancelled() => break,
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => client.handle_envelope(envelope).await,
                        None => break,
                    },
                }
            }
            debug!("edge {} recv loop ended", client.inner.client_id);
        });
    }

    fn emit(&self, event: EdgeEvent) {
        self.inner.events.send(event).ok();
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        self.emit(EdgeEvent::Message(envelope.clone()));
        match envelope.kind {
            MessageType::StateUpdate => match envelope.parse_payload::<CallStateSnapshot>() {
                Ok(snapshot) => {
                    self.inner.ready.send_replace(Some(snapshot.clone()));
                    self.emit(EdgeEvent::StateUpdate(snapshot));
                }
                Err(e) => warn!("bad state update: {}", e),
            },
            MessageType::Response => match envelope.parse_payload::<ResponsePayload>() {
                Ok(response) => self.settle_request(response),
                Err(e) => warn!("bad response payload: {}", e),
            },
            MessageType::SipInitResult => {
                self.emit_parsed(&envelope, EdgeEvent::SipInitResult);
            }
            MessageType::SipConnectionUpdate => {
                self.emit_parsed(&envelope, EdgeEvent::SipConnectionUpdate);
            }
            MessageType::SipRegistrationUpdate => {
                self.emit_parsed(&envelope, EdgeEvent::SipRegistrationUpdate);
            }
            MessageType::CallUpdate => {
                self.emit_parsed(&envelope, EdgeEvent::CallUpdate);
            }
            MessageType::IncomingCall => {
                self.emit_parsed(&envelope, EdgeEvent::IncomingCall);
            }
            MessageType::CallClaimed => {
                self.emit_parsed(&envelope, EdgeEvent::CallClaimed);
            }
            MessageType::CallError => {
                self.emit_parsed(&envelope, EdgeEvent::CallError);
            }
            MessageType::SdpRequest => match envelope.parse_payload() {
                Ok(payload) => self.inner.worker.handle_sdp_request(payload).await,
                Err(e) => warn!("bad sdp request: {}", e),
            },
            MessageType::MediaControl => match envelope.parse_payload() {
                Ok(payload) => self.inner.worker.handle_media_control(payload).await,
                Err(e) => warn!("bad media control: {}", e),
            },
            other => {
                debug!("unhandled envelope {}, catch-all only", other);
            }
        }
    }

    fn emit_parsed<T: serde::de::DeserializeOwned>(
        &self,
        envelope: &Envelope,
        wrap: impl FnOnce(T) -> EdgeEvent,
    ) {
        match envelope.parse_payload::<T>() {
            Ok(payload) => self.emit(wrap(payload)),
            Err(e) => warn!("bad {} payload: {}", envelope.kind, e),
        }
    }

    /// Settlement is single-shot: an id with no pending entry means the
    /// request already settled (timeout or close) and the reply is dropped.
    fn settle_request(&self, response: ResponsePayload) {
        let sender = self
            .inner
            .pending
            .lock()
            .unwrap()
            .remove(&response.request_id);
        let Some(sender) = sender else {
            debug!("response for unknown request {}, dropped", response.request_id);
            return;
        };
        let outcome = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(response
                .error
                .unwrap_or_else(|| "request failed".to_string()))
        };
        sender.send(outcome).ok();
    }
}
