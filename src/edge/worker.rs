use crate::config::IceServer;
use crate::message::{
    ClientId, ConnectionStateChangePayload, Envelope, IceCandidateInit, IceCandidatePayload,
    MediaCommand, MediaControlPayload, MessageType, SdpOperation, SdpRequestBody,
    SdpRequestPayload, SdpResponseBody, SdpResponsePayload, SessionDescriptionInit, SessionId,
};
use crate::transport::ChannelConnection;
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_DTMF_DURATION_MS: u32 = 100;
pub const DEFAULT_DTMF_INTER_TONE_GAP_MS: u32 = 70;

/// Media-plane events emitted by a peer connection back-end. A `None`
/// candidate signals end-of-gathering.
pub enum PeerEvent {
    IceCandidate(Option<IceCandidateInit>),
    IceConnectionState(String),
}

pub struct PeerConnectionConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Back-end for the browser peer-connection and media-device APIs. The
/// worker is the only caller; implementations live with the embedder.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerConnectionConfig,
        events: UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnectionHandle>>;
}

#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    async fn acquire_microphone(&self) -> Result<()>;
    async fn create_offer(&self, options: Option<Value>) -> Result<SessionDescriptionInit>;
    async fn create_answer(&self, options: Option<Value>) -> Result<SessionDescriptionInit>;
    async fn set_local_description(&self, description: SessionDescriptionInit) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescriptionInit) -> Result<()>;
    async fn local_description(&self) -> Option<SessionDescriptionInit>;
    async fn add_ice_candidate(&self, candidate: Option<IceCandidateInit>) -> Result<()>;
    async fn insert_dtmf(
        &self,
        tones: &str,
        duration_ms: u32,
        inter_tone_gap_ms: u32,
    ) -> Result<()>;
    async fn set_muted(&self, muted: bool) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

struct ActivePeer {
    handle: Box<dyn PeerConnectionHandle>,
    session_id: SessionId,
    has_microphone: bool,
    events_token: CancellationToken,
}

struct WorkerInner {
    client_id: ClientId,
    factory: Arc<dyn PeerConnectionFactory>,
    channel: ChannelConnection,
    ice_servers: Vec<IceServer>,
    peer: Mutex<Option<ActivePeer>>,
}

/// Services remote-SDP operations on the edge's real peer connection and
/// trickles ICE candidates and connection-state transitions back to the hub.
/// The peer connection never leaves this tab.
#[derive(Clone)]
pub struct PeerConnectionWorker {
    inner: Arc<WorkerInner>,
}

impl PeerConnectionWorker {
    pub fn new(
        client_id: ClientId,
        factory: Arc<dyn PeerConnectionFactory>,
        channel: ChannelConnection,
        ice_servers: Vec<IceServer>,
    ) -> Self {
        PeerConnectionWorker {
            inner: Arc::new(WorkerInner {
                client_id,
                factory,
                channel,
                ice_servers,
                peer: Mutex::new(None),
            }),
        }
    }

    pub async fn handle_sdp_request(&self, payload: SdpRequestPayload) {
        let SdpRequestPayload {
            session_id,
            request,
        } = payload;
        let operation = request.operation;
        let outcome = self.service(&session_id, request).await;
        if operation == SdpOperation::Close {
            // Close is fire-and-forget on the hub side.
            return;
        }
        let response = match outcome {
            Ok((request_id, result)) => SdpResponsePayload {
                session_id,
                response: SdpResponseBody {
                    request_id,
                    result: Some(result),
                    error: None,
                },
            },
            Err((request_id, error)) => {
                warn!("sdp operation {} failed: {}", operation, error);
                SdpResponsePayload {
                    session_id,
                    response: SdpResponseBody {
                        request_id,
                        result: None,
                        error: Some(error),
                    },
                }
            }
        };
        self.post(MessageType::SdpResponse, &response);
    }

    async fn service(
        &self,
        session_id: &str,
        request: SdpRequestBody,
    ) -> std::result::Result<(String, Value), (String, String)> {
        let request_id = request.request_id.clone();
        self.dispatch(session_id, request)
            .await
            .map(|result| (request_id.clone(), result))
            .map_err(|e| (request_id, e.to_string()))
    }

    async fn dispatch(&self, session_id: &str, request: SdpRequestBody) -> Result<Value> {
        match request.operation {
            SdpOperation::CreateOffer => {
                let ice_servers = parse_ice_servers(request.options.as_ref());
                let mut guard = self.inner.peer.lock().await;
                let peer = self.ensure_peer(&mut guard, session_id, ice_servers).await?;
                if !peer.has_microphone {
                    peer.handle.acquire_microphone().await?;
                    peer.has_microphone = true;
                }
                let description = peer.handle.create_offer(request.options).await?;
                peer.handle
                    .set_local_description(description.clone())
                    .await?;
                Ok(json!({"type": description.kind, "sdp": description.sdp}))
            }
            SdpOperation::CreateAnswer => {
                let ice_servers = parse_ice_servers(request.options.as_ref());
                let mut guard = self.inner.peer.lock().await;
                let peer = self.ensure_peer(&mut guard, session_id, ice_servers).await?;
                let description = peer.handle.create_answer(request.options).await?;
                peer.handle
                    .set_local_description(description.clone())
                    .await?;
                Ok(json!({"type": description.kind, "sdp": description.sdp}))
            }
            SdpOperation::SetLocalDescription => {
                let description: SessionDescriptionInit = parse_data(request.data)?;
                let mut guard = self.inner.peer.lock().await;
                let peer = self.ensure_peer(&mut guard, session_id, None).await?;
                peer.handle.set_local_description(description).await?;
                Ok(json!({"success": true}))
            }
            SdpOperation::SetRemoteDescription => {
                let description: SessionDescriptionInit = parse_data(request.data)?;
                let mut guard = self.inner.peer.lock().await;
                let peer = self.ensure_peer(&mut guard, session_id, None).await?;
                peer.handle.set_remote_description(description).await?;
                Ok(json!({"success": true}))
            }
            SdpOperation::GetCompleteSdp => {
                let guard = self.inner.peer.lock().await;
                let peer = guard
                    .as_ref()
                    .ok_or_else(|| crate::Error::MediaFailure("no peer connection".to_string()))?;
                let description = peer.handle.local_description().await.ok_or_else(|| {
                    crate::Error::MediaFailure("no local description".to_string())
                })?;
                Ok(json!({"sdp": description.sdp}))
            }
            SdpOperation::AddIceCandidate => {
                let candidate: Option<IceCandidateInit> = match request.data {
                    Some(Value::Null) | None => None,
                    Some(value) => Some(serde_json::from_value(value)?),
                };
                let guard = self.inner.peer.lock().await;
                let peer = guard
                    .as_ref()
                    .ok_or_else(|| crate::Error::MediaFailure("no peer connection".to_string()))?;
                peer.handle.add_ice_candidate(candidate).await?;
                Ok(json!({"success": true}))
            }
            SdpOperation::SendDtmf => {
                let data = request.data.unwrap_or(Value::Null);
                let tones = data
                    .get("tones")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| crate::Error::MediaFailure("dtmf without tones".to_string()))?
                    .to_string();
                let duration = data
                    .get("duration")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(DEFAULT_DTMF_DURATION_MS as u64) as u32;
                let inter_tone_gap = data
                    .get("interToneGap")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(DEFAULT_DTMF_INTER_TONE_GAP_MS as u64)
                    as u32;
                let guard = self.inner.peer.lock().await;
                let peer = guard
                    .as_ref()
                    .ok_or_else(|| crate::Error::MediaFailure("no peer connection".to_string()))?;
                peer.handle
                    .insert_dtmf(&tones, duration, inter_tone_gap)
                    .await?;
                Ok(json!({"success": true}))
            }
            SdpOperation::Close => {
                let mut guard = self.inner.peer.lock().await;
                self.close_peer(&mut guard).await;
                Ok(json!({"success": true}))
            }
        }
    }

    async fn ensure_peer<'a>(
        &self,
        guard: &'a mut Option<ActivePeer>,
        session_id: &str,
        ice_servers: Option<Vec<IceServer>>,
    ) -> Result<&'a mut ActivePeer> {
        if let Some(peer) = guard.as_ref() {
            if peer.session_id != session_id {
                info!(
                    "session {} replaces {}, closing previous peer connection",
                    session_id, peer.session_id
                );
                self.close_peer(guard).await;
            }
        }
        if guard.is_none() {
            let (events_tx, mut events_rx) = unbounded_channel();
            let handle = self
                .inner
                .factory
                .create(
                    PeerConnectionConfig {
                        ice_servers: ice_servers
                            .unwrap_or_else(|| self.inner.ice_servers.clone()),
                    },
                    events_tx,
                )
                .await?;
            let events_token = CancellationToken::new();
            let pump_token = events_token.clone();
            let worker = self.clone();
            let pump_session = session_id.to_string();
            tokio::spawn(async move {
                loop {
                    select! {
                        _ = pump_token.cancelled() => break,
                        event = events_rx.recv() => match event {
                            Some(event) => worker.forward_peer_event(&pump_session, event),
                            None => break,
                        },
                    }
                }
            });
            debug!("peer connection created for session {}", session_id);
            *guard = Some(ActivePeer {
                handle,
                session_id: session_id.to_string(),
                has_microphone: false,
                events_token,
            });
        }
        Ok(guard.as_mut().unwrap())
    }

    fn forward_peer_event(&self, session_id: &str, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.post(
                    MessageType::IceCandidate,
                    &IceCandidatePayload {
                        session_id: session_id.to_string(),
                        candidate,
                    },
                );
            }
            PeerEvent::IceConnectionState(state) => {
                self.post(
                    MessageType::ConnectionStateChange,
                    &ConnectionStateChangePayload {
                        session_id: session_id.to_string(),
                        state,
                    },
                );
            }
        }
    }

    /// Local media mutation; nothing here reaches the SIP stack.
    pub async fn handle_media_control(&self, payload: MediaControlPayload) {
        let guard = self.inner.peer.lock().await;
        let Some(peer) = guard.as_ref() else {
            warn!("media control without peer connection");
            return;
        };
        let outcome = match payload.command {
            MediaCommand::SetMuted => {
                peer.handle
                    .set_muted(payload.muted.unwrap_or(false))
                    .await
            }
            MediaCommand::SendDtmf => match payload.tones {
                Some(tones) => {
                    peer.handle
                        .insert_dtmf(
                            &tones,
                            DEFAULT_DTMF_DURATION_MS,
                            DEFAULT_DTMF_INTER_TONE_GAP_MS,
                        )
                        .await
                }
                None => Err(crate::Error::MediaFailure("dtmf without tones".to_string())),
            },
        };
        if let Err(e) = outcome {
            warn!("media control failed: {}", e);
        }
    }

    async fn close_peer(&self, guard: &mut Option<ActivePeer>) {
        if let Some(peer) = guard.take() {
            peer.events_token.cancel();
            if let Err(e) = peer.handle.close().await {
                warn!("peer connection close failed: {}", e);
            }
            debug!("peer connection for session {} closed", peer.session_id);
        }
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.peer.lock().await;
        self.close_peer(&mut guard).await;
    }

    fn post<T: serde::Serialize>(&self, kind: MessageType, payload: &T) {
        match Envelope::new(kind)
            .client(self.inner.client_id.clone())
            .with_payload(payload)
        {
            Ok(envelope) => {
                self.inner.channel.post(envelope);
            }
            Err(e) => warn!("worker payload encode failed: {}", e),
        }
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(data: Option<Value>) -> Result<T> {
    let value = data.ok_or_else(|| crate::Error::MediaFailure("missing data".to_string()))?;
    Ok(serde_json::from_value(value)?)
}

fn parse_ice_servers(options: Option<&Value>) -> Option<Vec<IceServer>> {
    let servers = options?.get("iceServers")?;
    serde_json::from_value(servers.clone()).ok()
}
