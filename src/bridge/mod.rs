use crate::hub::registry::ClientRegistry;
use crate::message::{
    make_request_id, ClientId, Envelope, IceCandidateInit, MessageType, RequestId,
    SdpOperation, SdpRequestBody, SdpRequestPayload, SdpResponsePayload, SessionDescriptionInit,
    SessionId,
};
use crate::sip::stack::{
    SdhBody, SdhFactory, SdhOptions, SessionDelegate, SessionDescriptionHandler, SessionInfo,
};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

type PendingSender = oneshot::Sender<std::result::Result<Value, String>>;

struct HandlerInner {
    session_id: SessionId,
    registry: Arc<ClientRegistry>,
    client_id: RwLock<Option<ClientId>>,
    options: SdhOptions,
    local_sdp: RwLock<Option<String>>,
    remote_sdp: RwLock<Option<String>>,
    candidates: Mutex<Vec<IceCandidateInit>>,
    gathering: watch::Sender<IceGatheringState>,
    connection_state: RwLock<String>,
    closed: AtomicBool,
    pending: Mutex<HashMap<RequestId, PendingSender>>,
    delegate: SessionDelegate,
}

/// Session-description handler proxy.
///
/// The SIP stack calls this as if SDP were produced locally; every operation
/// is serialized to exactly one edge over the envelope channel and matched
/// back by request id. The handler pins itself to the first client it sends
/// to; before that, an explicit binding from the make-call path wins, with
/// first-registered-client as the fallback.
#[derive(Clone)]
pub struct RemoteSdpHandler {
    inner: Arc<HandlerInner>,
}

impl RemoteSdpHandler {
    fn new(
        session_id: SessionId,
        delegate: SessionDelegate,
        client_id: Option<ClientId>,
        registry: Arc<ClientRegistry>,
        options: SdhOptions,
    ) -> Self {
        let (gathering, _) = watch::channel(IceGatheringState::New);
        RemoteSdpHandler {
            inner: Arc::new(HandlerInner {
                session_id,
                registry,
                client_id: RwLock::new(client_id),
                options,
                local_sdp: RwLock::new(None),
                remote_sdp: RwLock::new(None),
                candidates: Mutex::new(Vec::new()),
                gathering,
                connection_state: RwLock::new("new".to_string()),
                closed: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                delegate,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.inner.client_id.read().unwrap().clone()
    }

    pub fn connection_state(&self) -> String {
        self.inner.connection_state.read().unwrap().clone()
    }

    pub fn ice_candidates(&self) -> Vec<IceCandidateInit> {
        self.inner.candidates.lock().unwrap().clone()
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        *self.inner.gathering.borrow()
    }

    fn pin_client(&self, client_id: &str) {
        let mut guard = self.inner.client_id.write().unwrap();
        if guard.is_none() {
            debug!("session {} pinned to client {}", self.inner.session_id, client_id);
            *guard = Some(client_id.to_string());
        }
    }

    fn bind_client(&self) -> Result<ClientId> {
        if let Some(client_id) = self.inner.client_id.read().unwrap().clone() {
            return Ok(client_id);
        }
        // Fallback: no binding was set before the stack asked for SDP.
        let client_id = self
            .inner
            .registry
            .get_all_client_ids()
            .into_iter()
            .next()
            .ok_or_else(|| crate::Error::BadState("no clients registered".to_string()))?;
        self.pin_client(&client_id);
        Ok(client_id)
    }

    async fn send_request(
        &self,
        operation: SdpOperation,
        data: Option<Value>,
        options: Option<Value>,
    ) -> Result<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(crate::Error::Closed);
        }
        let client_id = self.bind_client()?;
        let request_id = make_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);

        let payload = SdpRequestPayload {
            session_id: self.inner.session_id.clone(),
            request: SdpRequestBody {
                operation,
                request_id: request_id.clone(),
                data,
                options,
            },
        };
        let envelope = Envelope::new(MessageType::SdpRequest)
            .client(client_id.clone())
            .with_payload(&payload)?;
        if !self.inner.registry.send_to_client(&client_id, envelope) {
            self.inner.pending.lock().unwrap().remove(&request_id);
            return Err(crate::Error::ChannelSendError(format!(
                "sdp request to {} not delivered",
                client_id
            )));
        }

        let timeout_ms = self.inner.options.request_timeout;
        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(crate::Error::MediaFailure(error)),
            Ok(Err(_)) => Err(crate::Error::Closed),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&request_id);
                Err(crate::Error::SdpTimeout(timeout_ms, operation.to_string()))
            }
        }
    }

    async fn wait_gathering_complete(&self) {
        let mut rx = self.inner.gathering.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() == IceGatheringState::Complete {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if timeout(
            Duration::from_millis(self.inner.options.ice_gathering_timeout),
            wait,
        )
        .await
        .is_err()
        {
            debug!(
                "session {}: ice gathering incomplete after {}ms",
                self.inner.session_id, self.inner.options.ice_gathering_timeout
            );
        }
    }

    /// Response arrival. An id with no pending entry is normal (the timer
    /// already fired) and is logged and dropped.
    pub fn handle_response(&self, payload: SdpResponsePayload) {
        let sender = self
            .inner
            .pending
            .lock()
            .unwrap()
            .remove(&payload.response.request_id);
        let Some(sender) = sender else {
            warn!(
                "session {}: reply for unknown request {}, dropped",
                self.inner.session_id, payload.response.request_id
            );
            return;
        };
        let outcome = match payload.response.error {
            Some(error) => Err(error),
            None => Ok(payload.response.result.unwrap_or(Value::Null)),
        };
        sender.send(outcome).ok();
    }

    pub fn handle_ice_candidate(&self, candidate: Option<IceCandidateInit>) {
        match candidate {
            Some(candidate) => {
                self.inner
                    .candidates
                    .lock()
                    .unwrap()
                    .push(candidate.clone());
                self.inner
                    .gathering
                    .send_if_modified(|state| match state {
                        IceGatheringState::New => {
                            *state = IceGatheringState::Gathering;
                            true
                        }
                        _ => false,
                    });
                if self.inner.options.trickle_candidates {
                    if let Some(sender) = &self.inner.delegate.ice_candidate {
                        sender.send(Some(candidate)).ok();
                    }
                }
            }
            None => {
                self.inner.gathering.send_replace(IceGatheringState::Complete);
                if self.inner.options.trickle_candidates {
                    if let Some(sender) = &self.inner.delegate.ice_candidate {
                        sender.send(None).ok();
                    }
                }
            }
        }
    }

    pub fn handle_connection_state(&self, state: String) {
        *self.inner.connection_state.write().unwrap() = state.clone();
        if let Some(sender) = &self.inner.delegate.connection_state {
            sender.send(state).ok();
        }
    }

    fn reset_for_offer(&self) {
        self.inner.candidates.lock().unwrap().clear();
        self.inner.gathering.send_replace(IceGatheringState::New);
    }

    /// Attaches the session's ICE server list to offer/answer options so the
    /// edge builds its peer connection with the configured servers.
    fn offer_options(&self, options: Option<Value>) -> Option<Value> {
        if self.inner.options.ice_servers.is_empty() {
            return options;
        }
        let mut options = options.unwrap_or_else(|| json!({}));
        if let Some(map) = options.as_object_mut() {
            if !map.contains_key("iceServers") {
                if let Ok(servers) = serde_json::to_value(&self.inner.options.ice_servers) {
                    map.insert("iceServers".to_string(), servers);
                }
            }
        }
        Some(options)
    }
}

#[async_trait]
impl SessionDescriptionHandler for RemoteSdpHandler {
    async fn get_description(&self, options: Option<Value>) -> Result<SdhBody> {
        let operation = if self.inner.remote_sdp.read().unwrap().is_none() {
            SdpOperation::CreateOffer
        } else {
            SdpOperation::CreateAnswer
        };
        let options = self.offer_options(options);
        let result = self.send_request(operation, None, options).await?;
        let description: SessionDescriptionInit = serde_json::from_value(result)?;
        *self.inner.local_sdp.write().unwrap() = Some(description.sdp.clone());

        let data = json!({"type": description.kind, "sdp": description.sdp});
        self.send_request(SdpOperation::SetLocalDescription, Some(data), None)
            .await?;

        if !self.inner.options.trickle_candidates {
            self.wait_gathering_complete().await;
            let complete = self
                .send_request(SdpOperation::GetCompleteSdp, None, None)
                .await?;
            let sdp = complete
                .get("sdp")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    crate::Error::ProtocolError("getCompleteSdp reply without sdp".to_string())
                })?
                .to_string();
            *self.inner.local_sdp.write().unwrap() = Some(sdp);
        }

        let body = self
            .inner
            .local_sdp
            .read()
            .unwrap()
            .clone()
            .unwrap_or_default();
        Ok(SdhBody {
            body,
            content_type: SDP_CONTENT_TYPE.to_string(),
        })
    }

    async fn set_description(&self, sdp: &str, options: Option<Value>) -> Result<()> {
        let kind = if self.inner.remote_sdp.read().unwrap().is_none() {
            "offer"
        } else {
            "answer"
        };
        *self.inner.remote_sdp.write().unwrap() = Some(sdp.to_string());
        if kind == "offer" {
            self.reset_for_offer();
        }
        let data = json!({"type": kind, "sdp": sdp});
        self.send_request(SdpOperation::SetRemoteDescription, Some(data), options)
            .await?;
        Ok(())
    }

    fn send_dtmf(&self, tones: &str, options: Option<Value>) -> bool {
        let duration = options
            .as_ref()
            .and_then(|o| o.get("duration"))
            .and_then(|v| v.as_u64())
            .unwrap_or(100);
        let inter_tone_gap = options
            .as_ref()
            .and_then(|o| o.get("interToneGap"))
            .and_then(|v| v.as_u64())
            .unwrap_or(70);
        let handler = self.clone();
        let tones = tones.to_string();
        tokio::spawn(async move {
            let data = json!({
                "tones": tones,
                "duration": duration,
                "interToneGap": inter_tone_gap,
            });
            if let Err(e) = handler
                .send_request(SdpOperation::SendDtmf, Some(data), None)
                .await
            {
                warn!("session {}: dtmf failed: {}", handler.inner.session_id, e);
            }
        });
        true
    }

    fn has_description(&self, content_type: &str) -> bool {
        content_type == SDP_CONTENT_TYPE && self.inner.local_sdp.read().unwrap().is_some()
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("session {} closing", self.inner.session_id);
        // Dropping the senders rejects every outstanding request as closed.
        self.inner.pending.lock().unwrap().clear();
        if let Some(client_id) = self.inner.client_id.read().unwrap().clone() {
            let payload = SdpRequestPayload {
                session_id: self.inner.session_id.clone(),
                request: SdpRequestBody {
                    operation: SdpOperation::Close,
                    request_id: make_request_id(),
                    data: None,
                    options: None,
                },
            };
            if let Ok(envelope) = Envelope::new(MessageType::SdpRequest)
                .client(client_id.clone())
                .with_payload(&payload)
            {
                self.inner.registry.send_to_client(&client_id, envelope);
            }
        }
    }
}

struct FactoryInner {
    registry: Arc<ClientRegistry>,
    sessions: RwLock<HashMap<ClientId, HashMap<SessionId, RemoteSdpHandler>>>,
    unbound: RwLock<HashMap<SessionId, RemoteSdpHandler>>,
    defaults: RwLock<SdhOptions>,
    preferred_client: RwLock<Option<ClientId>>,
}

/// Owns every live remote-SDP handler, indexed by `(client, session)`, and
/// routes inbound bridge envelopes to them. Handlers hold only a client id
/// and the registry; ownership never cycles back here.
#[derive(Clone)]
pub struct RemoteSdpFactory {
    inner: Arc<FactoryInner>,
}

impl RemoteSdpFactory {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        RemoteSdpFactory {
            inner: Arc::new(FactoryInner {
                registry,
                sessions: RwLock::new(HashMap::new()),
                unbound: RwLock::new(HashMap::new()),
                defaults: RwLock::new(SdhOptions::default()),
                preferred_client: RwLock::new(None),
            }),
        }
    }

    pub fn set_defaults(&self, options: SdhOptions) {
        *self.inner.defaults.write().unwrap() = options;
    }

    pub fn defaults(&self) -> SdhOptions {
        self.inner.defaults.read().unwrap().clone()
    }

    /// Binding used for the next created handler; set by the make-call and
    /// answer paths so the session lands on the requesting edge.
    pub fn set_preferred_client(&self, client_id: Option<ClientId>) {
        *self.inner.preferred_client.write().unwrap() = client_id;
    }

    /// Pins a still-unbound session to `client_id`. Used by the answer path
    /// so the claiming edge hosts the media session.
    pub fn bind_session(&self, session_id: &str, client_id: &str) {
        let handler = self.inner.unbound.write().unwrap().remove(session_id);
        if let Some(handler) = handler {
            handler.pin_client(client_id);
            self.inner
                .sessions
                .write()
                .unwrap()
                .entry(client_id.to_string())
                .or_default()
                .insert(session_id.to_string(), handler);
        }
    }

    pub fn session_count(&self) -> usize {
        let bound: usize = self
            .inner
            .sessions
            .read()
            .unwrap()
            .values()
            .map(|sessions| sessions.len())
            .sum();
        bound + self.inner.unbound.read().unwrap().len()
    }

    fn find(&self, client_id: &str, session_id: &str) -> Option<RemoteSdpHandler> {
        if let Some(handler) = self
            .inner
            .sessions
            .read()
            .unwrap()
            .get(client_id)
            .and_then(|sessions| sessions.get(session_id))
            .cloned()
        {
            return Some(handler);
        }
        // The handler may still be awaiting its first send; promote it to
        // the client the reply came from.
        let promoted = self.inner.unbound.write().unwrap().remove(session_id);
        if let Some(handler) = promoted {
            handler.pin_client(client_id);
            self.inner
                .sessions
                .write()
                .unwrap()
                .entry(client_id.to_string())
                .or_default()
                .insert(session_id.to_string(), handler.clone());
            return Some(handler);
        }
        None
    }

    pub fn route_sdp_response(&self, client_id: &str, payload: SdpResponsePayload) {
        match self.find(client_id, &payload.session_id) {
            Some(handler) => handler.handle_response(payload),
            None => warn!(
                "sdp response for unknown session {} from {}",
                payload.session_id, client_id
            ),
        }
    }

    pub fn route_ice_candidate(
        &self,
        client_id: &str,
        session_id: &str,
        candidate: Option<IceCandidateInit>,
    ) {
        match self.find(client_id, session_id) {
            Some(handler) => handler.handle_ice_candidate(candidate),
            None => warn!(
                "ice candidate for unknown session {} from {}",
                session_id, client_id
            ),
        }
    }

    pub fn route_connection_state(&self, client_id: &str, session_id: &str, state: String) {
        match self.find(client_id, session_id) {
            Some(handler) => handler.handle_connection_state(state),
            None => warn!(
                "connection state for unknown session {} from {}",
                session_id, client_id
            ),
        }
    }
}

impl SdhFactory for RemoteSdpFactory {
    fn create(
        &self,
        session: SessionInfo,
        options: SdhOptions,
    ) -> Arc<dyn SessionDescriptionHandler> {
        let preferred = self.inner.preferred_client.read().unwrap().clone();
        let handler = RemoteSdpHandler::new(
            session.session_id.clone(),
            session.delegate,
            preferred.clone(),
            self.inner.registry.clone(),
            options,
        );
        debug!(
            "add sdp session {} (client {:?})",
            session.session_id, preferred
        );
        match preferred {
            Some(client_id) => {
                self.inner
                    .sessions
                    .write()
                    .unwrap()
                    .entry(client_id)
                    .or_default()
                    .insert(session.session_id, handler.clone());
            }
            None => {
                self.inner
                    .unbound
                    .write()
                    .unwrap()
                    .insert(session.session_id, handler.clone());
            }
        }
        Arc::new(handler)
    }

    fn remove_session(&self, session_id: &str, client_id: Option<&str>) {
        debug!("remove sdp session {}", session_id);
        let mut sessions = self.inner.sessions.write().unwrap();
        match client_id {
            Some(client_id) => {
                if let Some(by_session) = sessions.get_mut(client_id) {
                    by_session.remove(session_id);
                }
            }
            None => {
                for by_session in sessions.values_mut() {
                    by_session.remove(session_id);
                }
            }
        }
        drop(sessions);
        self.inner.unbound.write().unwrap().remove(session_id);
    }
}
