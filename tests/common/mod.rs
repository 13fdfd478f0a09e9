//! Scripted doubles for the two black-box collaborators: the SIP stack the
//! hub hosts and the peer-connection API the edge drives. The stub transport
//! connects synchronously, which is what the lifecycle tests rely on.

use async_trait::async_trait;
use serde_json::Value;
use siphub::config::{EdgeConfig, SipConfig};
use siphub::edge::{
    PeerConnectionConfig, PeerConnectionFactory, PeerConnectionHandle, PeerEvent,
};
use siphub::message::{make_session_id, IceCandidateInit, SessionDescriptionInit};
use siphub::sip::stack::{
    InviteOptions, RegistererHandle, RegistererOptions, RegistererState, SdhOptions,
    SessionDelegate, SessionDescriptionHandler, SessionHandle, SessionInfo, SessionState,
    TransportState, UaEvent, UserAgentFactory, UserAgentHandle, UserAgentInit,
};
use siphub::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

pub const OFFER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=offer\r\n";
pub const ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=answer\r\n";

#[derive(Debug, Clone)]
pub enum RegisterBehavior {
    Succeed,
    Fail(String),
    Terminate,
}

pub struct StubStackFactory {
    pub auto_connect: AtomicBool,
    pub register_behavior: Mutex<RegisterBehavior>,
    pub sdh_options: Mutex<SdhOptions>,
    pub ice_delegate: Mutex<Option<UnboundedSender<Option<IceCandidateInit>>>>,
    user_agents: Mutex<Vec<Arc<StubUserAgent>>>,
}

impl StubStackFactory {
    pub fn new() -> Self {
        StubStackFactory {
            auto_connect: AtomicBool::new(true),
            register_behavior: Mutex::new(RegisterBehavior::Succeed),
            sdh_options: Mutex::new(SdhOptions::default()),
            ice_delegate: Mutex::new(None),
            user_agents: Mutex::new(Vec::new()),
        }
    }

    pub fn last_ua(&self) -> Arc<StubUserAgent> {
        self.user_agents
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no user agent built")
    }

    pub fn ua_count(&self) -> usize {
        self.user_agents.lock().unwrap().len()
    }
}

impl UserAgentFactory for StubStackFactory {
    fn build(
        &self,
        init: UserAgentInit,
        events: UnboundedSender<UaEvent>,
    ) -> Result<Arc<dyn UserAgentHandle>> {
        let ua = Arc::new(StubUserAgent {
            init,
            events,
            auto_connect: self.auto_connect.load(Ordering::SeqCst),
            register_behavior: self.register_behavior.lock().unwrap().clone(),
            sdh_options: self.sdh_options.lock().unwrap().clone(),
            ice_delegate: self.ice_delegate.lock().unwrap().clone(),
            stopped: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
            registerers: Mutex::new(Vec::new()),
        });
        self.user_agents.lock().unwrap().push(ua.clone());
        Ok(ua)
    }
}

pub struct StubUserAgent {
    pub init: UserAgentInit,
    events: UnboundedSender<UaEvent>,
    auto_connect: bool,
    register_behavior: RegisterBehavior,
    sdh_options: SdhOptions,
    ice_delegate: Option<UnboundedSender<Option<IceCandidateInit>>>,
    pub stopped: AtomicBool,
    sessions: Mutex<Vec<Arc<StubSession>>>,
    registerers: Mutex<Vec<Arc<StubRegisterer>>>,
}

impl StubUserAgent {
    pub fn last_session(&self) -> Arc<StubSession> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session created")
    }

    pub fn last_registerer(&self) -> Arc<StubRegisterer> {
        self.registerers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no registerer created")
    }

    pub fn emit_transport(&self, state: TransportState) {
        self.events.send(UaEvent::Transport(state)).ok();
    }

    fn delegate(&self) -> SessionDelegate {
        SessionDelegate {
            ice_candidate: self.ice_delegate.clone(),
            connection_state: None,
        }
    }

    /// Simulates an inbound INVITE carrying `offer_sdp`.
    pub fn push_incoming(&self, from: &str, offer_sdp: &str) -> Arc<StubSession> {
        let factory = self.init.sdh_factory.as_ref().expect("transport-only ua");
        let session_id = make_session_id();
        let sdh = factory.create(
            SessionInfo {
                session_id: session_id.clone(),
                delegate: self.delegate(),
            },
            self.sdh_options.clone(),
        );
        let (states_tx, states_rx) = unbounded_channel();
        let session = Arc::new(StubSession {
            id: session_id,
            sdh: Some(sdh),
            states: states_tx,
            remote_offer: Mutex::new(Some(offer_sdp.to_string())),
            local_body: Mutex::new(None),
        });
        self.sessions.lock().unwrap().push(session.clone());
        self.events
            .send(UaEvent::IncomingInvite {
                session: session.clone(),
                from: from.to_string(),
                states: states_rx,
            })
            .ok();
        session
    }
}

#[async_trait]
impl UserAgentHandle for StubUserAgent {
    async fn start(&self) -> Result<()> {
        if self.auto_connect {
            self.emit_transport(TransportState::Connected);
        } else {
            self.emit_transport(TransportState::Connecting);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.emit_transport(TransportState::Disconnected { error: None });
        Ok(())
    }

    fn registerer(
        &self,
        options: RegistererOptions,
        states: UnboundedSender<RegistererState>,
    ) -> Result<Arc<dyn RegistererHandle>> {
        let registerer = Arc::new(StubRegisterer {
            options,
            states,
            behavior: self.register_behavior.clone(),
            extra_headers: Mutex::new(Vec::new()),
        });
        self.registerers.lock().unwrap().push(registerer.clone());
        Ok(registerer)
    }

    async fn invite(
        &self,
        options: InviteOptions,
        states: UnboundedSender<SessionState>,
    ) -> Result<Arc<dyn SessionHandle>> {
        let factory = self
            .init
            .sdh_factory
            .as_ref()
            .ok_or_else(|| siphub::Error::BadState("transport-only user agent".to_string()))?;
        let session_id = make_session_id();
        let sdh = factory.create(
            SessionInfo {
                session_id: session_id.clone(),
                delegate: self.delegate(),
            },
            options.sdh_options.clone(),
        );
        states.send(SessionState::Calling).ok();
        let body = sdh.get_description(None).await?;
        let session = Arc::new(StubSession {
            id: session_id,
            sdh: Some(sdh),
            states,
            remote_offer: Mutex::new(None),
            local_body: Mutex::new(Some(body.body)),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct StubRegisterer {
    pub options: RegistererOptions,
    states: UnboundedSender<RegistererState>,
    behavior: RegisterBehavior,
    pub extra_headers: Mutex<Vec<String>>,
}

#[async_trait]
impl RegistererHandle for StubRegisterer {
    async fn register(&self, extra_headers: Vec<String>) -> Result<()> {
        *self.extra_headers.lock().unwrap() = extra_headers;
        match &self.behavior {
            RegisterBehavior::Succeed => {
                self.states.send(RegistererState::Registering).ok();
                self.states.send(RegistererState::Registered).ok();
            }
            RegisterBehavior::Fail(error) => {
                self.states
                    .send(RegistererState::Failed(error.clone()))
                    .ok();
            }
            RegisterBehavior::Terminate => {
                self.states.send(RegistererState::Terminated).ok();
            }
        }
        Ok(())
    }

    async fn unregister(&self) -> Result<()> {
        self.states.send(RegistererState::Unregistered).ok();
        Ok(())
    }
}

pub struct StubSession {
    id: String,
    sdh: Option<Arc<dyn SessionDescriptionHandler>>,
    states: UnboundedSender<SessionState>,
    remote_offer: Mutex<Option<String>>,
    local_body: Mutex<Option<String>>,
}

impl StubSession {
    /// Offer the session sent toward the network (outgoing calls).
    pub fn local_body(&self) -> Option<String> {
        self.local_body.lock().unwrap().clone()
    }

    pub fn emit(&self, state: SessionState) {
        self.states.send(state).ok();
    }

    /// Remote side answered an outgoing call.
    pub async fn answer(&self, sdp: &str) -> Result<()> {
        if let Some(sdh) = &self.sdh {
            sdh.set_description(sdp, None).await?;
        }
        self.emit(SessionState::Established);
        Ok(())
    }

    pub fn hangup_remote(&self, reason: &str) {
        self.emit(SessionState::Terminated(Some(reason.to_string())));
    }
}

#[async_trait]
impl SessionHandle for StubSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn remote_identity(&self) -> Option<String> {
        None
    }

    fn sdh(&self) -> Option<Arc<dyn SessionDescriptionHandler>> {
        self.sdh.clone()
    }

    async fn accept(&self) -> Result<()> {
        let offer = self
            .remote_offer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| siphub::Error::BadState("no offer to accept".to_string()))?;
        let sdh = self
            .sdh
            .clone()
            .ok_or_else(|| siphub::Error::BadState("no media session".to_string()))?;
        sdh.set_description(&offer, None).await?;
        let body = sdh.get_description(None).await?;
        *self.local_body.lock().unwrap() = Some(body.body);
        self.emit(SessionState::Established);
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.emit(SessionState::Terminated(Some("bye".to_string())));
        Ok(())
    }
}

pub struct FakePcFactory {
    pub fail_media: AtomicBool,
    connections: Mutex<Vec<Arc<FakePcState>>>,
}

impl FakePcFactory {
    pub fn new() -> Self {
        FakePcFactory {
            fail_media: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn last_pc(&self) -> Arc<FakePcState> {
        self.connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer connection created")
    }

    pub fn pc_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePcFactory {
    async fn create(
        &self,
        config: PeerConnectionConfig,
        events: UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnectionHandle>> {
        let state = Arc::new(FakePcState {
            ice_servers: config.ice_servers.len(),
            events,
            fail_media: self.fail_media.load(Ordering::SeqCst),
            microphone: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            muted: Mutex::new(None),
            dtmf: Mutex::new(Vec::new()),
            added_candidates: Mutex::new(Vec::new()),
        });
        self.connections.lock().unwrap().push(state.clone());
        Ok(Box::new(FakePc { state }))
    }
}

pub struct FakePcState {
    pub ice_servers: usize,
    events: UnboundedSender<PeerEvent>,
    fail_media: bool,
    pub microphone: AtomicBool,
    pub closed: AtomicBool,
    pub local: Mutex<Option<SessionDescriptionInit>>,
    pub remote: Mutex<Option<SessionDescriptionInit>>,
    pub muted: Mutex<Option<bool>>,
    pub dtmf: Mutex<Vec<(String, u32, u32)>>,
    pub added_candidates: Mutex<Vec<Option<IceCandidateInit>>>,
}

impl FakePcState {
    pub fn emit_candidate(&self, candidate: Option<IceCandidateInit>) {
        self.events.send(PeerEvent::IceCandidate(candidate)).ok();
    }

    pub fn emit_ice_state(&self, state: &str) {
        self.events
            .send(PeerEvent::IceConnectionState(state.to_string()))
            .ok();
    }
}

struct FakePc {
    state: Arc<FakePcState>,
}

#[async_trait]
impl PeerConnectionHandle for FakePc {
    async fn acquire_microphone(&self) -> Result<()> {
        if self.state.fail_media {
            return Err(siphub::Error::MediaFailure(
                "getUserMedia denied".to_string(),
            ));
        }
        self.state.microphone.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self, _options: Option<Value>) -> Result<SessionDescriptionInit> {
        Ok(SessionDescriptionInit {
            kind: "offer".to_string(),
            sdp: OFFER_SDP.to_string(),
        })
    }

    async fn create_answer(&self, _options: Option<Value>) -> Result<SessionDescriptionInit> {
        Ok(SessionDescriptionInit {
            kind: "answer".to_string(),
            sdp: ANSWER_SDP.to_string(),
        })
    }

    async fn set_local_description(&self, description: SessionDescriptionInit) -> Result<()> {
        *self.state.local.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescriptionInit) -> Result<()> {
        *self.state.remote.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescriptionInit> {
        self.state.local.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidateInit>) -> Result<()> {
        self.state.added_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn insert_dtmf(
        &self,
        tones: &str,
        duration_ms: u32,
        inter_tone_gap_ms: u32,
    ) -> Result<()> {
        self.state
            .dtmf
            .lock()
            .unwrap()
            .push((tones.to_string(), duration_ms, inter_tone_gap_ms));
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<()> {
        *self.state.muted.lock().unwrap() = Some(muted);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn test_sip_config() -> SipConfig {
    SipConfig {
        uri: "sip:alice@example.org".to_string(),
        password: "pw".to_string(),
        ws_servers: vec!["wss://example.org/ws".to_string()],
        register_expires: 600,
        ..Default::default()
    }
}

pub fn test_edge_config() -> EdgeConfig {
    EdgeConfig::default()
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();
}

pub fn new_hub() -> (Arc<StubStackFactory>, siphub::Hub) {
    init_logging();
    let stack = Arc::new(StubStackFactory::new());
    let hub = siphub::Hub::new(stack.clone());
    (stack, hub)
}

pub fn new_edge(hub: &siphub::Hub) -> (Arc<FakePcFactory>, siphub::EdgeClient) {
    let pc_factory = Arc::new(FakePcFactory::new());
    let edge = siphub::EdgeClient::over(hub.connect(), test_edge_config(), pc_factory.clone());
    (pc_factory, edge)
}

/// An admitted edge, ready for SIP and call traffic.
pub async fn ready_edge(hub: &siphub::Hub) -> (Arc<FakePcFactory>, siphub::EdgeClient) {
    let (pc_factory, edge) = new_edge(hub);
    edge.initialize().await.expect("edge initialize");
    (pc_factory, edge)
}

/// Waits up to two seconds for an event the picker accepts.
pub async fn next_event<T>(
    rx: &mut tokio::sync::broadcast::Receiver<siphub::edge::EdgeEvent>,
    pick: impl FnMut(&siphub::edge::EdgeEvent) -> Option<T>,
) -> T {
    next_event_within(rx, 2, pick).await
}

pub async fn next_event_within<T>(
    rx: &mut tokio::sync::broadcast::Receiver<siphub::edge::EdgeEvent>,
    secs: u64,
    mut pick: impl FnMut(&siphub::edge::EdgeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(secs), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
