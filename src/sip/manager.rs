use crate::bridge::RemoteSdpFactory;
use crate::config::SipConfig;
use crate::hub::registry::ClientRegistry;
use crate::message::{
    now_millis, random_text, CallRecord, CallState, CallStateSnapshot, CallUpdatePayload,
    ConnectionState, ConnectionUpdatePayload, Envelope, IncomingCallPayload, InitState,
    MessageType, RegistrationSnapshot, RegistrationState, RegistrationUpdatePayload,
    SipInitResultPayload,
};
use crate::sip::stack::{
    InviteOptions, MediaConstraints, RegistererHandle, RegistererOptions, RegistererState,
    SdhFactory, SdhOptions, SessionHandle, SessionState, TransportState, UaEvent,
    UserAgentFactory, UserAgentHandle, UserAgentInit,
};
use crate::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const USER_AGENT: &str = "siphub/0.1";
const CALL_ID_LEN: usize = 22;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// SIP lifecycle phases, gated in order: initialize, then transport connect,
/// then register. Error transitions may happen from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipPhase {
    Uninitialized,
    Initialized,
    Connecting,
    Connected,
    Registering,
    Registered,
    Unregistering,
    Disconnected,
}

impl SipPhase {
    fn is_connected(&self) -> bool {
        matches!(
            self,
            SipPhase::Connected | SipPhase::Registering | SipPhase::Registered | SipPhase::Unregistering
        )
    }
}

impl std::fmt::Display for SipPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipPhase::Uninitialized => write!(f, "uninitialized"),
            SipPhase::Initialized => write!(f, "initialized"),
            SipPhase::Connecting => write!(f, "connecting"),
            SipPhase::Connected => write!(f, "connected"),
            SipPhase::Registering => write!(f, "registering"),
            SipPhase::Registered => write!(f, "registered"),
            SipPhase::Unregistering => write!(f, "unregistering"),
            SipPhase::Disconnected => write!(f, "disconnected"),
        }
    }
}

struct SipCore {
    phase: SipPhase,
    config: Option<SipConfig>,
    ua: Option<Arc<dyn UserAgentHandle>>,
    registerer: Option<Arc<dyn RegistererHandle>>,
    registration_state: RegistrationState,
    active_call: Option<CallRecord>,
    sessions: HashMap<String, Arc<dyn SessionHandle>>,
    last_connection: Option<ConnectionState>,
    last_registration: Option<RegistrationState>,
    was_connected: bool,
    event_task_token: Option<CancellationToken>,
    reconnect_token: Option<CancellationToken>,
}

struct ManagerInner {
    registry: Arc<ClientRegistry>,
    bridge: RemoteSdpFactory,
    factory: Arc<dyn UserAgentFactory>,
    core: Mutex<SipCore>,
    transport: watch::Sender<TransportState>,
    cancel_token: CancellationToken,
}

/// Hub-side lifecycle owner for the SIP stack.
///
/// Public operations return `bool`: transient failures surface as `false`
/// plus a `{state: "failed", error}` update envelope, and stack errors never
/// propagate past this type.
#[derive(Clone)]
pub struct SipManager {
    inner: Arc<ManagerInner>,
}

impl SipManager {
    pub fn new(
        registry: Arc<ClientRegistry>,
        bridge: RemoteSdpFactory,
        factory: Arc<dyn UserAgentFactory>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (transport, _) = watch::channel(TransportState::Disconnected { error: None });
        SipManager {
            inner: Arc::new(ManagerInner {
                registry,
                bridge,
                factory,
                core: Mutex::new(SipCore {
                    phase: SipPhase::Uninitialized,
                    config: None,
                    ua: None,
                    registerer: None,
                    registration_state: RegistrationState::None,
                    active_call: None,
                    sessions: HashMap::new(),
                    last_connection: None,
                    last_registration: None,
                    was_connected: false,
                    event_task_token: None,
                    reconnect_token: None,
                }),
                transport,
                cancel_token,
            }),
        }
    }

    pub async fn phase(&self) -> SipPhase {
        self.inner.core.lock().await.phase
    }

    pub async fn snapshot(&self) -> CallStateSnapshot {
        let core = self.inner.core.lock().await;
        CallStateSnapshot {
            has_active_call: core.active_call.is_some(),
            active_call: core.active_call.clone(),
            registration: RegistrationSnapshot {
                state: core.registration_state,
            },
        }
    }

    /// Constructs the user agent with the remote-SDP bridge bound (unless
    /// `transport_only`). Tolerates re-initialization: any prior user agent
    /// is stopped and the registerer discarded. Returns `true` iff the agent
    /// was constructed.
    pub async fn initialize(&self, config: SipConfig) -> bool {
        match self.try_initialize(config).await {
            Ok(()) => {
                info!("sip manager initialized");
                self.broadcast_init(true, InitState::Initialized, None);
                true
            }
            Err(e) => {
                warn!("sip initialize failed: {}", e);
                self.broadcast_init(false, InitState::Failed, Some(e.to_string()));
                false
            }
        }
    }

    async fn try_initialize(&self, config: SipConfig) -> Result<()> {
        config.validate()?;
        let mut core = self.inner.core.lock().await;

        if let Some(ua) = core.ua.take() {
            debug!("re-initialize: stopping prior user agent");
            ua.stop().await.ok();
        }
        core.registerer = None;
        core.registration_state = RegistrationState::None;
        core.last_connection = None;
        core.last_registration = None;
        core.was_connected = false;
        if let Some(token) = core.event_task_token.take() {
            token.cancel();
        }
        if let Some(token) = core.reconnect_token.take() {
            token.cancel();
        }

        let sdh_factory: Option<Arc<dyn SdhFactory>> = if config.transport_only {
            None
        } else {
            self.inner.bridge.set_defaults(SdhOptions {
                trickle_candidates: true,
                ice_gathering_timeout: config.ice_gathering_timeout,
                request_timeout: 30_000,
                constraints: MediaConstraints::default(),
                ice_servers: config.ice_servers(),
            });
            Some(Arc::new(self.inner.bridge.clone()))
        };

        self.inner
            .transport
            .send_replace(TransportState::Disconnected { error: None });

        let (events_tx, events_rx) = unbounded_channel();
        let ua = self.inner.factory.build(
            UserAgentInit {
                uri: config.sip_uri()?,
                display_name: config.display_name.clone(),
                password: config.password.clone(),
                ws_servers: config.ws_servers.clone(),
                user_agent: USER_AGENT.to_string(),
                sdh_factory,
            },
            events_tx,
        )?;

        let token = self.inner.cancel_token.child_token();
        let auto_reconnect = config.auto_reconnect;
        core.event_task_token = Some(token.clone());
        core.ua = Some(ua);
        core.config = Some(config);
        core.phase = SipPhase::Initialized;
        drop(core);

        self.spawn_event_task(events_rx, token, auto_reconnect);
        Ok(())
    }

    /// Starts the user agent; `true` once the transport reports connected,
    /// `false` on the configured connection timeout or a start failure.
    pub async fn connect(&self) -> bool {
        let (ua, timeout_ms) = {
            let mut core = self.inner.core.lock().await;
            let Some(ua) = core.ua.clone() else {
                drop(core);
                self.broadcast_connection(ConnectionState::Failed, Some("not initialized".to_string()))
                    .await;
                return false;
            };
            core.phase = SipPhase::Connecting;
            let timeout_ms = core
                .config
                .as_ref()
                .map(|c| c.connection_timeout)
                .unwrap_or(crate::config::DEFAULT_CONNECTION_TIMEOUT_MS);
            (ua, timeout_ms)
        };

        self.broadcast_connection(ConnectionState::Connecting, None).await;
        let mut transport_rx = self.inner.transport.subscribe();
        self.inner
            .transport
            .send_replace(TransportState::Connecting);

        if let Err(e) = ua.start().await {
            error!("user agent start failed: {}", e);
            self.broadcast_connection(ConnectionState::Failed, Some(e.to_string()))
                .await;
            return false;
        }

        let wait = async {
            loop {
                match &*transport_rx.borrow() {
                    TransportState::Connected => return true,
                    TransportState::Disconnected { error: Some(_) } => return false,
                    _ => {}
                }
                if transport_rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        match timeout(Duration::from_millis(timeout_ms), wait).await {
            Ok(connected) => connected,
            Err(_) => {
                warn!("transport connect timed out after {}ms", timeout_ms);
                self.broadcast_connection(
                    ConnectionState::Failed,
                    Some(format!("connection timeout after {}ms", timeout_ms)),
                )
                .await;
                false
            }
        }
    }

    /// Lazily constructs the registerer and sends REGISTER with the
    /// configured extra headers. Registration outcome arrives on the update
    /// stream.
    pub async fn register(&self) -> bool {
        let registerer = match self.ensure_registerer().await {
            Ok(registerer) => registerer,
            Err(e) => {
                warn!("register unavailable: {}", e);
                self.broadcast_registration(RegistrationState::Failed, None, Some(e.to_string()))
                    .await;
                return false;
            }
        };

        let extra_headers = {
            let mut core = self.inner.core.lock().await;
            core.phase = SipPhase::Registering;
            core.config
                .as_ref()
                .map(|c| c.extra_header_lines())
                .unwrap_or_default()
        };
        self.broadcast_registration(RegistrationState::Registering, None, None)
            .await;

        match registerer.register(extra_headers).await {
            Ok(()) => true,
            Err(e) => {
                error!("register failed: {}", e);
                self.broadcast_registration(RegistrationState::Failed, None, Some(e.to_string()))
                    .await;
                false
            }
        }
    }

    async fn ensure_registerer(&self) -> Result<Arc<dyn RegistererHandle>> {
        let mut core = self.inner.core.lock().await;
        if !core.phase.is_connected() {
            return Err(crate::Error::BadState(format!(
                "register in phase {}",
                core.phase
            )));
        }
        if let Some(registerer) = core.registerer.clone() {
            return Ok(registerer);
        }
        let ua = core
            .ua
            .clone()
            .ok_or_else(|| crate::Error::BadState("not initialized".to_string()))?;
        let config = core
            .config
            .clone()
            .ok_or_else(|| crate::Error::BadState("not initialized".to_string()))?;

        let (states_tx, states_rx) = unbounded_channel();
        let options = RegistererOptions {
            expires: config.register_expires,
            call_id: Some(make_registration_call_id(
                config.registrar_domain().ok().as_deref(),
            )),
        };
        let registerer = ua.registerer(options, states_tx)?;
        core.registerer = Some(registerer.clone());
        drop(core);

        self.spawn_registration_task(states_rx);
        Ok(registerer)
    }

    pub async fn unregister(&self) -> bool {
        let registerer = {
            let mut core = self.inner.core.lock().await;
            let Some(registerer) = core.registerer.clone() else {
                drop(core);
                self.broadcast_registration(
                    RegistrationState::Failed,
                    None,
                    Some("not registered".to_string()),
                )
                .await;
                return false;
            };
            core.phase = SipPhase::Unregistering;
            registerer
        };
        match registerer.unregister().await {
            Ok(()) => true,
            Err(e) => {
                error!("unregister failed: {}", e);
                self.broadcast_registration(RegistrationState::Failed, None, Some(e.to_string()))
                    .await;
                false
            }
        }
    }

    /// Unregisters first when registered, then stops the user agent.
    pub async fn disconnect(&self) -> bool {
        let registered = {
            let core = self.inner.core.lock().await;
            core.phase == SipPhase::Registered
        };
        if registered {
            self.unregister().await;
        }
        let ua = {
            let mut core = self.inner.core.lock().await;
            if let Some(token) = core.reconnect_token.take() {
                token.cancel();
            }
            core.phase = SipPhase::Disconnected;
            core.ua.clone()
        };
        match ua {
            Some(ua) => match ua.stop().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("user agent stop failed: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Builds an inviter toward `target` with audio-only constraints, pins
    /// the remote-SDP bridge to the calling edge, and tracks the resulting
    /// session. Returns the new call id.
    pub async fn make_call(&self, client_id: &str, target: &str) -> Result<String> {
        let (ua, target_uri) = {
            let core = self.inner.core.lock().await;
            if !core.phase.is_connected() {
                return Err(crate::Error::BadState(format!(
                    "make call in phase {}",
                    core.phase
                )));
            }
            if core.active_call.is_some() {
                return Err(crate::Error::BadState("another call is active".to_string()));
            }
            let ua = core
                .ua
                .clone()
                .ok_or_else(|| crate::Error::BadState("not initialized".to_string()))?;
            let target_uri = resolve_target(target, core.config.as_ref())?;
            (ua, target_uri)
        };

        let call_id = Uuid::new_v4().to_string();
        self.inner
            .bridge
            .set_preferred_client(Some(client_id.to_string()));

        let record = CallRecord {
            id: call_id.clone(),
            state: CallState::Creating,
            target: Some(target.to_string()),
            from: None,
            start_time: Some(now_millis()),
            connect_time: None,
            end_time: None,
            end_reason: None,
        };
        {
            let mut core = self.inner.core.lock().await;
            core.active_call = Some(record.clone());
        }
        self.broadcast_call_update(&record).await;
        self.broadcast_state_update().await;

        let (states_tx, states_rx) = unbounded_channel();
        let options = InviteOptions {
            target: target_uri,
            constraints: MediaConstraints::default(),
            extra_headers: Vec::new(),
            sdh_options: self.inner.bridge.defaults(),
        };
        match ua.invite(options, states_tx).await {
            Ok(session) => {
                {
                    let mut core = self.inner.core.lock().await;
                    core.sessions.insert(call_id.clone(), session);
                }
                self.spawn_session_task(call_id.clone(), states_rx);
                Ok(call_id)
            }
            Err(e) => {
                error!("invite failed: {}", e);
                self.broadcast_call_error(Some(call_id.clone()), e.to_string());
                self.update_call(&call_id, CallState::Ended, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// First claim wins; later claims are rejected so the winning edge keeps
    /// the media path.
    pub async fn answer_call(&self, client_id: &str, call_id: &str) -> Result<()> {
        let (session, record) = {
            let mut core = self.inner.core.lock().await;
            let record = core
                .active_call
                .as_mut()
                .filter(|record| record.id == call_id)
                .ok_or_else(|| crate::Error::BadState("no such call".to_string()))?;
            if record.state != CallState::Incoming {
                return Err(crate::Error::BadState("call already claimed".to_string()));
            }
            record.state = CallState::Connecting;
            let record = record.clone();
            let session = core
                .sessions
                .get(call_id)
                .cloned()
                .ok_or_else(|| crate::Error::BadState("no such call".to_string()))?;
            (session, record)
        };
        self.broadcast_call_update(&record).await;

        self.inner
            .bridge
            .set_preferred_client(Some(client_id.to_string()));
        self.inner.bridge.bind_session(&session.id(), client_id);
        self.broadcast(
            MessageType::CallClaimed,
            &crate::message::CallClaimedPayload {
                call_id: call_id.to_string(),
                client_id: client_id.to_string(),
            },
        );
        session.accept().await
    }

    pub async fn end_call(&self, call_id: &str) -> Result<()> {
        let session = {
            let core = self.inner.core.lock().await;
            core.sessions
                .get(call_id)
                .cloned()
                .ok_or_else(|| crate::Error::BadState("no such call".to_string()))?
        };
        session.terminate().await
    }

    /// DTMF rides the session's description handler, which proxies it to the
    /// edge peer connection.
    pub async fn send_dtmf(&self, call_id: &str, tones: &str) -> Result<()> {
        let session = {
            let core = self.inner.core.lock().await;
            core.sessions
                .get(call_id)
                .cloned()
                .ok_or_else(|| crate::Error::BadState("no such call".to_string()))?
        };
        let sdh = session
            .sdh()
            .ok_or_else(|| crate::Error::BadState("call has no media session".to_string()))?;
        if sdh.send_dtmf(tones, None) {
            Ok(())
        } else {
            Err(crate::Error::MediaFailure("dtmf rejected".to_string()))
        }
    }

    fn spawn_event_task(
        &self,
        mut events: UnboundedReceiver<UaEvent>,
        token: CancellationToken,
        auto_reconnect: bool,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => manager.on_ua_event(event, auto_reconnect).await,
                        None => break,
                    },
                }
            }
        });
    }

    async fn on_ua_event(&self, event: UaEvent, auto_reconnect: bool) {
        match event {
            UaEvent::Transport(state) => self.on_transport_state(state, auto_reconnect).await,
            UaEvent::IncomingInvite {
                session,
                from,
                states,
            } => self.on_incoming_invite(session, from, states).await,
        }
    }

    async fn on_transport_state(&self, state: TransportState, auto_reconnect: bool) {
        self.inner.transport.send_replace(state.clone());
        match state {
            TransportState::Connecting => {
                self.broadcast_connection(ConnectionState::Connecting, None).await;
            }
            TransportState::Connected => {
                {
                    let mut core = self.inner.core.lock().await;
                    core.was_connected = true;
                    if let Some(token) = core.reconnect_token.take() {
                        token.cancel();
                    }
                    if matches!(core.phase, SipPhase::Initialized | SipPhase::Connecting) {
                        core.phase = SipPhase::Connected;
                    }
                }
                self.broadcast_connection(ConnectionState::Connected, None).await;
            }
            TransportState::Disconnected { error } => {
                let (was_connected, deliberate) = {
                    let core = self.inner.core.lock().await;
                    (core.was_connected, core.phase == SipPhase::Disconnected)
                };
                self.broadcast_connection(ConnectionState::Disconnected, error).await;
                if auto_reconnect && was_connected && !deliberate {
                    self.schedule_reconnect().await;
                }
            }
        }
    }

    async fn on_incoming_invite(
        &self,
        session: Arc<dyn SessionHandle>,
        from: String,
        states: UnboundedReceiver<SessionState>,
    ) {
        let call_id = Uuid::new_v4().to_string();
        {
            let mut core = self.inner.core.lock().await;
            if core.active_call.is_some() {
                info!("incoming call while busy, declining");
                drop(core);
                session.terminate().await.ok();
                return;
            }
            core.active_call = Some(CallRecord {
                id: call_id.clone(),
                state: CallState::Incoming,
                target: None,
                from: Some(from.clone()),
                start_time: Some(now_millis()),
                connect_time: None,
                end_time: None,
                end_reason: None,
            });
            core.sessions.insert(call_id.clone(), session);
        }
        self.spawn_session_task(call_id.clone(), states);
        self.broadcast(
            MessageType::IncomingCall,
            &IncomingCallPayload {
                call_id,
                from,
            },
        );
        self.broadcast_state_update().await;
    }

    fn spawn_session_task(&self, call_id: String, mut states: UnboundedReceiver<SessionState>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(state) = states.recv().await {
                let (call_state, reason) = match state {
                    SessionState::Calling => (CallState::Calling, None),
                    SessionState::Early => (CallState::Connecting, None),
                    SessionState::Established => (CallState::Connected, None),
                    SessionState::Terminated(reason) => (CallState::Ended, reason),
                };
                let ended = call_state == CallState::Ended;
                manager.update_call(&call_id, call_state, reason).await;
                if ended {
                    break;
                }
            }
        });
    }

    async fn update_call(&self, call_id: &str, state: CallState, reason: Option<String>) {
        let record = {
            let mut core = self.inner.core.lock().await;
            let Some(record) = core
                .active_call
                .as_mut()
                .filter(|record| record.id == call_id)
            else {
                debug!("state {:?} for unknown call {}", state, call_id);
                return;
            };
            // Updates are monotonic per call id, and a call never crosses
            // between the incoming and outgoing trajectories.
            if !record.state.can_advance_to(state) {
                debug!(
                    "call {} transition {:?} -> {:?} rejected",
                    call_id, record.state, state
                );
                return;
            }
            record.state = state;
            match state {
                CallState::Connected => record.connect_time = Some(now_millis()),
                CallState::Ended => {
                    record.end_time = Some(now_millis());
                    record.end_reason = reason.clone();
                }
                _ => {}
            }
            record.clone()
        };

        self.broadcast_call_update(&record).await;
        if record.state == CallState::Ended {
            self.finish_call(call_id, reason).await;
        }
        self.broadcast_state_update().await;
    }

    async fn finish_call(&self, call_id: &str, _reason: Option<String>) {
        let session = {
            let mut core = self.inner.core.lock().await;
            if core
                .active_call
                .as_ref()
                .map(|record| record.id == call_id)
                .unwrap_or(false)
            {
                core.active_call = None;
            }
            core.sessions.remove(call_id)
        };
        if let Some(session) = session {
            if let Some(sdh) = session.sdh() {
                sdh.close().await;
            }
            self.inner.bridge.remove_session(&session.id(), None);
        }
    }

    async fn schedule_reconnect(&self) {
        let token = {
            let mut core = self.inner.core.lock().await;
            if core.reconnect_token.is_some() {
                return;
            }
            let token = self.inner.cancel_token.child_token();
            core.reconnect_token = Some(token.clone());
            token
        };
        info!("transport lost, reconnecting in {:?}", RECONNECT_DELAY);
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = token.cancelled() => break,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
                let ua = {
                    let core = manager.inner.core.lock().await;
                    core.ua.clone()
                };
                let Some(ua) = ua else { break };
                info!("reconnect attempt");
                if let Err(e) = ua.start().await {
                    warn!("reconnect failed: {}", e);
                    continue;
                }
                if matches!(&*manager.inner.transport.borrow(), TransportState::Connected) {
                    break;
                }
            }
        });
    }

    fn spawn_registration_task(&self, mut states: UnboundedReceiver<RegistererState>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(state) = states.recv().await {
                match state {
                    RegistererState::Registering => {
                        manager
                            .broadcast_registration(RegistrationState::Registering, None, None)
                            .await;
                    }
                    RegistererState::Registered => {
                        {
                            let mut core = manager.inner.core.lock().await;
                            core.phase = SipPhase::Registered;
                            core.registration_state = RegistrationState::Registered;
                        }
                        manager
                            .broadcast_registration(RegistrationState::Registered, None, None)
                            .await;
                    }
                    RegistererState::Unregistered => {
                        {
                            let mut core = manager.inner.core.lock().await;
                            if core.phase.is_connected() {
                                core.phase = SipPhase::Connected;
                            }
                            core.registration_state = RegistrationState::Unregistered;
                        }
                        manager
                            .broadcast_registration(RegistrationState::Unregistered, None, None)
                            .await;
                    }
                    RegistererState::Failed(error) => {
                        {
                            let mut core = manager.inner.core.lock().await;
                            core.registration_state = RegistrationState::Failed;
                        }
                        manager
                            .broadcast_registration(RegistrationState::Failed, None, Some(error))
                            .await;
                    }
                    RegistererState::Terminated => {
                        {
                            let mut core = manager.inner.core.lock().await;
                            core.registration_state = RegistrationState::Failed;
                        }
                        manager
                            .broadcast_registration(
                                RegistrationState::Failed,
                                Some("Registration terminated".to_string()),
                                None,
                            )
                            .await;
                    }
                }
            }
        });
    }

    fn broadcast<T: Serialize>(&self, kind: MessageType, payload: &T) {
        match Envelope::new(kind).with_payload(payload) {
            Ok(envelope) => {
                self.inner.registry.broadcast_to_all_clients(envelope);
            }
            Err(e) => warn!("broadcast {} encode failed: {}", kind, e),
        }
    }

    fn broadcast_init(&self, success: bool, state: InitState, error: Option<String>) {
        self.broadcast(
            MessageType::SipInitResult,
            &SipInitResultPayload {
                success,
                state,
                error,
            },
        );
    }

    async fn broadcast_connection(&self, state: ConnectionState, error: Option<String>) {
        {
            let mut core = self.inner.core.lock().await;
            if core.last_connection == Some(state) && error.is_none() {
                return;
            }
            core.last_connection = Some(state);
        }
        self.broadcast(
            MessageType::SipConnectionUpdate,
            &ConnectionUpdatePayload { state, error },
        );
    }

    async fn broadcast_registration(
        &self,
        state: RegistrationState,
        cause: Option<String>,
        error: Option<String>,
    ) {
        {
            let mut core = self.inner.core.lock().await;
            if core.last_registration == Some(state) && cause.is_none() && error.is_none() {
                return;
            }
            core.last_registration = Some(state);
        }
        self.broadcast(
            MessageType::SipRegistrationUpdate,
            &RegistrationUpdatePayload {
                state,
                cause,
                error,
            },
        );
    }

    async fn broadcast_call_update(&self, record: &CallRecord) {
        self.broadcast(
            MessageType::CallUpdate,
            &CallUpdatePayload {
                call_id: record.id.clone(),
                state: record.state,
                target: record.target.clone(),
                from: record.from.clone(),
                end_reason: record.end_reason.clone(),
            },
        );
    }

    fn broadcast_call_error(&self, call_id: Option<String>, error: String) {
        self.broadcast(
            MessageType::CallError,
            &crate::message::CallErrorPayload { call_id, error },
        );
    }

    async fn broadcast_state_update(&self) {
        let snapshot = self.snapshot().await;
        self.broadcast(MessageType::StateUpdate, &snapshot);
    }
}

fn make_registration_call_id(domain: Option<&str>) -> String {
    format!(
        "{}@{}",
        random_text(CALL_ID_LEN),
        domain.unwrap_or("siphub.invalid")
    )
}

/// Accepts a full SIP URI or a bare user part, completed against the
/// configured registrar domain.
fn resolve_target(target: &str, config: Option<&SipConfig>) -> Result<rsip::Uri> {
    if target.starts_with("sip:") || target.starts_with("sips:") {
        return rsip::Uri::try_from(target).map_err(Into::into);
    }
    let domain = config
        .map(|c| c.registrar_domain())
        .transpose()?
        .ok_or_else(|| crate::Error::BadState("no configuration".to_string()))?;
    if target.contains('@') {
        rsip::Uri::try_from(format!("sip:{}", target).as_str()).map_err(Into::into)
    } else {
        rsip::Uri::try_from(format!("sip:{}@{}", target, domain).as_str()).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(SipPhase::Uninitialized.to_string(), "uninitialized");
        assert_eq!(SipPhase::Registered.to_string(), "registered");
    }

    #[test]
    fn test_registration_call_id_has_domain() {
        let call_id = make_registration_call_id(Some("example.org"));
        assert!(call_id.ends_with("@example.org"));
        assert_eq!(call_id.len(), CALL_ID_LEN + 1 + "example.org".len());
    }

    #[test]
    fn test_resolve_target_variants() {
        let config = SipConfig {
            uri: "sip:alice@example.org".to_string(),
            password: "pw".to_string(),
            ws_servers: vec!["wss://example.org/ws".to_string()],
            ..Default::default()
        };
        let full = resolve_target("sip:bob@other.org", Some(&config)).unwrap();
        assert_eq!(full.to_string(), "sip:bob@other.org");
        let bare = resolve_target("bob", Some(&config)).unwrap();
        assert_eq!(bare.to_string(), "sip:bob@example.org");
        let user_host = resolve_target("bob@other.org", Some(&config)).unwrap();
        assert_eq!(user_host.to_string(), "sip:bob@other.org");
    }
}
