use crate::message::{IceCandidateInit, SessionId};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Contract between the hub and the SIP stack it hosts.
///
/// The stack itself is an external collaborator; only the seams below matter
/// here. The manager drives a `UserAgentHandle` built by a
/// `UserAgentFactory`, and the stack consumes session-description handlers
/// through the bound `SdhFactory` exactly as it would a local handler.
/// All state flows back over plain unbounded senders.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected { error: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistererState {
    Registering,
    Registered,
    Unregistered,
    Failed(String),
    Terminated,
}

/// Session progression as reported by the stack. The manager translates
/// these into call-record states; the stream is monotonic per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Calling,
    Early,
    Established,
    Terminated(Option<String>),
}

pub enum UaEvent {
    Transport(TransportState),
    IncomingInvite {
        session: Arc<dyn SessionHandle>,
        from: String,
        states: tokio::sync::mpsc::UnboundedReceiver<SessionState>,
    },
}

pub struct UserAgentInit {
    pub uri: rsip::Uri,
    pub display_name: Option<String>,
    pub password: String,
    pub ws_servers: Vec<String>,
    pub user_agent: String,
    /// Session-description handler factory the stack must use for every
    /// media session. Absent in transport-only mode.
    pub sdh_factory: Option<Arc<dyn SdhFactory>>,
}

pub trait UserAgentFactory: Send + Sync {
    fn build(
        &self,
        init: UserAgentInit,
        events: UnboundedSender<UaEvent>,
    ) -> Result<Arc<dyn UserAgentHandle>>;
}

#[async_trait]
pub trait UserAgentHandle: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn registerer(
        &self,
        options: RegistererOptions,
        states: UnboundedSender<RegistererState>,
    ) -> Result<Arc<dyn RegistererHandle>>;
    async fn invite(
        &self,
        options: InviteOptions,
        states: UnboundedSender<SessionState>,
    ) -> Result<Arc<dyn SessionHandle>>;
}

pub struct RegistererOptions {
    pub expires: u32,
    /// Fresh Call-Id per registration.
    pub call_id: Option<String>,
}

#[async_trait]
pub trait RegistererHandle: Send + Sync {
    async fn register(&self, extra_headers: Vec<String>) -> Result<()>;
    async fn unregister(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        MediaConstraints {
            audio: true,
            video: false,
        }
    }
}

pub struct InviteOptions {
    pub target: rsip::Uri,
    pub constraints: MediaConstraints,
    pub extra_headers: Vec<String>,
    /// Handler options the stack must hand to the bound `SdhFactory`.
    pub sdh_options: SdhOptions,
}

#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> String;
    fn remote_identity(&self) -> Option<String>;
    /// The session-description handler the stack bound to this session, if
    /// one was created.
    fn sdh(&self) -> Option<Arc<dyn SessionDescriptionHandler>>;
    async fn accept(&self) -> Result<()>;
    async fn terminate(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct SdhBody {
    pub body: String,
    pub content_type: String,
}

/// The handler surface the stack calls as if local. The remote-SDP bridge
/// implements this over the envelope channel.
#[async_trait]
pub trait SessionDescriptionHandler: Send + Sync {
    async fn get_description(&self, options: Option<Value>) -> Result<SdhBody>;
    async fn set_description(&self, sdp: &str, options: Option<Value>) -> Result<()>;
    /// Fire-and-forget; returns `true` and logs failures.
    fn send_dtmf(&self, tones: &str, options: Option<Value>) -> bool;
    fn has_description(&self, content_type: &str) -> bool;
    async fn close(&self);
}

/// Per-session sinks for media-plane events the stack's delegate cares
/// about. A `None` candidate marks end-of-gathering.
#[derive(Default)]
pub struct SessionDelegate {
    pub ice_candidate: Option<UnboundedSender<Option<IceCandidateInit>>>,
    pub connection_state: Option<UnboundedSender<String>>,
}

pub struct SessionInfo {
    pub session_id: SessionId,
    pub delegate: SessionDelegate,
}

#[derive(Debug, Clone)]
pub struct SdhOptions {
    pub trickle_candidates: bool,
    pub ice_gathering_timeout: u64,
    pub request_timeout: u64,
    pub constraints: MediaConstraints,
    /// ICE servers synthesized from the account configuration; forwarded to
    /// the edge peer connection with the first offer or answer.
    pub ice_servers: Vec<crate::config::IceServer>,
}

impl Default for SdhOptions {
    fn default() -> Self {
        SdhOptions {
            trickle_candidates: true,
            ice_gathering_timeout: crate::config::DEFAULT_ICE_GATHERING_TIMEOUT_MS,
            request_timeout: 30_000,
            constraints: MediaConstraints::default(),
            ice_servers: Vec::new(),
        }
    }
}

pub trait SdhFactory: Send + Sync {
    fn create(
        &self,
        session: SessionInfo,
        options: SdhOptions,
    ) -> Arc<dyn SessionDescriptionHandler>;
    fn remove_session(&self, session_id: &str, client_id: Option<&str>);
}
