use crate::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CLIENT_ID_LEN: usize = 12;
pub const REQUEST_ID_LEN: usize = 12;
pub const SESSION_ID_LEN: usize = 16;

pub type ClientId = String;
pub type RequestId = String;
pub type SessionId = String;

/// Message Type Taxonomy
///
/// Closed set of envelope types exchanged between an edge and the hub.
/// Arrivals outside this set fail deserialization and are dropped at the
/// receiving side with an error log; they never raise an error back to the
/// sender.
///
/// # Groups
///
/// * Admission - `ClientConnected`, `ClientDisconnected`, `StateUpdate`
/// * RPC - `Request`, `Response`, `RequestResult`, `Error`
/// * SIP lifecycle - init / connect / register requests and their update
///   streams
/// * Calls - call requests, `IncomingCall`, `CallUpdate`, `CallError`,
///   `CallClaimed`
/// * Remote-SDP bridge - `SdpRequest`, `SdpResponse`, `IceCandidate`,
///   `ConnectionStateChange`, `MediaControl`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ClientConnected,
    ClientDisconnected,
    StateUpdate,
    Request,
    Response,
    RequestResult,
    Error,
    RequestSipInit,
    SipInitResult,
    RequestConnect,
    SipConnectionUpdate,
    RequestRegister,
    RequestUnregister,
    SipRegistrationUpdate,
    RequestMakeCall,
    RequestAnswerCall,
    RequestEndCall,
    IncomingCall,
    CallUpdate,
    CallError,
    CallClaimed,
    SdpRequest,
    SdpResponse,
    IceCandidate,
    ConnectionStateChange,
    MediaControl,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

/// Wire envelope between edge and hub.
///
/// Every envelope carries a millisecond epoch timestamp. `Request` and
/// `SdpRequest` envelopes carry a `request_id`; the matching reply carries
/// the same id inside its payload. After admission, every envelope an edge
/// posts carries that edge's `client_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub timestamp: u64,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Envelope {
            kind,
            payload: None,
            client_id: None,
            timestamp: now_millis(),
            request_id: None,
            action: None,
        }
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn with_raw_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn client(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn request(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Deserializes the payload into `T`. Missing payloads are a protocol
    /// error: callers only parse envelopes whose type implies a payload.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .payload
            .clone()
            .ok_or_else(|| crate::Error::ProtocolError(format!("{} without payload", self.kind)))?;
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPresencePayload {
    pub client_id: ClientId,
    pub total_clients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationSnapshot {
    pub state: RegistrationState,
}

/// Aggregate call state broadcast to edges in `StateUpdate` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStateSnapshot {
    pub has_active_call: bool,
    pub active_call: Option<CallRecord>,
    pub registration: RegistrationSnapshot,
}

impl Default for CallStateSnapshot {
    fn default() -> Self {
        CallStateSnapshot {
            has_active_call: false,
            active_call: None,
            registration: RegistrationSnapshot {
                state: RegistrationState::None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitState {
    Initialized,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    None,
    Registering,
    Registered,
    Unregistered,
    Failed,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::None => write!(f, "none"),
            RegistrationState::Registering => write!(f, "registering"),
            RegistrationState::Registered => write!(f, "registered"),
            RegistrationState::Unregistered => write!(f, "unregistered"),
            RegistrationState::Failed => write!(f, "failed"),
        }
    }
}

/// Call progression on the wire. Ordered: a `CallUpdate` stream for one call
/// id never moves to a lower rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Creating,
    Calling,
    Incoming,
    Connecting,
    Connected,
    Ended,
}

impl CallState {
    pub fn rank(&self) -> u8 {
        match self {
            CallState::Creating => 0,
            CallState::Calling => 1,
            CallState::Incoming => 1,
            CallState::Connecting => 2,
            CallState::Connected => 3,
            CallState::Ended => 4,
        }
    }

    /// Whether a record in this state may move to `next`. Valid transitions
    /// strictly increase rank; the equal-rank pairs are either repeats or a
    /// crossing between the incoming and outgoing trajectories, both
    /// invalid.
    pub fn can_advance_to(&self, next: CallState) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub state: CallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SipInitResultPayload {
    pub success: bool,
    pub state: InitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdatePayload {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationUpdatePayload {
    pub state: RegistrationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUpdatePayload {
    pub call_id: String,
    pub state: CallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    pub call_id: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallClaimedPayload {
    pub call_id: String,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub error: String,
}

/// Remote-SDP bridge operations serviced by the edge peer-connection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SdpOperation {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    GetCompleteSdp,
    AddIceCandidate,
    SendDtmf,
    Close,
}

impl std::fmt::Display for SdpOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SdpOperation::CreateOffer => "createOffer",
            SdpOperation::CreateAnswer => "createAnswer",
            SdpOperation::SetLocalDescription => "setLocalDescription",
            SdpOperation::SetRemoteDescription => "setRemoteDescription",
            SdpOperation::GetCompleteSdp => "getCompleteSdp",
            SdpOperation::AddIceCandidate => "addIceCandidate",
            SdpOperation::SendDtmf => "sendDtmf",
            SdpOperation::Close => "close",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpRequestBody {
    pub operation: SdpOperation,
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpRequestPayload {
    pub session_id: SessionId,
    pub request: SdpRequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpResponseBody {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpResponsePayload {
    pub session_id: SessionId,
    pub response: SdpResponseBody,
}

/// Serialized ICE candidate as emitted by a peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u32>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// A `candidate` of `None` signals end-of-gathering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub session_id: SessionId,
    pub candidate: Option<IceCandidateInit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStateChangePayload {
    pub session_id: SessionId,
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaCommand {
    SetMuted,
    SendDtmf,
}

/// Local media mutation; never crosses into the SIP stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaControlPayload {
    pub command: MediaCommand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tones: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptionInit {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect::<String>()
}

pub fn make_client_id() -> ClientId {
    format!("edge-{}", random_text(CLIENT_ID_LEN))
}

pub fn make_request_id() -> RequestId {
    random_text(REQUEST_ID_LEN)
}

pub fn make_session_id() -> SessionId {
    random_text(SESSION_ID_LEN)
}
