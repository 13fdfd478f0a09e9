pub mod handler;
pub mod registry;
pub use handler::{HandlerFn, MessageContext, MessageHandler};
pub use registry::ClientRegistry;

use crate::bridge::RemoteSdpFactory;
use crate::config::SipConfig;
use crate::message::{
    make_client_id, ClientId, ClientPresencePayload, ConnectionStateChangePayload, Envelope,
    IceCandidatePayload, MessageType, SdpResponsePayload,
};
use crate::sip::stack::UserAgentFactory;
use crate::sip::SipManager;
use crate::transport::{channel_pair, ChannelConnection};
use crate::Result;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ActionContext {
    pub client_id: ClientId,
    pub payload: Option<Value>,
}

pub type ActionFuture = BoxFuture<'static, Result<Value>>;
pub type ActionFn = Arc<dyn Fn(ActionContext) -> ActionFuture + Send + Sync>;

struct HubInner {
    registry: Arc<ClientRegistry>,
    handler: Arc<MessageHandler>,
    actions: Arc<RwLock<HashMap<String, ActionFn>>>,
    sip: SipManager,
    bridge: RemoteSdpFactory,
    cancel_token: CancellationToken,
}

/// The singleton scope shared by all edges: client registry, message
/// router, SIP manager, and the remote-SDP bridge factory.
///
/// Each attached channel gets its own receive loop. Admission and bridge
/// routing are dispatched inline to keep their ordering guarantees; request
/// and SIP lifecycle handlers are spawned so a long-running operation (a
/// connect, an invite waiting on SDP) never stalls the loop that must route
/// the edge's own replies back in.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(ua_factory: Arc<dyn UserAgentFactory>) -> Self {
        let cancel_token = CancellationToken::new();
        let registry = Arc::new(ClientRegistry::new());
        let bridge = RemoteSdpFactory::new(registry.clone());
        let sip = SipManager::new(
            registry.clone(),
            bridge.clone(),
            ua_factory,
            cancel_token.child_token(),
        );
        let handler = Arc::new(MessageHandler::new(registry.clone()));
        let hub = Hub {
            inner: Arc::new(HubInner {
                registry,
                handler,
                actions: Arc::new(RwLock::new(HashMap::new())),
                sip,
                bridge,
                cancel_token,
            }),
        };
        hub.install_handlers();
        hub.install_actions();
        hub
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.inner.registry
    }

    pub fn sip(&self) -> &SipManager {
        &self.inner.sip
    }

    pub fn bridge(&self) -> &RemoteSdpFactory {
        &self.inner.bridge
    }

    pub fn get_client_count(&self) -> usize {
        self.inner.registry.get_client_count()
    }

    /// Opens a new channel and returns the edge half.
    pub fn connect(&self) -> ChannelConnection {
        let (edge_half, hub_half) = channel_pair(&format!("ch-{}", crate::message::random_text(6)));
        self.attach(hub_half);
        edge_half
    }

    /// Serves an already-created hub-side channel half.
    pub fn attach(&self, connection: ChannelConnection) {
        let hub = self.clone();
        let token = self.inner.cancel_token.child_token();
        let Some(mut rx) = connection.take_receiver() else {
            warn!("attach: channel receiver already taken");
            return;
        };
        let channel_token = connection.cancel_token();
        tokio::spawn(async move {
            let mut admitted: Option<ClientId> = None;
            loop {
                select! {
                    _ = token.cancelled() => break,
                    _ = channel_token.cancelled() => break,
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => {
                            hub.route(&mut admitted, &connection, envelope).await;
                        }
                        None => break,
                    },
                }
            }
            hub.reap(admitted).await;
        });
    }

    pub fn add_action(&self, name: &str, action: ActionFn) {
        self.inner
            .actions
            .write()
            .unwrap()
            .insert(name.to_string(), action);
    }

    pub fn add_handler(&self, kind: MessageType, handler: HandlerFn) {
        self.inner.handler.add_handler(kind, handler);
    }

    pub fn shutdown(&self) {
        info!("hub shutdown requested");
        self.inner.cancel_token.cancel();
    }

    async fn route(
        &self,
        admitted: &mut Option<ClientId>,
        connection: &ChannelConnection,
        mut envelope: Envelope,
    ) {
        // Admission precedes everything else; violators are dropped here and
        // never reach the SIP manager or the bridge.
        if envelope.kind == MessageType::ClientConnected {
            // Allocate here, not in the handler, so the reap tracker always
            // carries the id the registry ends up keyed by.
            if envelope.client_id.is_none() {
                envelope.client_id = Some(make_client_id());
            }
            admitted.clone_from(&envelope.client_id);
        } else {
            let known = envelope
                .client_id
                .as_deref()
                .map(|id| self.inner.registry.contains(id))
                .unwrap_or(false);
            if !known {
                warn!(
                    "unadmitted {} envelope dropped (client {:?})",
                    envelope.kind, envelope.client_id
                );
                return;
            }
        }

        let ctx = MessageContext {
            envelope,
            connection: connection.clone(),
        };
        match ctx.envelope.kind {
            MessageType::ClientConnected
            | MessageType::ClientDisconnected
            | MessageType::SdpResponse
            | MessageType::IceCandidate
            | MessageType::ConnectionStateChange => {
                self.inner.handler.dispatch(ctx).await;
            }
            _ => {
                let handler = self.inner.handler.clone();
                tokio::spawn(async move {
                    handler.dispatch(ctx).await;
                });
            }
        }
    }

    /// Cleanup for channels that died without a `ClientDisconnected`.
    async fn reap(&self, admitted: Option<ClientId>) {
        let Some(client_id) = admitted else { return };
        if !self.inner.registry.contains(&client_id) {
            return;
        }
        debug!("reaping dead client {}", client_id);
        self.remove_client(&client_id);
    }

    fn remove_client(&self, client_id: &str) {
        if self.inner.registry.unregister(client_id).is_none() {
            return;
        }
        let payload = ClientPresencePayload {
            client_id: client_id.to_string(),
            total_clients: self.inner.registry.get_client_count(),
        };
        if let Ok(envelope) = Envelope::new(MessageType::ClientDisconnected).with_payload(&payload)
        {
            self.inner.registry.broadcast_to_all_clients(envelope);
        }
    }

    fn install_handlers(&self) {
        let handler = &self.inner.handler;

        // Admission.
        {
            let registry = self.inner.registry.clone();
            let sip = self.inner.sip.clone();
            handler.add_handler(
                MessageType::ClientConnected,
                Arc::new(move |ctx| {
                    let registry = registry.clone();
                    let sip = sip.clone();
                    Box::pin(async move {
                        let client_id = require_client(&ctx.envelope)?;
                        registry.register(client_id.clone(), ctx.connection.clone());
                        info!(
                            "client {} connected ({} total)",
                            client_id,
                            registry.get_client_count()
                        );
                        let snapshot = sip.snapshot().await;
                        let state =
                            Envelope::new(MessageType::StateUpdate).with_payload(&snapshot)?;
                        ctx.connection.post(state);
                        let payload = ClientPresencePayload {
                            client_id,
                            total_clients: registry.get_client_count(),
                        };
                        let joined = Envelope::new(MessageType::ClientConnected)
                            .with_payload(&payload)?;
                        registry.broadcast_to_all_clients(joined);
                        Ok(())
                    })
                }),
            );
        }

        // Departure.
        {
            let hub = self.clone();
            handler.add_handler(
                MessageType::ClientDisconnected,
                Arc::new(move |ctx| {
                    let hub = hub.clone();
                    Box::pin(async move {
                        if let Some(client_id) = ctx.envelope.client_id.as_deref() {
                            info!("client {} disconnected", client_id);
                            hub.remove_client(client_id);
                        }
                        Ok(())
                    })
                }),
            );
        }

        // Typed RPC, dispatched by action.
        {
            let registry = self.inner.registry.clone();
            let actions = self.inner.actions.clone();
            handler.add_handler(
                MessageType::Request,
                Arc::new(move |ctx| {
                    let registry = registry.clone();
                    let actions = actions.clone();
                    Box::pin(async move {
                        let action = ctx.envelope.action.clone().unwrap_or_default();
                        let (Some(client_id), Some(request_id)) = (
                            ctx.envelope.client_id.clone(),
                            ctx.envelope.request_id.clone(),
                        ) else {
                            return Err(crate::Error::ProtocolError(
                                "request without client or request id".to_string(),
                            ));
                        };
                        let action_fn = actions.read().unwrap().get(&action).cloned();
                        match action_fn {
                            Some(action_fn) => {
                                let outcome = action_fn(ActionContext {
                                    client_id: client_id.clone(),
                                    payload: ctx.envelope.payload.clone(),
                                })
                                .await;
                                match outcome {
                                    Ok(data) => {
                                        registry.send_response(
                                            &client_id,
                                            request_id,
                                            Some(data),
                                            true,
                                        );
                                    }
                                    Err(e) => {
                                        registry.send_error_response(
                                            &client_id,
                                            request_id,
                                            e.to_string(),
                                        );
                                    }
                                }
                            }
                            None => {
                                registry.send_error_response(
                                    &client_id,
                                    request_id,
                                    crate::Error::UnknownAction(action).to_string(),
                                );
                            }
                        }
                        Ok(())
                    })
                }),
            );
        }

        // SIP lifecycle requests. Results travel on the update streams, not
        // as responses.
        {
            let sip = self.inner.sip.clone();
            handler.add_handler(
                MessageType::RequestSipInit,
                Arc::new(move |ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        let config: SipConfig = ctx.envelope.parse_payload()?;
                        sip.initialize(config).await;
                        Ok(())
                    })
                }),
            );
        }
        {
            let sip = self.inner.sip.clone();
            handler.add_handler(
                MessageType::RequestConnect,
                Arc::new(move |_ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        sip.connect().await;
                        Ok(())
                    })
                }),
            );
        }
        {
            let sip = self.inner.sip.clone();
            handler.add_handler(
                MessageType::RequestRegister,
                Arc::new(move |_ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        sip.register().await;
                        Ok(())
                    })
                }),
            );
        }
        {
            let sip = self.inner.sip.clone();
            handler.add_handler(
                MessageType::RequestUnregister,
                Arc::new(move |_ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        sip.unregister().await;
                        Ok(())
                    })
                }),
            );
        }

        // Dedicated call envelopes delegate to the same manager operations
        // as the action-based path.
        {
            let sip = self.inner.sip.clone();
            handler.add_handler(
                MessageType::RequestMakeCall,
                Arc::new(move |ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        let client_id = require_client(&ctx.envelope)?;
                        let target = ctx
                            .envelope
                            .payload
                            .as_ref()
                            .and_then(|p| p.get("target"))
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| {
                                crate::Error::ProtocolError("make call without target".to_string())
                            })?
                            .to_string();
                        sip.make_call(&client_id, &target).await?;
                        Ok(())
                    })
                }),
            );
        }
        {
            let sip = self.inner.sip.clone();
            handler.add_handler(
                MessageType::RequestAnswerCall,
                Arc::new(move |ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        let client_id = require_client(&ctx.envelope)?;
                        let call_id = require_call_id(&ctx.envelope)?;
                        sip.answer_call(&client_id, &call_id).await
                    })
                }),
            );
        }
        {
            let sip = self.inner.sip.clone();
            handler.add_handler(
                MessageType::RequestEndCall,
                Arc::new(move |ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        let call_id = require_call_id(&ctx.envelope)?;
                        sip.end_call(&call_id).await
                    })
                }),
            );
        }

        // Remote-SDP bridge routing, keyed by (client, session).
        {
            let bridge = self.inner.bridge.clone();
            handler.add_handler(
                MessageType::SdpResponse,
                Arc::new(move |ctx| {
                    let bridge = bridge.clone();
                    Box::pin(async move {
                        let client_id = require_client(&ctx.envelope)?;
                        let payload: SdpResponsePayload = ctx.envelope.parse_payload()?;
                        bridge.route_sdp_response(&client_id, payload);
                        Ok(())
                    })
                }),
            );
        }
        {
            let bridge = self.inner.bridge.clone();
            handler.add_handler(
                MessageType::IceCandidate,
                Arc::new(move |ctx| {
                    let bridge = bridge.clone();
                    Box::pin(async move {
                        let client_id = require_client(&ctx.envelope)?;
                        let payload: IceCandidatePayload = ctx.envelope.parse_payload()?;
                        bridge.route_ice_candidate(
                            &client_id,
                            &payload.session_id,
                            payload.candidate,
                        );
                        Ok(())
                    })
                }),
            );
        }
        {
            let bridge = self.inner.bridge.clone();
            handler.add_handler(
                MessageType::ConnectionStateChange,
                Arc::new(move |ctx| {
                    let bridge = bridge.clone();
                    Box::pin(async move {
                        let client_id = require_client(&ctx.envelope)?;
                        let payload: ConnectionStateChangePayload = ctx.envelope.parse_payload()?;
                        bridge.route_connection_state(
                            &client_id,
                            &payload.session_id,
                            payload.state,
                        );
                        Ok(())
                    })
                }),
            );
        }
    }

    fn install_actions(&self) {
        self.add_action(
            "echo",
            Arc::new(|ctx| Box::pin(async move { Ok(ctx.payload.unwrap_or(Value::Null)) })),
        );

        {
            let registry = self.inner.registry.clone();
            self.add_action(
                "getClients",
                Arc::new(move |_ctx| {
                    let registry = registry.clone();
                    Box::pin(async move {
                        let clients = registry.get_all_client_ids();
                        Ok(json!({"clients": clients, "count": clients.len()}))
                    })
                }),
            );
        }

        {
            let sip = self.inner.sip.clone();
            self.add_action(
                "makeCall",
                Arc::new(move |ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        let target = ctx
                            .payload
                            .as_ref()
                            .and_then(|p| p.get("target"))
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| {
                                crate::Error::BadState("makeCall requires a target".to_string())
                            })?
                            .to_string();
                        let call_id = sip.make_call(&ctx.client_id, &target).await?;
                        Ok(json!({"callId": call_id}))
                    })
                }),
            );
        }

        {
            let sip = self.inner.sip.clone();
            self.add_action(
                "answerCall",
                Arc::new(move |ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        let call_id = payload_call_id(ctx.payload.as_ref())?;
                        sip.answer_call(&ctx.client_id, &call_id).await?;
                        Ok(json!({"success": true}))
                    })
                }),
            );
        }

        {
            let sip = self.inner.sip.clone();
            self.add_action(
                "endCall",
                Arc::new(move |ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        let call_id = payload_call_id(ctx.payload.as_ref())?;
                        sip.end_call(&call_id).await?;
                        Ok(json!({"success": true}))
                    })
                }),
            );
        }

        {
            let sip = self.inner.sip.clone();
            self.add_action(
                "sendDtmf",
                Arc::new(move |ctx| {
                    let sip = sip.clone();
                    Box::pin(async move {
                        let call_id = payload_call_id(ctx.payload.as_ref())?;
                        let tones = ctx
                            .payload
                            .as_ref()
                            .and_then(|p| p.get("tones"))
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| {
                                crate::Error::BadState("sendDtmf requires tones".to_string())
                            })?
                            .to_string();
                        sip.send_dtmf(&call_id, &tones).await?;
                        Ok(json!({"success": true}))
                    })
                }),
            );
        }
    }
}

fn require_client(envelope: &Envelope) -> Result<ClientId> {
    envelope
        .client_id
        .clone()
        .ok_or_else(|| crate::Error::ProtocolError(format!("{} without client id", envelope.kind)))
}

fn require_call_id(envelope: &Envelope) -> Result<String> {
    envelope
        .payload
        .as_ref()
        .and_then(|p| p.get("callId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| crate::Error::ProtocolError(format!("{} without callId", envelope.kind)))
}

fn payload_call_id(payload: Option<&Value>) -> Result<String> {
    payload
        .and_then(|p| p.get("callId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| crate::Error::BadState("missing callId".to_string()))
}
