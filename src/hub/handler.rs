use super::registry::ClientRegistry;
use crate::message::{Envelope, MessageType};
use crate::transport::ChannelConnection;
use crate::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// Everything a handler needs about one arrival: the envelope and the
/// channel it came in on.
#[derive(Clone)]
pub struct MessageContext {
    pub envelope: Envelope,
    pub connection: ChannelConnection,
}

pub type HandlerFuture = BoxFuture<'static, Result<()>>;
pub type HandlerFn = Arc<dyn Fn(MessageContext) -> HandlerFuture + Send + Sync>;

/// Dispatch table from message type to an ordered handler list.
///
/// All handlers for a type run in registration order. A handler error is
/// caught and logged; when the source envelope is a `Request` it is also
/// converted into an error `Response` for the requester. A `Request` with no
/// handler at all gets an unknown-action error response.
pub struct MessageHandler {
    handlers: RwLock<HashMap<MessageType, Vec<HandlerFn>>>,
    registry: Arc<ClientRegistry>,
}

impl MessageHandler {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        MessageHandler {
            handlers: RwLock::new(HashMap::new()),
            registry,
        }
    }

    pub fn add_handler(&self, kind: MessageType, handler: HandlerFn) {
        self.handlers
            .write()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub async fn dispatch(&self, ctx: MessageContext) {
        let handlers = {
            let guard = self.handlers.read().unwrap();
            guard.get(&ctx.envelope.kind).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            if ctx.envelope.kind == MessageType::Request {
                self.reject_request(&ctx, unknown_action_error(&ctx.envelope));
            } else {
                debug!("no handler for {}, dropped", ctx.envelope.kind);
            }
            return;
        }

        for handler in handlers {
            if let Err(e) = handler(ctx.clone()).await {
                error!("handler for {} failed: {}", ctx.envelope.kind, e);
                if ctx.envelope.kind == MessageType::Request {
                    self.reject_request(&ctx, e.to_string());
                }
            }
        }
    }

    fn reject_request(&self, ctx: &MessageContext, error: String) {
        let (client_id, request_id) = match (&ctx.envelope.client_id, &ctx.envelope.request_id) {
            (Some(client_id), Some(request_id)) => (client_id.clone(), request_id.clone()),
            _ => {
                warn!("request without client or request id, cannot reject");
                return;
            }
        };
        self.registry
            .send_error_response(&client_id, request_id, error);
    }
}

pub fn unknown_action_error(envelope: &Envelope) -> String {
    crate::Error::UnknownAction(envelope.action.clone().unwrap_or_default()).to_string()
}
