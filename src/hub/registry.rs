use crate::message::{ClientId, Envelope, MessageType, RequestId, ResponsePayload};
use crate::transport::ChannelConnection;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Hub-owned mapping of admitted edge channels.
///
/// The registry is the only holder of channel handles; edges never see each
/// other's channels. All sends are best-effort: an unknown id or a failed
/// post yields `false` (or a logged skip during broadcast), never an error.
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ChannelConnection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, client_id: ClientId, connection: ChannelConnection) {
        debug!("register client: {}", client_id);
        self.clients.write().unwrap().insert(client_id, connection);
    }

    pub fn unregister(&self, client_id: &str) -> Option<ChannelConnection> {
        debug!("unregister client: {}", client_id);
        self.clients.write().unwrap().remove(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.read().unwrap().contains_key(client_id)
    }

    pub fn get_all_client_ids(&self) -> Vec<ClientId> {
        self.clients.read().unwrap().keys().cloned().collect()
    }

    pub fn get_client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Unicast. Returns `false` when the id is unknown or the post fails.
    pub fn send_to_client(&self, client_id: &str, envelope: Envelope) -> bool {
        let connection = self.clients.read().unwrap().get(client_id).cloned();
        match connection {
            Some(connection) => connection.post(envelope),
            None => {
                warn!("send to unknown client: {}", client_id);
                false
            }
        }
    }

    /// Best-effort fan-out; per-recipient failures are logged and the loop
    /// continues. Returns the number of successful posts.
    pub fn broadcast_to_all_clients(&self, envelope: Envelope) -> usize {
        let clients = {
            let guard = self.clients.read().unwrap();
            guard
                .iter()
                .map(|(id, conn)| (id.clone(), conn.clone()))
                .collect::<Vec<_>>()
        };
        let mut delivered = 0;
        for (client_id, connection) in clients {
            if connection.post(envelope.clone()) {
                delivered += 1;
            } else {
                warn!("broadcast skipped client: {}", client_id);
            }
        }
        delivered
    }

    pub fn send_response(
        &self,
        client_id: &str,
        request_id: RequestId,
        data: Option<Value>,
        success: bool,
    ) -> bool {
        let payload = ResponsePayload {
            request_id,
            success,
            data,
            error: None,
        };
        let envelope = match Envelope::new(MessageType::Response).with_payload(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("response payload encode failed: {}", e);
                return false;
            }
        };
        self.send_to_client(client_id, envelope)
    }

    pub fn send_error_response(
        &self,
        client_id: &str,
        request_id: RequestId,
        error: impl Into<String>,
    ) -> bool {
        let payload = ResponsePayload {
            request_id,
            success: false,
            data: None,
            error: Some(error.into()),
        };
        let envelope = match Envelope::new(MessageType::Response).with_payload(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("error response payload encode failed: {}", e);
                return false;
            }
        };
        self.send_to_client(client_id, envelope)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;

    #[tokio::test]
    async fn test_register_and_count() {
        let registry = ClientRegistry::new();
        let (_e1, h1) = channel_pair("c1");
        let (_e2, h2) = channel_pair("c2");
        registry.register("c1".to_string(), h1);
        registry.register("c2".to_string(), h2);
        assert_eq!(registry.get_client_count(), 2);
        let mut ids = registry.get_all_client_ids();
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
        assert!(registry.unregister("c1").is_some());
        assert_eq!(registry.get_client_count(), 1);
        assert!(registry.unregister("c1").is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_client_is_false() {
        let registry = ClientRegistry::new();
        assert!(!registry.send_to_client("ghost", Envelope::new(MessageType::StateUpdate)));
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_channels() {
        let registry = ClientRegistry::new();
        let (e1, h1) = channel_pair("c1");
        let (_e2, h2) = channel_pair("c2");
        registry.register("c1".to_string(), h1);
        registry.register("c2".to_string(), h2);
        e1.close();
        let delivered = registry.broadcast_to_all_clients(Envelope::new(MessageType::StateUpdate));
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let registry = ClientRegistry::new();
        let (edge, hub) = channel_pair("c1");
        let mut rx = edge.take_receiver().unwrap();
        registry.register("c1".to_string(), hub);
        assert!(registry.send_error_response("c1", "r2".to_string(), "Unknown request action: x"));
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, MessageType::Response);
        let payload: ResponsePayload = envelope.parse_payload().unwrap();
        assert_eq!(payload.request_id, "r2");
        assert!(!payload.success);
        assert_eq!(payload.error.as_deref(), Some("Unknown request action: x"));
    }
}
