//! In-process transport
//!
//! A [`MemoryNetwork`] is a hub of named locations. Each [`MemoryTransport`]
//! listens at one location, and connecting two of them wires a pair of
//! session channels per shared capability. Used by tests and simulations.

use crate::network::peer::PeerId;
use crate::network::protocol::Capability;
use crate::network::transport::{
    DisconnectReason, Transport, TransportError, TransportEvent, TransportPeer, TransportSession,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

struct Endpoint {
    id: PeerId,
    port: u16,
    capabilities: Vec<Capability>,
    events: mpsc::Sender<TransportEvent>,
    /// Connected peer id -> its location
    links: HashMap<PeerId, String>,
}

/// Shared registry of listening memory transports
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locations with a listening transport
    pub fn locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self.endpoints().keys().cloned().collect();
        locations.sort();
        locations
    }

    /// Number of live links at `location`
    pub fn links(&self, location: &str) -> usize {
        self.endpoints()
            .get(location)
            .map(|e| e.links.len())
            .unwrap_or(0)
    }
}

/// Transport over a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    location: String,
    id: PeerId,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork, location: impl Into<String>, id: PeerId) -> Self {
        Self {
            network,
            location: location.into(),
            id,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Connect to whoever listens at `location`, whatever its id
    pub async fn discover(&self, location: &str) -> Result<(), TransportError> {
        let id = self
            .network
            .endpoints()
            .get(location)
            .map(|e| e.id)
            .ok_or_else(|| TransportError::UnknownEndpoint(location.to_string()))?;
        self.connect_to(id, location).await
    }

    /// Report an error on the link to `id`, as a real transport would
    pub fn inject_error(&self, id: Option<PeerId>, error: TransportError) {
        let events = self
            .network
            .endpoints()
            .get(&self.location)
            .map(|e| e.events.clone());
        if let Some(events) = events {
            deliver(events, TransportEvent::PeerError { id, error });
        }
    }

    async fn connect_to(&self, id: PeerId, location: &str) -> Result<(), TransportError> {
        if location == self.location {
            return Err(TransportError::HandshakeFailed("cannot dial self".into()));
        }

        let (local_events, remote_events, local_peer, remote_peer) = {
            let mut endpoints = self.network.endpoints();
            let (local_port, local_caps, local_events) = match endpoints.get(&self.location) {
                Some(local) if local.links.contains_key(&id) => return Ok(()),
                Some(local) => (local.port, local.capabilities.clone(), local.events.clone()),
                None => return Err(TransportError::NotListening),
            };
            let remote = endpoints
                .get_mut(location)
                .ok_or_else(|| TransportError::UnknownEndpoint(location.to_string()))?;
            if remote.id != id {
                return Err(TransportError::HandshakeFailed(format!(
                    "expected {} at {}, found {}",
                    id, location, remote.id
                )));
            }

            let (local_sessions, remote_sessions): (Vec<_>, Vec<_>) = local_caps
                .iter()
                .filter(|c| remote.capabilities.contains(c))
                .map(|c| TransportSession::pair(c.clone()))
                .unzip();

            remote.links.insert(self.id, self.location.clone());
            let remote_peer = TransportPeer {
                id: self.id,
                host: self.location.clone(),
                port: local_port,
                inbound: true,
                capabilities: local_caps.clone(),
                sessions: remote_sessions,
            };
            let local_peer = TransportPeer {
                id,
                host: location.to_string(),
                port: remote.port,
                inbound: false,
                capabilities: remote.capabilities.clone(),
                sessions: local_sessions,
            };
            let remote_events = remote.events.clone();

            if let Some(local) = endpoints.get_mut(&self.location) {
                local.links.insert(id, location.to_string());
            }
            (local_events, remote_events, local_peer, remote_peer)
        };

        log::debug!("Memory link {} <-> {}", self.location, location);
        let _ = remote_events
            .send(TransportEvent::PeerAdded(remote_peer))
            .await;
        let _ = local_events
            .send(TransportEvent::PeerAdded(local_peer))
            .await;
        Ok(())
    }
}

/// Queue an event without blocking the caller
fn deliver(events: mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        tokio::spawn(async move {
            let _ = events.send(event).await;
        });
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn local_id(&self) -> PeerId {
        self.id
    }

    fn listen(
        &self,
        port: u16,
        capabilities: Vec<Capability>,
        events: mpsc::Sender<TransportEvent>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            {
                let mut endpoints = self.network.endpoints();
                if endpoints.contains_key(&self.location) {
                    return Err(TransportError::HandshakeFailed(format!(
                        "location {} already taken",
                        self.location
                    )));
                }
                endpoints.insert(
                    self.location.clone(),
                    Endpoint {
                        id: self.id,
                        port,
                        capabilities,
                        events: events.clone(),
                        links: HashMap::new(),
                    },
                );
            }
            let url = format!("memory://{}@{}:{}", self.id.to_hex(), self.location, port);
            let _ = events.send(TransportEvent::Listening { url }).await;
            Ok(())
        }
        .boxed()
    }

    fn connect(
        &self,
        id: PeerId,
        host: String,
        _port: u16,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        async move { self.connect_to(id, &host).await }.boxed()
    }

    fn disconnect(&self, id: PeerId, reason: DisconnectReason) {
        let mut endpoints = self.network.endpoints();
        let (local_events, remote_location) = match endpoints.get_mut(&self.location) {
            Some(local) => match local.links.remove(&id) {
                Some(location) => (local.events.clone(), location),
                None => return,
            },
            None => return,
        };
        let remote_events = endpoints.get_mut(&remote_location).and_then(|remote| {
            remote
                .links
                .remove(&self.id)
                .map(|_| remote.events.clone())
        });
        drop(endpoints);

        deliver(local_events, TransportEvent::PeerRemoved { id, reason });
        if let Some(events) = remote_events {
            deliver(
                events,
                TransportEvent::PeerRemoved {
                    id: self.id,
                    reason,
                },
            );
        }
    }

    fn close(&self) {
        let mut endpoints = self.network.endpoints();
        let Some(local) = endpoints.remove(&self.location) else {
            return;
        };
        for (_, location) in local.links {
            if let Some(remote) = endpoints.get_mut(&location) {
                if remote.links.remove(&self.id).is_some() {
                    deliver(
                        remote.events.clone(),
                        TransportEvent::PeerRemoved {
                            id: self.id,
                            reason: DisconnectReason::ClientQuitting,
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Vec<Capability> {
        vec![Capability::new("sync", 1), Capability::new("light", 1)]
    }

    async fn listen(
        network: &MemoryNetwork,
        name: &str,
        capabilities: Vec<Capability>,
    ) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let transport = MemoryTransport::new(network.clone(), name, PeerId::from_name(name));
        let (tx, mut rx) = mpsc::channel(16);
        transport.listen(30303, capabilities, tx).await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Listening { url } => assert!(url.ends_with(&format!("@{}:30303", name))),
            other => panic!("unexpected {:?}", other),
        }
        (transport, rx)
    }

    #[tokio::test]
    async fn test_connect_pairs_shared_capabilities() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = listen(&network, "a", caps()).await;
        let (_b, mut b_rx) = listen(&network, "b", vec![Capability::new("sync", 1)]).await;

        a.connect(PeerId::from_name("b"), "b".into(), 0).await.unwrap();

        let TransportEvent::PeerAdded(outbound) = a_rx.recv().await.unwrap() else {
            panic!("expected PeerAdded");
        };
        assert!(!outbound.inbound);
        assert_eq!(outbound.sessions.len(), 1);
        assert_eq!(outbound.sessions[0].capability, Capability::new("sync", 1));

        let TransportEvent::PeerAdded(mut inbound) = b_rx.recv().await.unwrap() else {
            panic!("expected PeerAdded");
        };
        assert!(inbound.inbound);
        assert_eq!(inbound.id, PeerId::from_name("a"));
        assert_eq!(inbound.capabilities, caps());

        outbound.sessions[0]
            .sender
            .send(bytes::Bytes::from_static(b"hi"))
            .await
            .unwrap();
        let got = inbound.sessions[0].receiver.recv().await.unwrap();
        assert_eq!(&got[..], b"hi");
    }

    #[tokio::test]
    async fn test_connect_checks_identity() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = listen(&network, "a", caps()).await;
        let (_b, _b_rx) = listen(&network, "b", caps()).await;

        let wrong = a.connect(PeerId::from_name("z"), "b".into(), 0).await;
        assert!(matches!(wrong, Err(TransportError::HandshakeFailed(_))));
        let missing = a.connect(PeerId::from_name("c"), "c".into(), 0).await;
        assert!(matches!(missing, Err(TransportError::UnknownEndpoint(_))));
        assert_eq!(network.locations(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_both_sides() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = listen(&network, "a", caps()).await;
        let (_b, mut b_rx) = listen(&network, "b", caps()).await;

        a.discover("b").await.unwrap();
        a_rx.recv().await.unwrap();
        b_rx.recv().await.unwrap();
        assert_eq!(network.links("a"), 1);

        a.disconnect(PeerId::from_name("b"), DisconnectReason::TooManyPeers);
        match a_rx.recv().await.unwrap() {
            TransportEvent::PeerRemoved { id, reason } => {
                assert_eq!(id, PeerId::from_name("b"));
                assert_eq!(reason, DisconnectReason::TooManyPeers);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            b_rx.recv().await.unwrap(),
            TransportEvent::PeerRemoved { .. }
        ));
        assert_eq!(network.links("b"), 0);

        // Unknown ids are ignored
        a.disconnect(PeerId::from_name("b"), DisconnectReason::Requested);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_releases_location() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = listen(&network, "a", caps()).await;
        let (b, mut b_rx) = listen(&network, "b", caps()).await;
        b.discover("a").await.unwrap();
        b_rx.recv().await.unwrap();

        a.close();
        match b_rx.recv().await.unwrap() {
            TransportEvent::PeerRemoved { reason, .. } => {
                assert_eq!(reason, DisconnectReason::ClientQuitting)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(network.locations(), vec!["b"]);
    }
}
