//! TCP transport
//!
//! Length-prefixed JSON frames over TCP. Each connection starts with a
//! `Hello` exchange carrying the node id and capabilities; afterwards
//! `Data` frames are multiplexed onto one session per shared capability.

use crate::network::peer::PeerId;
use crate::network::protocol::Capability;
use crate::network::transport::{
    DisconnectReason, Transport, TransportError, TransportEvent, TransportPeer, TransportSession,
    SESSION_BUFFER,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;

/// Magic bytes for frame delimiting
pub const MAGIC: [u8; 4] = [0x4D, 0x49, 0x4E, 0x49]; // "MINI"

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        id: PeerId,
        capabilities: Vec<Capability>,
        listen_port: u16,
    },
    /// Hex-encoded payload for one protocol session
    Data { protocol: String, payload: String },
    Disconnect { code: u8 },
}

/// Frame codec: magic (4) + big-endian length (4) + JSON body
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = serde_json::to_vec(&item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        if data.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Frame too large",
            ));
        }

        dst.reserve(8 + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }
        if src[..4] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Frame too large",
            ));
        }
        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        src.advance(8);
        let data = src.split_to(len);
        let frame = serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(Some(frame))
    }
}

struct Connection {
    serial: u64,
    outgoing: mpsc::Sender<Frame>,
    closed: CancellationToken,
    /// Set when we initiated the disconnect
    reason: Arc<Mutex<Option<DisconnectReason>>>,
}

#[derive(Default)]
struct TcpState {
    capabilities: Mutex<Vec<Capability>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    connections: Mutex<HashMap<PeerId, Connection>>,
    listen_port: AtomicU16,
    serial: AtomicU64,
    shutdown: Mutex<CancellationToken>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Transport over TCP sockets
#[derive(Clone)]
pub struct TcpTransport {
    id: PeerId,
    bind_host: String,
    state: Arc<TcpState>,
}

impl TcpTransport {
    pub fn new(id: PeerId) -> Self {
        Self::with_bind_host(id, "0.0.0.0")
    }

    pub fn with_bind_host(id: PeerId, bind_host: impl Into<String>) -> Self {
        Self {
            id,
            bind_host: bind_host.into(),
            state: Arc::new(TcpState::default()),
        }
    }

    /// Port actually bound, once listening
    pub fn listen_port(&self) -> Option<u16> {
        match self.state.listen_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    fn events(&self) -> Result<mpsc::Sender<TransportEvent>, TransportError> {
        lock(&self.state.events)
            .clone()
            .ok_or(TransportError::NotListening)
    }

    async fn accept_loop(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.establish(stream, addr, None).await {
                    log::debug!("Inbound handshake with {} failed: {}", addr, e);
                    if let Ok(events) = transport.events() {
                        let _ = events
                            .send(TransportEvent::PeerError { id: None, error: e })
                            .await;
                    }
                }
            });
        }
        log::debug!("TCP accept loop stopped");
    }

    /// Exchange hellos and wire up the sessions of one connection.
    /// `expected` is the id we dialed, `None` for inbound connections.
    async fn establish(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        expected: Option<(PeerId, u16)>,
    ) -> Result<(), TransportError> {
        let events = self.events()?;
        let local_caps = lock(&self.state.capabilities).clone();
        let mut framed = Framed::new(stream, FrameCodec);

        framed
            .send(Frame::Hello {
                id: self.id,
                capabilities: local_caps.clone(),
                listen_port: self.state.listen_port.load(Ordering::SeqCst),
            })
            .await?;

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| TransportError::Timeout("Handshake timed out".into()))?;
        let (remote_id, remote_caps, listen_port) = match hello {
            Some(Ok(Frame::Hello {
                id,
                capabilities,
                listen_port,
            })) => (id, capabilities, listen_port),
            Some(Ok(Frame::Disconnect { code })) => {
                return Err(TransportError::HandshakeFailed(format!(
                    "remote disconnected with code {}",
                    code
                )))
            }
            Some(Ok(Frame::Data { .. })) => {
                return Err(TransportError::HandshakeFailed("data before hello".into()))
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::ConnectionReset),
        };

        if remote_id == self.id {
            return Err(TransportError::HandshakeFailed("connected to self".into()));
        }
        if let Some((id, _)) = expected {
            if id != remote_id {
                return Err(TransportError::HandshakeFailed(format!(
                    "expected {}, found {}",
                    id, remote_id
                )));
            }
        }

        let mut peer_sessions = Vec::new();
        let mut wire_sessions = HashMap::new();
        for capability in local_caps.iter().filter(|c| remote_caps.contains(c)) {
            let (peer_side, wire_side) = TransportSession::pair(capability.clone());
            peer_sessions.push(peer_side);
            wire_sessions.insert(capability.name.clone(), wire_side);
        }

        let serial = self.state.serial.fetch_add(1, Ordering::Relaxed);
        let closed = CancellationToken::new();
        let reason = Arc::new(Mutex::new(None));
        let (outgoing, outgoing_rx) = mpsc::channel(SESSION_BUFFER);
        let duplicate = {
            let mut connections = lock(&self.state.connections);
            let duplicate = connections.contains_key(&remote_id);
            if !duplicate {
                connections.insert(
                    remote_id,
                    Connection {
                        serial,
                        outgoing: outgoing.clone(),
                        closed: closed.clone(),
                        reason: reason.clone(),
                    },
                );
            }
            duplicate
        };
        if duplicate {
            let _ = framed
                .send(Frame::Disconnect {
                    code: DisconnectReason::AlreadyConnected.code(),
                })
                .await;
            return Err(TransportError::HandshakeFailed("already connected".into()));
        }

        let port = match expected {
            Some((_, port)) => port,
            None => listen_port,
        };
        let _ = events
            .send(TransportEvent::PeerAdded(TransportPeer {
                id: remote_id,
                host: addr.ip().to_string(),
                port,
                inbound: expected.is_none(),
                capabilities: remote_caps,
                sessions: peer_sessions,
            }))
            .await;

        let (sink, stream) = framed.split();
        let mut inbound = HashMap::new();
        for (name, session) in wire_sessions {
            inbound.insert(name.clone(), session.sender);
            tokio::spawn(forward_outgoing(
                name,
                session.receiver,
                outgoing.clone(),
                closed.clone(),
            ));
        }
        drop(outgoing);

        tokio::spawn(write_frames(sink, outgoing_rx, closed.clone()));
        tokio::spawn(read_frames(
            self.state.clone(),
            remote_id,
            serial,
            stream,
            inbound,
            closed,
            reason,
            events,
        ));
        Ok(())
    }
}

async fn forward_outgoing(
    protocol: String,
    mut receiver: mpsc::Receiver<Bytes>,
    outgoing: mpsc::Sender<Frame>,
    closed: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = closed.cancelled() => break,
            payload = receiver.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let frame = Frame::Data {
            protocol: protocol.clone(),
            payload: hex::encode(&payload),
        };
        if outgoing.send(frame).await.is_err() {
            break;
        }
    }
}

async fn write_frames(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let last = matches!(frame, Frame::Disconnect { .. });
        if sink.send(frame).await.is_err() || last {
            break;
        }
    }
    closed.cancel();
    let _ = sink.close().await;
}

#[allow(clippy::too_many_arguments)]
async fn read_frames(
    state: Arc<TcpState>,
    id: PeerId,
    serial: u64,
    mut stream: futures::stream::SplitStream<Framed<TcpStream, FrameCodec>>,
    inbound: HashMap<String, mpsc::Sender<Bytes>>,
    closed: CancellationToken,
    local_reason: Arc<Mutex<Option<DisconnectReason>>>,
    events: mpsc::Sender<TransportEvent>,
) {
    let remote_reason = loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break DisconnectReason::Requested,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Frame::Data { protocol, payload })) => {
                let Some(session) = inbound.get(&protocol) else {
                    log::debug!("Dropping {} frame from {}: not negotiated", protocol, id);
                    continue;
                };
                match hex::decode(&payload) {
                    Ok(payload) => {
                        if session.send(Bytes::from(payload)).await.is_err() {
                            log::debug!("{} session with {} is gone", protocol, id);
                        }
                    }
                    Err(e) => {
                        let _ = events
                            .send(TransportEvent::PeerError {
                                id: Some(id),
                                error: TransportError::MalformedFrame(e.to_string()),
                            })
                            .await;
                    }
                }
            }
            Some(Ok(Frame::Disconnect { code })) => {
                break DisconnectReason::from_code(code).unwrap_or(DisconnectReason::Requested)
            }
            Some(Ok(Frame::Hello { .. })) => {
                log::debug!("Ignoring repeated hello from {}", id);
            }
            Some(Err(e)) => {
                let _ = events
                    .send(TransportEvent::PeerError {
                        id: Some(id),
                        error: e.into(),
                    })
                    .await;
                break DisconnectReason::NetworkError;
            }
            None => break DisconnectReason::NetworkError,
        }
    };
    closed.cancel();

    {
        let mut connections = lock(&state.connections);
        if matches!(connections.get(&id), Some(c) if c.serial == serial) {
            connections.remove(&id);
        }
    }
    let reason = lock(&local_reason).take().unwrap_or(remote_reason);
    let _ = events.send(TransportEvent::PeerRemoved { id, reason }).await;
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
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
            let addr = format!("{}:{}", self.bind_host, port);
            let listener = TcpListener::bind(&addr).await?;
            let bound = listener.local_addr()?;

            *lock(&self.state.capabilities) = capabilities;
            *lock(&self.state.events) = Some(events.clone());
            self.state.listen_port.store(bound.port(), Ordering::SeqCst);
            let shutdown = CancellationToken::new();
            *lock(&self.state.shutdown) = shutdown.clone();

            tokio::spawn(self.clone().accept_loop(listener, shutdown));

            let url = format!("tcp://{}@{}", self.id.to_hex(), bound);
            let _ = events.send(TransportEvent::Listening { url }).await;
            Ok(())
        }
        .boxed()
    }

    fn connect(
        &self,
        id: PeerId,
        host: String,
        port: u16,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            self.events()?;
            if lock(&self.state.connections).contains_key(&id) {
                return Ok(());
            }
            let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| TransportError::Timeout(format!("dialing {}:{}", host, port)))??;
            let addr = stream.peer_addr()?;
            log::debug!("Connected to {}", addr);
            self.establish(stream, addr, Some((id, port))).await
        }
        .boxed()
    }

    fn disconnect(&self, id: PeerId, reason: DisconnectReason) {
        let Some(connection) = lock(&self.state.connections).remove(&id) else {
            return;
        };
        *lock(&connection.reason) = Some(reason);
        let frame = Frame::Disconnect {
            code: reason.code(),
        };
        if connection.outgoing.try_send(frame).is_err() {
            connection.closed.cancel();
        }
    }

    fn close(&self) {
        lock(&self.state.shutdown).cancel();
        let ids: Vec<PeerId> = lock(&self.state.connections).keys().copied().collect();
        for id in ids {
            self.disconnect(id, DisconnectReason::ClientQuitting);
        }
        self.state.listen_port.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_codec() {
        let mut codec = FrameCodec;
        let frame = Frame::Data {
            protocol: "sync".into(),
            payload: hex::encode(b"payload"),
        };

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        assert_eq!(&buf[..4], &MAGIC);

        // Partial frames wait for more bytes
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        match codec.decode(&mut partial).unwrap().unwrap() {
            Frame::Data { protocol, payload } => {
                assert_eq!(protocol, "sync");
                assert_eq!(hex::decode(payload).unwrap(), b"payload");
            }
            other => panic!("Wrong frame {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = BytesMut::from(&b"XXXX\0\0\0\x02{}"[..]);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_tcp_peers_exchange_payloads() {
        let caps = vec![Capability::new("sync", 1)];
        let a = TcpTransport::with_bind_host(PeerId::from_name("a"), "127.0.0.1");
        let b = TcpTransport::with_bind_host(PeerId::from_name("b"), "127.0.0.1");
        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);

        a.listen(0, caps.clone(), a_tx).await.unwrap();
        b.listen(0, caps, b_tx).await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(TransportEvent::Listening { .. })));
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::Listening { .. })));

        let port = b.listen_port().unwrap();
        a.connect(PeerId::from_name("b"), "127.0.0.1".into(), port)
            .await
            .unwrap();

        let Some(TransportEvent::PeerAdded(outbound)) = a_rx.recv().await else {
            panic!("expected outbound peer");
        };
        let Some(TransportEvent::PeerAdded(mut inbound)) = b_rx.recv().await else {
            panic!("expected inbound peer");
        };
        assert!(!outbound.inbound);
        assert!(inbound.inbound);
        assert_eq!(inbound.id, PeerId::from_name("a"));

        outbound.sessions[0]
            .sender
            .send(Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let got = inbound.sessions[0].receiver.recv().await.unwrap();
        assert_eq!(&got[..], b"ping");

        a.disconnect(PeerId::from_name("b"), DisconnectReason::TooManyPeers);
        match a_rx.recv().await {
            Some(TransportEvent::PeerRemoved { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::TooManyPeers)
            }
            other => panic!("unexpected {:?}", other),
        }
        match b_rx.recv().await {
            Some(TransportEvent::PeerRemoved { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::TooManyPeers)
            }
            other => panic!("unexpected {:?}", other),
        }

        a.close();
        b.close();
    }
}
