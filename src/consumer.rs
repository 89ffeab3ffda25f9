//! Connected-consumer bookkeeping shared by the three streaming
//! protocols: MJPEG multipart, WebSocket H.264, and FLV. Each consumer
//! is exclusively owned by its connection; the registry holds only
//! what the packet router needs to fan out to it (a bounded send
//! queue) plus enough metadata for `/status`.
//!
//! Generic over `S`, the consumer-kind-specific state the router needs
//! alongside the send queue — `()` for MJPEG/WebSocket clients, and
//! [`crate::flv::FlvMuxer`] for FLV clients, which need their own
//! muxer instance and keyframe-gating flag.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

pub type ClientId = u64;

/// Rolling 1-second-window FPS counter, shared by every consumer kind.
#[derive(Debug, Clone)]
pub struct FpsCalculator {
    frame_times: VecDeque<Instant>,
    window: Duration,
}

impl FpsCalculator {
    pub fn new() -> Self {
        Self {
            frame_times: VecDeque::with_capacity(120),
            window: Duration::from_secs(1),
        }
    }

    pub fn record_frame(&mut self) {
        let now = Instant::now();
        self.frame_times.push_back(now);
        let cutoff = now - self.window;
        while let Some(&oldest) = self.frame_times.front() {
            if oldest < cutoff {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_fps(&self) -> u32 {
        self.frame_times.len() as u32
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client session metadata, common across consumer kinds.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: ClientId,
    pub connected_at: Instant,
    pub frames_sent: u64,
    pub fps: FpsCalculator,
}

impl ClientSession {
    fn new(id: ClientId) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
            frames_sent: 0,
            fps: FpsCalculator::new(),
        }
    }

    pub fn connected_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }
}

struct ClientEntry<S> {
    session: ClientSession,
    tx: mpsc::Sender<Bytes>,
    state: S,
}

/// A registry of connected clients for one consumer kind. Clients
/// register via [`ClientGuard`] and are removed automatically on drop,
/// or immediately once a send to them fails (their receiver is gone).
pub struct ConsumerRegistry<S> {
    clients: RwLock<HashMap<ClientId, ClientEntry<S>>>,
    next_id: AtomicU64,
}

impl<S> Default for ConsumerRegistry<S> {
    fn default() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<S> ConsumerRegistry<S> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new client with a bounded send queue and its initial
    /// per-consumer state, returning an RAII guard plus the receive
    /// half for the connection task to drain.
    pub fn register(self: &Arc<Self>, queue_depth: usize, state: S) -> (ClientGuard<S>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().insert(
            id,
            ClientEntry {
                session: ClientSession::new(id),
                tx,
                state,
            },
        );
        (
            ClientGuard {
                id,
                registry: self.clone(),
            },
            rx,
        )
    }

    fn unregister(&self, id: ClientId) {
        self.clients.write().remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn sessions(&self) -> Vec<ClientSession> {
        self.clients.read().values().map(|e| e.session.clone()).collect()
    }

    /// Send the same bytes to every client (best effort); a full or
    /// closed channel drops that client from the registry immediately.
    pub fn broadcast(&self, payload: Bytes) {
        let dead: Vec<ClientId> = {
            let mut clients = self.clients.write();
            let mut dead = Vec::new();
            for (id, entry) in clients.iter_mut() {
                match entry.tx.try_send(payload.clone()) {
                    Ok(()) => {
                        entry.session.frames_sent += 1;
                        entry.session.fps.record_frame();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow consumer: drop this frame for them, keep the client.
                    }
                }
            }
            dead
        };
        for id in dead {
            self.unregister(id);
        }
    }

    /// Apply `f` to every client's state and send whatever bytes it
    /// returns (skipping `None`). Used by FLV fan-out, where each
    /// client's muxer output differs (keyframe-gating, sequence
    /// header already sent or not).
    pub fn for_each_mut(&self, mut f: impl FnMut(ClientId, &mut S) -> Option<Bytes>) {
        let dead: Vec<ClientId> = {
            let mut clients = self.clients.write();
            let mut dead = Vec::new();
            for (id, entry) in clients.iter_mut() {
                if let Some(payload) = f(*id, &mut entry.state) {
                    match entry.tx.try_send(payload) {
                        Ok(()) => {
                            entry.session.frames_sent += 1;
                            entry.session.fps.record_frame();
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                        Err(mpsc::error::TrySendError::Full(_)) => {}
                    }
                }
            }
            dead
        };
        for id in dead {
            self.unregister(id);
        }
    }
}

/// RAII registration handle: unregisters on drop so a client is never
/// leaked by an early return or panic in the connection task.
pub struct ClientGuard<S> {
    id: ClientId,
    registry: Arc<ConsumerRegistry<S>>,
}

impl<S> ClientGuard<S> {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl<S> Drop for ClientGuard<S> {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_registers_and_unregisters_on_drop() {
        let registry: Arc<ConsumerRegistry<()>> = ConsumerRegistry::new();
        {
            let (guard, mut rx) = registry.register(4, ());
            assert_eq!(registry.client_count(), 1);
            registry.broadcast(Bytes::from_static(b"hi"));
            let received = rx.recv().await.unwrap();
            assert_eq!(&received[..], b"hi");
            let _ = guard.id();
        }
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn fps_calculator_counts_within_window() {
        let mut fps = FpsCalculator::new();
        for _ in 0..5 {
            fps.record_frame();
        }
        assert_eq!(fps.current_fps(), 5);
    }

    #[tokio::test]
    async fn closed_receiver_drops_client_on_next_broadcast() {
        let registry: Arc<ConsumerRegistry<()>> = ConsumerRegistry::new();
        let (guard, rx) = registry.register(4, ());
        drop(rx);
        std::mem::forget(guard); // keep the entry alive; only the channel is closed
        registry.broadcast(Bytes::from_static(b"x"));
        assert_eq!(registry.client_count(), 0);
    }
}
