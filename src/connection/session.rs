//! Per-connection state: viewport, last-seen marker ids, and pending
//! outbound operations. Guarded by a single mutex so a viewport update and
//! a delta-router enqueue are mutually exclusive, per the concurrency
//! model: whichever task gets the lock first observes (and leaves) a
//! consistent `lastSeenIds`/`pendingOps` pair.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::Mutex;

use crate::model::{ChangeEvent, ChangeKind, Marker, MarkerId, PendingOp, Viewport};
use crate::protocol::{ServerMessage, WireMarker, WireViewport};

pub struct SessionState {
    pub viewport: Option<Viewport>,
    pub last_seen_ids: HashSet<MarkerId>,
    pub pending_ops: HashMap<MarkerId, PendingOp>,
    pub last_activity_at: Instant,
    pub protocol_violations: u32,
    pub violations_window_started: Instant,
}

impl SessionState {
    fn new() -> Self {
        let now = Instant::now();
        SessionState {
            viewport: None,
            last_seen_ids: HashSet::new(),
            pending_ops: HashMap::new(),
            last_activity_at: now,
            protocol_violations: 0,
            violations_window_started: now,
        }
    }
}

/// Abort handles for a connection's reader/writer tasks, attached once both
/// are spawned so the session can force its own connection closed (the
/// disconnect-slow-consumer backpressure policy, §5/§7) without the
/// Connection Manager's accept loop being involved.
struct ConnectionTasks {
    reader: tokio::task::AbortHandle,
    writer: tokio::task::AbortHandle,
}

pub struct ClientSession {
    pub client_id: String,
    pub client_addr: SocketAddr,
    pub connected_at: Instant,
    pub outbound: flume::Sender<ServerMessage>,
    state: Mutex<SessionState>,
    tasks: Mutex<Option<ConnectionTasks>>,
}

impl ClientSession {
    pub fn new(client_id: String, client_addr: SocketAddr, outbound: flume::Sender<ServerMessage>) -> Self {
        ClientSession {
            client_id,
            client_addr,
            connected_at: Instant::now(),
            outbound,
            state: Mutex::new(SessionState::new()),
            tasks: Mutex::new(None),
        }
    }

    /// Wires up the reader/writer abort handles once both tasks are
    /// spawned, so `force_disconnect` has something to tear down.
    pub fn attach_tasks(&self, reader: tokio::task::AbortHandle, writer: tokio::task::AbortHandle) {
        *self.tasks.lock() = Some(ConnectionTasks { reader, writer });
    }

    /// Forcibly tears down this connection: aborts the reader and writer
    /// tasks so the socket closes, forcing the client to reconnect and
    /// rehydrate via `initial_markers`. Used when the outbound queue is
    /// full (§5 "disconnect-slow-consumer").
    pub fn force_disconnect(&self) {
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }

    pub fn touch_activity(&self) {
        self.state.lock().last_activity_at = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.state.lock().last_activity_at.elapsed()
    }

    /// Records a protocol violation within a rolling window; returns
    /// whether the violation count within the window exceeds `threshold`.
    pub fn record_violation(&self, window: std::time::Duration, threshold: u32) -> bool {
        let mut state = self.state.lock();
        if state.violations_window_started.elapsed() > window {
            state.protocol_violations = 0;
            state.violations_window_started = Instant::now();
        }
        state.protocol_violations += 1;
        state.protocol_violations > threshold
    }

    /// Handles `viewport_update`: validates the new viewport, searches the
    /// index, sends `initial_markers` (always, even if empty), and resets
    /// `lastSeenIds` to the fresh snapshot, dropping any pending ops for
    /// ids that fell out of view.
    pub fn handle_viewport_update(
        &self,
        wire: WireViewport,
        search: impl FnOnce(&Viewport) -> Vec<(MarkerId, Marker)>,
    ) -> Result<(), crate::model::ViewportError> {
        let viewport = Viewport::new(wire.west, wire.south, wire.east, wire.north)?;
        let snapshot = search(&viewport);
        let new_ids: HashSet<MarkerId> = snapshot.iter().map(|(id, _)| id.clone()).collect();

        let data: Vec<WireMarker> = snapshot.iter().map(|(_, m)| WireMarker::from(m)).collect();
        let _ = self.outbound.send(ServerMessage::InitialMarkers { data });

        let mut state = self.state.lock();
        state.viewport = Some(viewport);
        state.pending_ops.retain(|id, _| new_ids.contains(id));
        state.last_seen_ids = new_ids;
        Ok(())
    }

    /// Folds one change event into this session's pending ops per the
    /// effective-kind decision table, and eagerly updates `lastSeenIds` to
    /// reflect the post-flush state.
    pub fn route_change(&self, event: &ChangeEvent) {
        let mut state = self.state.lock();

        let next_in_view = event
            .next
            .as_ref()
            .zip(state.viewport.as_ref())
            .map(|(m, vp)| vp.contains(m.coordinate))
            .unwrap_or(false);
        let previously_seen = state.last_seen_ids.contains(&event.id);

        let effective = match event.kind {
            ChangeKind::Deleted => {
                if previously_seen {
                    Some(PendingOp::Deleted)
                } else {
                    None
                }
            }
            _ => match (next_in_view, previously_seen) {
                (true, false) => event.next.clone().map(PendingOp::Created),
                (true, true) => event.next.clone().map(PendingOp::Updated),
                (false, true) => Some(PendingOp::Deleted),
                (false, false) => None,
            },
        };

        let Some(effective) = effective else {
            return;
        };

        let existing = state.pending_ops.remove(&event.id);
        match PendingOp::collapse(existing, effective) {
            Some(op) => {
                match &op {
                    PendingOp::Deleted => {
                        state.last_seen_ids.remove(&event.id);
                    }
                    PendingOp::Created(_) | PendingOp::Updated(_) => {
                        state.last_seen_ids.insert(event.id.clone());
                    }
                }
                state.pending_ops.insert(event.id.clone(), op);
            }
            None => {
                state.last_seen_ids.remove(&event.id);
            }
        }
    }

    /// Atomically swaps out `pendingOps`, returning it for the coalescer to
    /// turn into a single batch message. Empty maps are left untouched.
    pub fn take_pending_ops(&self) -> HashMap<MarkerId, PendingOp> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.pending_ops)
    }

    pub fn has_pending_ops(&self) -> bool {
        !self.state.lock().pending_ops.is_empty()
    }
}
