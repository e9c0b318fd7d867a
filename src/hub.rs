//! Connection hub
//!
//! Terminates every tracker and viewer connection, routes inbound frames into
//! the registry, and fans registry lifecycle events back out over the wire.
//! All writes to a connection go through its writer channel, so broadcasts
//! and direct replies never interleave on the socket. Broadcasts iterate a
//! snapshot of writer handles; no map guard is held across channel sends that
//! matter or across any await point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_ws::{CloseCode, CloseReason};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WS_EVENTS_PAGE_SIZE;
use crate::protocol::{BroadcastDetail, ClientMessage, ServerMessage, TrackerErrorKind};
use crate::registry::{SessionEventSink, SessionRegistry};
use crate::store::HistoryReader;

/// Role assigned at upgrade time from the `?type=` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Tracker,
    Viewer,
}

impl ClientRole {
    /// Missing or unrecognized values default to tracker.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("viewer") => Self::Viewer,
            _ => Self::Tracker,
        }
    }
}

/// Commands consumed by a connection's writer task.
#[derive(Debug)]
pub enum WriterCommand {
    Frame(String),
    Ping,
    Close(Option<CloseReason>),
}

struct ClientHandle {
    role: ClientRole,
    sender: UnboundedSender<WriterCommand>,
    /// Session held by a tracker connection.
    session_id: Option<String>,
    /// Sessions a viewer connection receives filtered broadcasts for.
    watched: HashSet<String>,
    #[allow(dead_code)]
    joined_at: DateTime<Utc>,
    last_heartbeat: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClientCounts {
    pub total: usize,
    pub trackers: usize,
    pub viewers: usize,
}

pub struct ConnectionHub {
    clients: DashMap<Uuid, ClientHandle>,
    registry: Arc<SessionRegistry>,
    history: Arc<dyn HistoryReader>,
    client_timeout: Duration,
}

impl ConnectionHub {
    pub fn new(
        registry: Arc<SessionRegistry>,
        history: Arc<dyn HistoryReader>,
        client_timeout: Duration,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            registry,
            history,
            client_timeout,
        }
    }

    /// Add a connection. Viewers are immediately sent the current
    /// active-sessions snapshot.
    pub fn register(&self, connection_id: Uuid, role: ClientRole, sender: UnboundedSender<WriterCommand>) {
        self.clients.insert(
            connection_id,
            ClientHandle {
                role,
                sender,
                session_id: None,
                watched: HashSet::new(),
                joined_at: Utc::now(),
                last_heartbeat: Instant::now(),
            },
        );
        info!(%connection_id, ?role, total = self.clients.len(), "client connected");

        if role == ClientRole::Viewer {
            let sessions = self.registry.active_snapshot();
            self.send_to(&connection_id, &ServerMessage::ActiveSessions { sessions });
        }
    }

    /// Remove a connection and run its disconnect effects: a tracker that
    /// still holds a session ends it. Safe to call more than once.
    pub fn disconnect(&self, connection_id: &Uuid) {
        let Some((_, handle)) = self.clients.remove(connection_id) else {
            return;
        };
        info!(%connection_id, total = self.clients.len(), "client disconnected");

        if handle.role == ClientRole::Tracker {
            if let Some(session_id) = handle.session_id {
                let _ = self.registry.end_session(&session_id);
            }
        }
    }

    /// Refresh connection liveness. Called for every inbound frame and pong.
    pub fn touch(&self, connection_id: &Uuid) {
        if let Some(mut client) = self.clients.get_mut(connection_id) {
            client.last_heartbeat = Instant::now();
        }
    }

    pub fn client_counts(&self) -> ClientCounts {
        let mut counts = ClientCounts { total: 0, trackers: 0, viewers: 0 };
        for entry in self.clients.iter() {
            counts.total += 1;
            match entry.role {
                ClientRole::Tracker => counts.trackers += 1,
                ClientRole::Viewer => counts.viewers += 1,
            }
        }
        counts
    }

    /// Dispatch one decoded inbound message for a connection.
    pub async fn handle_message(&self, connection_id: Uuid, message: ClientMessage) {
        let (role, owned) = match self.clients.get(&connection_id) {
            Some(client) => (client.role, client.session_id.clone()),
            None => return,
        };

        use ClientRole::{Tracker, Viewer};
        match message {
            ClientMessage::Heartbeat { session_id } => {
                // Connection liveness was refreshed by the reader; trackers
                // additionally keep their session warm.
                if role == Tracker {
                    if let Some(session_id) = session_id.or(owned) {
                        let _ = self.registry.heartbeat(&session_id);
                    }
                }
            }
            ClientMessage::SessionStart(start) if role == Tracker => {
                // A tracker owns at most one session at a time.
                if let Some(previous) = &owned {
                    if *previous != start.session_id {
                        let _ = self.registry.end_session(previous);
                    }
                }
                let outcome = self.registry.start_session(connection_id, start);
                if let Some(mut client) = self.clients.get_mut(&connection_id) {
                    client.session_id = Some(outcome.session_id.clone());
                }
                if outcome.reassigned {
                    self.send_to(
                        &connection_id,
                        &ServerMessage::SessionAssigned { session_id: outcome.session_id },
                    );
                }
            }
            ClientMessage::EventsBatch { events } if role == Tracker => match owned {
                Some(session_id) => {
                    if let Err(e) = self.registry.append_events(&session_id, events) {
                        self.reply_error(&connection_id, &e.to_string());
                    }
                }
                None => self.reply_error(&connection_id, "no session started"),
            },
            ClientMessage::SessionEnd { session_id } if role == Tracker => {
                match session_id.or(owned.clone()) {
                    Some(target) => {
                        if let Err(e) = self.registry.end_session(&target) {
                            self.reply_error(&connection_id, &e.to_string());
                        }
                        if owned.as_deref() == Some(target.as_str()) {
                            if let Some(mut client) = self.clients.get_mut(&connection_id) {
                                client.session_id = None;
                            }
                        }
                    }
                    None => self.reply_error(&connection_id, "no session to end"),
                }
            }
            ClientMessage::TrackerError { payload } if role == Tracker => {
                self.record_tracker_error(connection_id, owned, TrackerErrorKind::Generic, payload);
            }
            ClientMessage::JavascriptError { payload } if role == Tracker => {
                self.record_tracker_error(connection_id, owned, TrackerErrorKind::Javascript, payload);
            }
            ClientMessage::PromiseRejection { payload } if role == Tracker => {
                self.record_tracker_error(
                    connection_id,
                    owned,
                    TrackerErrorKind::PromiseRejection,
                    payload,
                );
            }
            ClientMessage::VisibilityChange { payload } if role == Tracker => match owned {
                Some(session_id) => {
                    let detail = BroadcastDetail::new(session_id.clone(), payload);
                    self.broadcast_to_watchers(&session_id, &ServerMessage::VisibilityChange(detail));
                }
                None => self.reply_error(&connection_id, "no session started"),
            },
            ClientMessage::GetActiveSessions if role == Viewer => {
                let sessions = self.registry.active_snapshot();
                self.send_to(&connection_id, &ServerMessage::ActiveSessions { sessions });
            }
            ClientMessage::ViewerJoinSession { session_id } if role == Viewer => {
                self.join_session(connection_id, session_id).await;
            }
            ClientMessage::ViewerLeaveSession { session_id } if role == Viewer => {
                if let Some(mut client) = self.clients.get_mut(&connection_id) {
                    client.watched.remove(&session_id);
                }
            }
            ClientMessage::GetSessionEvents { session_id, from_index } if role == Viewer => {
                self.send_events_page(connection_id, session_id, from_index).await;
            }
            ClientMessage::Unknown { kind } => {
                debug!(%connection_id, %kind, "dropping unknown message type");
            }
            _ => {
                debug!(%connection_id, ?role, "message not allowed for role");
                self.reply_error(&connection_id, "message not allowed for this client role");
            }
        }
    }

    /// Close connections whose last heartbeat is older than the timeout and
    /// ping the rest. Closed trackers run the normal disconnect path.
    pub fn sweep_stale(&self) {
        let now = Instant::now();
        let mut stale = Vec::new();
        let mut fresh = Vec::new();

        for entry in self.clients.iter() {
            if now.duration_since(entry.last_heartbeat) > self.client_timeout {
                stale.push(*entry.key());
            } else {
                fresh.push(entry.sender.clone());
            }
        }

        for connection_id in stale {
            warn!(%connection_id, "closing connection after heartbeat timeout");
            if let Some(client) = self.clients.get(&connection_id) {
                let _ = client.sender.send(WriterCommand::Close(Some(CloseReason {
                    code: CloseCode::Normal,
                    description: Some("Heartbeat timeout".to_string()),
                })));
            }
            self.disconnect(&connection_id);
        }

        for sender in fresh {
            let _ = sender.send(WriterCommand::Ping);
        }
    }

    pub fn spawn_heartbeat_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                hub.sweep_stale();
            }
        })
    }

    /// Ask every connection to close and forget them all.
    pub fn shutdown(&self) {
        for entry in self.clients.iter() {
            let _ = entry.sender.send(WriterCommand::Close(Some(CloseReason {
                code: CloseCode::Away,
                description: Some("Server shutting down".to_string()),
            })));
        }
        self.clients.clear();
        info!("connection hub shut down");
    }

    async fn join_session(&self, connection_id: Uuid, session_id: String) {
        match self.clients.get_mut(&connection_id) {
            Some(mut client) => {
                client.watched.insert(session_id.clone());
            }
            None => return,
        }

        // Joined sessions still in memory are answered from the registry;
        // anything older comes from the store.
        let reply = if let Some(overview) = self.registry.session_overview(&session_id) {
            ServerMessage::SessionJoined {
                session_id: session_id.clone(),
                events: Vec::new(),
                metadata: overview.metadata,
                total_events: overview.total_events,
                is_active: overview.is_active,
            }
        } else {
            match self.history.session_detail(&session_id).await {
                Ok(Some(detail)) => ServerMessage::SessionJoined {
                    session_id: session_id.clone(),
                    events: Vec::new(),
                    metadata: detail.metadata,
                    total_events: detail.event_count.max(0) as u64,
                    is_active: detail.is_active,
                },
                Ok(None) => ServerMessage::Error {
                    message: format!("unknown session: {session_id}"),
                },
                Err(e) => {
                    warn!(error = %e, %session_id, "session detail lookup failed");
                    ServerMessage::Error { message: "session history unavailable".to_string() }
                }
            }
        };

        self.send_to(&connection_id, &reply);
    }

    async fn send_events_page(&self, connection_id: Uuid, session_id: String, from_index: usize) {
        // The registry buffer indexes the current buffer, not the stream;
        // it can only answer while it still holds the whole stream.
        if let Some(page) = self.registry.events_page(&session_id, from_index, WS_EVENTS_PAGE_SIZE) {
            if page.total_events as usize == page.buffered {
                let has_more = from_index + page.events.len() < page.total_events as usize;
                self.send_to(
                    &connection_id,
                    &ServerMessage::SessionEvents {
                        session_id,
                        events: page.events,
                        from_index,
                        total_events: page.total_events,
                        has_more,
                    },
                );
                return;
            }
        }

        match self.history.events_page(&session_id, from_index, WS_EVENTS_PAGE_SIZE).await {
            Ok(page) => {
                let has_more = from_index + page.events.len() < page.total_events as usize;
                self.send_to(
                    &connection_id,
                    &ServerMessage::SessionEvents {
                        session_id,
                        events: page.events,
                        from_index,
                        total_events: page.total_events,
                        has_more,
                    },
                );
            }
            Err(e) => {
                warn!(error = %e, %session_id, "event page lookup failed");
                self.reply_error(&connection_id, "session history unavailable");
            }
        }
    }

    fn record_tracker_error(
        &self,
        connection_id: Uuid,
        owned: Option<String>,
        kind: TrackerErrorKind,
        payload: serde_json::Value,
    ) {
        match owned {
            Some(session_id) => {
                if let Err(e) = self.registry.append_error(&session_id, kind, payload) {
                    self.reply_error(&connection_id, &e.to_string());
                }
            }
            None => self.reply_error(&connection_id, "no session started"),
        }
    }

    fn send_to(&self, connection_id: &Uuid, message: &ServerMessage) {
        let Some(sender) = self.clients.get(connection_id).map(|c| c.sender.clone()) else {
            return;
        };
        match message.to_frame() {
            Ok(frame) => {
                let _ = sender.send(WriterCommand::Frame(frame));
            }
            Err(e) => error!(error = %e, "failed to serialize outbound message"),
        }
    }

    /// Best-effort `error` reply; used for protocol and routing failures.
    pub fn reply_error(&self, connection_id: &Uuid, message: &str) {
        self.send_to(connection_id, &ServerMessage::Error { message: message.to_string() });
    }

    fn broadcast_to_viewers(&self, message: &ServerMessage) {
        let targets: Vec<_> = self
            .clients
            .iter()
            .filter(|entry| entry.role == ClientRole::Viewer)
            .map(|entry| entry.sender.clone())
            .collect();
        self.fan_out(targets, message);
    }

    fn broadcast_to_watchers(&self, session_id: &str, message: &ServerMessage) {
        let targets: Vec<_> = self
            .clients
            .iter()
            .filter(|entry| entry.role == ClientRole::Viewer && entry.watched.contains(session_id))
            .map(|entry| entry.sender.clone())
            .collect();
        self.fan_out(targets, message);
    }

    fn fan_out(&self, targets: Vec<UnboundedSender<WriterCommand>>, message: &ServerMessage) {
        if targets.is_empty() {
            return;
        }
        match message.to_frame() {
            Ok(frame) => {
                for target in targets {
                    let _ = target.send(WriterCommand::Frame(frame.clone()));
                }
            }
            Err(e) => error!(error = %e, "failed to serialize broadcast"),
        }
    }

    #[cfg(test)]
    fn age_client(&self, connection_id: &Uuid, age: Duration) {
        if let Some(mut client) = self.clients.get_mut(connection_id) {
            client.last_heartbeat = Instant::now() - age;
        }
    }
}

impl SessionEventSink for ConnectionHub {
    fn session_started(&self, session_id: &str, user_id: &str, metadata: &serde_json::Value) {
        self.broadcast_to_viewers(&ServerMessage::SessionStarted {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            metadata: metadata.clone(),
        });
    }

    fn session_ended(&self, session_id: &str) {
        self.broadcast_to_viewers(&ServerMessage::SessionEnded { session_id: session_id.to_string() });
    }

    fn events_added(&self, session_id: &str, events: &[serde_json::Value]) {
        self.broadcast_to_watchers(
            session_id,
            &ServerMessage::EventsBatch {
                session_id: session_id.to_string(),
                events: events.to_vec(),
            },
        );
    }

    fn error_added(&self, session_id: &str, kind: TrackerErrorKind, record: &serde_json::Value) {
        let message = match kind {
            TrackerErrorKind::Javascript => ServerMessage::JavascriptError(BroadcastDetail::new(
                session_id.to_string(),
                record.clone(),
            )),
            TrackerErrorKind::PromiseRejection => ServerMessage::PromiseRejection(
                BroadcastDetail::new(session_id.to_string(), record.clone()),
            ),
            // Plain tracker errors are persisted but have no broadcast frame
            // of their own; `error` frames are reserved for protocol replies.
            TrackerErrorKind::Generic => return,
        };
        self.broadcast_to_watchers(session_id, &message);
    }
}
