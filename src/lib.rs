//! Real-time session replay relay
//!
//! Stateful broker between browser trackers that stream recorded DOM events
//! and viewer clients that watch sessions live or query them from storage.

pub mod api;
pub mod batcher;
pub mod client;
pub mod config;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod store;

pub use batcher::{BatchWriter, EventBatcher, SessionBatch};
pub use config::Config;
pub use hub::{ClientRole, ConnectionHub, WriterCommand};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, SessionStart, TrackerErrorKind};
pub use registry::{SessionEventSink, SessionRegistry};
pub use store::{EventsPage, HistoryReader, ReplayStore, SessionStore, StoreError, StoredSession};
