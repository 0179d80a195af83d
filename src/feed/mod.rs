//! Feed connectivity: WebSocket listener, wire types, snapshot fetcher

mod listener;
pub mod messages;
mod snapshot;

pub use listener::FeedListener;
pub use messages::{DiffBatch, Snapshot, StreamMessage, SubscribeRequest};
pub use snapshot::{request_channel, SnapshotFetcher, SnapshotRequester};
