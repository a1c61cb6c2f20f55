pub mod bloom_filter;
pub mod datastore;
pub mod network;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use datastore::{
    NoopTokenProvider, StaticTokenProvider, StreamingDatastore, StreamingDatastoreImpl, TokenProvider,
    TokenProviderArc,
};
pub use network::{NetworkLayer, NetworkLayerBuilder};
pub use online_state_tracker::{OnlineState, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use serializer::JsonProtoSerializer;
pub use stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamTransport};
pub use watch_change::WatchChange;
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
