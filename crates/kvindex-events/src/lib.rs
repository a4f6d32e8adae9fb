//! Event-ingestion pool: wire decoding, the ZeroMQ transport subscriber,
//! and the sharded worker pool that applies mutation events to the block
//! index.

pub mod pool;
pub mod subscriber;
pub mod wire;

pub use pool::EventPool;
