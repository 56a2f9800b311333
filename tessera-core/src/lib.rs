//! Tessera Core Library
//!
//! Content-addressed object graph exchange:
//! - Dynamic property model (`Base`, closed `Value` sum type)
//! - Content hasher / serializer with detach and closure semantics
//! - Transport abstraction (memory, SQLite local cache, HTTP server)
//! - Send/receive operations with cancellation and progress reporting
//! - Account storage for remote store credentials

pub mod account;
pub mod base;
pub mod deserializer;
pub mod memory_transport;
pub mod object;
pub mod operations;
pub mod registry;
pub mod serializer;
pub mod server_transport;
pub mod sqlite_transport;
pub mod transport;

pub use account::{Account, AccountError, AccountStore};
pub use base::{Base, PropertyError, Value, is_detached_key, is_hidden_key};
pub use deserializer::{DeserializeError, Deserializer};
pub use memory_transport::MemoryTransport;
pub use object::{Closure, ObjectId};
pub use operations::{
    OperationError, ReceiveOptions, SendOptions, SendResult, receive, send,
};
pub use registry::{TypeRegistry, TypeSpec};
pub use serializer::{SerializeError, Serialized, Serializer, verify_stored_document};
pub use server_transport::{ServerTransport, ServerTransportOptions};
pub use sqlite_transport::{SqliteTransport, default_cache_path};
pub use transport::{OnError, OnProgress, OnTotalChildren, Transport, TransportError};
