//! SmartMessage Core Library
//!
//! This library provides the core of the SmartMessage framework: typed,
//! self-describing messages that carry their own routing metadata,
//! validate themselves, and are delivered through pluggable transports to
//! subscriber-registered handlers, with handler-scoped deduplication,
//! circuit breakers, and a dead-letter queue for failure containment.

pub mod backend;
pub mod circuit;
pub mod ddq;
pub mod dispatcher;
pub mod dlq;
pub mod header;
pub mod message;
pub mod registry;
pub mod schema;
pub mod serializer;
pub mod subscription;
pub mod transport;

// Re-export commonly used types
pub use backend::{Backend, InMemoryBackend};
pub use circuit::{CircuitBreaker, CircuitState, CircuitStats};
pub use ddq::{ddq_key, DedupStats, DedupStore, DistributedDedupStore, MemoryDedupStore};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, PoolMode, ANY_CLASS};
pub use dlq::{DeadLetter, DeadLetterQueue, DlqStatistics};
pub use header::{MessageHeader, WIRE_HEADER_KEY};
pub use message::Message;
pub use registry::SchemaRegistry;
pub use schema::{MessageSchema, PropertySpec, SchemaBuilder};
pub use serializer::{
    Envelope, JsonSerializer, MsgPackSerializer, PrettySerializer, Serializer,
};
pub use subscription::{
    named_handler_id, FilterMode, FilterValue, FnHandler, MessageHandler, Subscription,
    SubscriptionFilter, DEFAULT_HANDLER_METHOD,
};
pub use transport::{
    effective_serializer, pattern_matches, routing_key, sanitize_segment, FifoMode, FileFormat,
    FilePartitioner, FileTransport, FileTransportConfig, FileWriteMode, InMemoryTransport,
    MemoryOverflowPolicy, MemoryTransportConfig, OverflowPolicy, PubSubTransport,
    QueueSubscriptionBuilder, QueueTransport, SinkTarget, TailConfig, Transport,
    TransportFactory, TransportRegistry, TransportStats, ALERT_TYPES,
};

// Re-export shared libraries
pub use smartmessage_config as config;
pub use smartmessage_errors as errors;
pub use smartmessage_errors::{Result, SmartMessageError};
pub use smartmessage_logging as logging;
