//! Filter-transform-forward pipeline.
//!
//! Every inbound event from every source flows through:
//! 1. `Transport::subscribe()`: transport-specific I/O, one stream per source
//! 2. `FilterEngine::evaluate()`: keyword rules, first match wins
//! 3. `TextTransformer::transform()`: ordered literal replacements
//! 4. `DedupLedger::admit()`: drops messages already forwarded
//! 5. `Dispatcher::send()`: delivery with retry and backoff
//!
//! Events from one source are handled strictly in arrival order.

pub mod connection;
pub mod coordinator;
pub mod dedup;
pub mod dispatcher;
pub mod filter;
pub mod rules;
pub mod stats;
pub mod transform;
pub mod types;

pub use coordinator::{ProcessOutcome, Relay, RelayHandle, ShutdownReport};
pub use types::{
    Ack, Destination, InboundMessage, OutboundMessage, Source, SourceEvent, SourceStream,
    Transport,
};
