//! Batching upload pipeline.
//!
//! Pushes a stream of records to a batch storage endpoint while staying
//! under per-request and per-batch budgets.
//! Two-stage pipeline: Uploader -> Dispatcher worker
//!
//! # Architecture
//!
//! ```text
//! +--------------+  PayloadJob  +--------------+  POST   +--------------+
//! |   Uploader   | -----------> |  Dispatcher  | ------> |  Transport   |
//! | (budgets,    |   (ordered)  | (whiteboard, | <------ |              |
//! |  flushes)    | <----------- |  responses)  |         +--------------+
//! +--------------+ batching mode +--------------+
//!                                      |
//!                                      v
//!                               StoreDelegate
//! ```
//!
//! # Batches
//!
//! A batch spans one or more payloads. The first is posted with
//! `batch=true`, the server answers `202` with a token, later payloads carry
//! `batch=<token>`, and the last carries `commit=true`. Records only become
//! visible once their batch is committed. Servers without batching answer
//! every payload with a plain `200` and the uploader drops batch budgets.

pub mod budget;
pub mod channel;
pub mod dispatcher;
pub mod payload;
pub mod record;
pub mod request;
pub mod response;
pub mod timestamp;
pub mod transport;
pub mod uploader;
pub mod whiteboard;

pub use budget::{admit, Admission, BatchBudget, SizeTracker};
pub use channel::{PayloadJob, UploadStats};
pub use dispatcher::Dispatcher;
pub use payload::{
    Payload, PAYLOAD_FRAMING_BYTES, PAYLOAD_FRAMING_OVERHEAD, RECORD_SEPARATOR_OVERHEAD,
};
pub use record::{EncodedRecord, OutgoingRecord};
pub use request::{build_post_uri, build_request, if_unmodified_since, PostRequest};
pub use response::{PayloadOutcome, ResponseInterpreter};
pub use timestamp::Timestamp;
pub use transport::{HttpResponse, StoreDelegate, Transport, TransportError, LAST_MODIFIED_HEADER};
pub use uploader::Uploader;
pub use whiteboard::{BatchingMode, Whiteboard};
