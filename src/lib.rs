//! batchpush - batching upload client for record storage endpoints.
//!
//! Records go in through [`Uploader::process`]; the uploader packs them into
//! payloads and batches under the server's limits, a worker task posts them
//! in order, and every record's outcome comes back through a
//! [`StoreDelegate`].

pub mod config;
pub mod error;
pub mod logging;
pub mod sim;
pub mod upload;

pub use config::UploaderConfig;
pub use error::{Error, Result, UploadError};
pub use upload::{
    BatchingMode, EncodedRecord, HttpResponse, OutgoingRecord, PostRequest, StoreDelegate,
    Timestamp, Transport, TransportError, UploadStats, Uploader,
};
