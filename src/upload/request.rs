//! Outgoing request construction.
//!
//! Pure functions over the whiteboard: building a request never mutates it.

use crate::upload::whiteboard::Whiteboard;
use bytes::{BufMut, Bytes, BytesMut};
use url::Url;

/// Query parameter carrying `true` or the batch token
pub const BATCH_PARAM: &str = "batch";

/// Query parameter closing the batch
pub const COMMIT_PARAM: &str = "commit";

/// Precondition header sent once a server timestamp is known
pub const IF_UNMODIFIED_SINCE: &str = "If-Unmodified-Since";

/// A fully built POST to the collection endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRequest {
    pub uri: Url,
    /// `If-Unmodified-Since` value, if any
    pub if_unmodified_since: Option<String>,
    /// JSON array of encoded records
    pub body: Bytes,
    pub is_commit: bool,
}

/// Collection URI with batching parameters appended.
///
/// `batch=true` opens a batch, `batch=<token>` continues one, and
/// `commit=true` closes it. Without batching the bare collection URI is
/// posted and every payload lands on its own.
pub fn build_post_uri(is_commit: bool, whiteboard: &Whiteboard, base: &Url) -> Url {
    let mut uri = base.clone();
    if whiteboard.mode().is_disabled() {
        return uri;
    }
    {
        let mut query = uri.query_pairs_mut();
        query.append_pair(BATCH_PARAM, whiteboard.token().unwrap_or("true"));
        if is_commit {
            query.append_pair(COMMIT_PARAM, "true");
        }
    }
    uri
}

/// Precondition value taken from the whiteboard's last-modified time.
pub fn if_unmodified_since(whiteboard: &Whiteboard) -> Option<String> {
    whiteboard.last_modified().map(|ts| ts.to_header_value())
}

/// Frame encoded records as a JSON array.
pub fn encode_body(records: &[Bytes]) -> Bytes {
    let len = records.iter().map(|r| r.len() + 1).sum::<usize>() + 1;
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(b'[');
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b',');
        }
        buf.put_slice(record);
    }
    buf.put_u8(b']');
    buf.freeze()
}

pub fn build_request(
    records: &[Bytes],
    is_commit: bool,
    whiteboard: &Whiteboard,
    base: &Url,
) -> PostRequest {
    PostRequest {
        uri: build_post_uri(is_commit, whiteboard, base),
        if_unmodified_since: if_unmodified_since(whiteboard),
        body: encode_body(records),
        is_commit,
    }
}
