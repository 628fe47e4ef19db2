//! Upload limits.
//!
//! Limits normally come from the server's info/configuration document; a
//! TOML file with the same keys can stand in for it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MAX_POST_RECORDS: usize = 100;
pub const DEFAULT_MAX_POST_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_TOTAL_RECORDS: usize = 10_000;
pub const DEFAULT_MAX_TOTAL_BYTES: usize = 100 * 1024 * 1024;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Half of the smallest record seen must still fit, or the buffer is flushed.
pub const DEFAULT_EARLY_FLUSH_MARGIN: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Records per request
    pub max_post_records: usize,
    /// Body bytes per request
    pub max_post_bytes: usize,
    /// Records per batch
    pub max_total_records: usize,
    /// Bytes per batch
    pub max_total_bytes: usize,
    /// Upper bound on a whole request, honoured by the transport
    pub max_request_bytes: usize,
    /// Fraction of the smallest record that must still fit for a payload or
    /// batch to be considered not yet full
    pub early_flush_margin: f64,
    /// Stop sending once a payload fails as a whole
    pub abort_on_payload_failure: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_post_records: DEFAULT_MAX_POST_RECORDS,
            max_post_bytes: DEFAULT_MAX_POST_BYTES,
            max_total_records: DEFAULT_MAX_TOTAL_RECORDS,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            early_flush_margin: DEFAULT_EARLY_FLUSH_MARGIN,
            abort_on_payload_failure: true,
        }
    }
}

impl UploaderConfig {
    /// Limits from the server's info/configuration JSON. Unknown keys are
    /// ignored; absent keys keep their defaults.
    pub fn from_info_configuration(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load limits from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_post_records", self.max_post_records),
            ("max_post_bytes", self.max_post_bytes),
            ("max_total_records", self.max_total_records),
            ("max_total_bytes", self.max_total_bytes),
            ("max_request_bytes", self.max_request_bytes),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        if !(self.early_flush_margin > 0.0 && self.early_flush_margin <= 1.0) {
            return Err(Error::Config(format!(
                "early_flush_margin must be in (0, 1], got {}",
                self.early_flush_margin
            )));
        }
        if self.max_post_records > self.max_total_records {
            return Err(Error::Config(format!(
                "max_post_records ({}) exceeds max_total_records ({})",
                self.max_post_records, self.max_total_records
            )));
        }
        if self.max_post_bytes > self.max_total_bytes {
            return Err(Error::Config(format!(
                "max_post_bytes ({}) exceeds max_total_bytes ({})",
                self.max_post_bytes, self.max_total_bytes
            )));
        }
        Ok(())
    }

    /// Per-payload byte cap after accounting for the request size bound.
    pub fn effective_post_bytes(&self) -> usize {
        self.max_post_bytes.min(self.max_request_bytes)
    }
}
