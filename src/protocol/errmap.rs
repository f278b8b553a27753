// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server error map.
//!
//! Negotiated via GET_ERROR_MAP, the map tells the client how to treat
//! status codes it does not know natively: whether an error is transient,
//! and an optional retry schedule (strategy, interval, ceiling, initial
//! delay, maximum total duration). When a packet fails with a mapped status
//! carrying a retry spec, that spec's schedule takes precedence over the
//! client's own backoff computation.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CouchError, Result};

/// Growth shape of an error-map retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    #[default]
    Constant,
    Linear,
    Exponential,
}

/// Retry guidance attached to a single error-map entry.
///
/// All intervals are milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetrySpec {
    #[serde(default)]
    pub strategy: RetryStrategy,
    /// Base interval between attempts.
    pub interval: u64,
    /// Delay before the first retry, when present.
    #[serde(default)]
    pub after: Option<u64>,
    /// Upper bound for a single interval.
    #[serde(rename = "ceil", default)]
    pub ceiling: Option<u64>,
    /// Total time budget; effectively shortens the packet deadline.
    #[serde(rename = "max-duration", default)]
    pub max_duration: Option<u64>,
}

impl RetrySpec {
    /// Interval before attempt `n` (1-based count of retries already made).
    #[must_use]
    pub fn next_interval(&self, n: u32) -> Duration {
        let base = match self.strategy {
            RetryStrategy::Constant => self.interval,
            RetryStrategy::Linear => self.interval.saturating_mul(u64::from(n.max(1))),
            RetryStrategy::Exponential => {
                let shift = (n.saturating_sub(1)).min(32);
                self.interval.saturating_mul(1u64 << shift)
            }
        };
        let mut ms = if n <= 1 {
            self.after.unwrap_or(base)
        } else {
            base
        };
        if let Some(ceil) = self.ceiling {
            ms = ms.min(ceil);
        }
        Duration::from_millis(ms)
    }

    /// Deadline cap implied by `max-duration`, if any.
    #[must_use]
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration.map(Duration::from_millis)
    }
}

/// One error-map entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMapEntry {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub attrs: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

impl ErrorMapEntry {
    #[must_use]
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }

    /// The server marked this status as safe to retry automatically.
    #[must_use]
    pub fn is_auto_retry(&self) -> bool {
        self.has_attr("auto-retry")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawErrorMap {
    version: u32,
    revision: u32,
    errors: HashMap<String, ErrorMapEntry>,
}

/// Parsed error map, keyed by status code.
#[derive(Debug, Clone, Default)]
pub struct ErrorMap {
    pub version: u32,
    pub revision: u32,
    entries: HashMap<u16, ErrorMapEntry>,
}

impl ErrorMap {
    /// Parse the JSON document returned by GET_ERROR_MAP. Keys are
    /// lower-case hex status codes without a prefix.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let doc: RawErrorMap = serde_json::from_slice(raw)
            .map_err(|e| CouchError::Protocol(format!("error map parse: {e}")))?;
        let mut entries = HashMap::with_capacity(doc.errors.len());
        for (code, entry) in doc.errors {
            let code = u16::from_str_radix(&code, 16)
                .map_err(|_| CouchError::Protocol(format!("error map code {code:?}")))?;
            entries.insert(code, entry);
        }
        Ok(Self {
            version: doc.version,
            revision: doc.revision,
            entries,
        })
    }

    #[must_use]
    pub fn get(&self, status: u16) -> Option<&ErrorMapEntry> {
        self.entries.get(&status)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
