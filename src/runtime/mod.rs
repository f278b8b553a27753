// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime machinery: the retry queue, log redaction, and slow-operation
//! tracing.

pub mod logging;
pub mod retry;
pub mod tracing;

pub use self::logging::{LogLevel, Redactor};
pub use self::retry::{BackoffStrategy, NoBackoff, ProportionalBackoff, RetryQueue, RetryReason};
pub use self::tracing::OperationSpan;
