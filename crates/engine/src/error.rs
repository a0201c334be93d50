// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2026 Stride Project Contributors
//
// This file is part of Stride.
//
// Stride is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Stride is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Stride. If not, see <https://www.gnu.org/licenses/>.

//! Error types for the workflow engine.
//!
//! The executor keys its retry decisions off these variants:
//! - `Validation` and `Unrecoverable` never consume a retry and fail the
//!   instance immediately
//! - `AccountNotAlive` never consumes a retry; it fails the instance only
//!   when the current step is critical
//! - everything else is retryable up to the definition's retry budget

use stride_locks::LockError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during workflow execution.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid definition, step parameters, or request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Target account is not reachable/alive at the vendor
    #[error("Account not alive: {0}")]
    AccountNotAlive(String),

    /// Vendor API call failed
    #[error("Vendor call failed: {0}")]
    VendorCall(String),

    /// A required lock is held by another holder
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// Step execution exceeded its timeout
    #[error("Step timed out after {0} ms")]
    Timeout(u64),

    /// Instance state cannot be repaired (recovery validation failed)
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Workflow, instance, or account not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent update detected (optimistic locking failure)
    #[error("Concurrent update: {0}")]
    ConcurrentUpdate(String),

    /// Deferred task scheduling failed
    #[error("Scheduling error: {0}")]
    Scheduling(String),
}

impl EngineError {
    /// Stable machine-readable kind, used at the service boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AccountNotAlive(_) => "account_not_alive",
            Self::VendorCall(_) => "vendor_call",
            Self::LockUnavailable(_) => "lock_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Unrecoverable(_) => "unrecoverable",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::NotFound(_) => "not_found",
            Self::ConcurrentUpdate(_) => "concurrent_update",
            Self::Scheduling(_) => "scheduling",
        }
    }

    /// Whether the executor may charge this failure against the retry
    /// budget. Terminal classifications and liveness failures are not
    /// retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_) | Self::Unrecoverable(_) | Self::AccountNotAlive(_)
        )
    }
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        EngineError::Storage(format!("lock backend: {err}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
