// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Admission control for SQL client launches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StatementError;

/// Bounds the number of SQL clients running at once.
///
/// A request that cannot get an execution slot within the admission timeout
/// is rejected instead of queueing indefinitely.
#[derive(Debug, Clone)]
pub struct Admission {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl Admission {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Admission {
        Admission {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            timeout,
        }
    }

    /// Waits for an execution slot.
    ///
    /// The slot is held until the returned permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, StatementError> {
        let permits = Arc::clone(&self.permits);
        match tokio::time::timeout(self.timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(StatementError::Cancelled { script_id: None }),
            Err(_elapsed) => Err(StatementError::Backpressure {
                waited: self.timeout,
            }),
        }
    }

    /// Rejects all current and future waiters with
    /// [`StatementError::Cancelled`]. Permits already handed out stay valid.
    pub fn close(&self) {
        self.permits.close();
    }

    /// The number of free execution slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
