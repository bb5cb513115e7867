// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{future::Future, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("timeout elapsed")]
pub struct Elapsed;

/// Requires a [`Future`] to complete before `after` elapsed, dropping it
/// otherwise.
pub async fn timeout<F, T>(after: Duration, f: F) -> Result<T, Elapsed>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(after, f).await.map_err(|_| Elapsed)
}

/// Wait until `duration` has elapsed.
///
/// # Cancellation
///
/// A sleep is cancelled by dropping its future.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}
