// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Races `fut` against `io_timeout` and the cancellation token, whichever
/// comes first. Callers check `cancel.is_cancelled()` before constructing
/// `fut` so a pre-cancelled token never reaches this far.
pub(super) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow!("{label} timeout")),
            }
        }
    }
}
