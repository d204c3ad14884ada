use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::Result;

/// Awaits `task` until it finishes, `duration` elapses or `cancel` fires.
///
/// Giving up does not undo whatever the task already started.
pub(crate) async fn wait_with_deadline<F, T>(
    task: F,
    duration: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(Error::Canceled),
            r = timeout(duration, task) => r.map_err(|_| Error::Timeout(duration))?,
        },
        None => timeout(duration, task).await.map_err(|_| Error::Timeout(duration))?,
    }
}
