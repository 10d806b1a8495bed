mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
mod tls;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver, AcknowledgmentSender},
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    tls::TlsConfig,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::{Error, Result, TimeoutPhase};

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::new(tokio::task::spawn(fut))
}

/// Await a future, failing with a timeout error of the given phase if it does
/// not complete within `duration`.
pub(crate) async fn timeout<F: Future>(
    duration: Duration,
    phase: TimeoutPhase,
    future: F,
) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::timeout(phase, format!("deadline of {:?} elapsed", duration)))
}

/// An interval that fires first after `initial_delay` and then every `period`,
/// skipping (rather than bursting) missed ticks.
pub(crate) fn interval(initial_delay: Duration, period: Duration) -> tokio::time::Interval {
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + initial_delay, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}
