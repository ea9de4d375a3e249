use std::{future::Future, time::Duration};

use tokio::{
    sync::watch,
    time::{sleep_until, Instant},
};
use tracing::trace;

use crate::status::{Result, Status};

/// Evaluate `condition` right away then every `interval` until it yields a
/// value. A zero `timeout` waits forever. An error from `condition` stops
/// the polling.
pub(crate) async fn poll_immediate<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut cancel: Option<watch::Receiver<bool>>,
    what: &str,
    mut condition: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
    loop {
        if let Some(value) = condition().await? {
            return Ok(value);
        }
        trace!("{} not ready, next check in {:?}", what, interval);

        let mut wake = Instant::now() + interval;
        let mut expires = false;
        if let Some(deadline) = deadline {
            if deadline <= wake {
                wake = deadline;
                expires = true;
            }
        }
        tokio::select! {
            _ = sleep_until(wake) => {
                if expires {
                    return Err(Status::deadline_exceeded(format!(
                        "timed out after {:?} waiting for {}",
                        timeout, what
                    )));
                }
            }
            _ = cancelled(&mut cancel) => {
                return Err(Status::cancelled(format!("stopped waiting for {}", what)));
            }
        }
    }
}

async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(cancel) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
