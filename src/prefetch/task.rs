// SPDX-License-Identifier: MPL-2.0

//! Background download tasks and their single-slot mailboxes.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};

use super::storage::{FetchError, Segment};

pub(crate) type Outcome = Result<Segment, FetchError>;

/// Run `job` on its own thread; its result arrives on the returned receiver.
pub(crate) fn spawn<F>(name: &str, job: F) -> std::io::Result<Receiver<Outcome>>
where
    F: FnOnce() -> Outcome + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            // The receiver is gone if the task was abandoned.
            let _ = tx.send(job());
        })?;
    Ok(rx)
}

/// A task in flight.
#[derive(Debug)]
pub(crate) struct Pending {
    pub rx: Receiver<Outcome>,
    pub id: u64,
    /// Collection index the task was issued for.
    pub tag: usize,
    /// Remote index the download starts at.
    pub start: usize,
    pub started: Instant,
}

impl Pending {
    /// Non-blocking check for the task's result.
    pub fn poll(&self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(FetchError::TaskLost)),
        }
    }

    #[must_use]
    pub fn expired(&self, now: Instant, timeout: Option<Duration>) -> bool {
        timeout.is_some_and(|limit| now.saturating_duration_since(self.started) >= limit)
    }
}
