// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::{Spawner, Task};

/// A debounced single-shot timer.
///
/// [`Debounce::schedule`] arms the timer unless it is already armed; the
/// callback fires once `delay` after the first of a burst of schedules.
/// Used for checkpoint autosave, where consecutive mutations must coalesce
/// into one save.
pub struct Debounce {
    tx: mpsc::UnboundedSender<Cmd>,
    _task: Task<()>,
}

enum Cmd {
    Schedule,
    Flush,
    Cancel,
}

impl Debounce {
    pub fn new<F>(spawner: &Spawner, delay: Duration, mut fire: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawner.spawn(async move {
            let mut deadline: Option<tokio::time::Instant> = None;
            loop {
                let snooze_at = deadline;
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        None => break,
                        Some(Cmd::Schedule) => {
                            if deadline.is_none() {
                                deadline = Some(tokio::time::Instant::now() + delay);
                            }
                        },
                        Some(Cmd::Flush) => {
                            if deadline.take().is_some() {
                                fire()
                            }
                        },
                        Some(Cmd::Cancel) => deadline = None,
                    },
                    () = async {
                        match snooze_at {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => futures::future::pending().await,
                        }
                    } => {
                        deadline = None;
                        fire()
                    },
                }
            }
        });
        Self { tx, _task: task }
    }

    /// Arm the timer, unless a firing is already scheduled.
    pub fn schedule(&self) {
        let _ = self.tx.send(Cmd::Schedule);
    }

    /// Fire now if armed, disarming the timer.
    pub fn flush(&self) {
        let _ = self.tx.send(Cmd::Flush);
    }

    /// Disarm without firing.
    pub fn cancel(&self) {
        let _ = self.tx.send(Cmd::Cancel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn schedules_coalesce() {
        let spawner = Spawner::from_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let debounce = Debounce::new(&spawner, Duration::from_millis(50), move || {
            counter.fetch_add(1, SeqCst);
        });

        debounce.schedule();
        debounce.schedule();
        debounce.schedule();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_fires_only_when_armed() {
        let spawner = Spawner::from_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let debounce = Debounce::new(&spawner, Duration::from_secs(10), move || {
            counter.fetch_add(1, SeqCst);
        });

        debounce.flush();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(SeqCst), 0);

        debounce.schedule();
        debounce.flush();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(SeqCst), 1);
    }
}
