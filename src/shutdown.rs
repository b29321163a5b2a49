//! Cooperative shutdown coordination.
//!
//! A one-way shutdown flag plus a count of in-flight tasks (the listener and
//! every connection handler). Tasks poll the flag on their own timeout
//! cadence; nothing is cancelled from the outside. The process waits on
//! [`Shutdown::wait_all`] until every tracked task has exited voluntarily.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared shutdown state
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: RwLock<bool>,
    in_flight: Mutex<usize>,
    drained: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.flag.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the shutdown flag. Returns `true` only for the call that flipped it.
    pub fn initiate_shutdown(&self) -> bool {
        let mut flag = self.flag.write().unwrap_or_else(PoisonError::into_inner);
        if *flag {
            return false;
        }
        *flag = true;
        info!("Shutdown initiated");
        true
    }

    pub fn track_start(&self) {
        *self.lock_in_flight() += 1;
    }

    pub fn track_done(&self) {
        let mut in_flight = self.lock_in_flight();
        match in_flight.checked_sub(1) {
            Some(remaining) => *in_flight = remaining,
            None => warn!("track_done called with no task in flight"),
        }
        if *in_flight == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Number of tracked tasks that have not finished yet
    pub fn in_flight(&self) -> usize {
        *self.lock_in_flight()
    }

    /// Track a task until the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> InFlight {
        self.track_start();
        InFlight {
            shutdown: Arc::clone(self),
        }
    }

    /// Wait until no tracked task is left.
    pub async fn wait_all(&self) {
        loop {
            // Registered before the check so a concurrent track_done is not missed
            let drained = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            drained.await;
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard for one tracked task; calls [`Shutdown::track_done`] on drop.
#[derive(Debug)]
pub struct InFlight {
    shutdown: Arc<Shutdown>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shutdown.track_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_flag_is_one_way() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_shutting_down());

        assert!(shutdown.initiate_shutdown());
        assert!(shutdown.is_shutting_down());

        assert!(!shutdown.initiate_shutdown());
        assert!(shutdown.is_shutting_down());
    }

    #[test]
    fn test_concurrent_initiate_flips_once() {
        let shutdown = Shutdown::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || shutdown.initiate_shutdown())
            })
            .collect();

        let flipped = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&flipped| flipped)
            .count();
        assert_eq!(flipped, 1);
    }

    #[test]
    fn test_tracking() {
        let shutdown = Shutdown::new();
        shutdown.track_start();
        shutdown.track_start();
        assert_eq!(shutdown.in_flight(), 2);

        shutdown.track_done();
        assert_eq!(shutdown.in_flight(), 1);

        {
            let _guard = shutdown.track();
            assert_eq!(shutdown.in_flight(), 2);
        }
        assert_eq!(shutdown.in_flight(), 1);

        shutdown.track_done();
        assert_eq!(shutdown.in_flight(), 0);

        // Unbalanced done does not underflow
        shutdown.track_done();
        assert_eq!(shutdown.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_all_with_nothing_in_flight() {
        let shutdown = Shutdown::new();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait_all())
            .await
            .expect("wait_all should return immediately");
    }

    #[tokio::test]
    async fn test_wait_all_waits_for_every_task() {
        let shutdown = Shutdown::new();
        let mut tasks = Vec::new();

        for i in 0..5u64 {
            let guard = shutdown.track();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20 * (i + 1))).await;
                drop(guard);
            }));
        }
        assert_eq!(shutdown.in_flight(), 5);

        tokio::time::timeout(Duration::from_secs(5), shutdown.wait_all())
            .await
            .expect("wait_all should complete once tasks finish");
        assert_eq!(shutdown.in_flight(), 0);

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_all_blocks_while_in_flight() {
        let shutdown = Shutdown::new();
        let guard = shutdown.track();

        let waited = tokio::time::timeout(Duration::from_millis(50), shutdown.wait_all()).await;
        assert!(waited.is_err());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait_all())
            .await
            .expect("wait_all should complete after the guard drops");
    }
}
