//! Cancellable timers driven on the tokio executor.
//!
//! Each advertising instance owns two of these: the periodic RPA rotation
//! timer and the host-side duration timer. Scheduling replaces any pending
//! expiry; dropping an alarm cancels it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Default)]
pub struct Alarm {
    task: Option<JoinHandle<()>>,
}

impl Alarm {
    pub fn new() -> Self {
        Alarm { task: None }
    }

    /// Runs `fire` once after `delay`. Must be called within a tokio
    /// runtime.
    pub fn schedule<F>(&mut self, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        }));
    }

    /// Runs a fresh future from `fire` every `period`, starting one period
    /// from now.
    pub fn schedule_periodic<G, F>(&mut self, period: Duration, mut fire: G)
    where
        G: FnMut() -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                fire().await;
            }
        }));
    }

    /// Cancels the pending expiry, if any.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let count = Arc::new(AtomicU32::new(0));
        let mut alarm = Alarm::new();
        let fired = count.clone();
        alarm.schedule(Duration::from_millis(100), async move {
            fired.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!alarm.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let count = Arc::new(AtomicU32::new(0));
        let mut alarm = Alarm::new();
        let fired = count.clone();
        alarm.schedule(Duration::from_millis(100), async move {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        alarm.cancel();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let count = Arc::new(AtomicU32::new(0));
        let mut alarm = Alarm::new();
        for _ in 0..3 {
            let fired = count.clone();
            alarm.schedule(Duration::from_millis(100), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_fires_repeatedly() {
        let count = Arc::new(AtomicU32::new(0));
        let mut alarm = Alarm::new();
        let fired = count.clone();
        alarm.schedule_periodic(Duration::from_millis(100), move || {
            let fired = fired.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        alarm.cancel();
    }
}
