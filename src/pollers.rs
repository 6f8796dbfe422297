//! Periodic background tasks.
//!
//! A [`Poller`] runs an async callback on a tunable cadence. The delay
//! can be tightened temporarily (e.g. while waiting for a status bit)
//! and restored afterwards; changing it interrupts the current wait.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub type PollCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct PollerInner {
    name: String,
    default_delay: Duration,
    delay_tx: watch::Sender<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
    callback: PollCallback,
}

#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    pub fn new<F, Fut>(name: impl Into<String>, delay: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: PollCallback = Arc::new(move || {
            let fut: BoxFuture<'static, ()> = Box::pin(callback());
            fut
        });

        let (delay_tx, _) = watch::channel(delay);

        Self {
            inner: Arc::new(PollerInner {
                name: name.into(),
                default_delay: delay,
                delay_tx,
                task: Mutex::new(None),
                callback,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn running(&self) -> bool {
        self.inner
            .task
            .lock()
            .expect("poller task lock")
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn start(&self) {
        if self.running() {
            return;
        }

        debug!(poller = %self.inner.name, "starting poller");

        let callback = Arc::clone(&self.inner.callback);
        let mut delay_rx = self.inner.delay_tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                callback().await;

                let delay = *delay_rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    // A delay change takes effect immediately.
                    _ = delay_rx.changed() => {}
                }
            }
        });

        *self.inner.task.lock().expect("poller task lock") = Some(task);
    }

    pub async fn stop(&self) {
        let task = self.inner.task.lock().expect("poller task lock").take();
        if let Some(task) = task {
            debug!(poller = %self.inner.name, "stopping poller");
            task.abort();
            let _ = task.await;
        }
    }

    /// Changes the polling cadence; `None` restores the default.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.inner
            .delay_tx
            .send_replace(delay.unwrap_or(self.inner.default_delay));
    }
}

/// The supervisor's status and position pollers, handled as a unit.
#[derive(Clone, Default)]
pub struct PollerList {
    pollers: Vec<Poller>,
}

impl PollerList {
    pub fn new(pollers: Vec<Poller>) -> Self {
        Self { pollers }
    }

    pub fn running(&self) -> bool {
        self.pollers.iter().any(|poller| poller.running())
    }

    pub fn start(&self) {
        for poller in &self.pollers {
            poller.start();
        }
    }

    pub async fn stop(&self) {
        for poller in &self.pollers {
            poller.stop().await;
        }
    }

    pub fn get(&self, name: &str) -> Option<&Poller> {
        self.pollers.iter().find(|poller| poller.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn polls_on_cadence_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let poller = Poller::new("status", Duration::from_secs(5), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        poller.start();
        assert!(poller.running());

        tokio::time::sleep(Duration::from_secs(16)).await;
        let seen = count.load(Ordering::SeqCst);
        assert!((3..=4).contains(&seen), "polled {seen} times");

        poller.stop().await;
        assert!(!poller.running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_change_takes_effect() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let poller = Poller::new("position", Duration::from_secs(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        poller.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        poller.set_delay(Some(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(count.load(Ordering::SeqCst) >= 4);

        poller.stop().await;
    }
}
