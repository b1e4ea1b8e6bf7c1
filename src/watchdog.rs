//! Server-idle watchdog.

use std::{future::Future, sync::Mutex, time::Duration};
use tokio::task::JoinHandle;

/// One-shot rearmable timer that tears the transport down when the server
/// stays silent past the configured window.
///
/// `needed` is decided at start time: a transport with inherent keep-alive
/// leaves the timer idle.
pub(crate) struct Watchdog {
    inner: Mutex<WatchdogInner>,
}

#[derive(Default)]
struct WatchdogInner {
    timer: Option<JoinHandle<()>>,
    needed: bool,
    disposed: bool,
}

impl Watchdog {
    pub fn new() -> Self {
        Watchdog {
            inner: Mutex::new(WatchdogInner::default()),
        }
    }

    /// Arms the watchdog for a new session.
    pub fn reset(&self, needed: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.needed = needed;
        inner.disposed = false;
    }

    /// Schedules a fresh one-shot timeout, replacing any armed one. Rearming
    /// after disposal is absorbed silently.
    pub fn rearm<F>(&self, timeout: Duration, on_timeout: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed || !inner.needed {
            return;
        }
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_timeout.await;
        }));
    }

    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disposed = true;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }
}
