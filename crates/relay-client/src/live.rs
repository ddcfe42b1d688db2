//! A value kept fresh by the event stream, with polling as the fallback.
//!
//! While the stream client is open the resource refetches only when a
//! matching event arrives, bypassing the coordinator cache and any fetch
//! already in flight from before the event, so the refetch observes the
//! change. While the stream is down it polls on a fixed interval
//! through the coordinator, cache allowed. A fetch error keeps the previous
//! value.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_core::EventFilter;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ClientState, StreamClient};
use crate::coordinator::RequestCoordinator;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct LiveResourceConfig {
    /// Coordinator key shared by every fetch of this resource.
    pub key: String,
    /// Events that make the current value stale.
    pub filter: EventFilter,
    pub poll_interval: Duration,
}

impl LiveResourceConfig {
    pub fn new(key: impl Into<String>, filter: EventFilter) -> Self {
        Self {
            key: key.into(),
            filter,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to a background refresher. Dropping it stops refreshing.
pub struct LiveResource<T> {
    key: String,
    value: watch::Receiver<Option<T>>,
    cancel: CancellationToken,
}

impl<T> LiveResource<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start refreshing. The first fetch runs immediately.
    pub fn spawn<E, F, Fut>(
        client: &StreamClient,
        coordinator: Arc<RequestCoordinator<T, E>>,
        config: LiveResourceConfig,
        fetch: F,
    ) -> Self
    where
        E: Clone + Display + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, value) = watch::channel(None);
        let cancel = CancellationToken::new();
        let key = config.key.clone();
        let refresher = Refresher {
            coordinator,
            config,
            fetch,
            tx,
        };
        let _ = tokio::spawn(refresher.run(client.status(), client.subscribe(), cancel.clone()));
        Self { key, value, cancel }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest successfully fetched value.
    pub fn current(&self) -> Option<T> {
        self.value.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.value.clone()
    }

    /// Wait for the next successful fetch. `None` once the refresher stopped.
    pub async fn changed(&mut self) -> Option<T> {
        self.value.changed().await.ok()?;
        self.value.borrow_and_update().clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for LiveResource<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Refresher<T, E, F> {
    coordinator: Arc<RequestCoordinator<T, E>>,
    config: LiveResourceConfig,
    fetch: F,
    tx: watch::Sender<Option<T>>,
}

impl<T, E, F, Fut> Refresher<T, E, F>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Display + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    async fn run(
        self,
        mut status: watch::Receiver<ClientState>,
        mut events: broadcast::Receiver<relay_core::Event>,
        cancel: CancellationToken,
    ) {
        self.refresh(true, None).await;

        let period = self.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_live = true;
        let mut events_live = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = status.changed(), if status_live => {
                    if changed.is_err() {
                        status_live = false;
                        continue;
                    }
                    let reopened = status.borrow_and_update().is_open();
                    if reopened {
                        debug!(key = %self.config.key, "stream open, catching up");
                        self.refresh(false, Some(Instant::now())).await;
                    }
                }
                received = events.recv(), if events_live => match received {
                    Ok(event) => {
                        if self.config.filter.matches(&event) {
                            debug!(key = %self.config.key, event_type = %event.event_type, "refresh on event");
                            self.refresh(false, Some(Instant::now())).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(key = %self.config.key, skipped, "event receiver lagged, refreshing");
                        self.refresh(false, Some(Instant::now())).await;
                    }
                    Err(RecvError::Closed) => events_live = false,
                },
                _ = ticker.tick() => {
                    let open = status.borrow().is_open();
                    if !open {
                        self.refresh(true, None).await;
                    }
                }
            }
        }
        debug!(key = %self.config.key, "live resource stopped");
    }

    /// Fetch through the coordinator. With `changed_at`, nothing started
    /// before that instant is reused.
    async fn refresh(&self, use_cache: bool, changed_at: Option<Instant>) {
        let fetch = &self.fetch;
        let key = &self.config.key;
        let result = match changed_at {
            Some(at) => {
                self.coordinator
                    .deduplicate_since(key, || fetch(), use_cache, at)
                    .await
            }
            None => self.coordinator.deduplicate(key, || fetch(), use_cache).await,
        };
        match result {
            Ok(value) => {
                let _ = self.tx.send_replace(Some(value));
            }
            Err(err) => {
                warn!(key = %self.config.key, error = %err, "refresh failed, keeping previous value");
            }
        }
    }
}
