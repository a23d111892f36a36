//! Debounced service watcher
//!
//! `docker compose up` starts and stops containers in bursts. Every raw
//! event pushes a single deadline forward; only when the deadline passes
//! is the full service list queried again and handed to the callback.

use std::time::Duration;

use futures::StreamExt;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use pv_core::types::ContainerService;

use super::{ContainerSource, WatchError};

/// Quiet period after the last event before services are recomputed
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Emits settled service snapshots for one compose project
pub struct ServiceWatcher<S> {
    source: S,
    debounce: Duration,
}

impl<S: ContainerSource> ServiceWatcher<S> {
    pub fn new(source: S, debounce: Duration) -> Self {
        Self { source, debounce }
    }

    /// Report an initial snapshot immediately, then one snapshot per settled
    /// burst of events, until cancelled or the event stream fails.
    pub async fn run<F>(&self, mut on_change: F, cancel: CancellationToken) -> Result<(), WatchError>
    where
        F: FnMut(Vec<ContainerService>),
    {
        // Subscribe first so events during the initial listing are not lost
        let mut events = self.source.events();

        let initial = self.source.list_services().await?;
        tracing::info!("Initial services: {}", describe(&initial));
        on_change(initial);

        let mut deadline: Option<Instant> = None;

        loop {
            let settle = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Service watcher stopped");
                    return Ok(());
                }
                event = events.next() => match event {
                    Some(Ok(())) => deadline = Some(Instant::now() + self.debounce),
                    Some(Err(e)) => return Err(e),
                    None => return Err(WatchError::EventsEnded),
                },
                _ = settle => {
                    deadline = None;
                    match self.source.list_services().await {
                        Ok(services) => {
                            tracing::info!("Services changed: {}", describe(&services));
                            on_change(services);
                        }
                        Err(e) => tracing::warn!("Failed to list services: {}", e),
                    }
                }
            }
        }
    }
}

fn describe(services: &[ContainerService]) -> String {
    if services.is_empty() {
        return "none".to_string();
    }
    services
        .iter()
        .map(|s| format!("{}{:?}", s.name, s.ports))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use tokio::sync::mpsc;

    use pv_protocol::AccessLevel;

    struct FakeSource {
        lists: AtomicUsize,
        events: Mutex<Option<mpsc::UnboundedReceiver<Result<(), WatchError>>>>,
    }

    impl FakeSource {
        fn new() -> (Self, mpsc::UnboundedSender<Result<(), WatchError>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    lists: AtomicUsize::new(0),
                    events: Mutex::new(Some(rx)),
                },
                tx,
            )
        }
    }

    #[async_trait]
    impl ContainerSource for FakeSource {
        async fn list_services(&self) -> Result<Vec<ContainerService>, WatchError> {
            let n = self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ContainerService {
                name: format!("web{}", n),
                project: "demo".to_string(),
                ports: vec![80],
                access: AccessLevel::Public,
                host: "web".to_string(),
            }])
        }

        fn events(&self) -> BoxStream<'_, Result<(), WatchError>> {
            let rx = self.events.lock().unwrap().take().expect("events taken twice");
            futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_watcher(
        source: FakeSource,
    ) -> (
        Arc<Mutex<Vec<Vec<ContainerService>>>>,
        CancellationToken,
        tokio::task::JoinHandle<Result<(), WatchError>>,
    ) {
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let handle = {
            let snapshots = Arc::clone(&snapshots);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                ServiceWatcher::new(source, DEFAULT_DEBOUNCE)
                    .run(move |s| snapshots.lock().unwrap().push(s), cancel)
                    .await
            })
        };
        (snapshots, cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_snapshot_is_immediate() {
        let (source, _tx) = FakeSource::new();
        let (snapshots, cancel, handle) = spawn_watcher(source);

        settle().await;
        assert_eq!(snapshots.lock().unwrap().len(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_produces_one_callback() {
        let (source, tx) = FakeSource::new();
        let (snapshots, cancel, handle) = spawn_watcher(source);
        settle().await;

        for _ in 0..5 {
            tx.send(Ok(())).unwrap();
            settle().await;
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        settle().await;
        assert_eq!(snapshots.lock().unwrap().len(), 1);

        tokio::time::advance(DEFAULT_DEBOUNCE).await;
        settle().await;

        let snapshots_now = snapshots.lock().unwrap().clone();
        assert_eq!(snapshots_now.len(), 2);
        // Recomputed from a fresh listing, not from the events
        assert_eq!(snapshots_now[1][0].name, "web1");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_events_each_produce_callback() {
        let (source, tx) = FakeSource::new();
        let (snapshots, cancel, handle) = spawn_watcher(source);
        settle().await;

        for _ in 0..3 {
            tx.send(Ok(())).unwrap();
            settle().await;
            tokio::time::advance(DEFAULT_DEBOUNCE + Duration::from_millis(50)).await;
            settle().await;
        }

        assert_eq!(snapshots.lock().unwrap().len(), 4);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_is_an_error() {
        let (source, tx) = FakeSource::new();
        let (_snapshots, _cancel, handle) = spawn_watcher(source);
        settle().await;

        drop(tx);
        assert!(matches!(
            handle.await.unwrap(),
            Err(WatchError::EventsEnded)
        ));
    }
}
