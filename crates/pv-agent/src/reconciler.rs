//! Tunnel reconciliation
//!
//! Each service snapshot immediately starts an update on the tunnel
//! session. Updates are not queued here and their tasks may run in any
//! order. Every update carries a generation taken when the snapshot
//! arrives. The session refuses a generation older than one it already
//! applied, and only the latest generation may become the current state.
//!
//! A failed update becomes the current state and is not retried here. The
//! next service snapshot from the watcher starts a new update.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use pv_core::error::SessionError;
use pv_core::traits::TunnelSession;
use pv_core::types::{ContainerService, TunnelResult};

/// State of the latest requested tunnel set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// An update is in flight
    Pending,
    /// The latest update succeeded
    Ready(TunnelResult),
    /// The latest update failed
    Failed(String),
}

#[derive(Debug, Clone)]
struct Current {
    generation: u64,
    state: TunnelState,
}

/// Drives the tunnel session from service snapshots
pub struct TunnelReconciler<S> {
    session: Arc<S>,
    generation: Arc<AtomicU64>,
    current: Arc<watch::Sender<Current>>,
}

impl<S: TunnelSession + 'static> TunnelReconciler<S> {
    pub fn new(session: Arc<S>) -> Self {
        let (tx, _) = watch::channel(Current {
            generation: 0,
            state: TunnelState::Pending,
        });
        Self {
            session,
            generation: Arc::new(AtomicU64::new(0)),
            current: Arc::new(tx),
        }
    }

    /// Start an update for `services`, superseding any update in flight
    pub fn on_services_changed(&self, services: Vec<ContainerService>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.current.send_replace(Current {
            generation,
            state: TunnelState::Pending,
        });

        let session = Arc::clone(&self.session);
        let current = Arc::clone(&self.current);

        tokio::spawn(async move {
            let state = match session.update_tunnels(generation, &services).await {
                Ok(result) => TunnelState::Ready(result),
                Err(SessionError::Superseded { latest, .. }) => {
                    tracing::debug!(
                        "Tunnel update {} skipped, update {} already applied",
                        generation,
                        latest
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!("Tunnel update {} failed: {}", generation, e);
                    TunnelState::Failed(e.to_string())
                }
            };

            current.send_if_modified(|cur| {
                if cur.generation != generation {
                    tracing::debug!(
                        "Discarding result of tunnel update {} (latest is {})",
                        generation,
                        cur.generation
                    );
                    return false;
                }
                cur.state = state;
                true
            });
        });
    }

    /// Read handle on the current state
    pub fn reader(&self) -> TunnelStateReader {
        TunnelStateReader {
            rx: self.current.subscribe(),
        }
    }
}

/// Cloneable read side of the reconciler state
#[derive(Debug, Clone)]
pub struct TunnelStateReader {
    rx: watch::Receiver<Current>,
}

impl TunnelStateReader {
    /// State right now, possibly [`TunnelState::Pending`]
    pub fn peek(&self) -> TunnelState {
        self.rx.borrow().state.clone()
    }

    /// Wait until the latest update settles and return its outcome
    pub async fn current(&self) -> TunnelState {
        let mut rx = self.rx.clone();
        let state = match rx
            .wait_for(|cur| !matches!(cur.state, TunnelState::Pending))
            .await
        {
            Ok(cur) => cur.state.clone(),
            Err(_) => TunnelState::Failed("reconciler stopped".to_string()),
        };
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use pv_core::types::{Tunnel, TunnelRequest};
    use pv_protocol::AccessLevel;

    use crate::ssh::forwards::{AppliedForwards, ForwardTable, Forwarder};

    /// Answers after a per-service delay, echoing the first service name
    struct SlowSession {
        delays: HashMap<String, Duration>,
        fail: Vec<String>,
    }

    #[async_trait]
    impl TunnelSession for SlowSession {
        async fn update_tunnels(
            &self,
            _generation: u64,
            services: &[ContainerService],
        ) -> Result<TunnelResult, SessionError> {
            let name = services[0].name.clone();
            tokio::time::sleep(self.delays[&name]).await;
            if self.fail.contains(&name) {
                return Err(SessionError::Forward {
                    name,
                    reason: "rejected".to_string(),
                });
            }
            Ok(TunnelResult {
                client_id: None,
                tunnels: vec![Tunnel {
                    project: "demo".to_string(),
                    service: name,
                    ports: BTreeMap::from([(80, vec!["https://x.example".to_string()])]),
                }],
            })
        }
    }

    fn services(name: &str) -> Vec<ContainerService> {
        vec![ContainerService {
            name: name.to_string(),
            project: "demo".to_string(),
            ports: vec![80],
            access: AccessLevel::Public,
            host: name.to_string(),
        }]
    }

    fn reconciler(delays: &[(&str, u64)], fail: &[&str]) -> TunnelReconciler<SlowSession> {
        TunnelReconciler::new(Arc::new(SlowSession {
            delays: delays
                .iter()
                .map(|(n, ms)| (n.to_string(), Duration::from_millis(*ms)))
                .collect(),
            fail: fail.iter().map(|s| s.to_string()).collect(),
        }))
    }

    fn service_of(state: TunnelState) -> String {
        match state {
            TunnelState::Ready(result) => result.tunnels[0].service.clone(),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_wins_when_earlier_finishes_last() {
        let reconciler = reconciler(&[("u1", 100), ("u2", 10)], &[]);
        let reader = reconciler.reader();

        reconciler.on_services_changed(services("u1"));
        reconciler.on_services_changed(services("u2"));

        assert_eq!(service_of(reader.current().await), "u2");

        // Let u1 finish too; it must not replace u2
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service_of(reader.peek()), "u2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_wins_when_earlier_finishes_first() {
        let reconciler = reconciler(&[("u1", 10), ("u2", 100)], &[]);
        let reader = reconciler.reader();

        reconciler.on_services_changed(services("u1"));
        reconciler.on_services_changed(services("u2"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        // u1 is done but superseded; still waiting for u2
        assert_eq!(reader.peek(), TunnelState::Pending);

        assert_eq!(service_of(reader.current().await), "u2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_is_reported_until_next_change() {
        let reconciler = reconciler(&[("bad", 10), ("good", 10)], &["bad"]);
        let reader = reconciler.reader();

        reconciler.on_services_changed(services("bad"));
        assert!(matches!(reader.current().await, TunnelState::Failed(_)));

        reconciler.on_services_changed(services("good"));
        assert_eq!(service_of(reader.current().await), "good");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_does_not_override() {
        let reconciler = reconciler(&[("bad", 100), ("good", 10)], &["bad"]);
        let reader = reconciler.reader();

        reconciler.on_services_changed(services("bad"));
        reconciler.on_services_changed(services("good"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service_of(reader.peek()), "good");
    }

    struct AcceptAll;

    #[async_trait]
    impl Forwarder for AcceptAll {
        async fn request(&self, _bind: &str) -> Result<(), String> {
            tokio::task::yield_now().await;
            Ok(())
        }

        async fn cancel(&self, _bind: &str) -> Result<(), String> {
            Ok(())
        }
    }

    /// Applies forwards the way the SSH session does, against a fake server
    #[derive(Default)]
    struct ForwardingSession {
        applied: tokio::sync::Mutex<AppliedForwards>,
        table: ForwardTable,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl TunnelSession for ForwardingSession {
        async fn update_tunnels(
            &self,
            generation: u64,
            services: &[ContainerService],
        ) -> Result<TunnelResult, SessionError> {
            let desired = TunnelRequest::from_services(services).forwards("env");
            let outcome = async {
                let mut applied = self.applied.lock().await;
                applied.claim(generation)?;
                applied.apply(&desired, &AcceptAll, &self.table).await
            }
            .await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            outcome?;

            Ok(TunnelResult {
                client_id: None,
                tunnels: services
                    .iter()
                    .map(|s| Tunnel {
                        project: s.project.clone(),
                        service: s.name.clone(),
                        ports: BTreeMap::new(),
                    })
                    .collect(),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_ends_with_last_requested_set() {
        const UPDATES: usize = 8;

        for _ in 0..50 {
            let session = Arc::new(ForwardingSession::default());
            let reconciler = TunnelReconciler::new(Arc::clone(&session));
            let reader = reconciler.reader();

            for i in 0..UPDATES {
                reconciler.on_services_changed(services(&format!("svc{}", i)));
            }
            while session.finished.load(Ordering::SeqCst) < UPDATES {
                tokio::task::yield_now().await;
            }

            let last = services(&format!("svc{}", UPDATES - 1));
            let expected = TunnelRequest::from_services(&last).forwards("env");
            let applied = session.applied.lock().await;
            assert_eq!(applied.targets(), &expected);
            let table: Vec<String> = session.table.iter().map(|e| e.key().clone()).collect();
            assert_eq!(table, expected.keys().cloned().collect::<Vec<_>>());

            let state = reader.current().await;
            assert!(
                matches!(&state, TunnelState::Ready(r) if r.tunnels[0].service == last[0].name),
                "unexpected state {:?}",
                state
            );
        }
    }
}
