//! Poll-until-ready gate
//!
//! Readiness is an aggregate of several upstream signals with no ordering
//! guarantee relative to watch delivery, so the gate polls fresh snapshots on
//! a fixed interval rather than reacting to watch events.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::ControlPlane;
use crate::resource::{ResourceRef, TrackedResource};
use crate::{Error, Result};

/// Default time between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Waits for a resource's `Ready` condition to report `True`
pub struct ReadinessGate<'a> {
    control_plane: &'a dyn ControlPlane,
    interval: Duration,
    deadline: Option<Duration>,
}

impl<'a> ReadinessGate<'a> {
    pub fn new(control_plane: &'a dyn ControlPlane) -> Self {
        Self {
            control_plane,
            interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give up after `deadline`. `None` waits indefinitely.
    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Block until `resource` is ready, returning the number of polls made.
    ///
    /// `tick` is called with the poll number after every poll that did not
    /// observe readiness. Read errors are returned immediately.
    pub async fn wait<F>(
        &self,
        resource: &ResourceRef,
        cancel: &CancellationToken,
        mut tick: F,
    ) -> Result<u32>
    where
        F: FnMut(u32) + Send,
    {
        let start = Instant::now();
        let expires = self.deadline.and_then(|limit| start.checked_add(limit));
        let timeout = || Error::Timeout {
            resource: resource.to_string(),
            waited: start.elapsed(),
        };
        let mut polls = 0u32;

        loop {
            polls += 1;
            let obj = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = until(expires) => return Err(timeout()),
                obj = self.control_plane.get(resource) => obj?,
            };
            let snapshot = TrackedResource::from_object(resource.kind, &obj)?;

            if snapshot.status.is_ready() {
                info!(resource = %resource, polls, "resource ready");
                return Ok(polls);
            }

            tick(polls);
            debug!(resource = %resource, polls, "waiting for Ready condition");

            let pause = match expires {
                Some(at) => {
                    let left = at.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(timeout());
                    }
                    self.interval.min(left)
                }
                None => self.interval,
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

/// Resolves at `at`, or never when there is no deadline.
async fn until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::client::MockControlPlane;
    use crate::resource::ResourceKind;
    use crate::watch::tests::snapshot;
    use serde_json::json;

    fn notebook() -> ResourceRef {
        ResourceRef::new(ResourceKind::Notebook, "falcon", "ml")
    }

    fn not_ready() -> kube::api::DynamicObject {
        snapshot(json!({"conditions": [{"type": "Ready", "status": "False"}]}))
    }

    fn ready() -> kube::api::DynamicObject {
        snapshot(json!({"conditions": [{"type": "Ready", "status": "True"}]}))
    }

    /// Control plane that reports ready starting at poll `ready_on`
    fn ready_on(ready_on: u32, calls: Arc<AtomicU32>) -> MockControlPlane {
        let mut mock = MockControlPlane::new();
        mock.expect_get().returning(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= ready_on {
                Ok(ready())
            } else {
                Ok(not_ready())
            }
        });
        mock
    }

    #[tokio::test(start_paused = true)]
    async fn returns_after_exactly_three_polls() {
        let calls = Arc::new(AtomicU32::new(0));
        let mock = ready_on(3, calls.clone());
        let mut ticks = Vec::new();

        let polls = ReadinessGate::new(&mock)
            .wait(&notebook(), &CancellationToken::new(), |n| ticks.push(n))
            .await
            .expect("should become ready");

        assert_eq!(polls, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ticks, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_within_one_interval_of_deadline() {
        let mut mock = MockControlPlane::new();
        mock.expect_get().returning(|_| Ok(not_ready()));
        let deadline = Duration::from_secs(5);
        let interval = Duration::from_secs(1);

        let start = Instant::now();
        let err = ReadinessGate::new(&mock)
            .interval(interval)
            .deadline(Some(deadline))
            .wait(&notebook(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() <= deadline + interval);
    }

    #[tokio::test(start_paused = true)]
    async fn final_sleep_is_capped_at_deadline() {
        let mut mock = MockControlPlane::new();
        mock.expect_get().returning(|_| Ok(not_ready()));
        let deadline = Duration::from_secs(5);

        let start = Instant::now();
        let err = ReadinessGate::new(&mock)
            .interval(Duration::from_secs(60))
            .deadline(Some(deadline))
            .wait(&notebook(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() <= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_status_never_ready() {
        let mut mock = MockControlPlane::new();
        mock.expect_get().returning(|_| Ok(snapshot(json!(null))));

        let err = ReadinessGate::new(&mock)
            .deadline(Some(Duration::from_secs(3)))
            .wait(&notebook(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn read_error_propagates_without_retry() {
        let mut mock = MockControlPlane::new();
        mock.expect_get().times(1).returning(|r| {
            Err(Error::NotFound {
                resource: r.to_string(),
            })
        });

        let err = ReadinessGate::new(&mock)
            .wait(&notebook(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let mut mock = MockControlPlane::new();
        mock.expect_get().returning(|_| Ok(not_ready()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let err = ReadinessGate::new(&mock)
            .interval(Duration::from_secs(3600))
            .wait(&notebook(), &cancel, move |_| trigger.cancel())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    /// Control plane whose reads never answer
    struct Unresponsive;

    #[async_trait::async_trait]
    impl ControlPlane for Unresponsive {
        async fn create(
            &self,
            _resource: &ResourceRef,
            _obj: &kube::api::DynamicObject,
        ) -> Result<kube::api::DynamicObject> {
            Err(Error::command_failed("create not expected"))
        }

        async fn get(&self, _resource: &ResourceRef) -> Result<kube::api::DynamicObject> {
            std::future::pending().await
        }

        async fn patch_spec(
            &self,
            _resource: &ResourceRef,
            _patch: &serde_json::Value,
        ) -> Result<kube::api::DynamicObject> {
            Err(Error::command_failed("patch not expected"))
        }

        async fn watch(&self, _resource: &ResourceRef) -> Result<crate::client::WatchStream> {
            Err(Error::command_failed("watch not expected"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_hung_read() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            ReadinessGate::new(&Unresponsive).wait(&notebook(), &cancel, |_| {}),
        )
        .await
        .expect("wait should return promptly after cancel")
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_hung_read() {
        let deadline = Duration::from_secs(3);
        let start = Instant::now();

        let err = ReadinessGate::new(&Unresponsive)
            .deadline(Some(deadline))
            .wait(&notebook(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() <= deadline);
    }
}
