// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `leader.rs`

#[cfg(test)]
mod tests {
    use super::super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::timeout;

    /// In-memory lock: granted while `available` is set.
    #[derive(Default)]
    struct FakeLock {
        available: AtomicBool,
        fail: AtomicBool,
        attempts: AtomicUsize,
        releases: AtomicUsize,
    }

    impl FakeLock {
        fn new(available: bool) -> Arc<Self> {
            let lock = Self::default();
            lock.available.store(available, Ordering::SeqCst);
            Arc::new(lock)
        }
    }

    #[async_trait]
    impl LeaseLock for FakeLock {
        async fn try_acquire_or_renew(
            &self,
            _identity: &str,
            _lease_duration: Duration,
        ) -> Result<bool, LeaseError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(LeaseError::InvalidDuration(Duration::ZERO));
            }
            Ok(self.available.load(Ordering::SeqCst))
        }

        async fn release(&self, _identity: &str) -> Result<(), LeaseError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn describe(&self) -> String {
            "test/lease".to_string()
        }
    }

    fn config() -> LeaderElectionConfig {
        LeaderElectionConfig {
            id: "argo-events-controller".to_string(),
            namespace: "argo-events".to_string(),
            identity: "pod-a".to_string(),
            lease_duration: Duration::from_millis(300),
            renew_deadline: Duration::from_millis(100),
            retry_period: Duration::from_millis(20),
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<LeaderState>, state: LeaderState) {
        timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .expect("elector dropped");
    }

    fn spec(holder: Option<&str>, renewed: Timestamp, seconds: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            renew_time: Some(MicroTime(renewed)),
            lease_duration_seconds: Some(seconds),
            lease_transitions: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_timing_warnings() {
        assert!(config().timing_warnings().is_empty());

        let mut inverted = config();
        inverted.renew_deadline = Duration::from_secs(20);
        inverted.retry_period = Duration::from_secs(30);
        assert_eq!(inverted.timing_warnings().len(), 2);
    }

    #[test]
    fn test_lease_expiry() {
        let now = Timestamp::now();
        assert!(!lease_expired(&spec(Some("pod-b"), now, 15), now));
        assert!(lease_expired(
            &spec(Some("pod-b"), now.checked_sub(SignedDuration::from_secs(16)).unwrap(), 15),
            now
        ));
        // Released leases are free immediately
        assert!(lease_expired(&spec(None, now, 15), now));
        assert!(lease_expired(&spec(Some(""), now, 15), now));
    }

    #[test]
    fn test_next_spec_creates_new_lease() {
        let now = Timestamp::now();
        let next = next_lease_spec(None, "pod-a", Duration::from_secs(15), now)
            .unwrap()
            .unwrap();
        assert_eq!(next.holder_identity.as_deref(), Some("pod-a"));
        assert_eq!(next.lease_duration_seconds, Some(15));
        assert_eq!(next.lease_transitions, Some(0));
    }

    #[test]
    fn test_next_spec_renews_own_lease() {
        let now = Timestamp::now();
        let current = spec(Some("pod-a"), now.checked_sub(SignedDuration::from_secs(5)).unwrap(), 15);
        let next = next_lease_spec(Some(&current), "pod-a", Duration::from_secs(15), now)
            .unwrap()
            .unwrap();
        assert_eq!(next.renew_time, Some(MicroTime(now)));
        assert_eq!(next.lease_transitions, Some(2));
    }

    #[test]
    fn test_next_spec_respects_valid_foreign_claim() {
        let now = Timestamp::now();
        let current = spec(Some("pod-b"), now, 15);
        assert!(next_lease_spec(Some(&current), "pod-a", Duration::from_secs(15), now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_next_spec_takes_over_expired_claim() {
        let now = Timestamp::now();
        let current = spec(Some("pod-b"), now.checked_sub(SignedDuration::from_secs(60)).unwrap(), 15);
        let next = next_lease_spec(Some(&current), "pod-a", Duration::from_secs(15), now)
            .unwrap()
            .unwrap();
        assert_eq!(next.holder_identity.as_deref(), Some("pod-a"));
        assert_eq!(next.acquire_time, Some(MicroTime(now)));
        assert_eq!(next.lease_transitions, Some(3));
    }

    #[tokio::test]
    async fn test_acquires_leadership_when_free() {
        let lock = FakeLock::new(true);
        let elector = Arc::new(LeaderElector::new(config(), lock.clone()));
        let mut rx = elector.subscribe();
        assert_eq!(elector.state(), LeaderState::Standby);

        let token = CancellationToken::new();
        let task = {
            let elector = Arc::clone(&elector);
            let token = token.clone();
            tokio::spawn(async move { elector.run(token).await })
        };

        wait_for(&mut rx, LeaderState::Leading).await;
        assert!(elector.state().is_leading());

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(elector.state(), LeaderState::Standby);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stays_acquiring_while_lease_is_held() {
        let lock = FakeLock::new(false);
        let elector = Arc::new(LeaderElector::new(config(), lock.clone()));
        let token = CancellationToken::new();
        let task = {
            let elector = Arc::clone(&elector);
            let token = token.clone();
            tokio::spawn(async move { elector.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(elector.state(), LeaderState::Acquiring);
        assert!(lock.attempts.load(Ordering::SeqCst) >= 2);

        // Becomes leader once the other holder lets go
        let mut rx = elector.subscribe();
        lock.available.store(true, Ordering::SeqCst);
        wait_for(&mut rx, LeaderState::Leading).await;

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_acquiring_does_not_release() {
        let lock = FakeLock::new(false);
        let elector = LeaderElector::new(config(), lock.clone());
        let token = CancellationToken::new();
        token.cancel();

        timeout(Duration::from_secs(2), elector.run(token)).await.unwrap();
        assert_eq!(elector.state(), LeaderState::Standby);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loses_leadership_when_renewals_fail() {
        let lock = FakeLock::new(true);
        let elector = Arc::new(LeaderElector::new(config(), lock.clone()));
        let mut rx = elector.subscribe();
        let token = CancellationToken::new();
        let task = {
            let elector = Arc::clone(&elector);
            let token = token.clone();
            tokio::spawn(async move { elector.run(token).await })
        };
        wait_for(&mut rx, LeaderState::Leading).await;

        // Renewals error out: leadership lapses after the renew deadline
        lock.fail.store(true, Ordering::SeqCst);
        wait_for(&mut rx, LeaderState::Acquiring).await;
        assert!(!elector.state().is_leading());

        // And is reacquired once the API recovers, without a restart
        lock.fail.store(false, Ordering::SeqCst);
        wait_for(&mut rx, LeaderState::Leading).await;

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_loses_leadership_when_taken_over() {
        let lock = FakeLock::new(true);
        let elector = Arc::new(LeaderElector::new(config(), lock.clone()));
        let mut rx = elector.subscribe();
        let token = CancellationToken::new();
        let task = {
            let elector = Arc::clone(&elector);
            let token = token.clone();
            tokio::spawn(async move { elector.run(token).await })
        };
        wait_for(&mut rx, LeaderState::Leading).await;

        lock.available.store(false, Ordering::SeqCst);
        wait_for(&mut rx, LeaderState::Acquiring).await;

        token.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
