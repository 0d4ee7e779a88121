// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `health.rs`

#[cfg(test)]
mod tests {
    use super::super::*;
    use std::net::SocketAddr;

    fn failing(reason: &'static str) -> Checker {
        Arc::new(move || Err(reason.to_string()))
    }

    /// Start the probe server on an ephemeral port.
    async fn start(probes: &HealthProbes) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let server = probes.clone();
        let server_token = token.clone();
        tokio::spawn(async move { server.serve(listener, server_token).await });
        (addr, token)
    }

    async fn fetch(addr: SocketAddr, path: &str) -> (u16, String) {
        let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        let status = response.status().as_u16();
        (status, response.text().await.unwrap())
    }

    #[test]
    fn test_rejects_empty_and_duplicate_names() {
        let probes = HealthProbes::new();
        assert_eq!(
            probes.add_healthz_check("", ping()),
            Err(HealthError::EmptyName { probe: "healthz" })
        );
        probes.add_readyz_check("readiness", ping()).unwrap();
        assert_eq!(
            probes.add_readyz_check("readiness", ping()),
            Err(HealthError::Duplicate {
                probe: "readyz",
                name: "readiness".to_string()
            })
        );
        // Same name on the other probe is fine
        probes.add_healthz_check("readiness", ping()).unwrap();
        assert_eq!(probes.readyz_checks(), vec!["readiness".to_string()]);
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let probes = HealthProbes::new();
        probes.add_healthz_check("liveness", ping()).unwrap();
        probes.add_readyz_check("readiness", ping()).unwrap();
        let (addr, token) = start(&probes).await;

        assert_eq!(fetch(addr, "/healthz").await, (200, "ok".to_string()));
        assert_eq!(fetch(addr, "/readyz").await, (200, "ok".to_string()));
        token.cancel();
    }

    #[tokio::test]
    async fn test_failing_check_reports_500() {
        let probes = HealthProbes::new();
        probes.add_readyz_check("readiness", ping()).unwrap();
        probes.add_readyz_check("cache", failing("not synced")).unwrap();
        let (addr, token) = start(&probes).await;

        let (status, body) = fetch(addr, "/readyz").await;
        assert_eq!(status, 500);
        assert!(body.contains("[+]readiness ok"));
        assert!(body.contains("[-]cache failed: not synced"));

        // Liveness is unaffected by readiness failures
        assert_eq!(fetch(addr, "/healthz").await.0, 200);
        token.cancel();
    }

    #[tokio::test]
    async fn test_single_check_endpoint() {
        let probes = HealthProbes::new();
        probes.add_readyz_check("readiness", ping()).unwrap();
        probes.add_readyz_check("cache", failing("not synced")).unwrap();
        let (addr, token) = start(&probes).await;

        assert_eq!(fetch(addr, "/readyz/readiness").await.0, 200);
        assert_eq!(fetch(addr, "/readyz/cache").await.0, 500);
        assert_eq!(fetch(addr, "/readyz/missing").await.0, 404);
        token.cancel();
    }

    #[tokio::test]
    async fn test_verbose_report_on_success() {
        let probes = HealthProbes::new();
        probes.add_healthz_check("liveness", ping()).unwrap();
        let (addr, token) = start(&probes).await;

        let (status, body) = fetch(addr, "/healthz?verbose").await;
        assert_eq!(status, 200);
        assert!(body.contains("[+]liveness ok"));
        assert!(body.contains("healthz check passed"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_checks_frozen_after_start() {
        let probes = HealthProbes::new();
        let (_addr, token) = start(&probes).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(probes.has_started());
        assert!(matches!(
            probes.add_healthz_check("late", ping()),
            Err(HealthError::AlreadyStarted { .. })
        ));
        token.cancel();
    }
}
