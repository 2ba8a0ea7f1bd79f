//! Health checking for backend processes

use std::time::Duration;
use tracing::{debug, warn};

/// HTTP health checker for backend servers
pub struct HealthChecker {
    client: reqwest::Client,
    health_path: String,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(health_path: impl Into<String>, timeout_secs: u64) -> Self {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to a default HTTP client for health checks");
                reqwest::Client::new()
            });

        Self {
            client,
            health_path: health_path.into(),
            timeout,
        }
    }

    /// Probe URL for a backend listening on `ip:port`
    pub fn url(&self, ip: &str, port: u16) -> String {
        format!("http://{}:{}{}", ip, port, self.health_path)
    }

    /// Check the health of a backend
    pub async fn check(&self, ip: &str, port: u16) -> bool {
        let url = self.url(ip, port);

        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if healthy {
                    debug!(endpoint = %url, "Health check passed");
                } else {
                    debug!(
                        endpoint = %url,
                        status = %response.status(),
                        "Health check failed"
                    );
                }
                healthy
            }
            Err(e) => {
                debug!(endpoint = %url, error = %e, "Health check error");
                false
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new("/health", 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_checker_creation() {
        let checker = HealthChecker::new("/health", 10);
        assert_eq!(checker.timeout(), Duration::from_secs(10));
        assert_eq!(checker.url("10.0.0.1", 40000), "http://10.0.0.1:40000/health");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unhealthy() {
        // port 9 (discard) on loopback is never an HTTP server
        let checker = HealthChecker::new("/health", 1);
        assert!(!checker.check("127.0.0.1", 9).await);
    }
}
