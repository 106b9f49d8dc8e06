//! TCP readiness probe for services inside sandbox containers
//!
//! A lesson container counts as ready once its service port accepts
//! connections. The probe retries a bounded number of times, each attempt
//! with its own timeout, and never runs past the overall budget.

use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ReadinessConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadinessStatus {
    Ready {
        attempts: u32,
    },
    NotReady {
        attempts: u32,
        #[serde(rename = "lastError")]
        last_error: String,
    },
}

impl ReadinessStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    attempts: u32,
    interval: Duration,
    attempt_timeout: Duration,
    budget: Duration,
}

impl ReadinessProbe {
    pub fn new(config: &ReadinessConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            interval: config.interval(),
            attempt_timeout: config.attempt_timeout(),
            budget: config.budget(),
        }
    }

    /// Try to open a TCP connection to `addr` until one succeeds or the budget runs out
    pub async fn check(&self, addr: &str) -> ReadinessStatus {
        let deadline = Instant::now() + self.budget;
        let mut last_error = String::from("probe budget exhausted before the first attempt");
        let mut attempts = 0;

        while attempts < self.attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;

            let wait = self.attempt_timeout.min(remaining);
            match tokio::time::timeout(wait, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => {
                    debug!(addr = %addr, attempts, "Endpoint accepts connections");
                    return ReadinessStatus::Ready { attempts };
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("connect timed out after {:?}", wait),
            }
            debug!(addr = %addr, attempt = attempts, error = %last_error, "Endpoint not ready");

            if attempts < self.attempts {
                let pause = self
                    .interval
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::time::sleep(pause).await;
            }
        }

        ReadinessStatus::NotReady {
            attempts,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    fn fast_config() -> ReadinessConfig {
        ReadinessConfig {
            attempts: 3,
            interval_ms: 10,
            attempt_timeout_ms: 200,
            budget_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_listening_port_is_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let status = ReadinessProbe::new(&fast_config()).check(&addr).await;
        assert_eq!(status, ReadinessStatus::Ready { attempts: 1 });
    }

    #[tokio::test]
    async fn test_closed_port_uses_every_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let status = ReadinessProbe::new(&fast_config()).check(&addr).await;
        match status {
            ReadinessStatus::NotReady {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(!last_error.is_empty());
            }
            other => panic!("expected not ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_budget_caps_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ReadinessConfig {
            attempts: 1000,
            interval_ms: 50,
            attempt_timeout_ms: 50,
            budget_ms: 200,
        };
        let started = std::time::Instant::now();
        let status = ReadinessProbe::new(&config).check(&addr).await;

        assert!(!status.is_ready());
        assert!(started.elapsed() < Duration::from_secs(1));
        if let ReadinessStatus::NotReady { attempts, .. } = status {
            assert!(attempts < 1000);
        }
    }

    #[test]
    fn test_status_serialization() {
        let status = ReadinessStatus::NotReady {
            attempts: 2,
            last_error: "refused".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({"status": "not_ready", "attempts": 2, "lastError": "refused"})
        );
    }
}
