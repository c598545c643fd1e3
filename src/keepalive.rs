//! Health checks against `/ping`.
//!
//! AVS expects a ping on an established connection roughly every five
//! minutes. A failed ping is only reported; it never tears down the
//! downchannel on its own.

use crate::auth::TokenSource;
use crate::config::ConfigError;
use crate::error::{ProtocolError, Result};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One ping. Only `204 No Content` counts as success.
pub async fn ping(http: &Client, url: &str, token: &str) -> Result<()> {
    let response = http.get(url).bearer_auth(token).send().await?;
    let status = response.status();
    log::debug!("Ping status code: {}", status.as_u16());

    if status == StatusCode::NO_CONTENT {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedStatus(status.as_u16()).into())
    }
}

/// Periodic ping, started once the downchannel is open
pub struct KeepaliveScheduler {
    http: Client,
    url: String,
    tokens: Arc<dyn TokenSource>,
    period: Duration,
}

impl KeepaliveScheduler {
    pub fn new(http: Client, url: String, tokens: Arc<dyn TokenSource>, period: Duration) -> Self {
        Self {
            http,
            url,
            tokens,
            period,
        }
    }

    /// Ping every `period` until `cancel` fires. The first ping goes out one
    /// period after start; each result goes to `on_result`. A period that
    /// cannot be scheduled is reported once and no pings are sent.
    pub fn spawn<F>(self, cancel: CancellationToken, mut on_result: F) -> JoinHandle<()>
    where
        F: FnMut(Result<()>) + Send + 'static,
    {
        tokio::spawn(async move {
            let first = match self.first_tick() {
                Ok(first) => first,
                Err(e) => {
                    log::error!("💔 Keepalive not started: {}", e);
                    on_result(Err(e.into()));
                    return;
                }
            };
            let mut ticker = interval_at(first, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("💓 Keepalive started (every {:?})", self.period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = match self.tokens.bearer_token() {
                            Ok(token) => tokio::select! {
                                _ = cancel.cancelled() => break,
                                result = ping(&self.http, &self.url, &token) => result,
                            },
                            Err(e) => Err(e),
                        };
                        if let Err(e) = &result {
                            log::warn!("💔 Keepalive ping failed: {}", e);
                        }
                        on_result(result);
                    }
                }
            }

            log::info!("💓 Keepalive stopped");
        })
    }

    fn first_tick(&self) -> std::result::Result<Instant, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            var: "ping_interval".to_string(),
            reason: reason.to_string(),
        };
        if self.period.is_zero() {
            return Err(invalid("must be greater than zero"));
        }
        Instant::now()
            .checked_add(self.period)
            .ok_or_else(|| invalid("too far in the future to schedule"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_scheduler_pings_until_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(header("authorization", "Bearer tick"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let cancel = CancellationToken::new();

        let scheduler = KeepaliveScheduler::new(
            Client::new(),
            format!("{}/ping", server.uri()),
            Arc::new(StaticTokenSource::new("tick")),
            Duration::from_millis(50),
        );
        let handle = scheduler.spawn(cancel.clone(), move |result| {
            sink.lock().unwrap().push(result.is_ok());
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
        handle.await.unwrap();

        let seen = results.lock().unwrap().clone();
        assert!(seen.len() >= 2, "expected several pings, got {}", seen.len());
        assert!(seen.iter().all(|ok| *ok));
    }

    async fn rejected_period(period: Duration) -> Vec<String> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();

        let scheduler = KeepaliveScheduler::new(
            Client::new(),
            "http://127.0.0.1:9/ping".to_string(),
            Arc::new(StaticTokenSource::new("x")),
            period,
        );
        let handle = scheduler.spawn(CancellationToken::new(), move |result| {
            if let Err(e) = result {
                sink.lock().unwrap().push(e.to_string());
            }
        });

        // The task must end on its own instead of panicking
        handle.await.unwrap();
        let seen = errors.lock().unwrap().clone();
        seen
    }

    #[tokio::test]
    async fn test_zero_period_is_reported() {
        let errors = rejected_period(Duration::ZERO).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ping_interval"));
    }

    #[tokio::test]
    async fn test_overflowing_period_is_reported() {
        let errors = rejected_period(Duration::from_secs(u64::MAX)).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("too far in the future"));
    }

    #[tokio::test]
    async fn test_scheduler_waits_one_period_before_first_ping() {
        let cancel = CancellationToken::new();
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();

        let scheduler = KeepaliveScheduler::new(
            Client::new(),
            "http://127.0.0.1:9/ping".to_string(),
            Arc::new(StaticTokenSource::new("x")),
            Duration::from_secs(3600),
        );
        let handle = scheduler.spawn(cancel.clone(), move |_| *sink.lock().unwrap() += 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
