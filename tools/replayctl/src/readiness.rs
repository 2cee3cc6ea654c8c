use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, HttpClient, HttpRequest};
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Overall deadline for the whole poll.
    pub timeout: Duration,
    /// Pause between failed attempts.
    pub interval: Duration,
    /// Upper bound for a single request.
    pub attempt_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POLL_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub attempts: u32,
}

/// Retries `probe` until any HTTP response comes back or the deadline passes.
///
/// Each attempt is capped at `min(attempt_timeout, time left)` and the pause
/// between attempts never sleeps past the deadline, so the call returns within
/// `timeout + interval` even when every attempt hangs.
pub fn poll_until_ready(
    http: &dyn HttpClient,
    clock: &dyn Clock,
    probe: &ReadinessProbe,
    policy: &PollPolicy,
) -> Result<PolledResponse, ReplayError> {
    let start = clock.now();
    let deadline = start + policy.timeout;
    let mut last_error = "no attempt made".to_string();
    let mut attempts = 0u32;

    loop {
        let remaining = match deadline.duration_since(clock.now()) {
            Ok(left) if !left.is_zero() => left,
            _ => break,
        };
        attempts += 1;
        let request = HttpRequest {
            method: probe.method.clone(),
            url: probe.url.clone(),
            timeout: policy.attempt_timeout.min(remaining),
        };
        match http.send(&request) {
            Ok(response) => {
                append_run_log(
                    "info",
                    "readiness.ready",
                    json!({
                        "url": probe.url,
                        "status": response.status,
                        "attempts": attempts,
                    }),
                );
                return Ok(PolledResponse {
                    status: response.status,
                    body: response.body,
                    attempts,
                });
            }
            Err(err) => {
                last_error = err.to_string();
                append_run_log(
                    "debug",
                    "readiness.attempt_failed",
                    json!({ "url": probe.url, "attempt": attempts, "error": last_error }),
                );
            }
        }
        let next = clock.now() + policy.interval;
        clock.sleep_until(next.min(deadline))?;
    }

    let waited = clock.now().duration_since(start).unwrap_or_default();
    append_run_log(
        "error",
        "readiness.timeout",
        json!({
            "url": probe.url,
            "attempts": attempts,
            "waited_ms": waited.as_millis() as u64,
            "last_error": last_error,
        }),
    );
    Err(ReplayError::ReadinessTimeout {
        url: probe.url.clone(),
        waited_ms: waited.as_millis(),
        last_error,
    })
}

/// Base URL a local client uses to reach a server bound to `listen`.
/// Wildcard and empty hosts map to `localhost`.
pub fn local_base_url(listen: &str) -> String {
    let (host, port) = match listen.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", listen),
    };
    let host = match host {
        "" | "0.0.0.0" | "[::]" | "::" => "localhost",
        other => other,
    };
    format!("http://{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::{local_base_url, poll_until_ready, PollPolicy, ReadinessProbe};
    use crate::errors::ReplayError;
    use crate::runtime::{Clock, FakeClock, FakeHttpClient, HttpResponse};
    use std::time::Duration;

    fn probe() -> ReadinessProbe {
        ReadinessProbe {
            method: "POST".to_string(),
            url: "http://localhost:8090/post?name=hello".to_string(),
        }
    }

    #[test]
    fn returns_first_response_regardless_of_status() {
        let clock = FakeClock::default();
        let http = FakeHttpClient::default();
        http.push_response(Err(ReplayError::Http("connection refused".to_string())));
        http.push_response(Ok(HttpResponse {
            status: 404,
            body: b"not found".to_vec(),
        }));

        let polled =
            poll_until_ready(&http, &clock, &probe(), &PollPolicy::default()).expect("ready");
        assert_eq!(polled.status, 404);
        assert_eq!(polled.attempts, 2);
        assert_eq!(clock.sleeps().len(), 1);
        assert_eq!(http.requests()[0].method, "POST");
    }

    #[test]
    fn attempt_timeout_is_clamped_to_remaining_time() {
        let clock = FakeClock::default();
        let http = FakeHttpClient::with_clock(clock.clone(), Duration::from_secs(10));
        let policy = PollPolicy {
            timeout: Duration::from_secs(4),
            interval: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(3),
        };

        let _ = poll_until_ready(&http, &clock, &probe(), &policy);
        let timeouts = http
            .requests()
            .iter()
            .map(|r| r.timeout)
            .collect::<Vec<_>>();
        assert_eq!(timeouts[0], Duration::from_secs(3));
        assert_eq!(timeouts[1], Duration::from_millis(500));
    }

    #[test]
    fn wildcard_listen_addresses_map_to_localhost() {
        assert_eq!(local_base_url(":8090"), "http://localhost:8090");
        assert_eq!(local_base_url("0.0.0.0:8090"), "http://localhost:8090");
        assert_eq!(local_base_url("127.0.0.1:9000"), "http://127.0.0.1:9000");
        assert_eq!(local_base_url("8090"), "http://localhost:8090");
    }

    #[test]
    fn zero_timeout_fails_without_attempting() {
        let clock = FakeClock::default();
        let http = FakeHttpClient::default();
        let policy = PollPolicy {
            timeout: Duration::ZERO,
            ..PollPolicy::default()
        };
        let err = poll_until_ready(&http, &clock, &probe(), &policy).expect_err("timeout");
        assert!(matches!(err, ReplayError::ReadinessTimeout { .. }));
        assert!(http.requests().is_empty());
        assert_eq!(clock.now(), std::time::SystemTime::UNIX_EPOCH);
    }
}
