use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::types::AppliedFlag;

/// How the backend answered a batch of apply events. Status codes and
/// transport errors are classified exactly once, here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every event in the batch was accepted.
    Success,
    /// The backend refused the batch and will keep refusing it.
    PermanentReject(String),
    /// The batch may succeed later. `retry_after` carries the backend's hint, if any.
    TransientFail {
        reason: String,
        retry_after: Option<time::Duration>,
    },
}

impl DeliveryOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        DeliveryOutcome::TransientFail {
            reason: reason.into(),
            retry_after: None,
        }
    }
}

/// Sends batches of apply events to the backend.
#[async_trait]
pub trait ApplyPublisher: Send + Sync {
    async fn publish(&self, flags: &[AppliedFlag]) -> DeliveryOutcome;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplyRequest<'a> {
    client_secret: &'a str,
    flags: Vec<ApplyRequestFlag<'a>>,
    send_time: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplyRequestFlag<'a> {
    flag: &'a str,
    resolve_token: &'a str,
    applied_at: DateTime<Utc>,
}

/// Publishes apply events as a JSON POST request.
pub struct HttpApplyPublisher {
    client: reqwest::Client,
    url: String,
    client_secret: String,
}

impl HttpApplyPublisher {
    pub fn new(
        url: &str,
        client_secret: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("flag-cache/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.to_owned(),
            client_secret: client_secret.to_owned(),
        })
    }
}

#[async_trait]
impl ApplyPublisher for HttpApplyPublisher {
    async fn publish(&self, flags: &[AppliedFlag]) -> DeliveryOutcome {
        let request = ApplyRequest {
            client_secret: &self.client_secret,
            flags: flags
                .iter()
                .map(|applied| ApplyRequestFlag {
                    flag: &applied.flag_name,
                    resolve_token: &applied.resolve_token,
                    applied_at: applied.applied_at,
                })
                .collect(),
            send_time: Utc::now(),
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return DeliveryOutcome::transient(format!("request timed out: {}", e))
            }
            Err(e) => return DeliveryOutcome::transient(format!("request failed: {}", e)),
        };

        let status = response.status();
        debug!(%status, events = flags.len(), "apply request completed");

        if status.is_success() {
            return DeliveryOutcome::Success;
        }

        let retry_after = parse_retry_after_header(response.headers());
        if is_retryable_status(status) {
            DeliveryOutcome::TransientFail {
                reason: format!("backend responded with {}", status),
                retry_after,
            }
        } else {
            DeliveryOutcome::PermanentReject(format!("backend responded with {}", status))
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a time::Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
/// Dates in the past are ignored.
fn parse_retry_after_header(header_map: &reqwest::header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(retry_after) {
        let duration = DateTime::<Utc>::from(dt) - Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());

        let duration = parse_retry_after_header(&headers).unwrap();
        assert_eq!(duration, time::Duration::from_secs(120));

        headers.remove(reqwest::header::RETRY_AFTER);

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);

        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);

        let in_an_hour = (Utc::now() + chrono::Duration::hours(1)).to_rfc2822();
        headers.insert(reqwest::header::RETRY_AFTER, in_an_hour.parse().unwrap());

        let duration = parse_retry_after_header(&headers).unwrap();
        assert!(duration > time::Duration::from_secs(3500));
        assert!(duration <= time::Duration::from_secs(3600));

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[test]
    fn test_request_payload_shape() {
        let applied_at = DateTime::from_timestamp(1_000, 0).unwrap();
        let request = ApplyRequest {
            client_secret: "secret",
            flags: vec![ApplyRequestFlag {
                flag: "flags/f1",
                resolve_token: "t0",
                applied_at,
            }],
            send_time: DateTime::from_timestamp(2_000, 0).unwrap(),
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "clientSecret": "secret",
                "flags": [{"flag": "flags/f1", "resolveToken": "t0", "appliedAt": "1970-01-01T00:16:40Z"}],
                "sendTime": "1970-01-01T00:33:20Z"
            })
        );
    }
}
