//! Device feed adapters for `fleetlink sync auto`.
//!
//! - [`HttpFeed`]: GET the provider's device list with retry / backoff
//! - [`FileFeed`]: read a saved device list from disk
//!
//! Both accept `{"devices": [...]}` or a bare array. Device fields accept
//! the aliases providers commonly use (`imei`, `plateNumber`, `lat`, `lng`,
//! `timestamp`, ...). A device without a usable timestamp is stamped with
//! the fetch time.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use fleetlink_recon::model::GeoPoint;
use fleetlink_recon::{DeviceFeed, DeviceRecord, FeedError};
use log::{debug, warn};
use serde::Deserialize;

const MAX_RETRIES: u32 = 3;
const USER_AGENT: &str = concat!("fleetlink/", env!("CARGO_PKG_VERSION"));

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Wrapped { devices: Vec<WireDevice> },
    Bare(Vec<WireDevice>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDevice {
    #[serde(default, alias = "imei", alias = "id")]
    tracker_id: Option<serde_json::Value>,
    #[serde(default, alias = "plateNumber")]
    plate: Option<String>,
    #[serde(default, alias = "lat")]
    latitude: Option<f64>,
    #[serde(default, alias = "lng", alias = "lon")]
    longitude: Option<f64>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default, alias = "timestamp")]
    reported_at: Option<serde_json::Value>,
}

/// Decode a device list. `fetched_at` stands in for missing timestamps.
pub fn parse_devices(body: &str, fetched_at: DateTime<Utc>) -> Result<Vec<DeviceRecord>, FeedError> {
    let body = body.trim_start_matches('\u{feff}');
    let payload: Payload =
        serde_json::from_str(body).map_err(|e| FeedError::Payload(e.to_string()))?;
    let wire = match payload {
        Payload::Wrapped { devices } => devices,
        Payload::Bare(devices) => devices,
    };

    Ok(wire
        .into_iter()
        .map(|d| {
            let tracker_id = match d.tracker_id {
                Some(serde_json::Value::String(s)) => s.trim().to_string(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => String::new(),
            };
            let location = GeoPoint::from_parts(d.latitude, d.longitude).filter(|p| {
                let ok = p.in_range();
                if !ok {
                    debug!("{tracker_id}: dropping out-of-range position {p:?}");
                }
                ok
            });
            DeviceRecord {
                reported_at: d
                    .reported_at
                    .as_ref()
                    .and_then(parse_timestamp)
                    .unwrap_or(fetched_at),
                tracker_id,
                raw_plate: d.plate.unwrap_or_default(),
                location,
                address: d.address.filter(|a| !a.trim().is_empty()),
            }
        })
        .collect())
}

/// RFC 3339 string, or epoch seconds / milliseconds.
fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

// ── HttpFeed ────────────────────────────────────────────────────────

/// Provider device list over HTTPS.
///
/// 401/403 fail immediately as [`FeedError::Auth`]; other 4xx fail as
/// upstream errors. 429 and 5xx are retried with exponential backoff,
/// honoring `Retry-After` on 429. Retries never wait past the request
/// timeout measured from the first attempt; a wait that would is reported
/// as [`FeedError::Timeout`].
pub struct HttpFeed {
    http: reqwest::blocking::Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
    backoff: Duration,
}

impl HttpFeed {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self, FeedError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FeedError::Upstream(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: url.to_string(),
            token,
            timeout,
            backoff: Duration::from_secs(1),
        })
    }

    /// Override the first retry delay (doubles on each attempt).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn send_error(&self, err: reqwest::Error) -> FeedError {
        if err.is_timeout() {
            FeedError::Timeout {
                secs: self.timeout.as_secs(),
            }
        } else {
            FeedError::Upstream(err.to_string())
        }
    }
}

impl DeviceFeed for HttpFeed {
    fn discover(&mut self) -> Result<Vec<DeviceRecord>, FeedError> {
        let mut backoff = self.backoff;
        let deadline = Instant::now() + self.timeout;

        for attempt in 0..=MAX_RETRIES {
            let mut req = self.http.get(&self.url).header("accept", "application/json");
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            let resp = req.send().map_err(|e| self.send_error(e))?;
            let status = resp.status().as_u16();

            if status == 401 || status == 403 {
                return Err(FeedError::Auth { status });
            }

            if (400..500).contains(&status) && status != 429 {
                let body = resp.text().unwrap_or_default();
                return Err(FeedError::Upstream(format!(
                    "HTTP {status}: {}",
                    body.chars().take(200).collect::<String>()
                )));
            }

            if status == 429 || status >= 500 {
                if attempt == MAX_RETRIES {
                    let what = if status == 429 { "rate limited" } else { "upstream error" };
                    return Err(FeedError::Upstream(format!(
                        "{what} after {MAX_RETRIES} retries (HTTP {status})"
                    )));
                }

                let wait = if status == 429 {
                    resp.headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or(backoff)
                } else {
                    backoff
                };
                if Instant::now() + wait > deadline {
                    warn!(
                        "feed gave up after HTTP {status}: waiting {wait:?} would exceed {:?}",
                        self.timeout
                    );
                    return Err(FeedError::Timeout {
                        secs: self.timeout.as_secs(),
                    });
                }
                warn!(
                    "feed retry {}/{} in {:?} (HTTP {})",
                    attempt + 1,
                    MAX_RETRIES,
                    wait,
                    status
                );
                thread::sleep(wait);
                backoff *= 2;
                continue;
            }

            let fetched_at = Utc::now();
            let text = resp.text().map_err(|e| self.send_error(e))?;
            return parse_devices(&text, fetched_at);
        }

        Err(FeedError::Upstream("retry loop exhausted".into()))
    }
}

// ── FileFeed ────────────────────────────────────────────────────────

/// Device list saved to disk, in the same shape the provider returns.
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DeviceFeed for FileFeed {
    fn discover(&mut self) -> Result<Vec<DeviceRecord>, FeedError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| FeedError::Upstream(format!("cannot read {}: {e}", self.path.display())))?;
        parse_devices(&text, Utc::now())
    }
}
