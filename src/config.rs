//! Run options.
//!
//! Options come from up to three places: a JSON file, command line flags and the
//! environment. They are merged into [`RawOptions`] and resolved exactly once into
//! an immutable [`Options`]; nothing reads the environment after that.
//!
//! ```json
//! {
//!   "vus": 5,
//!   "duration": "30s",
//!   "thinkTime": "1s",
//!   "thresholds": {
//!     "http_req_failed": ["rate<0.01"],
//!     "http_req_duration": ["p(95)<800"]
//!   }
//! }
//! ```

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    executor::scheduler::DEFAULT_GRACEFUL_STOP,
    threshold::ThresholdSpec,
};

/// Environment variable consulted when `baseUrl` is not set.
pub const BASE_URL_ENV: &str = "BASE_URL";

/// Target used by the bundled runners when neither `baseUrl` nor `BASE_URL` is set.
pub const DEFAULT_BASE_URL: &str = "https://restful-booker.herokuapp.com";

/// Options as written by the user, every field optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawOptions {
    pub vus: Option<usize>,
    pub duration: Option<String>,
    pub iterations: Option<u64>,
    pub think_time: Option<String>,
    pub graceful_stop: Option<String>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
    pub base_url: Option<String>,
}

impl RawOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    /// Fields set in `other` win. Threshold lists are replaced per metric.
    pub fn merge(mut self, other: RawOptions) -> Self {
        self.vus = other.vus.or(self.vus);
        self.duration = other.duration.or(self.duration);
        self.iterations = other.iterations.or(self.iterations);
        self.think_time = other.think_time.or(self.think_time);
        self.graceful_stop = other.graceful_stop.or(self.graceful_stop);
        self.base_url = other.base_url.or(self.base_url);
        self.thresholds.extend(other.thresholds);
        self
    }
}

/// Fully resolved, validated options for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub vus: usize,
    pub duration: Duration,
    pub iterations: Option<u64>,
    pub think_time: Duration,
    pub graceful_stop: Duration,
    pub thresholds: Vec<ThresholdSpec>,
    pub base_url: Option<String>,
}

impl Options {
    /// Resolves against the process environment.
    pub fn resolve(raw: RawOptions) -> Result<Self> {
        Self::resolve_with(raw, |key| std::env::var(key).ok())
    }

    pub fn resolve_with(raw: RawOptions, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vus = raw
            .vus
            .ok_or_else(|| Error::config("vus", "is required"))?;
        if vus == 0 {
            return Err(Error::config("vus", "must be greater than zero"));
        }

        let duration = raw
            .duration
            .as_deref()
            .ok_or_else(|| Error::config("duration", "is required"))
            .and_then(|d| field_duration("duration", d))?;
        if duration.is_zero() {
            return Err(Error::config("duration", "must be greater than zero"));
        }

        if raw.iterations == Some(0) {
            return Err(Error::config("iterations", "must be greater than zero"));
        }

        let think_time = match raw.think_time.as_deref() {
            Some(d) => field_duration("thinkTime", d)?,
            None => Duration::ZERO,
        };
        let graceful_stop = match raw.graceful_stop.as_deref() {
            Some(d) => field_duration("gracefulStop", d)?,
            None => DEFAULT_GRACEFUL_STOP,
        };

        let mut thresholds = Vec::new();
        for (metric, expressions) in &raw.thresholds {
            for expression in expressions {
                thresholds.push(ThresholdSpec::parse(metric, expression)?);
            }
        }

        let base_url = match raw.base_url.or_else(|| env(BASE_URL_ENV)) {
            Some(url) => Some(validate_base_url(url)?),
            None => None,
        };

        Ok(Self {
            vus,
            duration,
            iterations: raw.iterations,
            think_time,
            graceful_stop,
            thresholds,
            base_url,
        })
    }
}

fn field_duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|reason| Error::config(field, reason))
}

fn validate_base_url(url: String) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let host = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .ok_or_else(|| {
            Error::config(
                "baseUrl",
                format!("`{url}` must start with http:// or https://"),
            )
        })?;
    if host.is_empty() {
        return Err(Error::config("baseUrl", format!("`{url}` has no host")));
    }
    Ok(trimmed.to_owned())
}

/// Parses `500ms`, `30s`, `5m`, `1h` and compounds such as `1m30s`.
/// A bare number is taken as milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_owned());
    }
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("`{s}` is missing a unit"))?;
        if digits == 0 {
            return Err(format!("`{s}` is not a duration"));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("`{}` is not a number", &rest[..digits]))?;

        let unit_len = rest[digits..]
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len() - digits);
        let unit = &rest[digits..digits + unit_len];
        let seconds = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(format!("unknown unit `{unit}` in `{s}`, use ms, s, m or h")),
        };
        let part = Duration::try_from_secs_f64(seconds).map_err(|e| format!("`{s}`: {e}"))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("`{s}` is too large"))?;
        rest = &rest[digits + unit_len..];
    }
    Ok(total)
}
