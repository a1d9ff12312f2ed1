//! Value Resolver
//!
//! Merges a field's explicit configuration value with its precedence-ordered
//! environment variables and a default. Configuration always outranks the
//! environment; within the environment the first non-empty variable wins.

use std::time::Duration;

use super::env::Environment;
use crate::error::{Error, Result};

/// How an explicitly empty configuration value is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyPolicy {
    /// `""` is a user error.
    Reject,
    /// `""` is treated as if the field were not set.
    Ignore,
}

/// Static description of one configuration field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub env: &'static [&'static str],
    pub empty: EmptyPolicy,
}

impl FieldSpec {
    pub const fn new(name: &'static str, env: &'static [&'static str], empty: EmptyPolicy) -> Self {
        Self { name, env, empty }
    }
}

// =========================================================================
// Field table
// =========================================================================

pub const CREDENTIALS: FieldSpec = FieldSpec::new(
    "credentials",
    &["GOOGLE_CREDENTIALS", "GOOGLE_CLOUD_KEYFILE_JSON", "GCLOUD_KEYFILE_JSON"],
    EmptyPolicy::Reject,
);
pub const ACCESS_TOKEN: FieldSpec =
    FieldSpec::new("access_token", &["GOOGLE_OAUTH_ACCESS_TOKEN"], EmptyPolicy::Reject);
pub const IMPERSONATE_SERVICE_ACCOUNT: FieldSpec = FieldSpec::new(
    "impersonate_service_account",
    &["GOOGLE_IMPERSONATE_SERVICE_ACCOUNT"],
    EmptyPolicy::Reject,
);
pub const PROJECT: FieldSpec = FieldSpec::new(
    "project",
    &[
        "GOOGLE_PROJECT",
        "GOOGLE_CLOUD_PROJECT",
        "GCLOUD_PROJECT",
        "CLOUDSDK_CORE_PROJECT",
    ],
    EmptyPolicy::Reject,
);
pub const REGION: FieldSpec = FieldSpec::new(
    "region",
    &["GOOGLE_REGION", "GCLOUD_REGION", "CLOUDSDK_COMPUTE_REGION"],
    EmptyPolicy::Reject,
);
pub const ZONE: FieldSpec = FieldSpec::new(
    "zone",
    &["GOOGLE_ZONE", "GCLOUD_ZONE", "CLOUDSDK_COMPUTE_ZONE"],
    EmptyPolicy::Reject,
);
pub const BILLING_PROJECT: FieldSpec =
    FieldSpec::new("billing_project", &["GOOGLE_BILLING_PROJECT"], EmptyPolicy::Reject);
pub const USER_PROJECT_OVERRIDE: FieldSpec =
    FieldSpec::new("user_project_override", &["USER_PROJECT_OVERRIDE"], EmptyPolicy::Ignore);
pub const REQUEST_REASON: FieldSpec =
    FieldSpec::new("request_reason", &["CLOUDSDK_CORE_REQUEST_REASON"], EmptyPolicy::Ignore);
pub const REQUEST_TIMEOUT: FieldSpec =
    FieldSpec::new("request_timeout", &[], EmptyPolicy::Ignore);
pub const SEND_AFTER: FieldSpec = FieldSpec::new("batching.send_after", &[], EmptyPolicy::Ignore);

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Config,
    /// The `index`-th variable of the field's list.
    Env { index: usize, name: &'static str },
    Default,
    Unset,
}

/// Per-field record produced while building a resolved configuration.
#[derive(Debug, Clone)]
pub struct FieldResolution<T> {
    pub field: &'static str,
    pub raw: Option<String>,
    pub env_vars: &'static [&'static str],
    pub value: Option<T>,
    pub source: Source,
}

impl FieldResolution<String> {
    /// Convert the resolved string, attributing parse errors to this field.
    pub fn parse_with<T, F>(self, parse: F) -> Result<FieldResolution<T>>
    where
        F: FnOnce(&'static str, &str) -> Result<T>,
    {
        let value = match self.value.as_deref() {
            Some(v) => Some(parse(self.field, v)?),
            None => None,
        };
        Ok(FieldResolution {
            field: self.field,
            raw: self.raw,
            env_vars: self.env_vars,
            value,
            source: self.source,
        })
    }
}

/// Resolve one field: explicit value, then environment, then default.
pub fn resolve(
    field: &FieldSpec,
    explicit: Option<&str>,
    env: &Environment,
    default: Option<&str>,
) -> Result<FieldResolution<String>> {
    let record = |value: Option<String>, source: Source| FieldResolution {
        field: field.name,
        raw: explicit.map(str::to_string),
        env_vars: field.env,
        value,
        source,
    };

    match explicit {
        Some(v) if !v.is_empty() => return Ok(record(Some(v.to_string()), Source::Config)),
        Some(_) if field.empty == EmptyPolicy::Reject => {
            return Err(Error::validation(field.name, "expected a non-empty string"));
        }
        _ => {}
    }

    if let Some((index, name, value)) = env.first_of(field.env) {
        tracing::debug!("{} resolved from ${}", field.name, name);
        return Ok(record(Some(value.to_string()), Source::Env { index, name }));
    }

    match default {
        Some(d) => Ok(record(Some(d.to_string()), Source::Default)),
        None => Ok(record(None, Source::Unset)),
    }
}

// =========================================================================
// Value parsing
// =========================================================================

/// Shorten a region given as a URL or self-link to its bare name.
///
/// Only applied to `region`; a zone self-link is kept verbatim.
pub fn region_from_self_link(value: &str) -> String {
    if let Some(idx) = value.rfind("/regions/") {
        let rest = &value[idx + "/regions/".len()..];
        let name = rest.split('/').next().unwrap_or(rest);
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if value.starts_with("https://") || value.starts_with("http://") {
        if let Ok(url) = url::Url::parse(value) {
            if let Some(last) = url.path_segments().and_then(|s| s.filter(|p| !p.is_empty()).last()) {
                return last.to_string();
            }
        }
    }
    value.to_string()
}

/// Parse a boolean the way Go's `strconv.ParseBool` does.
pub fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        other => Err(Error::validation(
            field,
            format!("expected a boolean, got {other:?}"),
        )),
    }
}

/// Parse a non-negative Go-style duration such as `300ms`, `1.5s` or `2m30s`.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    let invalid = || {
        Error::validation(
            field,
            format!("unable to parse duration from {value:?}"),
        )
    };

    let mut rest = value.trim();
    if let Some(stripped) = rest.strip_prefix('-') {
        if stripped.chars().all(|c| c == '0' || c == '.') && !stripped.is_empty() {
            return Ok(Duration::ZERO);
        }
        return Err(Error::validation(field, format!("duration {value:?} must not be negative")));
    }
    rest = rest.strip_prefix('+').unwrap_or(rest);
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += number * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total.round() as u64))
}
