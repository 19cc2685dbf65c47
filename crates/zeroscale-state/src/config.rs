//! Startup configuration.
//!
//! The backend hands out a [`ResourceScalerConfig`] once at startup. On the
//! wire (TOML manifests, JSON) durations are human strings like `"30s"` or
//! `"5m"`; the `Raw*` structs carry that form and are validated into the
//! typed option sets.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{Reducer, ScaleResource};

pub const DEFAULT_NAME_HEADER: &str = "X-Zeroscale-Target";
pub const DEFAULT_PATH_HEADER: &str = "X-Zeroscale-Path";
pub const DEFAULT_TARGET_HOST: &str = "{name}.{namespace}.svc.cluster.local";

// ── Typed options ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AutoScalerOptions {
    pub namespace: String,
    pub scale_interval: Duration,
    /// How long a scale-from-zero episode may take before reverting to `non`.
    pub readiness_timeout: Duration,
    /// Upper bound on any single backend call made from a tick.
    pub backend_timeout: Duration,
    /// Failed scale-down ticks tolerated before giving up.
    pub max_scale_down_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollerOptions {
    pub namespace: String,
    pub metric_interval: Duration,
    pub reconfigure_interval: Duration,
    pub query_timeout: Duration,
    /// Upper bound on one resource listing attempt.
    pub backend_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DlxOptions {
    pub namespace: String,
    pub target_name_header: String,
    pub target_path_header: String,
    pub target_port: u16,
    /// Host template; `{name}` and `{namespace}` are substituted.
    pub target_host: String,
    pub listen_address: SocketAddr,
    /// How long a single request may be held. Always equal to the
    /// autoscaler's readiness timeout.
    pub readiness_timeout: Duration,
    pub max_held_requests: usize,
    pub drain_timeout: Duration,
}

impl DlxOptions {
    /// `host:port` of the upstream serving `resource`.
    pub fn target_authority(&self, resource: &str) -> String {
        let host = self
            .target_host
            .replace("{name}", resource)
            .replace("{namespace}", &self.namespace);
        format!("{host}:{}", self.target_port)
    }
}

/// Everything the three live components need, seeded once by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceScalerConfig {
    pub autoscaler: AutoScalerOptions,
    pub poller: PollerOptions,
    pub dlx: DlxOptions,
}

impl ResourceScalerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let raw: RawScalerConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        raw.validate()
    }
}

// ── Raw (serde) form ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawScalerConfig {
    pub namespace: String,
    pub autoscaler: RawAutoScalerOptions,
    pub poller: RawPollerOptions,
    pub dlx: RawDlxOptions,
}

impl Default for RawScalerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            autoscaler: RawAutoScalerOptions::default(),
            poller: RawPollerOptions::default(),
            dlx: RawDlxOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawAutoScalerOptions {
    pub scale_interval: String,
    pub readiness_timeout: String,
    pub backend_timeout: String,
    pub max_scale_down_attempts: u32,
}

impl Default for RawAutoScalerOptions {
    fn default() -> Self {
        Self {
            scale_interval: "1m".to_string(),
            readiness_timeout: "2m".to_string(),
            backend_timeout: "30s".to_string(),
            max_scale_down_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPollerOptions {
    pub metric_interval: String,
    pub reconfigure_interval: String,
    pub query_timeout: String,
}

impl Default for RawPollerOptions {
    fn default() -> Self {
        Self {
            metric_interval: "30s".to_string(),
            reconfigure_interval: "1m".to_string(),
            query_timeout: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawDlxOptions {
    pub listen_address: String,
    pub target_name_header: String,
    pub target_path_header: String,
    pub target_port: u16,
    pub target_host: String,
    /// Defaults to `autoscaler.readiness_timeout`; must match it when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_timeout: Option<String>,
    pub max_held_requests: usize,
    pub drain_timeout: String,
}

impl Default for RawDlxOptions {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            target_name_header: DEFAULT_NAME_HEADER.to_string(),
            target_path_header: DEFAULT_PATH_HEADER.to_string(),
            target_port: 8080,
            target_host: DEFAULT_TARGET_HOST.to_string(),
            readiness_timeout: None,
            max_held_requests: 1024,
            drain_timeout: "30s".to_string(),
        }
    }
}

impl RawScalerConfig {
    pub fn validate(self) -> ConfigResult<ResourceScalerConfig> {
        let ns = self.namespace;
        let a = self.autoscaler;
        let p = self.poller;
        let d = self.dlx;

        if a.max_scale_down_attempts == 0 {
            return Err(ConfigError::ZeroValue("autoscaler.max_scale_down_attempts".into()));
        }
        if d.max_held_requests == 0 {
            return Err(ConfigError::ZeroValue("dlx.max_held_requests".into()));
        }
        if d.target_port == 0 {
            return Err(ConfigError::ZeroValue("dlx.target_port".into()));
        }
        let listen_address: SocketAddr = d
            .listen_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(d.listen_address.clone()))?;

        // Held requests and episode settlement share one deadline.
        let readiness_timeout = positive("autoscaler.readiness_timeout", &a.readiness_timeout)?;
        if let Some(dlx_timeout) = &d.readiness_timeout {
            let dlx_timeout = positive("dlx.readiness_timeout", dlx_timeout)?;
            if dlx_timeout != readiness_timeout {
                return Err(ConfigError::Mismatch {
                    field: "dlx.readiness_timeout".into(),
                    other: "autoscaler.readiness_timeout".into(),
                });
            }
        }
        let backend_timeout = positive("autoscaler.backend_timeout", &a.backend_timeout)?;

        Ok(ResourceScalerConfig {
            autoscaler: AutoScalerOptions {
                namespace: ns.clone(),
                scale_interval: positive("autoscaler.scale_interval", &a.scale_interval)?,
                readiness_timeout,
                backend_timeout,
                max_scale_down_attempts: a.max_scale_down_attempts,
            },
            poller: PollerOptions {
                namespace: ns.clone(),
                metric_interval: positive("poller.metric_interval", &p.metric_interval)?,
                reconfigure_interval: positive("poller.reconfigure_interval", &p.reconfigure_interval)?,
                query_timeout: positive("poller.query_timeout", &p.query_timeout)?,
                backend_timeout,
            },
            dlx: DlxOptions {
                namespace: ns,
                target_name_header: d.target_name_header,
                target_path_header: d.target_path_header,
                target_port: d.target_port,
                target_host: d.target_host,
                listen_address,
                readiness_timeout,
                max_held_requests: d.max_held_requests,
                drain_timeout: parse_duration("dlx.drain_timeout", &d.drain_timeout)?,
            },
        })
    }
}

/// Wire form of a [`ScaleResource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScaleResource {
    pub metric_name: String,
    pub window: String,
    pub threshold: i64,
    #[serde(default)]
    pub reducer: Reducer,
}

impl TryFrom<RawScaleResource> for ScaleResource {
    type Error = ConfigError;

    fn try_from(raw: RawScaleResource) -> Result<Self, Self::Error> {
        let window = parse_duration(&format!("{}.window", raw.metric_name), &raw.window)?;
        Ok(ScaleResource::new(raw.metric_name, window, raw.threshold)?.with_reducer(raw.reducer))
    }
}

impl From<ScaleResource> for RawScaleResource {
    fn from(rule: ScaleResource) -> Self {
        Self {
            metric_name: rule.metric_name,
            window: format_duration(rule.window),
            threshold: rule.threshold as i64,
            reducer: rule.reducer,
        }
    }
}

// ── Durations ──────────────────────────────────────────────────────

/// Parse a duration string like `"250ms"`, `"30s"`, `"5m"`, `"1h"`.
///
/// A bare number is seconds.
pub fn parse_duration(field: &str, s: &str) -> ConfigResult<Duration> {
    let invalid = || ConfigError::InvalidDuration {
        field: field.to_string(),
        value: s.to_string(),
    };
    let s = s.trim();
    let (digits, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        (s, 1_000)
    };
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Inverse of [`parse_duration`], choosing the largest exact unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        "0s".to_string()
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn positive(field: &str, s: &str) -> ConfigResult<Duration> {
    let d = parse_duration(field, s)?;
    if d.is_zero() {
        return Err(ConfigError::ZeroValue(field.to_string()));
    }
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("f", "30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("f", "5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("f", "1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("f", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("f", "7").unwrap(), Duration::from_secs(7));
        assert!(matches!(
            parse_duration("f", "soon"),
            Err(ConfigError::InvalidDuration { .. })
        ));
        assert!(parse_duration("f", "-5s").is_err());
    }

    #[test]
    fn format_duration_picks_largest_unit() {
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
    }

    #[test]
    fn duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn defaults_validate() {
        let config = RawScalerConfig::default().validate().unwrap();
        assert_eq!(config.autoscaler.scale_interval, Duration::from_secs(60));
        assert_eq!(config.dlx.target_name_header, DEFAULT_NAME_HEADER);
        assert_eq!(config.poller.namespace, "default");
    }

    #[test]
    fn parse_full_toml() {
        let toml_str = r#"
namespace = "prod"

[autoscaler]
scale_interval = "10s"
readiness_timeout = "2s"
max_scale_down_attempts = 5

[poller]
metric_interval = "5s"

[dlx]
listen_address = "127.0.0.1:9000"
target_port = 8081
target_host = "{name}.{namespace}"
max_held_requests = 16
"#;
        let config = ResourceScalerConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.autoscaler.namespace, "prod");
        assert_eq!(config.autoscaler.readiness_timeout, Duration::from_secs(2));
        assert_eq!(config.autoscaler.max_scale_down_attempts, 5);
        assert_eq!(config.poller.metric_interval, Duration::from_secs(5));
        assert_eq!(config.poller.reconfigure_interval, Duration::from_secs(60));
        assert_eq!(config.dlx.max_held_requests, 16);
        assert_eq!(config.dlx.target_authority("api"), "api.prod:8081");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ResourceScalerConfig::from_toml_str("[autoscaler]\nscale_interval = \"0s\"\n")
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroValue("autoscaler.scale_interval".into()));
    }

    #[test]
    fn dlx_readiness_timeout_follows_autoscaler() {
        let config =
            ResourceScalerConfig::from_toml_str("[autoscaler]\nreadiness_timeout = \"45s\"\n")
                .unwrap();
        assert_eq!(config.dlx.readiness_timeout, Duration::from_secs(45));
        assert_eq!(config.poller.backend_timeout, config.autoscaler.backend_timeout);

        let same = ResourceScalerConfig::from_toml_str(
            "[autoscaler]\nreadiness_timeout = \"45s\"\n[dlx]\nreadiness_timeout = \"45000ms\"\n",
        )
        .unwrap();
        assert_eq!(same.dlx.readiness_timeout, Duration::from_secs(45));

        let err = ResourceScalerConfig::from_toml_str(
            "[autoscaler]\nreadiness_timeout = \"45s\"\n[dlx]\nreadiness_timeout = \"10s\"\n",
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Mismatch {
                field: "dlx.readiness_timeout".into(),
                other: "autoscaler.readiness_timeout".into(),
            }
        );
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let err = ResourceScalerConfig::from_toml_str("[dlx]\nlisten_address = \"nowhere\"\n")
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidAddress("nowhere".into()));
    }

    #[test]
    fn scale_resource_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            rule: ScaleResource,
        }
        let doc: Doc = toml::from_str(
            "[rule]\nmetric_name = \"requests\"\nwindow = \"5m\"\nthreshold = 3\nreducer = \"max\"\n",
        )
        .unwrap();
        assert_eq!(doc.rule.window, Duration::from_secs(300));
        assert_eq!(doc.rule.threshold, 3);
        assert_eq!(doc.rule.reducer, Reducer::Max);

        let bad = toml::from_str::<Doc>(
            "[rule]\nmetric_name = \"requests\"\nwindow = \"5m\"\nthreshold = -1\n",
        );
        assert!(bad.is_err());
    }
}
