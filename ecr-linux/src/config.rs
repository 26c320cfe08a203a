//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ecr_core::{ConnectOptions, FlowConfig, PaymentRequest, RetryPolicy, SessionConfig};
use serde::Deserialize;
use tracing::{debug, warn};

/// Daemon configuration. File: ~/.config/ecr/config.toml or /etc/ecr/config.toml.
/// Env overrides: ECR_DEVICE, ECR_RELAY, ECR_BAUD_RATE, ECR_AMOUNT, ECR_CURRENCY,
/// ECR_LANGUAGE.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Serial character device (default /dev/ttyUSB0). Line settings are
    /// configured outside this program.
    #[serde(default = "default_device")]
    pub device: String,
    /// `host:port` of a TCP relay exposing the serial line; used instead of
    /// `device` when set.
    #[serde(default)]
    pub relay: Option<String>,
    /// Line speed, only used to estimate frame transmission time.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Amount in minor units (default 175).
    #[serde(default = "default_amount")]
    pub amount: u64,
    /// ISO 4217 numeric currency (default 756, CHF).
    #[serde(default = "default_currency")]
    pub currency: u32,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_printer_width")]
    pub printer_width: u32,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
}

fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    ecr_core::scheduler::DEFAULT_BAUD_RATE
}
fn default_amount() -> u64 {
    PaymentRequest::default().amount
}
fn default_currency() -> u32 {
    PaymentRequest::default().currency
}
fn default_language() -> String {
    ConnectOptions::default().language
}
fn default_printer_width() -> u32 {
    ConnectOptions::default().printer_width
}
fn default_max_tries() -> u32 {
    ecr_core::scheduler::DEFAULT_MAX_TRIES
}
fn default_ack_timeout_ms() -> u64 {
    ecr_core::scheduler::DEFAULT_ACK_TIMEOUT.as_millis() as u64
}
fn default_status_poll_ms() -> u64 {
    ecr_core::transaction::DEFAULT_STATUS_POLL_INTERVAL.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: default_device(),
            relay: None,
            baud_rate: default_baud_rate(),
            amount: default_amount(),
            currency: default_currency(),
            language: default_language(),
            printer_width: default_printer_width(),
            max_tries: default_max_tries(),
            ack_timeout_ms: default_ack_timeout_ms(),
            status_poll_ms: default_status_poll_ms(),
        }
    }
}

impl Config {
    /// Apply overrides from `lookup` (the process environment in [`load`]).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("ECR_DEVICE") {
            self.device = s;
        }
        if let Some(s) = lookup("ECR_RELAY") {
            self.relay = if s.is_empty() { None } else { Some(s) };
        }
        if let Some(v) = parse_var(&lookup, "ECR_BAUD_RATE") {
            self.baud_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "ECR_AMOUNT") {
            self.amount = v;
        }
        if let Some(v) = parse_var(&lookup, "ECR_CURRENCY") {
            self.currency = v;
        }
        if let Some(s) = lookup("ECR_LANGUAGE") {
            self.language = s;
        }
    }

    /// Core session settings derived from this configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            retry: RetryPolicy {
                max_tries: self.max_tries.max(1),
                ack_timeout: Duration::from_millis(self.ack_timeout_ms),
                baud_rate: self.baud_rate,
            },
            flow: FlowConfig {
                connect: ConnectOptions {
                    language: self.language.clone(),
                    printer_width: self.printer_width,
                },
                payment: PaymentRequest {
                    amount: self.amount,
                    currency: self.currency,
                    ..PaymentRequest::default()
                },
                status_poll_interval: Duration::from_millis(self.status_poll_ms),
            },
            ..SessionConfig::default()
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let s = lookup(name)?;
    match s.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %s, "Ignoring invalid environment override");
            None
        }
    }
}

/// Load config: merge default, then config file (explicit `path` or the first
/// one found), then env vars. An explicit path must exist and parse.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ecr/config.toml"));
    }
    out.push(PathBuf::from("/etc/ecr/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn load_file() -> Option<Config> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&p) {
        Ok(c) => {
            debug!(path = %p.display(), "Loaded config");
            Some(c)
        }
        Err(e) => {
            warn!(error = format_args!("{:#}", e), "Ignoring config file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.amount, 175);
        assert_eq!(c.currency, 756);
        assert_eq!(c.language, "de");
    }

    #[test]
    fn file_values_are_read() {
        let c: Config = toml::from_str(
            r#"
            relay = "127.0.0.1:5555"
            amount = 990
            ack_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(c.relay.as_deref(), Some("127.0.0.1:5555"));
        assert_eq!(c.amount, 990);
        assert_eq!(c.session().retry.ack_timeout, Duration::from_millis(500));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("ECR_AMOUNT", "2000"),
            ("ECR_CURRENCY", "978"),
            ("ECR_LANGUAGE", "fr"),
            ("ECR_BAUD_RATE", "fast"),
            ("ECR_RELAY", ""),
        ]
        .into_iter()
        .collect();
        let mut c = Config {
            relay: Some("relay:1".to_string()),
            ..Config::default()
        };
        c.apply_env(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(c.amount, 2000);
        assert_eq!(c.currency, 978);
        assert_eq!(c.language, "fr");
        assert_eq!(c.baud_rate, 115_200);
        assert_eq!(c.relay, None);
    }

    #[test]
    fn session_carries_payment() {
        let c = Config {
            amount: 500,
            language: "en".to_string(),
            ..Config::default()
        };
        let s = c.session();
        assert_eq!(s.flow.payment.amount, 500);
        assert_eq!(s.flow.payment.trx_function, 0x8000);
        assert_eq!(s.flow.connect.language, "en");
        assert_eq!(s.retry.max_tries, 3);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/ecr.toml"))).is_err());
    }
}
