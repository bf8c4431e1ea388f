use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, net::SocketAddr, path::{Path, PathBuf}, time::Duration};
use tracing::debug;

use crate::error::Error;
use crate::mutator::RetryPolicy;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OperatorConfig {
    /// Watch scope; `None` watches every namespace.
    pub namespace: Option<String>,
    pub image: String,
    pub image_pull_policy: String,
    pub container_name: String,
    pub port_name: String,
    pub container_port: i32,
    pub service_port: i32,
    pub requeue_after_secs: u64,
    pub error_requeue_secs: u64,
    pub reconcile_timeout_secs: u64,
    pub metrics_addr: SocketAddr,
    pub field_manager: String,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { attempts: 5, initial_backoff_ms: 10, max_backoff_ms: 1000 }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            image: "localhost/racecourse:latest".into(),
            image_pull_policy: "Never".into(),
            container_name: "racecourse".into(),
            port_name: "webapp".into(),
            container_port: 3000,
            service_port: 3000,
            requeue_after_secs: 60,
            error_requeue_secs: 5,
            reconcile_timeout_secs: 30,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            field_manager: "racecourse-operator".into(),
            retry: RetryConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load from `path`, falling back to `RACECOURSE_CONFIG` and then the
    /// per-user config file. A missing file yields defaults. Environment
    /// overrides are applied last.
    ///
    /// In a pod there is no meaningful per-user config directory: mount the
    /// file (e.g. from a ConfigMap) and point `--config` or
    /// `RACECOURSE_CONFIG` at it, or rely on defaults plus env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg_path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("RACECOURSE_CONFIG").map(PathBuf::from).unwrap_or_else(|_| config_file_path()),
        };
        debug!(path=?cfg_path, exists=?cfg_path.exists(), "config.load.attempt");
        let mut cfg = if cfg_path.exists() {
            let content = fs::read_to_string(&cfg_path).with_context(|| format!("read config {cfg_path:?}"))?;
            Self::from_toml(&content).with_context(|| format!("failed to parse config {cfg_path:?}"))?
        } else {
            Self::default()
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(content)?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(ns) = std::env::var("RACECOURSE_NAMESPACE") { if !ns.is_empty() { self.namespace = Some(ns); } }
        if let Ok(image) = std::env::var("RACECOURSE_IMAGE") { if !image.is_empty() { self.image = image; } }
        if let Ok(addr) = std::env::var("RACECOURSE_METRICS_ADDR") {
            match addr.parse() {
                Ok(a) => self.metrics_addr = a,
                Err(e) => debug!(error=%e, value=%addr, "config.env.metrics_addr.ignored"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.retry.attempts == 0 {
            return Err(Error::Config("retry.attempts must be at least 1".into()));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::Config("reconcile_timeout_secs must be at least 1".into()));
        }
        for (field, port) in [("container_port", self.container_port), ("service_port", self.service_port)] {
            if !(1..=65535).contains(&port) {
                return Err(Error::Config(format!("{field} {port} is not a valid port")));
            }
        }
        for (field, value) in [("image", &self.image), ("container_name", &self.container_name), ("port_name", &self.port_name)] {
            if value.is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
        }
        // IANA_SVC_NAME: at most 15 chars, the same name is shared by container, service and ingress
        if self.port_name.len() > 15 {
            return Err(Error::Config(format!("port_name {:?} is longer than 15 characters", self.port_name)));
        }
        Ok(())
    }

    pub fn requeue_after(&self) -> Duration { Duration::from_secs(self.requeue_after_secs) }
    pub fn error_requeue(&self) -> Duration { Duration::from_secs(self.error_requeue_secs) }
    pub fn reconcile_timeout(&self) -> Duration { Duration::from_secs(self.reconcile_timeout_secs) }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }
}

/// Per-user location, only useful when running the operator locally
/// against a cluster from a workstation.
pub fn config_dir() -> PathBuf { dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("racecourse") }
pub fn config_file_path() -> PathBuf { config_dir().join("operator.toml") }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = OperatorConfig::from_toml("image = \"registry.local/race:1\"\n[retry]\nattempts = 3\n").unwrap();
        assert_eq!(cfg.image, "registry.local/race:1");
        assert_eq!(cfg.retry.attempts, 3);
        assert_eq!(cfg.retry.initial_backoff_ms, 10);
        assert_eq!(cfg.port_name, "webapp");
        assert_eq!(cfg.requeue_after(), Duration::from_secs(60));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = OperatorConfig::default();
        cfg.retry.attempts = 0;
        assert!(cfg.validate().is_err());
        let cfg = OperatorConfig { container_port: 0, ..OperatorConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = OperatorConfig { port_name: "a-very-long-port-name".into(), ..OperatorConfig::default() };
        assert!(cfg.validate().is_err());
        assert!(OperatorConfig::default().validate().is_ok());
    }
}
