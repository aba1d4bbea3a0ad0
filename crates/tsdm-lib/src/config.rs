use crate::dataset::TimeSpec;
use crate::error::SyncError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How much older history survives a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Retention {
    /// Drop cached rows older than the earliest cached time shifted by the fresh range.
    #[default]
    Sliding,
    /// Keep every cached row older than the fresh data.
    Unbounded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub id: String,
    pub search: String,
    pub earliest: TimeSpec,
    pub latest: TimeSpec,
    pub keep_updated: bool,
    /// Seconds; the observed span is never allowed below this.
    pub min_update_interval: f64,
    pub time_field: String,
    pub span_field: String,
    pub retention: Retention,
    pub result_cache_secs: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            id: "data-manager".into(),
            search: "*".into(),
            earliest: TimeSpec::Relative("-4h".into()),
            latest: TimeSpec::Now,
            keep_updated: false,
            min_update_interval: 60.0,
            time_field: "_time".into(),
            span_field: "_span".into(),
            retention: Retention::Sliding,
            result_cache_secs: Some(60),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        validate_streaming(self.keep_updated, &self.latest)?;
        validate_update_interval(self.min_update_interval)
    }
}

pub(crate) fn validate_streaming(keep_updated: bool, latest: &TimeSpec) -> Result<(), SyncError> {
    if keep_updated && !latest.is_now() {
        return Err(SyncError::InvalidStreamingConfig {
            latest: latest.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn validate_update_interval(secs: f64) -> Result<(), SyncError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(SyncError::InvalidUpdateInterval(secs));
    }
    Ok(())
}

pub fn parse_config(text: &str) -> Result<ManagerConfig> {
    let config: ManagerConfig = toml::from_str(text).context("parsing manager config")?;
    config.validate()?;
    Ok(config)
}

pub fn read_config(path: &Path) -> Result<ManagerConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("loading config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_fill_missing_keys() {
        let config =
            parse_config("search = \"index=perfmon | timechart span=1m avg(cpu)\"").unwrap();
        assert_eq!(config.earliest, TimeSpec::Relative("-4h".into()));
        assert_eq!(config.latest, TimeSpec::Now);
        assert_eq!(config.min_update_interval, 60.0);
        assert_eq!(config.retention, Retention::Sliding);
    }

    #[test]
    fn streaming_requires_now() {
        let err = parse_config("keep_updated = true\nlatest = \"-5m\"").unwrap_err();
        let root = err.downcast_ref::<SyncError>().unwrap();
        assert_eq!(
            root,
            &SyncError::InvalidStreamingConfig {
                latest: "-5m".into()
            }
        );
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manager.toml");
        fs::write(
            &path,
            "id = \"cpu\"\nearliest = \"-20m\"\nkeep_updated = true\nretention = \"unbounded\"\n",
        )
        .unwrap();
        let config = read_config(&path).unwrap();
        assert_eq!(config.id, "cpu");
        assert!(config.keep_updated);
        assert_eq!(config.retention, Retention::Unbounded);
        assert!(read_config(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn rejects_negative_interval() {
        assert!(parse_config("min_update_interval = -1.0").is_err());
    }
}
