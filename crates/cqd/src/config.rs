//! Daemon configuration, read from a TOML file.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use cq_core::{EngineSettings, ProjectConfig, RunSettings};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STORE_URL: &str = "mem://";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// `memory` for the process-local store, `cloud` for credentials from the
    /// environment, otherwise any SurrealDB URL.
    pub store_url: String,
    pub submission_duration_secs: u64,
    pub tree_recheck_secs: u64,
    pub dispatch_tick_ms: u64,
    pub resync_secs: u64,
    pub projects: Vec<ProjectConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_string(),
            submission_duration_secs: 20 * 60,
            tree_recheck_secs: 60,
            dispatch_tick_ms: 500,
            resync_secs: 60,
            projects: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Invalid service config")
    }

    /// Read `path`, or use defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `CQ_STORE_URL` (or any other override) on top of the file.
    pub fn with_store_url(mut self, store_url: Option<String>) -> Self {
        if let Some(url) = store_url.filter(|u| !u.is_empty()) {
            self.store_url = url;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.submission_duration_secs == 0 {
            bail!("submission_duration_secs must be positive");
        }
        if self.dispatch_tick_ms == 0 || self.resync_secs == 0 {
            bail!("dispatch_tick_ms and resync_secs must be positive");
        }
        let mut projects = HashSet::new();
        for project in &self.projects {
            if !projects.insert(project.project.as_str()) {
                bail!("project {} is configured twice", project.project);
            }
            let mut groups = HashSet::new();
            for group in &project.config_groups {
                if !groups.insert(group.name.as_str()) {
                    bail!("project {}: duplicate config group {}", project.project, group.name);
                }
            }
            if let Some(opts) = &project.submit_options {
                if opts.max_burst > 0 && opts.burst_delay_secs == 0 {
                    bail!("project {}: max_burst needs a burst_delay_secs", project.project);
                }
            }
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            run: RunSettings {
                submission_duration: chrono::Duration::seconds(
                    self.submission_duration_secs as i64,
                ),
                tree_recheck_interval: chrono::Duration::seconds(self.tree_recheck_secs as i64),
            },
            dispatch_tick: std::time::Duration::from_millis(self.dispatch_tick_ms),
            resync_interval: std::time::Duration::from_secs(self.resync_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
store_url = "surrealkv:///var/lib/cq"
submission_duration_secs = 900

[[projects]]
project = "chromium"

[[projects.config_groups]]
name = "main"
tree_status_url = "https://tree.example.com/chromium"

[[projects.config_groups]]
name = "stack"
combine_cls = { stabilization_delay_secs = 300 }

[projects.submit_options]
max_burst = 4
burst_delay_secs = 480
"#;

    #[test]
    fn parses_projects_and_groups() {
        let config = ServiceConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.store_url, "surrealkv:///var/lib/cq");
        assert_eq!(config.tree_recheck_secs, 60);
        let project = &config.projects[0];
        assert_eq!(project.config_groups.len(), 2);
        assert!(!project.config_groups[0].is_combinable());
        assert!(project.config_groups[1].is_combinable());
        assert_eq!(project.submit_options.as_ref().unwrap().max_burst, 4);

        let settings = config.engine_settings();
        assert_eq!(settings.run.submission_duration, chrono::Duration::minutes(15));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ServiceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.projects[0].project, "chromium");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServiceConfig::load(Some(&dir.path().join("cq.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn no_file_means_defaults() {
        let config = ServiceConfig::load(None).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.store_url, DEFAULT_STORE_URL);
    }

    #[test]
    fn store_url_override_wins() {
        let config = ServiceConfig::default().with_store_url(Some("memory".into()));
        assert_eq!(config.store_url, "memory");
        let config = ServiceConfig::default().with_store_url(Some(String::new()));
        assert_eq!(config.store_url, DEFAULT_STORE_URL);
    }

    #[test]
    fn duplicate_groups_are_rejected() {
        let raw = r#"
[[projects]]
project = "v8"
config_groups = [{ name = "main" }, { name = "main" }]
"#;
        let err = ServiceConfig::from_toml(raw)
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate config group main"));
    }
}
