//! Project configuration consumed by triage and submission.
//!
//! Config ingestion and validation live elsewhere; this module only defines
//! the shape the core reads and a provider trait to read it through.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CqResult;

/// Settings for config groups whose CLs land together as one Run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineCls {
    /// Wait this long after the latest trigger before forming a multi-CL Run.
    #[serde(default)]
    pub stabilization_delay_secs: u64,
}

impl CombineCls {
    pub fn stabilization_delay(&self) -> Duration {
        Duration::seconds(self.stabilization_delay_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigGroup {
    pub name: String,
    /// Present for combinable groups; absent means one CL per Run.
    #[serde(default)]
    pub combine_cls: Option<CombineCls>,
    /// Tree status endpoint gating submission; absent means always open.
    #[serde(default)]
    pub tree_status_url: Option<String>,
}

impl ConfigGroup {
    pub fn singular(name: &str) -> Self {
        Self {
            name: name.to_string(),
            combine_cls: None,
            tree_status_url: None,
        }
    }

    pub fn combinable(name: &str, stabilization_delay_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            combine_cls: Some(CombineCls {
                stabilization_delay_secs,
            }),
            tree_status_url: None,
        }
    }

    pub fn is_combinable(&self) -> bool {
        self.combine_cls.is_some()
    }
}

/// Limit of `max_burst` submitted CLs per `burst_delay_secs` window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub max_burst: u32,
    pub burst_delay_secs: u64,
}

impl SubmitOptions {
    pub fn burst_delay(&self) -> Duration {
        Duration::seconds(self.burst_delay_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project: String,
    #[serde(default)]
    pub config_groups: Vec<ConfigGroup>,
    #[serde(default)]
    pub submit_options: Option<SubmitOptions>,
}

impl ProjectConfig {
    pub fn new(project: &str, config_groups: Vec<ConfigGroup>) -> Self {
        Self {
            project: project.to_string(),
            config_groups,
            submit_options: None,
        }
    }

    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.config_groups.iter().position(|g| g.name == name)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&ConfigGroup> {
        self.config_groups.iter().find(|g| g.name == name)
    }
}

/// Read-only source of project configs.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// `None` if the project is not (or no longer) configured.
    async fn project_config(&self, project: &str) -> CqResult<Option<ProjectConfig>>;

    /// Names of all configured projects.
    async fn projects(&self) -> CqResult<Vec<String>>;
}

/// In-process provider holding configs in memory.
#[derive(Debug, Default)]
pub struct StaticConfigProvider {
    configs: RwLock<HashMap<String, ProjectConfig>>,
}

impl StaticConfigProvider {
    pub fn new(configs: impl IntoIterator<Item = ProjectConfig>) -> Self {
        Self {
            configs: RwLock::new(
                configs
                    .into_iter()
                    .map(|c| (c.project.clone(), c))
                    .collect(),
            ),
        }
    }

    /// Replace (or add) a project's config.
    pub async fn set(&self, config: ProjectConfig) {
        self.configs
            .write()
            .await
            .insert(config.project.clone(), config);
    }

    pub async fn remove(&self, project: &str) {
        self.configs.write().await.remove(project);
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn project_config(&self, project: &str) -> CqResult<Option<ProjectConfig>> {
        Ok(self.configs.read().await.get(project).cloned())
    }

    async fn projects(&self) -> CqResult<Vec<String>> {
        let mut names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
