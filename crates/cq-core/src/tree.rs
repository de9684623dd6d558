//! Tree status: whether a repository currently accepts submissions.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CqResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeState {
    Open,
    Closed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStatus {
    pub state: TreeState,
    pub since: DateTime<Utc>,
}

impl TreeStatus {
    pub fn is_open(&self) -> bool {
        self.state == TreeState::Open
    }
}

#[async_trait]
pub trait TreeClient: Send + Sync {
    /// Latest status published at `url`.
    async fn fetch_latest(&self, url: &str) -> CqResult<TreeStatus>;
}

/// In-process tree status board. Unknown URLs report open.
#[derive(Debug, Default)]
pub struct ManualTree {
    states: Mutex<HashMap<String, TreeStatus>>,
}

impl ManualTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, url: &str, state: TreeState, since: DateTime<Utc>) {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(url.to_string(), TreeStatus { state, since });
    }
}

#[async_trait]
impl TreeClient for ManualTree {
    async fn fetch_latest(&self, url: &str) -> CqResult<TreeStatus> {
        let states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        Ok(states.get(url).cloned().unwrap_or(TreeStatus {
            state: TreeState::Open,
            since: DateTime::<Utc>::UNIX_EPOCH,
        }))
    }
}
