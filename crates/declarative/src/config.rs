//! Engine settings a host loads from its own config file

use crate::context::CallContext;
use crate::error::ValidationError;
use crate::executor::ExecutorConfig;
use crate::normalize::NormalizeOptions;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Provider defaults and executor tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Project used by configs that do not name one
    pub default_project: Option<String>,
    /// Labels added to every resource with a labels field
    pub default_labels: BTreeMap<String, String>,
    pub retry: RetryConfig,
    pub poll: RetryConfig,
    /// Overall budget for one resource's reconcile; unbounded when unset
    pub timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let executor = ExecutorConfig::default();
        Self {
            default_project: None,
            default_labels: BTreeMap::new(),
            retry: executor.retry,
            poll: executor.poll,
            timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Check settings that deserialize fine but cannot be used
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.retry.validate("retry")?;
        self.poll.validate("poll")
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            default_scope: self.default_project.clone(),
            default_labels: self.default_labels.clone(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: self.retry.clone(),
            poll: self.poll.clone(),
        }
    }

    /// A fresh call context carrying the configured timeout
    pub fn call_context(&self) -> CallContext {
        match self.timeout_secs {
            Some(secs) => CallContext::with_timeout(Duration::from_secs(secs)),
            None => CallContext::new(),
        }
    }
}
