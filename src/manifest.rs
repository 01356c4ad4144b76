//! Resource manifests
//!
//! ```toml
//! [[resource]]
//! type = "spanner_instance"
//! name = "main"
//! scope = "my-project"
//!
//! [resource.config]
//! config = "regional-us-central1"
//! display_name = "Main"
//! num_nodes = 1
//!
//! [[resource]]
//! type = "storage_transfer_job"
//! key = "nightly"
//!
//! [resource.config]
//! description = "nightly copy"
//! gcs_data_source = { bucket_name = "src" }
//! gcs_data_sink = { bucket_name = "dst" }
//! ```
//!
//! Every entry has an address, `type.key` or `type.name`, that stays put
//! across runs. Entries with neither fall back to their position among the
//! unnamed entries of their type, `type[0]`.

use declarative::{RawConfig, Schema};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("{resource}: `{key}` = {given:?} conflicts with config.{field} = {config}")]
    Conflict {
        resource: String,
        key: &'static str,
        given: String,
        field: String,
        config: Value,
    },

    #[error("{path}: more than one resource at address {address}")]
    DuplicateAddress { path: PathBuf, address: String },
}

/// One `[[resource]]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Stable handle for resources the remote names on create
    pub key: Option<String>,
    pub name: Option<String>,
    pub scope: Option<String>,
    #[serde(default)]
    pub config: RawConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(rename = "resource", default)]
    pub resources: Vec<ResourceDecl>,
}

impl Manifest {
    /// Load a manifest, choosing JSON or TOML by extension
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path.extension().is_some_and(|e| e == "json");
        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            toml::from_str(&content).map_err(|e| e.to_string())
        };
        let manifest: Self = parsed.map_err(|message| ManifestError::Parse {
            path: path.to_path_buf(),
            message,
        })?;

        let mut seen = HashSet::new();
        if let Some(address) = manifest.addresses().into_iter().find(|a| !seen.insert(a.clone())) {
            return Err(ManifestError::DuplicateAddress {
                path: path.to_path_buf(),
                address,
            });
        }
        Ok(manifest)
    }

    /// The address of each resource, in declaration order
    pub fn addresses(&self) -> Vec<String> {
        let mut unnamed: HashMap<&str, usize> = HashMap::new();
        self.resources
            .iter()
            .map(|decl| match decl.key.as_deref().or_else(|| decl.given_name()) {
                Some(key) => format!("{}.{key}", decl.resource_type),
                None => {
                    let index = unnamed.entry(decl.resource_type.as_str()).or_default();
                    *index += 1;
                    format!("{}[{}]", decl.resource_type, *index - 1)
                }
            })
            .collect()
    }
}

impl ResourceDecl {
    /// Short label for output, before the identity is known
    pub fn label(&self) -> String {
        let name = self.given_name().unwrap_or("(server-assigned)");
        format!("{}/{}", self.resource_type, name)
    }

    fn given_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or_else(|| self.config.get("name").and_then(Value::as_str))
    }

    /// The raw config with `name` and `scope` copied into the type's
    /// identity fields
    pub fn raw_config(&self, schema: &Schema) -> Result<RawConfig, ManifestError> {
        let mut raw = self.config.clone();
        let ids = &schema.identity;
        for (key, given, field) in [
            ("name", &self.name, &ids.name_field),
            ("scope", &self.scope, &ids.scope_field),
        ] {
            let Some(given) = given else { continue };
            match raw.get(field).filter(|v| !v.is_null()) {
                Some(existing) if existing.as_str() != Some(given.as_str()) => {
                    return Err(ManifestError::Conflict {
                        resource: self.label(),
                        key,
                        given: given.clone(),
                        field: field.clone(),
                        config: existing.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    raw.insert(field.clone(), Value::String(given.clone()));
                }
            }
        }
        Ok(raw)
    }
}
