//! Staging configuration
//!
//! Where release data lives below a release root, which live subtrees
//! bypass the release view, and which are hidden from it.
//!
//! Author: Moroya Sakamoto

use serde::{Deserialize, Serialize};

use crate::error::{ReleaseError, Result};
use crate::path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Paths relative to the release root that are always served from the
    /// live tree (site configuration, shared assets)
    pub overlay_nodes: Vec<String>,
    /// Paths relative to the release root that never resolve in a release
    pub excluded_paths: Vec<String>,
    /// Location of release storage relative to the release root
    pub releases_path: String,
    /// Attributes the tree synchronizer never copies, in addition to the
    /// built-in protected ones
    pub ignored_attributes: Vec<String>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            overlay_nodes: vec![String::from("meta"), String::from("assets")],
            excluded_paths: vec![String::from("meta/releases")],
            releases_path: String::from("meta/releases"),
            ignored_attributes: Vec::new(),
        }
    }
}

impl StagingConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReleaseError::validation(format!("invalid staging config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.releases_path.trim_matches('/').is_empty() {
            return Err(ReleaseError::validation("releases_path must not be empty"));
        }
        Ok(())
    }

    /// Absolute path of the releases node below `root`
    pub fn releases_node(&self, root: &str) -> String {
        path::join(root, &self.releases_path)
    }

    /// True if `abs_path` lies in an excluded subtree of `root`
    pub fn is_excluded(&self, root: &str, abs_path: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|rel| path::is_same_or_descendant(&path::join(root, rel), abs_path))
    }

    /// True if `abs_path` lies in an overlay subtree of `root`
    pub fn is_overlaid(&self, root: &str, abs_path: &str) -> bool {
        self.overlay_nodes
            .iter()
            .any(|rel| path::is_same_or_descendant(&path::join(root, rel), abs_path))
    }
}
