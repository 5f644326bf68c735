//! Bundled extension resources.
//!
//! Logical paths such as `translate/promise.js` are looked up under the bundle
//! root first and under the platform subdirectory (`safari/`) second.

use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::config::ResourcesConfig;

const DATE_FORMATS: &str = "utilities/resource/dateFormats.json";
const LOCALES_DIR: &str = "_locales";

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("refusing resource path outside the bundle: {0}")]
    OutsideBundle(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<ResourceError> for crate::error::BridgeError {
    fn from(e: ResourceError) -> Self {
        crate::error::BridgeError::Resource(e.to_string())
    }
}

/// A script ready to be evaluated at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapScript {
    /// Logical path, used as the debug source name
    pub name: String,
    pub source: String,
}

/// Read-only view of the resource bundle.
#[derive(Debug, Clone)]
pub struct ResourceBundle {
    root: PathBuf,
    fallback_subdir: String,
}

/// Paths from the runtime must stay inside the bundle.
fn is_contained(logical: &str) -> bool {
    let path = Path::new(logical);
    !logical.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl ResourceBundle {
    pub fn new(root: impl Into<PathBuf>, fallback_subdir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            fallback_subdir: fallback_subdir.into(),
        }
    }

    pub fn from_config(config: &ResourcesConfig) -> Self {
        Self::new(config.root.clone(), config.fallback_subdir.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an existing resource: `<root>/<logical>`, then `<root>/<fallback>/<logical>`.
    pub fn locate(&self, logical: &str) -> Result<PathBuf, ResourceError> {
        if !is_contained(logical) {
            return Err(ResourceError::OutsideBundle(logical.to_string()));
        }

        [
            self.root.join(logical),
            self.root.join(&self.fallback_subdir).join(logical),
        ]
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| ResourceError::NotFound(logical.to_string()))
    }

    /// UTF-8 contents of a resource.
    pub fn read(&self, logical: &str) -> Result<String, ResourceError> {
        let path = self.locate(logical)?;
        fs::read_to_string(&path).map_err(|source| ResourceError::Read {
            path: logical.to_string(),
            source,
        })
    }

    /// Load every startup script, in order. The first failure aborts.
    pub fn bootstrap(&self, scripts: &[String]) -> Result<Vec<BootstrapScript>, ResourceError> {
        scripts
            .iter()
            .map(|name| {
                Ok(BootstrapScript {
                    name: name.clone(),
                    source: self.read(name)?,
                })
            })
            .collect()
    }

    /// `messages.json` for `language`, falling back to `fallback`.
    pub fn locale(&self, language: &str, fallback: &str) -> Option<String> {
        [language, fallback]
            .iter()
            .filter(|lang| is_contained(lang))
            .find_map(|lang| {
                self.read(&format!("{}/{}/messages.json", LOCALES_DIR, lang))
                    .ok()
            })
    }

    pub fn date_formats(&self) -> Result<String, ResourceError> {
        self.read(DATE_FORMATS)
    }

    /// Toolbar PNG for an image path sent by the runtime.
    ///
    /// Only the directory and file stem are used: `images/zotero-z-16px.svg`
    /// resolves to `images/zotero-z-16px.png`.
    pub fn toolbar_image(&self, image_path: &str) -> Result<PathBuf, ResourceError> {
        let path = Path::new(image_path);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ResourceError::NotFound(image_path.to_string()))?;

        let png = match path.parent().and_then(|p| p.to_str()) {
            Some(dir) if !dir.is_empty() => format!("{}/{}.png", dir, stem),
            _ => format!("{}.png", stem),
        };

        if !is_contained(&png) {
            return Err(ResourceError::OutsideBundle(image_path.to_string()));
        }

        let candidate = self.root.join(&self.fallback_subdir).join(&png);
        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(ResourceError::NotFound(png))
        }
    }
}
