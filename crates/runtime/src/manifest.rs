//! Package manifests (`module.json`)
//!
//! A package directory describes itself with a UTF-8 `module.json`. The
//! loader parses it to decide how to build the package: which sources
//! belong to it, which file is the entry point, and whether the package
//! is a source or native module. Multi-module packages list their members
//! under `modules`.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ModuleError;

pub const MANIFEST_FILE: &str = "module.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Source,
    Native,
}

fn default_type() -> PackageType {
    PackageType::Source
}

/// One member of a multi-module package.
#[derive(Debug, Clone, Deserialize)]
pub struct SubModule {
    pub name: String,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "type", default = "default_type")]
    pub package_type: PackageType,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub dependencies: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub modules: Vec<SubModule>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Manifest, ModuleError> {
        let path = dir.join(MANIFEST_FILE);
        let text =
            fs::read_to_string(&path).map_err(|e| ModuleError::Io(path.clone(), e))?;
        serde_json::from_str(&text)
            .map_err(|e| ModuleError::Corrupt(format!("{}: {}", path.display(), e)))
    }

    /// The entry-point source file, relative to the package directory.
    pub fn entry_point(&self) -> Option<&str> {
        self.main
            .as_deref()
            .or_else(|| self.sources.first().map(String::as_str))
    }
}
