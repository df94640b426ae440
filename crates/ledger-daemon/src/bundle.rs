//! Project bundle identification.
//!
//! A bundle is a directory named `*.<extension>`. Its uuid lives in a
//! `<string>` element of `Settings.plist` at the bundle root. Rendered
//! versions in a sibling `Output`/`Outputs` folder are reported as project
//! info.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use ledger_core::sources::{Result, SourceError};
use ledger_core::{OpenProject, ProjectInfo, ProjectResolver};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;

static UUID_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<string>\s*(\w{8}-\w{4}-\w{4}-\w{4}-\w{12})\s*</string>").expect("valid regex")
});

static OUTPUTS_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^outputs?$").expect("valid regex"));

static VERSIONED_RENDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[ _-]v(\d+)[a-z]?[. _-].*(mov|mp4|m4v)").expect("valid regex")
});

/// Maps paths to bundles using the configured naming rules.
#[derive(Debug, Clone)]
pub struct BundleResolver {
    suffix: String,
    marker: String,
    excluded: Vec<String>,
}

impl BundleResolver {
    pub fn new(extension: &str, marker: &str, excluded: Vec<String>) -> Self {
        Self {
            suffix: format!(".{}", extension.trim_start_matches('.')),
            marker: marker.to_string(),
            excluded,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.bundle_extension,
            &config.activity_marker,
            config.excluded_fragments.clone(),
        )
    }

    fn is_bundle_name(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.len() > self.suffix.len() && n.ends_with(&self.suffix))
    }
}

impl ProjectResolver for BundleResolver {
    fn bundle_root(&self, path: &Path) -> Option<PathBuf> {
        let text = path.to_string_lossy();
        if self.excluded.iter().any(|f| text.contains(f.as_str())) {
            return None;
        }

        let root = path.ancestors().find(|p| self.is_bundle_name(p))?;
        if !self.marker.is_empty() {
            let inner = path.strip_prefix(root).ok()?;
            if !inner.to_string_lossy().contains(&self.marker) {
                return None;
            }
        }
        Some(root.to_path_buf())
    }

    fn describe(&self, bundle: &Path) -> Result<(String, OpenProject)> {
        if !self.is_bundle_name(bundle) {
            return Err(SourceError::NotABundle(bundle.display().to_string()));
        }

        let settings = fs::read_to_string(bundle.join("Settings.plist"))?;
        let uuid = UUID_STRING
            .captures(&settings)
            .map(|c| c[1].to_string())
            .ok_or_else(|| SourceError::MissingUuid(bundle.display().to_string()))?;

        let name = bundle
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut project = OpenProject::new(name, bundle.to_string_lossy());
        project.info = output_version_info(bundle);

        Ok((uuid, project))
    }
}

/// `version` and `version_mtime` of the highest-numbered render next to the
/// bundle, if any.
pub fn output_version_info(bundle: &Path) -> ProjectInfo {
    let mut info = ProjectInfo::new();
    let Some((name, mtime)) = bundle.parent().and_then(latest_output_version) else {
        return info;
    };
    info.insert("version".to_string(), name);
    info.insert("version_mtime".to_string(), mtime.to_string());
    info
}

fn sorted_entries(dir: &Path) -> Vec<fs::DirEntry> {
    let mut entries: Vec<_> = match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
        Err(_) => return Vec::new(),
    };
    entries.sort_by_key(|e| e.file_name());
    entries
}

fn latest_output_version(parent: &Path) -> Option<(String, i64)> {
    let outputs = sorted_entries(parent).into_iter().find(|e| {
        e.file_type().is_ok_and(|t| t.is_dir()) && OUTPUTS_DIR.is_match(&e.file_name().to_string_lossy())
    })?;

    let mut best: Option<(u64, String, i64)> = None;
    for entry in sorted_entries(&outputs.path()) {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(version) = VERSIONED_RENDER
            .captures(&name)
            .and_then(|c| c[1].parse::<u64>().ok())
        else {
            continue;
        };
        if best.as_ref().is_some_and(|(v, _, _)| *v >= version) {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        best = Some((version, name, mtime));
    }

    best.map(|(_, name, mtime)| (name, mtime))
}
