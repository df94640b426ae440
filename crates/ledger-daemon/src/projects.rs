//! Open-project enumeration from the editor's open file handles.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ledger_core::sources::{Result, SourceError};
use ledger_core::{OpenProjects, OpenProjectsSource, ProjectResolver};
use tokio::process::Command;
use tracing::{debug, warn};

/// Lists the bundles that `editor_process` currently holds files in.
pub struct LsofProjects {
    editor_process: String,
    resolver: Arc<dyn ProjectResolver>,
}

impl LsofProjects {
    pub fn new(editor_process: impl Into<String>, resolver: Arc<dyn ProjectResolver>) -> Self {
        Self {
            editor_process: editor_process.into(),
            resolver,
        }
    }

    /// Distinct bundle roots behind a set of open file paths.
    fn bundles<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) -> BTreeSet<PathBuf> {
        paths
            .into_iter()
            .filter_map(|p| self.resolver.bundle_root(p))
            .collect()
    }
}

/// File names from `lsof -F n0` output. Each line holds NUL-terminated
/// fields; the name field starts with `n`.
pub fn parse_lsof_paths(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .flat_map(|line| line.split('\0'))
        .filter_map(|field| field.strip_prefix('n'))
        .filter(|name| name.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}

#[async_trait]
impl OpenProjectsSource for LsofProjects {
    async fn open_projects(&self) -> Result<OpenProjects> {
        let output = Command::new("lsof")
            .args(["-F", "n0", "-wbc", &self.editor_process])
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            // lsof exits 1 when the process has nothing open, or is not running
            debug!("{} is not active", self.editor_process);
            return Ok(OpenProjects::new());
        }

        let paths = parse_lsof_paths(&stdout);
        let mut projects = OpenProjects::new();
        let mut failures = Vec::new();

        for bundle in self.bundles(paths.iter().map(PathBuf::as_path)) {
            match self.resolver.describe(&bundle) {
                Ok((uuid, project)) => {
                    projects.entry(uuid).or_insert(project);
                }
                Err(e) => {
                    warn!("[PROJECTS] {}", e);
                    failures.push(e.to_string());
                }
            }
        }

        if projects.is_empty() && !failures.is_empty() {
            return Err(SourceError::Enumeration(failures.join("; ")));
        }
        Ok(projects)
    }
}
