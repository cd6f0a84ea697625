//! Build-directory layout and filesystem plumbing.
//!
//! Every job lives under `<dir>/<design>/<jobname><jobid>/`, with one
//! working directory per flow node named `<step><index>` and the fixed
//! `inputs/`, `outputs/`, `reports/` triad inside it. Data moves between
//! nodes exclusively by copying an upstream `outputs/` into a downstream
//! `inputs/` (or `outputs/` for selector adoption), so a node never reads
//! outside its own directory.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

use crate::flowgraph::NodeId;
use crate::schema::{KeyStore, TypedValue};

#[derive(Debug, Error, Diagnostic)]
pub enum WorkspaceError {
    #[error("workspace io error for {path}: {source}")]
    #[diagnostic(code(fabflow::workspace::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Resolved job directory layout.
#[derive(Clone, Debug, PartialEq)]
pub struct JobDirs {
    job_dir: PathBuf,
    design: String,
}

impl JobDirs {
    /// Resolve `<dir>/<design>/<jobname><jobid>` from the store. The jobid
    /// is rendered without a fractional part.
    pub fn from_store(store: &mut KeyStore) -> Self {
        let dir = store
            .get(&["dir"])
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| "build".to_string());
        let design = store
            .get(&["design"])
            .as_str()
            .map(str::to_string)
            .unwrap_or_default();
        let jobname = store
            .get(&["jobname"])
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| "job".to_string());
        let jobid = match store.get(&["jobid"]) {
            TypedValue::Num(n) => n as i64,
            _ => 0,
        };
        let job_dir = PathBuf::from(dir)
            .join(&design)
            .join(format!("{jobname}{jobid}"));
        Self { job_dir, design }
    }

    #[must_use]
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    #[must_use]
    pub fn design(&self) -> &str {
        &self.design
    }

    #[must_use]
    pub fn node_dir(&self, id: &NodeId) -> PathBuf {
        self.job_dir.join(id.to_string())
    }

    #[must_use]
    pub fn inputs_dir(&self, id: &NodeId) -> PathBuf {
        self.node_dir(id).join("inputs")
    }

    #[must_use]
    pub fn outputs_dir(&self, id: &NodeId) -> PathBuf {
        self.node_dir(id).join("outputs")
    }

    #[must_use]
    pub fn reports_dir(&self, id: &NodeId) -> PathBuf {
        self.node_dir(id).join("reports")
    }

    /// The result package a completed node leaves in its `outputs/`.
    #[must_use]
    pub fn package_path(&self, id: &NodeId) -> PathBuf {
        self.outputs_dir(id).join(format!("{}.pkg.json", self.design))
    }

    /// Recreate the node working directory from scratch with the
    /// `inputs/outputs/reports` triad. Stale content from a previous run is
    /// removed first.
    pub fn prepare_node_dir(&self, id: &NodeId) -> Result<PathBuf, WorkspaceError> {
        let dir = self.node_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;
        }
        for sub in ["inputs", "outputs", "reports"] {
            let path = dir.join(sub);
            std::fs::create_dir_all(&path).map_err(|e| WorkspaceError::io(&path, e))?;
        }
        Ok(dir)
    }
}

/// Copy `src`'s contents into `dst` recursively, following the directory
/// shape. Symlinks are copied as their target's content.
pub fn copy_dir_contents(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    std::fs::create_dir_all(dst).map_err(|e| WorkspaceError::io(dst, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| WorkspaceError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| WorkspaceError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| WorkspaceError::io(&from, e))?;
        if file_type.is_dir() {
            copy_dir_contents(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| WorkspaceError::io(&from, e))?;
        }
    }
    Ok(())
}

/// Write an executable `replay.sh` reproducing the tool invocation.
pub fn write_replay_script(
    dir: &Path,
    program: &str,
    args: &[String],
) -> Result<PathBuf, WorkspaceError> {
    let path = dir.join("replay.sh");
    let mut script = String::from("#!/bin/bash\n");
    script.push_str(program);
    for arg in args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }
    script.push('\n');
    std::fs::write(&path, script).map_err(|e| WorkspaceError::io(&path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| WorkspaceError::io(&path, e))?;
    }
    Ok(path)
}

fn shell_quote(arg: &str) -> String {
    if arg.is_empty()
        || arg
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || "-_./=,".contains(c)))
    {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}
