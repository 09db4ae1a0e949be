//! Workspaces: directories of named layers, addressed by explicit handles.
//!
//! Each layer is stored as `<workspace>/<name>.json`. There is no process-wide
//! "current workspace"; every operation receives the handle it works on.

use std::fmt;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{PrepError, Result};
use crate::layer::{Layer, ShapeType};

const LAYER_EXT: &str = "json";

// ── Layer addressing ─────────────────────────────────────────────────────────

/// A layer addressed by workspace directory and layer name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPath {
    pub workspace: PathBuf,
    pub name: String,
}

impl LayerPath {
    pub fn new(workspace: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self { workspace: workspace.into(), name: name.into() }
    }

    /// Parse `<dir>/<name>` (a trailing `.json` is accepted and stripped).
    pub fn parse(s: &str) -> Result<Self> {
        let path = Path::new(s);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PrepError::config(format!("'{s}' does not name a layer")))?;
        let name = name
            .strip_suffix(".json")
            .unwrap_or(name)
            .to_string();
        let workspace = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self { workspace, name })
    }

    pub fn file_path(&self) -> PathBuf {
        self.workspace.join(format!("{}.{LAYER_EXT}", self.name))
    }

    /// Refuse to write `output` over `input`.
    pub fn guard_overwrite(input: &LayerPath, output: &LayerPath) -> Result<()> {
        if input.name == output.name && same_dir(&input.workspace, &output.workspace) {
            return Err(PrepError::OverwriteGuard(input.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for LayerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace.display(), self.name)
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

// ── Workspace ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LayerHeader {
    shape_type: ShapeType,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open an existing workspace directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        match fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => Ok(Self { root }),
            Ok(_) => Err(PrepError::WorkspaceUnavailable {
                path: root,
                reason: "not a directory".to_string(),
            }),
            Err(e) => Err(PrepError::WorkspaceUnavailable { path: root, reason: e.to_string() }),
        }
    }

    /// Open the workspace, creating the directory if needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| PrepError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn layer_path(&self, name: &str) -> LayerPath {
        LayerPath::new(&self.root, name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.layer_path(name).file_path().is_file()
    }

    /// Layer names matching a glob pattern (case-insensitive) and,
    /// optionally, a shape type. Sorted by name.
    pub fn list_layers(&self, pattern: &str, shape: Option<ShapeType>) -> Result<Vec<String>> {
        let matcher = layer_pattern(pattern)?;
        let options = MatchOptions { case_sensitive: false, ..MatchOptions::new() };
        let entries = fs::read_dir(&self.root).map_err(|e| PrepError::io(&self.root, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PrepError::io(&self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LAYER_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !matcher.matches_with(name, options) {
                continue;
            }
            if let Some(wanted) = shape {
                let text = fs::read_to_string(&path).map_err(|e| PrepError::io(&path, e))?;
                let header: LayerHeader =
                    serde_json::from_str(&text).map_err(|e| PrepError::json(&path, e))?;
                if header.shape_type != wanted {
                    continue;
                }
            }
            names.push(name.to_string());
        }
        names.sort();
        Ok(names)
    }

    pub fn read_layer(&self, name: &str) -> Result<Layer> {
        let path = self.layer_path(name).file_path();
        if !path.is_file() {
            return Err(PrepError::LayerNotFound {
                workspace: self.root.clone(),
                name: name.to_string(),
            });
        }
        let text = fs::read_to_string(&path).map_err(|e| PrepError::io(&path, e))?;
        let mut layer: Layer = serde_json::from_str(&text).map_err(|e| PrepError::json(&path, e))?;
        layer.name = name.to_string();
        Ok(layer)
    }

    /// Write (or replace) `layer` under its own name. The file appears only
    /// once fully written.
    pub fn write_layer(&self, layer: &Layer) -> Result<LayerPath> {
        let target = self.layer_path(&layer.name);
        let path = target.file_path();
        let tmp = path.with_extension("json.partial");
        let text = serde_json::to_string_pretty(layer).map_err(|e| PrepError::json(&path, e))?;
        fs::write(&tmp, text).map_err(|e| PrepError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| PrepError::io(&path, e))?;
        debug!(layer = %target, features = layer.count(), "wrote layer");
        Ok(target)
    }

    /// Delete a layer. Returns false if it did not exist.
    pub fn delete_layer(&self, name: &str) -> Result<bool> {
        let path = self.layer_path(name).file_path();
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| PrepError::io(&path, e))?;
        Ok(true)
    }

    /// Move the layers `names` from `staging` into this workspace, all or
    /// nothing. Replaced layers are kept aside until every move has
    /// succeeded; on failure, moved layers are removed and the previous
    /// versions put back.
    pub fn commit_layers(&self, staging: &Workspace, names: &[&str]) -> Result<Vec<LayerPath>> {
        let mut moves: Vec<CommitMove> = Vec::with_capacity(names.len());
        for &name in names {
            match self.commit_one(staging, name) {
                Ok(m) => moves.push(m),
                Err(e) => {
                    for m in moves.iter().rev() {
                        m.roll_back();
                    }
                    return Err(e);
                }
            }
        }
        for m in &moves {
            m.discard_backup();
        }
        let paths: Vec<LayerPath> = names.iter().map(|n| self.layer_path(n)).collect();
        debug!(workspace = %self.root.display(), layers = ?names, "committed staged layers");
        Ok(paths)
    }

    fn commit_one(&self, staging: &Workspace, name: &str) -> Result<CommitMove> {
        let source = staging.layer_path(name).file_path();
        if !source.is_file() {
            return Err(PrepError::LayerNotFound { workspace: staging.root.clone(), name: name.to_string() });
        }
        let target = self.layer_path(name).file_path();
        let backup = if target.is_file() {
            let aside = target.with_extension("json.prev");
            fs::rename(&target, &aside).map_err(|e| PrepError::io(&target, e))?;
            Some(aside)
        } else {
            None
        };
        if let Err(e) = fs::rename(&source, &target) {
            if let Some(aside) = &backup {
                if let Err(restore) = fs::rename(aside, &target) {
                    warn!(path = %target.display(), "failed to restore previous layer: {restore}");
                }
            }
            return Err(PrepError::io(&target, e));
        }
        Ok(CommitMove { target, backup })
    }
}

/// One committed layer file and the previous version it replaced.
struct CommitMove {
    target: PathBuf,
    backup: Option<PathBuf>,
}

impl CommitMove {
    fn roll_back(&self) {
        if let Err(e) = fs::remove_file(&self.target) {
            warn!(path = %self.target.display(), "failed to remove partially committed layer: {e}");
        }
        if let Some(aside) = &self.backup {
            if let Err(e) = fs::rename(aside, &self.target) {
                warn!(path = %self.target.display(), "failed to restore previous layer: {e}");
            }
        }
    }

    fn discard_backup(&self) {
        if let Some(aside) = &self.backup {
            if let Err(e) = fs::remove_file(aside) {
                warn!(path = %aside.display(), "failed to remove replaced layer: {e}");
            }
        }
    }
}

/// Compile a layer-name pattern (`*`, `?`, `[...]`).
pub fn layer_pattern(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|e| PrepError::config(format!("invalid layer pattern '{pattern}': {e}")))
}

// ── Scratch workspaces ───────────────────────────────────────────────────────

/// A temporary workspace removed on every exit path.
///
/// A stale directory of the same name is deleted before use. Deletion failures
/// on drop are logged and swallowed.
#[derive(Debug)]
pub struct ScratchWorkspace {
    workspace: Workspace,
    removed: bool,
}

impl ScratchWorkspace {
    pub fn create(parent: &Path, name: &str) -> Result<Self> {
        let root = parent.join(name);
        if root.exists() {
            debug!(path = %root.display(), "removing stale scratch workspace");
            fs::remove_dir_all(&root).map_err(|e| PrepError::io(&root, e))?;
        }
        let workspace = Workspace::create(&root)?;
        Ok(Self { workspace, removed: false })
    }

    /// Delete the scratch directory now, reporting failure.
    pub fn close(mut self) -> Result<()> {
        self.removed = true;
        remove_scratch(self.workspace.path())
    }
}

impl Deref for ScratchWorkspace {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        &self.workspace
    }
}

impl Drop for ScratchWorkspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove_scratch(self.workspace.path()) {
            warn!("resource cleanup failure: {e}");
        }
    }
}

fn remove_scratch(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!(path = %path.display(), "deleted scratch workspace");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PrepError::Cleanup { path: path.to_path_buf(), source }),
    }
}
