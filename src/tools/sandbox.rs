//! Workspace sandbox: resolves tool paths and rejects anything outside the root.

use std::io;
use std::path::{Component, Path, PathBuf};

use super::ToolError;

/// A canonical workspace root that every tool path is resolved against.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create the root directory if needed and canonicalize it.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` inside the root.
    ///
    /// The path is normalized lexically first, so `..` can never climb above
    /// the root. Then every existing component is checked with
    /// `symlink_metadata`: a symlink must resolve to a target inside the root,
    /// and a dangling symlink is refused. Nothing is created or modified here.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let requested = Path::new(path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(ToolError::AccessDenied(path.to_string()));
                    }
                }
                other => normalized.push(other.as_os_str()),
            }
        }

        let relative = normalized
            .strip_prefix(&self.root)
            .map_err(|_| ToolError::AccessDenied(path.to_string()))?;

        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let target = current
                        .canonicalize()
                        .map_err(|_| ToolError::AccessDenied(path.to_string()))?;
                    if !target.starts_with(&self.root) {
                        return Err(ToolError::AccessDenied(path.to_string()));
                    }
                }
                Ok(_) => {}
                // Nothing below a missing component can be a link.
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(ToolError::io(path, e)),
            }
        }

        Ok(normalized)
    }

    /// Render an absolute path inside the root relative to it, for tool output.
    pub fn display_relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => path.to_string_lossy().to_string(),
        }
    }
}
