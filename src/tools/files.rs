//! File tools: read, write and list inside the sandbox.

use super::{ListDirectoryArgs, ReadFileArgs, Sandbox, ToolError, WriteFileArgs};

/// Read a file as text.
pub async fn read_file(sandbox: &Sandbox, args: &ReadFileArgs) -> Result<String, ToolError> {
    let path = sandbox.resolve(&args.path)?;
    if path.is_dir() {
        return Err(ToolError::invalid(
            "read_file",
            format!("{} is a directory, use list_directory", args.path),
        ));
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ToolError::io(&args.path, e))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "read file");

    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

/// Create or overwrite a file, creating parent directories.
pub async fn write_file(sandbox: &Sandbox, args: &WriteFileArgs) -> Result<String, ToolError> {
    let path = sandbox.resolve(&args.path)?;
    if path.is_dir() {
        return Err(ToolError::invalid(
            "write_file",
            format!("{} is a directory", args.path),
        ));
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::io(&args.path, e))?;
    }

    let existed = path.exists();
    tokio::fs::write(&path, args.content.as_bytes())
        .await
        .map_err(|e| ToolError::io(&args.path, e))?;
    tracing::info!(path = %path.display(), bytes = args.content.len(), "wrote file");

    Ok(format!(
        "{} {} ({} bytes)",
        if existed { "Overwrote" } else { "Created" },
        sandbox.display_relative(&path),
        args.content.len()
    ))
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Sorted contents of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<DirEntry>,
}

impl DirectoryListing {
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return format!("Directory {} is empty", self.path);
        }

        let mut out = format!("Directory: {}\n", self.path);
        for entry in &self.entries {
            if entry.is_dir {
                out.push_str(&format!("{}/\n", entry.name));
            } else {
                out.push_str(&format!("{} ({} bytes)\n", entry.name, entry.size));
            }
        }
        out.pop();
        out
    }
}

/// List a directory, sorted by name so repeated calls are identical.
pub async fn list_directory(
    sandbox: &Sandbox,
    args: &ListDirectoryArgs,
) -> Result<DirectoryListing, ToolError> {
    let path = sandbox.resolve(&args.path)?;
    if path.is_file() {
        return Err(ToolError::invalid(
            "list_directory",
            format!("{} is a file, use read_file", args.path),
        ));
    }

    let mut read_dir = tokio::fs::read_dir(&path)
        .await
        .map_err(|e| ToolError::io(&args.path, e))?;

    let mut entries = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| ToolError::io(&args.path, e))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        // Follow symlinks for the type; a dangling link lists as a plain entry.
        let (is_dir, size) = match tokio::fs::metadata(entry.path()).await {
            Ok(meta) => (meta.is_dir(), if meta.is_dir() { 0 } else { meta.len() }),
            Err(_) => (false, 0),
        };
        entries.push(DirEntry { name, is_dir, size });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(DirectoryListing {
        path: sandbox.display_relative(&path),
        entries,
    })
}
