//! Code search: regex over the text files of a directory tree.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::Path;

use regex::Regex;
use walkdir::{DirEntry, WalkDir};

use super::{SearchCodeArgs, Sandbox, ToolError};

/// Directories that are never worth searching.
const SKIPPED_DIRS: &[&str] = &[".git", ".hg", ".svn", "target", "node_modules", "__pycache__"];

/// Bytes sniffed for a NUL to decide a file is binary.
const BINARY_SNIFF_BYTES: usize = 8192;

/// Longest line text kept per match.
const MAX_LINE_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub file: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    pub pattern: String,
    pub matches: Vec<SearchMatch>,
    pub truncated: bool,
}

impl SearchResults {
    pub fn render(&self) -> String {
        if self.matches.is_empty() {
            return format!("No matches found for pattern: {}", self.pattern);
        }

        let mut out = self
            .matches
            .iter()
            .map(|m| format!("{}:{}: {}", m.file, m.line, m.text))
            .collect::<Vec<_>>()
            .join("\n");

        if self.truncated {
            out.push_str(&format!(
                "\n\n... (showing first {} matches)",
                self.matches.len()
            ));
        }
        out
    }
}

/// Search text files under `args.path` for lines matching `args.pattern`.
///
/// Files are visited in sorted order, so results are ordered by path and
/// then by line number. At most `max_matches` results are returned.
pub async fn search_code(
    sandbox: &Sandbox,
    args: &SearchCodeArgs,
    max_matches: usize,
) -> Result<SearchResults, ToolError> {
    let root = sandbox.resolve(&args.path)?;
    if !root.exists() {
        return Err(ToolError::NotFound(args.path.clone()));
    }

    let matcher = build_matcher(&args.pattern)?;
    let file_glob = match &args.file_pattern {
        Some(p) => Some(
            glob::Pattern::new(p)
                .map_err(|e| ToolError::invalid("search_code", format!("bad file_pattern: {}", e)))?,
        ),
        None => None,
    };

    let sandbox = sandbox.clone();
    let pattern = args.pattern.clone();
    // Walking and reading is blocking I/O.
    tokio::task::spawn_blocking(move || {
        let (matches, truncated) =
            scan_tree(&sandbox, &root, &matcher, file_glob.as_ref(), max_matches);
        SearchResults {
            pattern,
            matches,
            truncated,
        }
    })
    .await
    .map_err(|e| ToolError::Io {
        path: args.path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })
}

/// Compile the pattern as a regex, falling back to a literal match.
fn build_matcher(pattern: &str) -> Result<Regex, ToolError> {
    if let Ok(re) = Regex::new(pattern) {
        return Ok(re);
    }
    tracing::debug!(pattern, "pattern is not a valid regex, matching literally");
    Regex::new(&regex::escape(pattern))
        .map_err(|e| ToolError::invalid("search_code", format!("bad pattern: {}", e)))
}

fn scan_tree(
    sandbox: &Sandbox,
    root: &Path,
    matcher: &Regex,
    file_glob: Option<&glob::Pattern>,
    max_matches: usize,
) -> (Vec<SearchMatch>, bool) {
    let mut matches = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e));

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(glob) = file_glob {
            if !glob.matches(&entry.file_name().to_string_lossy()) {
                continue;
            }
        }

        let Some(mut reader) = open_text(entry.path()) else {
            continue;
        };
        let file = sandbox.display_relative(entry.path());

        let mut buf = Vec::new();
        let mut line_no = 0;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => line_no += 1,
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(&['\r', '\n'][..]);
            if !matcher.is_match(line) {
                continue;
            }
            if matches.len() >= max_matches {
                return (matches, true);
            }
            matches.push(SearchMatch {
                file: file.clone(),
                line: line_no,
                text: clip(line.trim()),
            });
        }
    }

    (matches, false)
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| SKIPPED_DIRS.contains(&name) || name.starts_with('.'))
            .unwrap_or(false)
}

/// Open a file for line reading, or `None` if it looks binary or is
/// unreadable. Only the first few KiB are sniffed; the rest is streamed.
fn open_text(path: &Path) -> Option<impl BufRead> {
    let mut file = File::open(path).ok()?;
    let mut head = Vec::with_capacity(BINARY_SNIFF_BYTES);
    (&mut file)
        .take(BINARY_SNIFF_BYTES as u64)
        .read_to_end(&mut head)
        .ok()?;

    if head.contains(&0) {
        return None;
    }
    Some(BufReader::new(Cursor::new(head).chain(file)))
}

fn clip(line: &str) -> String {
    if line.chars().count() <= MAX_LINE_CHARS {
        line.to_string()
    } else {
        let clipped: String = line.chars().take(MAX_LINE_CHARS).collect();
        format!("{}...", clipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = Sandbox::new(dir.path()).expect("sandbox");
        (dir, sandbox)
    }

    fn args(pattern: &str, path: &str, file_pattern: Option<&str>) -> SearchCodeArgs {
        SearchCodeArgs {
            pattern: pattern.to_string(),
            path: path.to_string(),
            file_pattern: file_pattern.map(str::to_string),
        }
    }

    fn write(sb: &Sandbox, rel: &str, content: &str) {
        let path = sb.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn finds_matches_ordered_by_file_then_line() {
        let (_dir, sb) = sandbox();
        write(&sb, "b.py", "def beta():\n    pass\ndef gamma():\n");
        write(&sb, "a.py", "import os\ndef alpha():\n");

        let results = search_code(&sb, &args(r"^def \w+", ".", None), 100)
            .await
            .unwrap();
        let found: Vec<_> = results
            .matches
            .iter()
            .map(|m| (m.file.as_str(), m.line))
            .collect();
        assert_eq!(found, vec![("a.py", 2), ("b.py", 1), ("b.py", 3)]);
        assert!(!results.truncated);
        assert_eq!(results.matches[0].text, "def alpha():");
    }

    #[tokio::test]
    async fn invalid_regex_matches_literally() {
        let (_dir, sb) = sandbox();
        write(&sb, "main.rs", "fn main() {\n    call(x);\n}\n");

        let results = search_code(&sb, &args("call(", ".", None), 100)
            .await
            .unwrap();
        assert_eq!(results.matches.len(), 1);
        assert_eq!(results.matches[0].line, 2);
    }

    #[tokio::test]
    async fn honors_file_pattern_and_subdirectory() {
        let (_dir, sb) = sandbox();
        write(&sb, "src/lib.rs", "// marker: rust\n");
        write(&sb, "src/app.py", "# marker: python\n");
        write(&sb, "docs/notes.md", "marker: docs\n");

        let results = search_code(&sb, &args("marker", "src", Some("*.py")), 100)
            .await
            .unwrap();
        assert_eq!(results.matches.len(), 1);
        assert_eq!(results.matches[0].file, "src/app.py");
    }

    #[tokio::test]
    async fn caps_total_matches() {
        let (_dir, sb) = sandbox();
        let body = "hit\n".repeat(50);
        write(&sb, "many.txt", &body);

        let results = search_code(&sb, &args("hit", ".", None), 10).await.unwrap();
        assert_eq!(results.matches.len(), 10);
        assert!(results.truncated);
        assert!(results.render().ends_with("(showing first 10 matches)"));
    }

    #[tokio::test]
    async fn skips_binary_files_and_vcs_dirs() {
        let (_dir, sb) = sandbox();
        std::fs::write(sb.root().join("blob.bin"), b"needle\0\x01\x02").unwrap();
        write(&sb, ".git/config", "needle\n");
        write(&sb, "real.txt", "needle\n");

        let results = search_code(&sb, &args("needle", ".", None), 100)
            .await
            .unwrap();
        assert_eq!(results.matches.len(), 1);
        assert_eq!(results.matches[0].file, "real.txt");
    }

    #[tokio::test]
    async fn escaping_search_root_is_denied() {
        let (_dir, sb) = sandbox();
        let err = search_code(&sb, &args("x", "..", None), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn no_matches_renders_a_note() {
        let (_dir, sb) = sandbox();
        write(&sb, "a.txt", "nothing here\n");
        let results = search_code(&sb, &args("absent", ".", None), 100)
            .await
            .unwrap();
        assert_eq!(results.render(), "No matches found for pattern: absent");
    }

    #[tokio::test]
    async fn handles_crlf_and_invalid_utf8_lines() {
        let (_dir, sb) = sandbox();
        std::fs::write(
            sb.root().join("mixed.txt"),
            b"first\r\nneedle \xff here\r\nlast needle",
        )
        .unwrap();

        let results = search_code(&sb, &args("needle", ".", None), 100)
            .await
            .unwrap();
        let found: Vec<_> = results.matches.iter().map(|m| m.line).collect();
        assert_eq!(found, vec![2, 3]);
        assert_eq!(results.matches[1].text, "last needle");
    }

    #[tokio::test]
    async fn only_the_head_is_sniffed_for_binary() {
        let (_dir, sb) = sandbox();
        let mut content = b"needle\n".to_vec();
        content.extend(std::iter::repeat(b'x').take(BINARY_SNIFF_BYTES));
        content.push(0);
        std::fs::write(sb.root().join("late_nul.log"), content).unwrap();

        let results = search_code(&sb, &args("needle", ".", None), 100)
            .await
            .unwrap();
        assert_eq!(results.matches.len(), 1);
        assert_eq!(results.matches[0].line, 1);
    }
}
