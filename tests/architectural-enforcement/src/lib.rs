//! Architectural Enforcement
//!
//! Source scanners shared by the enforcement tests under `tests/`:
//! - No sleeping in production code (wait on I/O or timers owned by tokio)
//! - No panicking shortcuts (`unwrap`/`expect`) outside test code
//! - No process-wide mutable state; the router owns everything it touches
//!
//! Scanning is line based. Everything after a `#[cfg(test)]` attribute is
//! treated as test code, which matches how the workspace places its unit
//! tests at the bottom of each file.

use std::fs;
use std::path::{Path, PathBuf};

/// One rule hit in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the hit
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Trimmed source line
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["switchboard/core/src", "switchboard/ctl/src"];

/// Workspace root, derived from this crate's manifest location
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("../.."))
}

/// All `.rs` files under the production directories
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.path().to_path_buf());
            }
        }
    }
    files.sort();
    files
}

/// Strip a trailing `//` comment; whole-line comments become empty
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Lines of `content` that precede the first `#[cfg(test)]` attribute
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| (idx + 1, line))
        .collect()
}

/// Scan `content` for production lines where `matches` fires on the code part
pub fn scan_content<F>(path: &Path, content: &str, matches: F) -> Vec<Violation>
where
    F: Fn(&str) -> bool,
{
    production_lines(content)
        .into_iter()
        .filter(|(_, line)| matches(code_part(line)))
        .map(|(line, text)| Violation {
            path: path.to_path_buf(),
            line,
            text: text.trim().to_string(),
        })
        .collect()
}

/// Scan every production file
pub fn scan_production<F>(matches: F) -> Vec<Violation>
where
    F: Fn(&str) -> bool,
{
    production_files()
        .iter()
        .filter_map(|path| {
            fs::read_to_string(path)
                .ok()
                .map(|content| scan_content(path, &content, &matches))
        })
        .flatten()
        .collect()
}

/// Sleeping instead of waiting on an event
#[must_use]
pub fn is_sleep(code: &str) -> bool {
    code.contains("thread::sleep") || code.contains("time::sleep(")
}

/// Panicking shortcuts on `Option`/`Result`
#[must_use]
pub fn is_panicking_unwrap(code: &str) -> bool {
    code.contains(".unwrap()") || code.contains(".expect(")
}

/// Process-wide mutable state
#[must_use]
pub fn is_global_state(code: &str) -> bool {
    code.contains("static mut")
        || code.contains("lazy_static!")
        || code.contains("OnceLock<")
        || code.contains("OnceCell<")
        || (code.trim_start().starts_with("static ") && code.contains("Mutex"))
}

/// Print violations and panic if there are any
pub fn report(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) of '{rule}' in production code.",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let lines = production_lines(content);
        assert_eq!(lines, vec![(1, "fn a() {}")]);
    }

    #[test]
    fn test_comments_are_ignored() {
        let path = Path::new("lib.rs");
        let content = "// calling .unwrap() here would panic\nlet x = y.unwrap_or(0);\n";
        assert!(scan_content(path, content, is_panicking_unwrap).is_empty());
    }

    #[test]
    fn test_detects_unwrap_with_line_number() {
        let path = Path::new("lib.rs");
        let content = "fn a() {\n    let x = y.unwrap();\n}\n";
        let hits = scan_content(path, content, is_panicking_unwrap);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line, 2);
        assert_eq!(hits[0].text, "let x = y.unwrap();");
    }

    #[test]
    fn test_rule_predicates() {
        assert!(is_sleep("std::thread::sleep(d);"));
        assert!(is_sleep("tokio::time::sleep(d).await;"));
        assert!(!is_sleep("tokio::time::timeout(d, f).await"));

        assert!(is_global_state("static mut COUNTER: u32 = 0;"));
        assert!(is_global_state("static ROUTER: OnceLock<Router> = OnceLock::new();"));
        assert!(!is_global_state("let pool = DashMap::new();"));

        assert!(!is_panicking_unwrap("x.unwrap_or_else(|_| 1)"));
        assert!(!is_panicking_unwrap("x.expect_err(\"boom\")"));
    }

    #[test]
    fn test_workspace_root_contains_core() {
        assert!(workspace_root().join("switchboard/core/src/lib.rs").exists());
    }
}
