//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! across the parley crates:
//! - Timers only where the chat protocol calls for them
//! - No blocking socket or file I/O inside the async core
//!
//! The helpers here walk the production sources and hand each line of
//! non-test code to a rule. Everything from the first `#[cfg(test)]` onward is
//! treated as test code, matching how the crates place their test modules.

use std::fmt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Source directory of a workspace crate, e.g. `source_dir("parley/core")`
pub fn source_dir(krate: &str) -> PathBuf {
    workspace_root().join(krate).join("src")
}

/// All `.rs` files under `dir`, sorted for stable reports
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.path().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Production lines of a source file as `(line_number, code)`
///
/// Stops at the first `#[cfg(test)]`. Comment lines are skipped and trailing
/// `//` comments are cut off.
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    let mut lines = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") || trimmed.is_empty() {
            continue;
        }
        let code = trimmed.split("//").next().unwrap_or(trimmed).trim_end();
        lines.push((idx + 1, code));
    }
    lines
}

/// One rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What the rule objected to
    pub reason: String,
    /// The offending code
    pub code: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.code
        )
    }
}

/// Run `rule` over every production line under `dir`
///
/// The rule receives the file path and a line of code and returns a reason
/// when the line breaks it.
pub fn scan<F>(dir: &Path, mut rule: F) -> Vec<Violation>
where
    F: FnMut(&Path, &str) -> Option<String>,
{
    let mut violations = Vec::new();
    for path in rust_files(dir) {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (line, code) in production_lines(&content) {
            if let Some(reason) = rule(&path, code) {
                violations.push(Violation {
                    path: path.clone(),
                    line,
                    reason,
                    code: code.to_string(),
                });
            }
        }
    }
    violations
}

/// Print violations and fail the calling test if there are any
pub fn report(title: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {title}:\n");
    for violation in violations {
        eprintln!("  {violation}");
    }
    eprintln!();
    panic!("Found {} {} violation(s)", violations.len(), title);
}

/// Whether `path` ends with `file_name`
pub fn is_file(path: &Path, file_name: &str) -> bool {
    path.file_name().is_some_and(|name| name == file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n// note\nfn b() {} // trailing\n#[cfg(test)]\nfn c() {}\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}"), (3, "fn b() {}")]);
    }

    #[test]
    fn test_source_dirs_exist() {
        assert!(source_dir("parley/core").join("lib.rs").exists());
        assert!(source_dir("parley/daemon").join("main.rs").exists());
    }
}
