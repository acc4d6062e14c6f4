//! Architectural Enforcement
//!
//! Source scanners used by this package's integration tests to enforce
//! rules on the connection pool's production code:
//! - No sleeping; blocked threads wait on condition variables
//! - `parking_lot` locks only, never `std::sync::Mutex` or `RwLock`
//! - No `unwrap()` or `expect()` outside test modules
//!
//! Test modules (`#[cfg(test)]`) and comments are excluded from every scan.

use std::fs;
use std::path::{Path, PathBuf};

/// A rule violation at a source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Production source directory of the core crate
pub fn core_src() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../connpool/core/src")
}

/// All `.rs` files below `dir`
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Numbered code lines of `content`, without comments or test modules
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    let mut lines = Vec::new();
    let mut pending_test_attr = false;
    let mut depth: Option<i64> = None;

    for (idx, line) in content.lines().enumerate() {
        let code = line.split("//").next().unwrap_or(line);

        if let Some(d) = depth.as_mut() {
            *d += brace_delta(code);
            if *d <= 0 && code.contains('}') {
                depth = None;
            }
            continue;
        }

        if code.trim_start().starts_with("#[cfg(test)]") {
            pending_test_attr = true;
            continue;
        }
        if pending_test_attr {
            let delta = brace_delta(code);
            if code.contains('{') && delta > 0 {
                depth = Some(delta);
                pending_test_attr = false;
                continue;
            }
            if code.trim_end().ends_with(';') {
                // `#[cfg(test)] use ...;` and friends
                pending_test_attr = false;
                continue;
            }
            continue;
        }

        lines.push((idx + 1, code));
    }
    lines
}

fn brace_delta(code: &str) -> i64 {
    let mut delta = 0;
    let mut in_string = false;
    let mut prev = '\0';
    for c in code.chars() {
        match c {
            '"' if prev != '\\' => in_string = !in_string,
            '{' if !in_string => delta += 1,
            '}' if !in_string => delta -= 1,
            _ => {}
        }
        prev = c;
    }
    delta
}

/// Scan every production line under `dir` with `is_violation`
pub fn scan<F>(dir: &Path, is_violation: F) -> Vec<Violation>
where
    F: Fn(&str) -> bool,
{
    let mut violations = Vec::new();
    for path in rust_files(dir) {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for (line, code) in production_lines(&content) {
            if is_violation(code) {
                violations.push(Violation {
                    path: path.clone(),
                    line,
                    text: code.trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Print violations and fail
pub fn report(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!("\nFound {} violation(s). Fix these before merging!", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_modules_are_skipped() {
        let source = "fn a() {}\n\
                      #[cfg(test)]\n\
                      mod tests {\n\
                      fn b() { x.unwrap(); }\n\
                      }\n\
                      fn c() {}\n";
        let lines: Vec<usize> = production_lines(source).iter().map(|(n, _)| *n).collect();
        assert_eq!(lines, vec![1, 6]);
    }

    #[test]
    fn test_comments_are_stripped() {
        let lines = production_lines("let x = 1; // x.unwrap()\n");
        assert_eq!(lines, vec![(1, "let x = 1; ")]);
    }

    #[test]
    fn test_braces_in_strings_ignored() {
        assert_eq!(brace_delta(r#"format!("{}", x) {"#), 1);
    }
}
