//! Dead Code Enforcement
//!
//! Production sources of the workspace crates may not silence the dead code
//! lint or leave `todo!()` / `unimplemented!()` placeholders behind. Test
//! modules (everything after a file's `#[cfg(test)]`) and `tests.rs` files are
//! exempt.

use std::fs;
use std::path::{Path, PathBuf};

/// Patterns rejected in production code, with the reason printed on failure.
const FORBIDDEN: [(&str, &str); 3] = [
    ("dead_code", "silences the dead code lint"),
    ("todo!(", "placeholder left in a code path"),
    ("unimplemented!(", "placeholder left in a code path"),
];

/// One forbidden pattern found in production code
#[derive(Debug)]
struct Violation {
    file_path: String,
    line_number: usize,
    reason: &'static str,
    line: String,
}

#[derive(Default)]
struct ProductionScanner {
    violations: Vec<Violation>,
    files_checked: usize,
}

impl ProductionScanner {
    /// `src/` directories of every `cellsim-*` crate next to this one.
    fn source_roots(workspace: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
        let mut roots = Vec::new();
        for entry in fs::read_dir(workspace)? {
            let path = entry?.path();
            let is_crate = path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("cellsim-"));
            if is_crate && path.join("src").is_dir() {
                roots.push(path.join("src"));
            }
        }
        roots.sort();
        Ok(roots)
    }

    fn collect_sources(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_sources(&path, files)?;
            } else if path.extension().is_some_and(|ext| ext == "rs")
                && path.file_name().is_some_and(|name| name != "tests.rs")
            {
                files.push(path);
            }
        }
        Ok(())
    }

    /// Checks the production part of one file's contents.
    fn check_source(&mut self, file_path: &str, content: &str) {
        self.files_checked += 1;
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("#[cfg(test)]") {
                break;
            }
            if trimmed.starts_with("//") {
                continue;
            }
            for (pattern, reason) in FORBIDDEN {
                let hit = if pattern == "dead_code" {
                    trimmed.starts_with("#[allow(") && trimmed.contains(pattern)
                } else {
                    trimmed.contains(pattern)
                };
                if hit {
                    self.violations.push(Violation {
                        file_path: file_path.to_string(),
                        line_number: index + 1,
                        reason,
                        line: trimmed.to_string(),
                    });
                }
            }
        }
    }

    fn check_workspace(&mut self, workspace: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let mut files = Vec::new();
        for root in Self::source_roots(workspace)? {
            Self::collect_sources(&root, &mut files)?;
        }
        for file in files {
            let content = fs::read_to_string(&file)?;
            self.check_source(&file.to_string_lossy(), &content);
        }
        Ok(())
    }

    fn report(&self) -> bool {
        if self.violations.is_empty() {
            println!(
                "Dead code enforcement: {} files checked, no violations found",
                self.files_checked
            );
            return true;
        }
        for violation in &self.violations {
            println!(
                "{}:{}: {}\n  {}",
                violation.file_path, violation.line_number, violation.reason, violation.line
            );
        }
        println!(
            "Found {} violation(s) in {} file(s) checked",
            self.violations.len(),
            self.files_checked
        );
        false
    }
}

#[test]
fn test_scanner_flags_production_lines_only() {
    let mut scanner = ProductionScanner::default();
    let content = r#"
#[allow(dead_code)]
fn unused() {}

#[allow(clippy::too_many_arguments, dead_code)]
fn wide() { todo!() }

// todo!() in a comment is fine
#[cfg(test)]
mod tests {
    #[allow(dead_code)]
    fn helper() { unimplemented!() }
}
"#;

    scanner.check_source("sample.rs", content);

    let lines: Vec<usize> = scanner.violations.iter().map(|v| v.line_number).collect();
    assert_eq!(lines, vec![2, 5, 6]);
}

#[test]
fn dead_code_enforcement() {
    let mut scanner = ProductionScanner::default();
    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("..");

    scanner
        .check_workspace(&workspace)
        .expect("Failed to scan workspace sources");

    assert!(scanner.files_checked > 0);
    assert!(
        scanner.report(),
        "Forbidden patterns found in production code - see output above"
    );
}
