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

//! Binary repository adapter backed by the `pacman` query interface.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{Output, Stdio};
use tokio::process::Command;

use super::PackageSource;
use crate::error::{PacsmithError, PacsmithResult};
use crate::package::{DependencySpec, InstalledState, Origin, PackageRecord, Provision};

/// Sync-database queries through `pacman`
pub struct PacmanSource {
    program: String,
}

impl PacmanSource {
    pub fn new() -> Self {
        Self::with_program("pacman")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run a read-only pacman query; never prompts
    async fn run(&self, args: &[&str]) -> PacsmithResult<Output> {
        if which::which(&self.program).is_err() {
            return Err(PacsmithError::unavailable(
                self.name(),
                format!("'{}' not found in PATH", self.program),
            ));
        }

        tracing::debug!(program = %self.program, ?args, "querying package database");
        Command::new(&self.program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PacsmithError::unavailable(self.name(), e))
    }

    /// Snapshot of locally installed packages and what they provide
    pub async fn installed_state(&self) -> PacsmithResult<InstalledState> {
        let output = self.run(&["-Qi"]).await?;
        if !output.status.success() {
            return Err(PacsmithError::unavailable(
                self.name(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let mut state = InstalledState::new();
        for block in parse_info_blocks(&String::from_utf8_lossy(&output.stdout)) {
            let (Some(name), Some(version)) = (block.single("Name"), block.single("Version")) else {
                continue;
            };
            let provides = block.list("Provides").iter().map(|p| Provision::parse(p)).collect();
            state.insert(name, version, provides);
        }
        tracing::debug!(packages = state.len(), "loaded installed state");
        Ok(state)
    }
}

impl Default for PacmanSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageSource for PacmanSource {
    fn origin(&self) -> Origin {
        Origin::BinaryRepo
    }

    fn name(&self) -> &str {
        "pacman"
    }

    async fn query(&self, text: &str) -> PacsmithResult<Vec<PackageRecord>> {
        let output = self.run(&["-Ss", "--", text]).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !search_completed(output.status.code(), &stderr) {
            return Err(PacsmithError::unavailable(self.name(), stderr.trim()));
        }
        Ok(parse_search_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn fetch_details(&self, name: &str) -> PacsmithResult<Option<PackageRecord>> {
        Ok(self
            .fetch_details_batch(&[name.to_string()])
            .await?
            .into_iter()
            .find(|r| r.name == name))
    }

    async fn fetch_details_batch(&self, names: &[String]) -> PacsmithResult<Vec<PackageRecord>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["-Si", "--"];
        args.extend(names.iter().map(String::as_str));
        let output = self.run(&args).await?;

        // Unknown names are reported on stderr while known ones still print
        Ok(parse_info_blocks(&String::from_utf8_lossy(&output.stdout))
            .iter()
            .filter_map(InfoBlock::to_record)
            .collect())
    }

    async fn find_providers(&self, name: &str) -> PacsmithResult<Vec<PackageRecord>> {
        let output = self
            .run(&["-Sp", "--nodeps", "--nodeps", "--noconfirm", "--print-format", "%n", "--", name])
            .await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }

        let providers: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("::"))
            .map(str::to_string)
            .collect();

        let records = self.fetch_details_batch(&providers).await?;
        Ok(records.into_iter().filter(|r| r.provision(name).is_some()).collect())
    }
}

/// Parse `pacman -Ss` output into records (no dependency data)
pub fn parse_search_output(stdout: &str) -> Vec<PackageRecord> {
    let mut results = Vec::new();
    let mut current: Option<PackageRecord> = None;

    for line in stdout.lines() {
        if line.starts_with(char::is_whitespace) {
            if let Some(pkg) = current.as_mut() {
                pkg.description = line.trim().to_string();
            }
            continue;
        }

        if let Some(pkg) = current.take() {
            results.push(pkg);
        }

        let mut parts = line.split_whitespace();
        let (Some(full_name), Some(version)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (repo, name) = full_name.split_once('/').unwrap_or(("local", full_name));
        let installed = line.contains("[installed");

        current = Some(
            PackageRecord::new(name, version, Origin::BinaryRepo)
                .in_repository(repo)
                .mark_installed(installed),
        );
    }

    if let Some(pkg) = current {
        results.push(pkg);
    }
    results
}

/// One `Key : value` block from `pacman -Si` / `-Qi`
#[derive(Debug, Default)]
pub struct InfoBlock {
    fields: HashMap<String, Vec<String>>,
}

const NONE_VALUE: &str = "None";

impl InfoBlock {
    /// Single-valued field, `None` for missing or pacman's literal "None"
    pub fn single(&self, key: &str) -> Option<&str> {
        let value = self.fields.get(key)?.first()?.as_str();
        (value != NONE_VALUE).then_some(value)
    }

    /// Whitespace-separated list field
    pub fn list(&self, key: &str) -> Vec<String> {
        self.fields
            .get(key)
            .map(|lines| {
                lines
                    .iter()
                    .flat_map(|l| l.split_whitespace())
                    .filter(|v| *v != NONE_VALUE)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn to_record(&self) -> Option<PackageRecord> {
        let name = self.single("Name")?;
        let version = self.single("Version")?;

        let mut record = PackageRecord::new(name, version, Origin::BinaryRepo)
            .with_description(self.single("Description").unwrap_or_default())
            .in_repository(self.single("Repository").unwrap_or("local"));
        record.dependencies = self
            .list("Depends On")
            .iter()
            .map(|d| DependencySpec::parse(d))
            .collect();
        record.provides = self.list("Provides").iter().map(|p| Provision::parse(p)).collect();
        record.conflicts = self
            .list("Conflicts With")
            .iter()
            .map(|c| DependencySpec::parse(c))
            .collect();
        Some(record)
    }
}

/// Split `pacman -Si/-Qi` output into blocks
pub fn parse_info_blocks(stdout: &str) -> Vec<InfoBlock> {
    let mut blocks = Vec::new();
    let mut block = InfoBlock::default();
    let mut last_key: Option<String> = None;

    for line in stdout.lines() {
        if line.trim().is_empty() {
            if !block.fields.is_empty() {
                blocks.push(std::mem::take(&mut block));
            }
            last_key = None;
            continue;
        }

        if line.starts_with(char::is_whitespace) {
            // continuation of a multi-line value (e.g. Optional Deps)
            if let Some(key) = &last_key {
                block
                    .fields
                    .entry(key.clone())
                    .or_default()
                    .push(line.trim().to_string());
            }
            continue;
        }

        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            block
                .fields
                .entry(key.clone())
                .or_default()
                .push(value.trim().to_string());
            last_key = Some(key);
        }
    }

    if !block.fields.is_empty() {
        blocks.push(block);
    }
    blocks
}

/// `pacman -Ss` exits 1 with nothing on stderr when there are no matches;
/// anything else non-zero is a real failure (bad regex, locked database)
fn search_completed(exit_code: Option<i32>, stderr: &str) -> bool {
    match exit_code {
        Some(0) => true,
        Some(1) => stderr.trim().is_empty(),
        _ => false,
    }
}
