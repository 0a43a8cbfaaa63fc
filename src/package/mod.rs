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

//! Normalized package model shared by both package sources.
//!
//! A record is tagged with its [`Origin`] instead of having a type per
//! source. Records are shared as `Arc<PackageRecord>` and never mutated;
//! a refresh fetches new records.

pub mod version;

pub use version::{ConstraintOp, DependencySpec, Provision, Version, VersionConstraint};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Where a package comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Origin {
    /// Signed binary repositories (core, extra, multilib, ...)
    BinaryRepo,
    /// Source-based community repository (AUR)
    CommunitySource,
}

impl Origin {
    /// Short label for tables and logs
    pub fn label(self) -> &'static str {
        match self {
            Origin::BinaryRepo => "repo",
            Origin::CommunitySource => "aur",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A package as reported by one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: Version,
    pub origin: Origin,
    pub description: String,
    /// Ordered as declared by the package
    pub dependencies: Vec<DependencySpec>,
    pub provides: Vec<Provision>,
    pub conflicts: Vec<DependencySpec>,
    /// Repository name (`core`, `extra`, `aur`, ...)
    pub repository: String,
    /// Split-package base, community source only
    pub package_base: Option<String>,
    /// Whether the local database reports this package installed
    pub installed: bool,
}

impl PackageRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>, origin: Origin) -> Self {
        let repository = match origin {
            Origin::BinaryRepo => "sync",
            Origin::CommunitySource => "aur",
        };
        Self {
            name: name.into(),
            version: Version::new(version),
            origin,
            description: String::new(),
            dependencies: Vec::new(),
            provides: Vec::new(),
            conflicts: Vec::new(),
            repository: repository.to_string(),
            package_base: None,
            installed: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependency(mut self, dep: DependencySpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Add runtime dependencies from their string form
    pub fn depends_on<'a>(mut self, deps: impl IntoIterator<Item = &'a str>) -> Self {
        self.dependencies
            .extend(deps.into_iter().map(DependencySpec::parse));
        self
    }

    /// Add build-time-only dependencies from their string form
    pub fn build_depends_on<'a>(mut self, deps: impl IntoIterator<Item = &'a str>) -> Self {
        self.dependencies
            .extend(deps.into_iter().map(DependencySpec::parse_build));
        self
    }

    pub fn providing<'a>(mut self, provides: impl IntoIterator<Item = &'a str>) -> Self {
        self.provides
            .extend(provides.into_iter().map(Provision::parse));
        self
    }

    pub fn conflicting<'a>(mut self, conflicts: impl IntoIterator<Item = &'a str>) -> Self {
        self.conflicts
            .extend(conflicts.into_iter().map(DependencySpec::parse));
        self
    }

    pub fn in_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_package_base(mut self, base: impl Into<String>) -> Self {
        self.package_base = Some(base.into());
        self
    }

    pub fn mark_installed(mut self, installed: bool) -> Self {
        self.installed = installed;
        self
    }

    /// Package base used to fetch build files
    pub fn base(&self) -> &str {
        self.package_base.as_deref().unwrap_or(&self.name)
    }

    /// Whether this record satisfies a dependency, directly or via `provides`
    pub fn satisfies(&self, dep: &DependencySpec) -> bool {
        if self.name == dep.name {
            return dep.is_satisfied_by(&self.version);
        }
        self.provides
            .iter()
            .any(|p| p.satisfies(&dep.name, dep.constraint.as_ref()))
    }

    /// The provision entry for a virtual name, if any
    pub fn provision(&self, name: &str) -> Option<&Provision> {
        self.provides.iter().find(|p| p.name == name)
    }

    pub fn runtime_dependencies(&self) -> impl Iterator<Item = &DependencySpec> {
        self.dependencies.iter().filter(|d| !d.build_only)
    }

    pub fn build_dependencies(&self) -> impl Iterator<Item = &DependencySpec> {
        self.dependencies.iter().filter(|d| d.build_only)
    }
}

/// What satisfies a dependency on the running system
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledMatch {
    /// Installed package providing the name
    pub provider: String,
    pub version: Option<Version>,
}

/// Snapshot of the locally installed packages
#[derive(Debug, Clone, Default)]
pub struct InstalledState {
    packages: HashMap<String, Version>,
    provided: HashMap<String, Vec<(String, Provision)>>,
}

impl InstalledState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, version: &str, provides: Vec<Provision>) {
        self.packages.insert(name.to_string(), Version::new(version));
        for provision in provides {
            self.provided
                .entry(provision.name.clone())
                .or_default()
                .push((name.to_string(), provision));
        }
    }

    pub fn with(mut self, name: &str, version: &str) -> Self {
        self.insert(name, version, Vec::new());
        self
    }

    pub fn version_of(&self, name: &str) -> Option<&Version> {
        self.packages.get(name)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Find an installed package satisfying `name` under every constraint
    pub fn satisfies(&self, name: &str, constraints: &[&VersionConstraint]) -> Option<InstalledMatch> {
        if let Some(version) = self.packages.get(name) {
            if constraints.iter().all(|c| c.satisfied_by(version)) {
                return Some(InstalledMatch {
                    provider: name.to_string(),
                    version: Some(version.clone()),
                });
            }
        }

        self.provided.get(name)?.iter().find_map(|(provider, provision)| {
            let ok = constraints
                .iter()
                .all(|c| provision.satisfies(name, Some(c)));
            ok.then(|| InstalledMatch {
                provider: provider.clone(),
                version: provision.version.clone(),
            })
        })
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}
