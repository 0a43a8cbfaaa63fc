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

//! Candidate records fetched ahead of resolution.
//!
//! The resolver itself is synchronous; this collects every record it may
//! need from both sources in layers, one batched request per source per
//! layer.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::PacsmithResult;
use crate::package::{InstalledState, PackageRecord, VersionConstraint};
use crate::sources::PackageSource;

/// Candidate records for one resolve request
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Exact-name candidates, repo before AUR
    by_name: HashMap<String, Vec<Arc<PackageRecord>>>,
    /// Virtual name -> providers, in discovery order
    provided: HashMap<String, Vec<Arc<PackageRecord>>>,
    /// Sources that failed while collecting
    pub degraded: Vec<String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = PackageRecord>) -> Self {
        let mut catalog = Self::new();
        for record in records {
            catalog.insert(record);
        }
        catalog
    }

    /// Add a record; a second record with the same name and origin is ignored
    pub fn insert(&mut self, record: PackageRecord) -> bool {
        let candidates = self.by_name.entry(record.name.clone()).or_default();
        if candidates.iter().any(|c| c.origin == record.origin) {
            return false;
        }

        let record = Arc::new(record);
        candidates.push(Arc::clone(&record));
        candidates.sort_by_key(|c| c.origin);

        for provision in &record.provides {
            if provision.name != record.name {
                self.provided
                    .entry(provision.name.clone())
                    .or_default()
                    .push(Arc::clone(&record));
            }
        }
        true
    }

    pub fn candidates(&self, name: &str) -> &[Arc<PackageRecord>] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn providers(&self, name: &str) -> &[Arc<PackageRecord>] {
        self.provided.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name) || self.provided.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Collect the dependency closure of `target` from all sources.
    ///
    /// Dependencies already satisfied by the installed system are not
    /// expanded, unless a constraint discovered later rules the installed
    /// version out.
    pub async fn collect(
        target: &str,
        sources: &[Arc<dyn PackageSource>],
        installed: &InstalledState,
    ) -> PacsmithResult<Self> {
        let mut catalog = Self::new();
        let mut constraints: HashMap<String, Vec<VersionConstraint>> = HashMap::new();
        let mut fetched: HashSet<String> = HashSet::new();
        let mut deferred: HashSet<String> = HashSet::new();
        let mut queue = vec![target.to_string()];

        loop {
            while !queue.is_empty() {
                let layer: Vec<String> = queue
                    .drain(..)
                    .filter(|name| fetched.insert(name.clone()))
                    .collect();
                if layer.is_empty() {
                    break;
                }
                tracing::debug!(count = layer.len(), "fetching dependency layer");

                let mut added = Vec::new();
                let mut failures = 0;
                let answers = join_all(sources.iter().map(|s| s.fetch_details_batch(&layer))).await;
                for (source, answer) in sources.iter().zip(answers) {
                    match answer {
                        Ok(records) => added.extend(records),
                        Err(e) => {
                            failures += 1;
                            tracing::warn!(source = source.name(), error = %e, "source failed during resolution");
                            catalog.mark_degraded(source.name());
                            if failures == sources.len() {
                                return Err(e);
                            }
                        }
                    }
                }

                // Names nobody ships directly may be virtual
                let found: HashSet<&str> = added.iter().map(|r| r.name.as_str()).collect();
                let missing: Vec<String> = layer
                    .iter()
                    .filter(|n| !found.contains(n.as_str()))
                    .cloned()
                    .collect();
                for name in &missing {
                    for source in sources {
                        match source.find_providers(name).await {
                            Ok(records) => added.extend(records),
                            Err(e) => {
                                tracing::warn!(source = source.name(), error = %e, "provider lookup failed");
                                catalog.mark_degraded(source.name());
                            }
                        }
                    }
                }

                for record in added {
                    let deps = record.dependencies.clone();
                    fetched.insert(record.name.clone());
                    if !catalog.insert(record) {
                        continue;
                    }

                    for dep in deps {
                        let bucket = constraints.entry(dep.name.clone()).or_default();
                        bucket.extend(dep.constraint.clone());
                        if fetched.contains(&dep.name) || deferred.contains(&dep.name) {
                            continue;
                        }
                        let refs: Vec<&VersionConstraint> = bucket.iter().collect();
                        if installed.satisfies(&dep.name, &refs).is_some() {
                            deferred.insert(dep.name);
                        } else {
                            queue.push(dep.name);
                        }
                    }
                }
            }

            // Installed packages ruled out by constraints found later
            let broken: Vec<String> = deferred
                .iter()
                .filter(|name| {
                    let refs: Vec<&VersionConstraint> =
                        constraints.get(*name).map(|c| c.iter().collect()).unwrap_or_default();
                    installed.satisfies(name, &refs).is_none()
                })
                .cloned()
                .collect();
            if broken.is_empty() {
                break;
            }
            for name in broken {
                deferred.remove(&name);
                queue.push(name);
            }
        }

        tracing::debug!(records = catalog.len(), "catalog collected");
        Ok(catalog)
    }

    fn mark_degraded(&mut self, source: &str) {
        if !self.degraded.iter().any(|s| s == source) {
            self.degraded.push(source.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Origin;
    use crate::sources::testing::StaticSource;

    fn sources(repo: Vec<PackageRecord>, aur: Vec<PackageRecord>) -> Vec<Arc<dyn PackageSource>> {
        vec![
            Arc::new(StaticSource::new(Origin::BinaryRepo, repo)),
            Arc::new(StaticSource::new(Origin::CommunitySource, aur)),
        ]
    }

    #[test]
    fn test_insert_orders_repo_first_and_dedupes() {
        let mut catalog = Catalog::new();
        assert!(catalog.insert(PackageRecord::new("foo", "2-1", Origin::CommunitySource)));
        assert!(catalog.insert(PackageRecord::new("foo", "1-1", Origin::BinaryRepo)));
        assert!(!catalog.insert(PackageRecord::new("foo", "3-1", Origin::BinaryRepo)));

        let origins: Vec<_> = catalog.candidates("foo").iter().map(|c| c.origin).collect();
        assert_eq!(origins, vec![Origin::BinaryRepo, Origin::CommunitySource]);
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_collect_spans_both_sources() {
        let srcs = sources(
            vec![
                PackageRecord::new("bar", "1-1", Origin::BinaryRepo).depends_on(["glibc"]),
                PackageRecord::new("glibc", "2.39-1", Origin::BinaryRepo),
            ],
            vec![
                PackageRecord::new("foo", "1-1", Origin::CommunitySource).depends_on(["bar", "baz"]),
                PackageRecord::new("baz", "1-1", Origin::CommunitySource).build_depends_on(["go"]),
            ],
        );
        let installed = InstalledState::new().with("glibc", "2.39-1");

        let catalog = Catalog::collect("foo", &srcs, &installed).await.unwrap();
        assert_eq!(catalog.candidates("bar").len(), 1);
        assert_eq!(catalog.candidates("baz").len(), 1);
        // installed and unconstrained: not expanded
        assert!(catalog.candidates("glibc").is_empty());
        // unknown build dependency simply stays absent
        assert!(!catalog.contains("go"));
    }

    #[tokio::test]
    async fn test_collect_refetches_installed_when_constraint_breaks_it() {
        let srcs = sources(
            vec![
                PackageRecord::new("a", "1-1", Origin::BinaryRepo).depends_on(["lib", "b"]),
                PackageRecord::new("b", "1-1", Origin::BinaryRepo).depends_on(["lib>=2"]),
                PackageRecord::new("lib", "2-1", Origin::BinaryRepo),
            ],
            vec![],
        );
        let installed = InstalledState::new().with("lib", "1-1");

        let catalog = Catalog::collect("a", &srcs, &installed).await.unwrap();
        assert_eq!(catalog.candidates("lib").len(), 1);
    }

    #[tokio::test]
    async fn test_collect_finds_virtual_providers() {
        let srcs = sources(
            vec![
                PackageRecord::new("app", "1-1", Origin::BinaryRepo).depends_on(["java-runtime"]),
                PackageRecord::new("jre-openjdk", "21-1", Origin::BinaryRepo).providing(["java-runtime=21"]),
            ],
            vec![],
        );
        let catalog = Catalog::collect("app", &srcs, &InstalledState::new()).await.unwrap();
        assert_eq!(catalog.providers("java-runtime")[0].name, "jre-openjdk");
    }

    #[tokio::test]
    async fn test_collect_degrades_on_one_failing_source() {
        let srcs: Vec<Arc<dyn PackageSource>> = vec![
            Arc::new(StaticSource::new(
                Origin::BinaryRepo,
                vec![PackageRecord::new("bar", "1-1", Origin::BinaryRepo)],
            )),
            Arc::new(StaticSource::new(Origin::CommunitySource, vec![]).failing()),
        ];
        let catalog = Catalog::collect("bar", &srcs, &InstalledState::new()).await.unwrap();
        assert_eq!(catalog.degraded, vec!["static-aur".to_string()]);
        assert_eq!(catalog.candidates("bar").len(), 1);
    }
}
