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

//! Unified search over the binary repositories and the AUR.
//!
//! Both adapters are queried concurrently under one deadline. A source that
//! misses the deadline or errors is reported as degraded and the search
//! returns whatever the other source produced. The slow query is detached,
//! not aborted, so it can still warm the adapter cache for the next search.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::Config;
use crate::error::PacsmithResult;
use crate::package::{Origin, PackageRecord};
use crate::sources::PackageSource;

/// Per-search switches
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub include_community: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            include_community: true,
        }
    }
}

/// One merged result
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: Arc<PackageRecord>,
    /// Same-named AUR package hidden behind a repo package
    pub aur_alternative: Option<Arc<PackageRecord>>,
}

impl SearchHit {
    pub fn has_aur_alternative(&self) -> bool {
        self.aur_alternative.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DegradeReason {
    /// Did not answer within the search deadline
    Timeout,
    /// Answered with an error
    Unavailable(String),
}

/// A source missing from this result set
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedSource {
    pub source: String,
    pub origin: Origin,
    pub reason: DegradeReason,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub degraded: Vec<DegradedSource>,
    pub generation: u64,
}

impl SearchResults {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &PackageRecord> {
        self.hits.iter().map(|h| h.record.as_ref())
    }
}

/// Merges both sources into one ranked namespace
pub struct SearchIndex {
    binary: Arc<dyn PackageSource>,
    community: Option<Arc<dyn PackageSource>>,
    timeout: Duration,
    min_query_len: usize,
    generation: AtomicU64,
}

impl SearchIndex {
    pub fn new(binary: Arc<dyn PackageSource>, community: Option<Arc<dyn PackageSource>>) -> Self {
        Self {
            binary,
            community,
            timeout: Duration::from_secs(5),
            min_query_len: 2,
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(
        config: &Config,
        binary: Arc<dyn PackageSource>,
        community: Option<Arc<dyn PackageSource>>,
    ) -> Self {
        let community = community.filter(|_| config.aur.enabled);
        Self::new(binary, community)
            .with_timeout(config.search_timeout())
            .with_min_query_len(config.min_query_len)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_min_query_len(mut self, len: usize) -> Self {
        self.min_query_len = len;
        self
    }

    /// Search both sources and merge the answers
    pub async fn search(&self, text: &str, options: SearchOptions) -> SearchResults {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.run(text, options, generation).await
    }

    /// Like [`search`](Self::search), but `None` when a newer search started
    /// before this one finished
    pub async fn search_latest(&self, text: &str, options: SearchOptions) -> Option<SearchResults> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let results = self.run(text, options, generation).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(query = %results.query, generation, "search superseded");
            return None;
        }
        Some(results)
    }

    async fn run(&self, text: &str, options: SearchOptions, generation: u64) -> SearchResults {
        let query = text.trim().to_string();
        let mut results = SearchResults {
            query: query.clone(),
            generation,
            ..Default::default()
        };
        if query.chars().count() < self.min_query_len {
            return results;
        }

        results.hits = self
            .collect(&query, options, &mut results.degraded)
            .instrument(crate::span_operation!("search"))
            .await;
        tracing::info!(query = %query, hits = results.hits.len(), "search complete");
        results
    }

    async fn collect(
        &self,
        query: &str,
        options: SearchOptions,
        degraded: &mut Vec<DegradedSource>,
    ) -> Vec<SearchHit> {
        let deadline = Instant::now() + self.timeout;

        let mut pending = vec![spawn_query(&self.binary, query)];
        if options.include_community {
            if let Some(community) = &self.community {
                pending.push(spawn_query(community, query));
            }
        }

        let mut binary = Vec::new();
        let mut community = Vec::new();
        for (source, origin, handle) in pending {
            let outcome = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(records))) => Ok(records),
                Ok(Ok(Err(e))) => Err(DegradeReason::Unavailable(e.to_string())),
                Ok(Err(join)) => Err(DegradeReason::Unavailable(join.to_string())),
                // Dropping the handle detaches the task; it keeps running
                Err(_) => Err(DegradeReason::Timeout),
            };

            match outcome {
                Ok(records) => {
                    tracing::debug!(%source, count = records.len(), "source answered");
                    match origin {
                        Origin::BinaryRepo => binary = records,
                        Origin::CommunitySource => community = records,
                    }
                }
                Err(reason) => {
                    tracing::warn!(%source, ?reason, "source degraded for this search");
                    degraded.push(DegradedSource {
                        source,
                        origin,
                        reason,
                    });
                }
            }
        }

        merge_and_rank(query, binary, community)
    }
}

type QueryTask = (String, Origin, JoinHandle<PacsmithResult<Vec<PackageRecord>>>);

fn spawn_query(source: &Arc<dyn PackageSource>, query: &str) -> QueryTask {
    let name = source.name().to_string();
    let origin = source.origin();
    let source = Arc::clone(source);
    let query = query.to_string();
    let handle = tokio::spawn(async move { source.query(&query).await });
    (name, origin, handle)
}

/// Relevance bucket, lower is better
fn relevance(record: &PackageRecord, query: &str) -> u8 {
    let name = record.name.to_lowercase();
    if name == query {
        0
    } else if name.starts_with(query) {
        1
    } else if name.contains(query) {
        2
    } else if record.description.to_lowercase().contains(query) {
        3
    } else {
        4
    }
}

/// Dedupe by name with repo precedence, then rank
pub fn merge_and_rank(
    query: &str,
    binary: Vec<PackageRecord>,
    community: Vec<PackageRecord>,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for record in binary {
        // a name listed by two repos keeps the first (highest priority) repo
        if by_name.contains_key(&record.name) {
            continue;
        }
        by_name.insert(record.name.clone(), hits.len());
        hits.push(SearchHit {
            record: Arc::new(record),
            aur_alternative: None,
        });
    }

    for record in community {
        match by_name.get(&record.name) {
            Some(&idx) => {
                let hit = &mut hits[idx];
                if hit.record.origin == Origin::BinaryRepo && hit.aur_alternative.is_none() {
                    hit.aur_alternative = Some(Arc::new(record));
                }
            }
            None => {
                by_name.insert(record.name.clone(), hits.len());
                hits.push(SearchHit {
                    record: Arc::new(record),
                    aur_alternative: None,
                });
            }
        }
    }

    let query = query.to_lowercase();
    hits.sort_by(|a, b| {
        let (ra, rb) = (a.record.as_ref(), b.record.as_ref());
        relevance(ra, &query)
            .cmp(&relevance(rb, &query))
            .then(ra.origin.cmp(&rb.origin))
            .then_with(|| ra.name.cmp(&rb.name))
    });
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::StaticSource;
    use std::collections::HashSet;

    fn repo(name: &str, desc: &str) -> PackageRecord {
        PackageRecord::new(name, "1.0-1", Origin::BinaryRepo).with_description(desc)
    }

    fn aur(name: &str, desc: &str) -> PackageRecord {
        PackageRecord::new(name, "2.0-1", Origin::CommunitySource).with_description(desc)
    }

    fn index(binary: StaticSource, community: StaticSource) -> SearchIndex {
        SearchIndex::new(Arc::new(binary), Some(Arc::new(community)))
            .with_timeout(Duration::from_millis(300))
    }

    #[test]
    fn test_ranking_order() {
        let hits = merge_and_rank(
            "fzf",
            vec![repo("zsh-fzf", "plugin"), repo("fzf", "fuzzy finder"), repo("skim", "like fzf")],
            vec![aur("fzf-git", "fzf for git"), aur("afzf", "x")],
        );
        let names: Vec<_> = hits.iter().map(|h| h.record.name.as_str()).collect();
        assert_eq!(names, vec!["fzf", "fzf-git", "zsh-fzf", "afzf", "skim"]);
    }

    #[test]
    fn test_ties_broken_by_origin_then_name() {
        let hits = merge_and_rank(
            "lib",
            vec![repo("libz", ""), repo("liba", "")],
            vec![aur("libb", "")],
        );
        let names: Vec<_> = hits.iter().map(|h| h.record.name.as_str()).collect();
        assert_eq!(names, vec!["liba", "libz", "libb"]);
    }

    #[test]
    fn test_collision_keeps_repo_with_alternative() {
        let hits = merge_and_rank(
            "yay",
            vec![repo("yay", "from repo"), repo("yay", "from testing")],
            vec![aur("yay", "from aur")],
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.origin, Origin::BinaryRepo);
        assert_eq!(hits[0].record.description, "from repo");
        assert!(hits[0].has_aur_alternative());
        assert_eq!(
            hits[0].aur_alternative.as_ref().unwrap().origin,
            Origin::CommunitySource
        );

        let keys: HashSet<_> = hits.iter().map(|h| (&h.record.name, h.record.origin)).collect();
        assert_eq!(keys.len(), hits.len());
    }

    #[tokio::test]
    async fn test_search_merges_both_sources() {
        let idx = index(
            StaticSource::new(Origin::BinaryRepo, vec![repo("neovim", "editor")]),
            StaticSource::new(Origin::CommunitySource, vec![aur("neovim-git", "editor, git")]),
        );
        let results = idx.search("neovim", SearchOptions::default()).await;
        assert!(!results.is_degraded());
        let names: Vec<_> = results.records().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["neovim", "neovim-git"]);
    }

    #[tokio::test]
    async fn test_slow_community_source_degrades() {
        let idx = index(
            StaticSource::new(Origin::BinaryRepo, vec![repo("neovim", "editor")]),
            StaticSource::new(Origin::CommunitySource, vec![aur("neovim-git", "")])
                .slow(Duration::from_secs(5)),
        );

        let started = std::time::Instant::now();
        let results = idx.search("neovim", SearchOptions::default()).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.degraded.len(), 1);
        assert_eq!(results.degraded[0].origin, Origin::CommunitySource);
        assert_eq!(results.degraded[0].reason, DegradeReason::Timeout);
    }

    #[tokio::test]
    async fn test_slow_binary_source_degrades() {
        let idx = index(
            StaticSource::new(Origin::BinaryRepo, vec![repo("neovim", "editor")])
                .slow(Duration::from_secs(5)),
            StaticSource::new(Origin::CommunitySource, vec![aur("neovim-git", "editor, git")]),
        );

        let started = std::time::Instant::now();
        let results = idx.search("neovim", SearchOptions::default()).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let names: Vec<_> = results.records().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["neovim-git"]);
        assert_eq!(results.degraded.len(), 1);
        assert_eq!(results.degraded[0].origin, Origin::BinaryRepo);
        assert_eq!(results.degraded[0].reason, DegradeReason::Timeout);
    }

    #[tokio::test]
    async fn test_failing_community_source_degrades() {
        let idx = index(
            StaticSource::new(Origin::BinaryRepo, vec![repo("neovim", "editor")]),
            StaticSource::new(Origin::CommunitySource, vec![]).failing(),
        );
        let results = idx.search("neovim", SearchOptions::default()).await;
        assert_eq!(results.hits.len(), 1);
        assert!(matches!(
            results.degraded[0].reason,
            DegradeReason::Unavailable(ref reason) if reason.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn test_short_query_touches_no_source() {
        let binary = Arc::new(StaticSource::new(Origin::BinaryRepo, vec![repo("x", "")]));
        let idx = SearchIndex::new(binary.clone(), None);
        let results = idx.search(" x ", SearchOptions::default()).await;
        assert!(results.hits.is_empty());
        assert!(!results.is_degraded());
        assert_eq!(binary.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_community_can_be_excluded() {
        let community = Arc::new(StaticSource::new(
            Origin::CommunitySource,
            vec![aur("neovim-git", "")],
        ));
        let idx = SearchIndex::new(
            Arc::new(StaticSource::new(Origin::BinaryRepo, vec![])),
            Some(community.clone()),
        );
        let results = idx
            .search("neovim", SearchOptions { include_community: false })
            .await;
        assert!(results.hits.is_empty());
        assert_eq!(community.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_superseded_search_is_discarded() {
        let idx = Arc::new(
            SearchIndex::new(
                Arc::new(StaticSource::new(Origin::BinaryRepo, vec![repo("neovim", "")])),
                Some(Arc::new(
                    StaticSource::new(Origin::CommunitySource, vec![])
                        .slow(Duration::from_millis(200)),
                )),
            )
            .with_timeout(Duration::from_secs(2)),
        );

        let first = {
            let idx = Arc::clone(&idx);
            tokio::spawn(async move { idx.search_latest("neo", SearchOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = idx.search_latest("neovim", SearchOptions::default()).await;

        assert!(first.await.unwrap().is_none());
        let second = second.unwrap();
        assert_eq!(second.query, "neovim");
        assert_eq!(second.hits.len(), 1);
    }
}
