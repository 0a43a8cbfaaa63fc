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

//! AUR RPC API client with caching and rate limiting.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use lru::LruCache;
use serde::Deserialize;
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::PackageSource;
use crate::config::Config;
use crate::error::{PacsmithError, PacsmithResult};
use crate::package::{DependencySpec, Origin, PackageRecord, Provision};
use crate::review::{FetchedScript, ScriptFetcher};

/// AUR RPC API response wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct AurRpcResponse {
    #[serde(default)]
    pub version: u32,
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(default)]
    pub resultcount: usize,
    #[serde(default)]
    pub results: Vec<AurPackageInfo>,
    pub error: Option<String>,
}

/// AUR package information from RPC API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AurPackageInfo {
    pub name: String,
    pub package_base: Option<String>,
    pub version: String,
    pub description: Option<String>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
    #[serde(default)]
    pub num_votes: u32,
    #[serde(default)]
    pub popularity: f64,
    pub out_of_date: Option<u64>,
    pub maintainer: Option<String>,

    // Only present in info responses
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub make_depends: Vec<String>,
    #[serde(default)]
    pub check_depends: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
}

impl AurPackageInfo {
    /// Normalize into a record; make/check depends become build-only
    pub fn to_record(&self, include_check_depends: bool) -> PackageRecord {
        let mut record = PackageRecord::new(&self.name, &self.version, Origin::CommunitySource)
            .with_description(self.description.clone().unwrap_or_default())
            .in_repository("aur");
        if let Some(base) = &self.package_base {
            record = record.with_package_base(base);
        }

        record.dependencies = self.depends.iter().map(|d| DependencySpec::parse(d)).collect();
        record
            .dependencies
            .extend(self.make_depends.iter().map(|d| DependencySpec::parse_build(d)));
        if include_check_depends {
            record
                .dependencies
                .extend(self.check_depends.iter().map(|d| DependencySpec::parse_build(d)));
        }
        record.provides = self.provides.iter().map(|p| Provision::parse(p)).collect();
        record.conflicts = self.conflicts.iter().map(|c| DependencySpec::parse(c)).collect();
        record
    }
}

struct CacheEntry<T> {
    value: T,
    cached_at: Instant,
}

/// AUR RPC client with TTL-bounded caching
pub struct AurClient {
    client: reqwest::Client,
    info_cache: Arc<RwLock<LruCache<String, CacheEntry<AurPackageInfo>>>>,
    search_cache: Arc<RwLock<LruCache<String, CacheEntry<Vec<AurPackageInfo>>>>>,
    limiter: DefaultDirectRateLimiter,
    base_url: String,
    snapshot_url: String,
    ttl: Duration,
    include_check_depends: bool,
}

// AUR RPC supports up to 250 packages per info request
const BATCH_SIZE: usize = 250;

impl AurClient {
    /// Create a client from configuration
    pub fn from_config(config: &Config) -> PacsmithResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(5)
            .user_agent(concat!("pacsmith/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PacsmithError::network(&config.aur.rpc_url, e))?;

        let capacity = NonZeroUsize::new(config.aur.cache_size).unwrap_or(NonZeroUsize::MIN);
        let rate = NonZeroU32::new(config.aur.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            info_cache: Arc::new(RwLock::new(LruCache::new(capacity))),
            search_cache: Arc::new(RwLock::new(LruCache::new(capacity))),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            base_url: config.aur.rpc_url.clone(),
            snapshot_url: config.aur.snapshot_url.clone(),
            ttl: Duration::from_secs(config.aur.cache_ttl_secs),
            include_check_depends: config.resolver.include_check_depends,
        })
    }

    fn fresh<T>(&self, entry: &CacheEntry<T>) -> bool {
        entry.cached_at.elapsed() < self.ttl
    }

    async fn rpc(&self, url: &str) -> PacsmithResult<Vec<AurPackageInfo>> {
        self.limiter.until_ready().await;
        tracing::debug!(%url, "AUR RPC request");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PacsmithError::unavailable(self.name(), e))?;
        let body = response
            .text()
            .await
            .map_err(|e| PacsmithError::unavailable(self.name(), e))?;
        parse_rpc_response(&body).map_err(|reason| PacsmithError::unavailable(self.name(), reason))
    }

    /// Batch fetch multiple packages, serving fresh entries from cache
    pub async fn get_info_batch(&self, names: &[String]) -> PacsmithResult<Vec<AurPackageInfo>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut to_fetch = Vec::new();
        {
            let cache = self.info_cache.read().await;
            for name in names {
                match cache.peek(name) {
                    Some(entry) if self.fresh(entry) => results.push(entry.value.clone()),
                    _ => to_fetch.push(name.clone()),
                }
            }
        }

        for chunk in to_fetch.chunks(BATCH_SIZE) {
            let args: Vec<String> = chunk
                .iter()
                .map(|n| format!("arg[]={}", urlencoding::encode(n)))
                .collect();
            let url = format!("{}?v=5&type=info&{}", self.base_url, args.join("&"));
            let fetched = self.rpc(&url).await?;

            if !self.ttl.is_zero() {
                let mut cache = self.info_cache.write().await;
                for pkg in &fetched {
                    cache.put(
                        pkg.name.clone(),
                        CacheEntry {
                            value: pkg.clone(),
                            cached_at: Instant::now(),
                        },
                    );
                }
            }
            results.extend(fetched);
        }

        Ok(results)
    }

    /// Search by name and description
    pub async fn search(&self, query: &str) -> PacsmithResult<Vec<AurPackageInfo>> {
        self.search_by("name-desc", query).await
    }

    /// Search with field specifier (name, name-desc, provides, depends, ...)
    pub async fn search_by(&self, field: &str, query: &str) -> PacsmithResult<Vec<AurPackageInfo>> {
        let key = format!("{}:{}", field, query);
        {
            let cache = self.search_cache.read().await;
            if let Some(entry) = cache.peek(&key) {
                if self.fresh(entry) {
                    return Ok(entry.value.clone());
                }
            }
        }

        let url = format!(
            "{}?v=5&type=search&by={}&arg={}",
            self.base_url,
            field,
            urlencoding::encode(query)
        );
        let results = self.rpc(&url).await?;

        // A search that outlives its caller still lands here for the next one
        if !self.ttl.is_zero() {
            self.search_cache.write().await.put(
                key,
                CacheEntry {
                    value: results.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(results)
    }

    /// Clear both caches
    pub async fn clear_cache(&self) {
        self.info_cache.write().await.clear();
        self.search_cache.write().await.clear();
    }

    /// Get cache statistics (entries, capacity)
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.info_cache.read().await;
        (cache.len(), cache.cap().get())
    }

    /// Get the snapshot download URL for a package base
    pub fn snapshot_url(&self, package_base: &str) -> String {
        format!("{}{}.tar.gz", self.snapshot_url, package_base)
    }
}

/// Decode an RPC body, surfacing API-level errors
pub fn parse_rpc_response(body: &str) -> Result<Vec<AurPackageInfo>, String> {
    let response: AurRpcResponse =
        serde_json::from_str(body).map_err(|e| format!("malformed RPC response: {}", e))?;
    if response.response_type == "error" || response.error.is_some() {
        return Err(format!(
            "AUR RPC error: {}",
            response.error.unwrap_or_else(|| "unknown".to_string())
        ));
    }
    Ok(response.results)
}

#[async_trait]
impl PackageSource for AurClient {
    fn origin(&self) -> Origin {
        Origin::CommunitySource
    }

    fn name(&self) -> &str {
        "aur"
    }

    async fn query(&self, text: &str) -> PacsmithResult<Vec<PackageRecord>> {
        let results = self.search(text).await?;
        Ok(results
            .iter()
            .map(|info| info.to_record(self.include_check_depends))
            .collect())
    }

    async fn fetch_details(&self, name: &str) -> PacsmithResult<Option<PackageRecord>> {
        let results = self.get_info_batch(&[name.to_string()]).await?;
        Ok(results
            .iter()
            .find(|info| info.name == name)
            .map(|info| info.to_record(self.include_check_depends)))
    }

    async fn fetch_details_batch(&self, names: &[String]) -> PacsmithResult<Vec<PackageRecord>> {
        let results = self.get_info_batch(names).await?;
        Ok(results
            .iter()
            .map(|info| info.to_record(self.include_check_depends))
            .collect())
    }

    async fn find_providers(&self, name: &str) -> PacsmithResult<Vec<PackageRecord>> {
        let hits = self.search_by("provides", name).await?;
        let names: Vec<String> = hits.into_iter().map(|h| h.name).collect();
        // search results lack provides/depends, so ask for full info
        let records = self.fetch_details_batch(&names).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.name == name || r.provision(name).is_some())
            .collect())
    }
}

#[async_trait]
impl ScriptFetcher for AurClient {
    async fn fetch_script(&self, record: &PackageRecord, dest: &Path) -> PacsmithResult<FetchedScript> {
        let base = record.base().to_string();
        let url = self.snapshot_url(&base);
        let extract_dir = dest.join(&base);

        tracing::info!(package = %record.name, %url, "downloading build files");
        self.limiter.until_ready().await;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PacsmithError::network(&url, e))?;
        if !response.status().is_success() {
            return Err(PacsmithError::Other(format!(
                "Failed to download {}: HTTP {}",
                base,
                response.status()
            )));
        }
        let data = response
            .bytes()
            .await
            .map_err(|e| PacsmithError::network(&url, e))?;

        let dest = dest.to_path_buf();
        let target = extract_dir.clone();
        tokio::task::spawn_blocking(move || unpack_snapshot(&data, &dest, &target))
            .await
            .map_err(|e| PacsmithError::Other(format!("snapshot extraction panicked: {}", e)))??;

        FetchedScript::read(&extract_dir).await
    }
}

/// Extract a snapshot tarball, replacing any stale build directory
fn unpack_snapshot(data: &[u8], dest: &Path, extract_dir: &Path) -> PacsmithResult<()> {
    std::fs::create_dir_all(dest)
        .map_err(|e| PacsmithError::filesystem(dest, "cannot create build directory", e))?;
    if extract_dir.exists() {
        std::fs::remove_dir_all(extract_dir)
            .map_err(|e| PacsmithError::filesystem(extract_dir, "cannot clean old build directory", e))?;
    }

    // tar::Archive::unpack refuses entries escaping `dest`
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    archive
        .unpack(dest)
        .map_err(|e| PacsmithError::filesystem(dest, "cannot extract snapshot", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_BODY: &str = r#"{
        "version": 5,
        "type": "multiinfo",
        "resultcount": 1,
        "results": [{
            "ID": 1,
            "Name": "yay",
            "PackageBase": "yay",
            "PackageBaseID": 1,
            "Version": "12.3.5-1",
            "Description": "Yet another yogurt",
            "URL": "https://github.com/Jguer/yay",
            "NumVotes": 2000,
            "Popularity": 20.5,
            "OutOfDate": null,
            "Maintainer": "jguer",
            "Depends": ["pacman>6.1", "git"],
            "MakeDepends": ["go>=1.21"],
            "CheckDepends": ["bats"],
            "Conflicts": ["yay-bin"],
            "Provides": ["yay=12.3.5"]
        }]
    }"#;

    #[test]
    fn test_parse_info_response() {
        let results = parse_rpc_response(INFO_BODY).unwrap();
        assert_eq!(results.len(), 1);

        let record = results[0].to_record(false);
        assert_eq!(record.origin, Origin::CommunitySource);
        assert_eq!(record.repository, "aur");
        assert_eq!(record.runtime_dependencies().count(), 2);
        let build: Vec<_> = record.build_dependencies().map(|d| d.to_string()).collect();
        assert_eq!(build, vec!["go>=1.21"]);
        assert_eq!(record.conflicts[0].name, "yay-bin");

        let with_check = results[0].to_record(true);
        assert_eq!(with_check.build_dependencies().count(), 2);
    }

    #[test]
    fn test_parse_search_response_without_deps() {
        let body = r#"{"version":5,"type":"search","resultcount":1,
            "results":[{"Name":"paru","PackageBase":"paru","Version":"2.0.3-1","Description":null}]}"#;
        let results = parse_rpc_response(body).unwrap();
        let record = results[0].to_record(false);
        assert!(record.dependencies.is_empty());
        assert_eq!(record.description, "");
    }

    #[test]
    fn test_parse_error_response() {
        let body = r#"{"version":5,"type":"error","resultcount":0,"results":[],"error":"Too many package results."}"#;
        let err = parse_rpc_response(body).unwrap_err();
        assert!(err.contains("Too many package results"));

        assert!(parse_rpc_response("<html>").unwrap_err().contains("malformed"));
    }

    #[tokio::test]
    async fn test_snapshot_url_and_cache_stats() {
        let client = AurClient::from_config(&Config::default()).unwrap();
        assert_eq!(
            client.snapshot_url("test-pkg-base"),
            "https://aur.archlinux.org/cgit/aur.git/snapshot/test-pkg-base.tar.gz"
        );
        assert_eq!(client.cache_stats().await, (0, 500));
    }

    #[test]
    fn test_unpack_snapshot() {
        let dir = tempfile::tempdir().unwrap();

        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let content = b"pkgname=foo\npkgver=1\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "foo/PKGBUILD", &content[..]).unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();

        let extract_dir = dir.path().join("foo");
        unpack_snapshot(&data, dir.path(), &extract_dir).unwrap();
        let text = std::fs::read_to_string(extract_dir.join("PKGBUILD")).unwrap();
        assert!(text.starts_with("pkgname=foo"));
    }
}
