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

//! Package source adapters.
//!
//! This module provides the two sources behind the unified namespace:
//! - `pacman`: the local sync database, queried through the `pacman` binary
//! - `aur`: the AUR RPC API with TTL caching and rate limiting
//!
//! Adapters share no state and can be swapped independently.

pub mod aur;
pub mod pacman;

pub use aur::{AurClient, AurPackageInfo};
pub use pacman::PacmanSource;

use async_trait::async_trait;

use crate::error::PacsmithResult;
use crate::package::{Origin, PackageRecord};

/// A queryable package source
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Which side of the namespace this source feeds
    fn origin(&self) -> Origin;

    /// Human-readable source name for logs and degraded markers
    fn name(&self) -> &str;

    /// Free-text search
    async fn query(&self, text: &str) -> PacsmithResult<Vec<PackageRecord>>;

    /// Full record for an exact package name
    async fn fetch_details(&self, name: &str) -> PacsmithResult<Option<PackageRecord>>;

    /// Full records for several names; missing names are simply absent
    async fn fetch_details_batch(&self, names: &[String]) -> PacsmithResult<Vec<PackageRecord>> {
        let mut records = Vec::new();
        for name in names {
            if let Some(record) = self.fetch_details(name).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Packages providing a virtual name
    async fn find_providers(&self, _name: &str) -> PacsmithResult<Vec<PackageRecord>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory sources for tests.

    use super::*;
    use crate::error::PacsmithError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub struct StaticSource {
        origin: Origin,
        records: Vec<PackageRecord>,
        delay: Option<Duration>,
        fail: bool,
        pub queries: AtomicUsize,
    }

    impl StaticSource {
        pub fn new(origin: Origin, records: Vec<PackageRecord>) -> Self {
            Self {
                origin,
                records,
                delay: None,
                fail: false,
                queries: AtomicUsize::new(0),
            }
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        async fn gate(&self) -> PacsmithResult<()> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(PacsmithError::unavailable(self.name(), "connection refused"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PackageSource for StaticSource {
        fn origin(&self) -> Origin {
            self.origin
        }

        fn name(&self) -> &str {
            match self.origin {
                Origin::BinaryRepo => "static-repo",
                Origin::CommunitySource => "static-aur",
            }
        }

        async fn query(&self, text: &str) -> PacsmithResult<Vec<PackageRecord>> {
            self.gate().await?;
            let text = text.to_lowercase();
            Ok(self
                .records
                .iter()
                .filter(|r| {
                    r.name.to_lowercase().contains(&text)
                        || r.description.to_lowercase().contains(&text)
                })
                .cloned()
                .collect())
        }

        async fn fetch_details(&self, name: &str) -> PacsmithResult<Option<PackageRecord>> {
            self.gate().await?;
            Ok(self.records.iter().find(|r| r.name == name).cloned())
        }

        async fn find_providers(&self, name: &str) -> PacsmithResult<Vec<PackageRecord>> {
            self.gate().await?;
            Ok(self
                .records
                .iter()
                .filter(|r| r.provision(name).is_some())
                .cloned()
                .collect())
        }
    }
}
