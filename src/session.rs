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

//! One front-end session: search, resolve, review, execute.
//!
//! The session owns every component and hands the presentation layer the
//! receiving end of the review channel. Searches run on the caller's task;
//! execution runs on the executor's own worker.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::Config;
use crate::error::{PacsmithError, PacsmithResult, ResolutionError};
use crate::executor::{ExecutionTicket, Executor, ExecutorHandle, PacmanToolchain, Toolchain};
use crate::log::TransactionLog;
use crate::package::InstalledState;
use crate::resolver::{BuildPlan, Catalog, ResolveOptions, Resolver};
use crate::review::{ReviewGate, ReviewLedger, ReviewRequest, ScriptFetcher};
use crate::search::{SearchIndex, SearchOptions, SearchResults};
use crate::sources::{AurClient, PackageSource, PacmanSource};

/// External tools the default toolchain shells out to
pub const REQUIRED_TOOLS: &[&str] = &["pacman", "makepkg"];

/// Names of required tools missing from `PATH`
pub fn missing_tools() -> Vec<&'static str> {
    REQUIRED_TOOLS
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect()
}

enum InstalledSource {
    Pacman(Arc<PacmanSource>),
    Fixed(InstalledState),
}

/// Replaceable components of a session
pub struct SessionParts {
    pub binary: Arc<dyn PackageSource>,
    pub community: Option<Arc<dyn PackageSource>>,
    pub fetcher: Arc<dyn ScriptFetcher>,
    pub toolchain: Arc<dyn Toolchain>,
    pub log: Arc<TransactionLog>,
}

pub struct Session {
    config: Config,
    sources: Vec<Arc<dyn PackageSource>>,
    search: SearchIndex,
    gate: ReviewGate,
    executor: ExecutorHandle,
    installed: InstalledSource,
}

impl Session {
    /// Wire up pacman, the AUR and the pacman/makepkg toolchain
    pub fn from_config(config: Config) -> PacsmithResult<(Self, mpsc::Receiver<ReviewRequest>)> {
        let pacman = Arc::new(PacmanSource::new());
        let aur = Arc::new(AurClient::from_config(&config)?);
        let log = match &config.logging.history_file {
            Some(path) => TransactionLog::with_history(path)?,
            None => TransactionLog::new(),
        };

        let parts = SessionParts {
            binary: pacman.clone(),
            community: Some(aur.clone()),
            fetcher: aur,
            toolchain: Arc::new(PacmanToolchain::from_config(&config)),
            log: Arc::new(log),
        };
        let (mut session, reviews) = Self::assemble(config, parts);
        session.installed = InstalledSource::Pacman(pacman);
        Ok((session, reviews))
    }

    /// Build a session from explicit parts; the installed state starts empty
    pub fn assemble(config: Config, parts: SessionParts) -> (Self, mpsc::Receiver<ReviewRequest>) {
        let community = parts.community.filter(|_| config.aur.enabled);
        let mut sources = vec![Arc::clone(&parts.binary)];
        sources.extend(community.iter().cloned());

        let search = SearchIndex::from_config(&config, parts.binary, community);
        let (gate, reviews) = ReviewGate::channel(parts.fetcher, config.aur.build_dir.clone());
        let executor = ExecutorHandle::spawn(Executor::from_config(&config, parts.toolchain, parts.log));

        let session = Self {
            config,
            sources,
            search,
            gate,
            executor,
            installed: InstalledSource::Fixed(InstalledState::new()),
        };
        (session, reviews)
    }

    pub fn with_installed(mut self, installed: InstalledState) -> Self {
        self.installed = InstalledSource::Fixed(installed);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        self.executor.log()
    }

    pub async fn installed_state(&self) -> PacsmithResult<InstalledState> {
        match &self.installed {
            InstalledSource::Pacman(pacman) => pacman.installed_state().await,
            InstalledSource::Fixed(state) => Ok(state.clone()),
        }
    }

    pub async fn search(&self, text: &str, options: SearchOptions) -> SearchResults {
        self.search.search(text, options).await
    }

    /// Newest search only; `None` when a later search overtook this one
    pub async fn search_latest(&self, text: &str, options: SearchOptions) -> Option<SearchResults> {
        self.search.search_latest(text, options).await
    }

    /// Resolve options carrying the configured provider policy
    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            pin: None,
            provider_policy: self.config.resolver.provider_policy,
        }
    }

    /// Collect the target's dependency closure and resolve it into a plan
    pub async fn resolve(&self, target: &str, options: ResolveOptions) -> PacsmithResult<BuildPlan> {
        let installed = self.installed_state().await?;
        let catalog = Catalog::collect(target, &self.sources, &installed)
            .instrument(crate::span_operation!("collect"))
            .await?;
        if !catalog.degraded.is_empty() {
            tracing::warn!(degraded = ?catalog.degraded, "resolving with degraded sources");
        }

        let plan = {
            let _span = crate::span_operation!("resolve").entered();
            Resolver::new(&catalog, &installed).with_options(options).resolve(target)?
        };
        plan.validate(&installed).map_err(PacsmithError::Other)?;
        Ok(plan)
    }

    /// Plan removing one installed package
    pub async fn removal_plan(&self, name: &str) -> PacsmithResult<BuildPlan> {
        let installed = self.installed_state().await?;
        let version = installed.version_of(name).ok_or_else(|| ResolutionError::NotFound {
            name: name.to_string(),
            required_by: None,
        })?;
        Ok(BuildPlan::removal(name, version))
    }

    /// Ask the reviewer about every AUR item not yet decided
    pub async fn review(&self, plan: &BuildPlan, ledger: &mut ReviewLedger) -> PacsmithResult<()> {
        self.gate
            .review_plan(plan, ledger)
            .instrument(crate::span_operation!("review"))
            .await
    }

    /// Queue a reviewed plan on the executor worker
    pub fn execute(&self, plan: BuildPlan, ledger: ReviewLedger) -> PacsmithResult<ExecutionTicket> {
        ledger.ensure_complete(&plan)?;
        self.executor.submit(plan, ledger)
    }
}
