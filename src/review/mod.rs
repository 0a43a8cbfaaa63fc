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

//! Human review of AUR build scripts.
//!
//! Every AUR plan item is fetched once, scanned, and handed to the
//! presentation layer as a [`ReviewRequest`] over a channel. The gate then
//! waits for the reply with no timeout. Decisions are kept in a
//! [`ReviewLedger`] owned by the session, so nothing shared is locked while
//! a human is thinking and no item is asked about twice.

pub mod scan;

pub use scan::{Finding, ScanReport, ScriptScanner, Severity};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{PacsmithError, PacsmithResult};
use crate::package::{PackageRecord, Version};
use crate::resolver::{BuildPlan, PlanItem};

/// Build script name inside a snapshot
pub const SCRIPT_NAME: &str = "PKGBUILD";

/// A build script as downloaded, plus where its build files live
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedScript {
    pub dir: PathBuf,
    pub text: String,
}

impl FetchedScript {
    /// Read the script from an unpacked build directory
    pub async fn read(dir: &Path) -> PacsmithResult<Self> {
        let path = dir.join(SCRIPT_NAME);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PacsmithError::filesystem(&path, "cannot read build script", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            text,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SCRIPT_NAME)
    }
}

/// Hex SHA-256 of a script text
pub fn script_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Downloads build scripts for AUR packages
#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    async fn fetch_script(&self, record: &PackageRecord, dest: &Path) -> PacsmithResult<FetchedScript>;
}

/// Decision for one AUR plan item
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDecision {
    Pending,
    Approved,
    Rejected,
    /// Approved, building this text instead of the downloaded one
    ApprovedWithEdits { script: String },
}

impl ReviewDecision {
    pub fn is_pending(&self) -> bool {
        matches!(self, ReviewDecision::Pending)
    }

    pub fn allows_build(&self) -> bool {
        matches!(self, ReviewDecision::Approved | ReviewDecision::ApprovedWithEdits { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReviewDecision::Pending => "pending",
            ReviewDecision::Approved => "approved",
            ReviewDecision::Rejected => "rejected",
            ReviewDecision::ApprovedWithEdits { .. } => "approved with edits",
        }
    }
}

/// Sent to the presentation layer; answering consumes it
#[derive(Debug)]
pub struct ReviewRequest {
    pub package: String,
    pub version: Version,
    /// Raw script text exactly as downloaded
    pub script: String,
    pub script_path: PathBuf,
    pub report: ScanReport,
    reply: oneshot::Sender<ReviewDecision>,
}

impl ReviewRequest {
    pub fn decide(self, decision: ReviewDecision) {
        // The gate treats a vanished receiver as a rejection anyway
        let _ = self.reply.send(decision);
    }

    pub fn approve(self) {
        self.decide(ReviewDecision::Approved);
    }

    pub fn reject(self) {
        self.decide(ReviewDecision::Rejected);
    }

    pub fn approve_with_edits(self, script: impl Into<String>) {
        self.decide(ReviewDecision::ApprovedWithEdits { script: script.into() });
    }
}

/// Recorded outcome for one item
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewEntry {
    pub decision: ReviewDecision,
    pub script: FetchedScript,
    /// Digest of the text that will be built (edited or original)
    pub sha256: String,
}

impl ReviewEntry {
    pub fn new(decision: ReviewDecision, script: FetchedScript) -> Self {
        let sha256 = match &decision {
            ReviewDecision::ApprovedWithEdits { script } => script_digest(script),
            _ => script_digest(&script.text),
        };
        Self {
            decision,
            script,
            sha256,
        }
    }

    /// Text to build, `None` unless approved
    pub fn approved_text(&self) -> Option<&str> {
        match &self.decision {
            ReviewDecision::Approved => Some(&self.script.text),
            ReviewDecision::ApprovedWithEdits { script } => Some(script),
            _ => None,
        }
    }

    pub fn is_edited(&self) -> bool {
        matches!(self.decision, ReviewDecision::ApprovedWithEdits { .. })
    }
}

/// Decisions for the lifetime of one plan
#[derive(Debug, Clone, Default)]
pub struct ReviewLedger {
    entries: HashMap<String, ReviewEntry>,
}

impl ReviewLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, package: impl Into<String>, entry: ReviewEntry) {
        self.entries.insert(package.into(), entry);
    }

    pub fn get(&self, package: &str) -> Option<&ReviewEntry> {
        self.entries.get(package)
    }

    pub fn decision(&self, package: &str) -> ReviewDecision {
        self.entries
            .get(package)
            .map(|e| e.decision.clone())
            .unwrap_or(ReviewDecision::Pending)
    }

    /// Refuse plans that still have undecided items
    pub fn ensure_complete(&self, plan: &BuildPlan) -> PacsmithResult<()> {
        let pending: Vec<String> = plan
            .review_items()
            .filter(|item| self.decision(item.name()).is_pending())
            .map(|item| item.name().to_string())
            .collect();
        if pending.is_empty() {
            Ok(())
        } else {
            Err(PacsmithError::PlanNotReviewed { pending })
        }
    }

    pub fn rejected(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, e)| e.decision == ReviewDecision::Rejected)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Suspends the pipeline until a human decides on each AUR item
pub struct ReviewGate {
    fetcher: Arc<dyn ScriptFetcher>,
    requests: mpsc::Sender<ReviewRequest>,
    build_dir: PathBuf,
}

impl ReviewGate {
    /// Create a gate and the receiving end for the presentation layer
    pub fn channel(
        fetcher: Arc<dyn ScriptFetcher>,
        build_dir: impl Into<PathBuf>,
    ) -> (Self, mpsc::Receiver<ReviewRequest>) {
        let (requests, rx) = mpsc::channel(16);
        let gate = Self {
            fetcher,
            requests,
            build_dir: build_dir.into(),
        };
        (gate, rx)
    }

    /// Ask for a decision on one plan item.
    ///
    /// Repo items bypass review. Items already decided return the recorded
    /// decision without asking again.
    pub async fn request_review(&self, item: &PlanItem, ledger: &mut ReviewLedger) -> PacsmithResult<ReviewDecision> {
        if !item.needs_review() {
            return Ok(ReviewDecision::Approved);
        }
        if let Some(entry) = ledger.get(item.name()) {
            if !entry.decision.is_pending() {
                return Ok(entry.decision.clone());
            }
        }

        let record = &item.record;
        let script = self.fetcher.fetch_script(record, &self.build_dir).await?;
        let report = ScriptScanner::global().scan(&script.text);
        tracing::info!(
            package = %record.name,
            score = report.score,
            findings = report.findings.len(),
            "build script awaiting review"
        );

        let (reply, answer) = oneshot::channel();
        let request = ReviewRequest {
            package: record.name.clone(),
            version: record.version.clone(),
            script: script.text.clone(),
            script_path: script.path(),
            report,
            reply,
        };

        let decision = if self.requests.send(request).await.is_err() {
            tracing::warn!(package = %record.name, "no reviewer listening, rejecting");
            ReviewDecision::Rejected
        } else {
            // No timeout: this waits for the human
            answer.await.unwrap_or(ReviewDecision::Rejected)
        };

        let entry = ReviewEntry::new(decision.clone(), script);
        tracing::info!(
            package = %record.name,
            decision = decision.label(),
            sha256 = %entry.sha256,
            "review decision recorded"
        );
        ledger.record(record.name.clone(), entry);
        Ok(decision)
    }

    /// Review every AUR item of a plan, in plan order
    pub async fn review_plan(&self, plan: &BuildPlan, ledger: &mut ReviewLedger) -> PacsmithResult<()> {
        for item in plan.review_items() {
            self.request_review(item, ledger).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a fixed script into `dest/<name>`
    pub struct FixedFetcher {
        pub text: String,
        pub fetches: AtomicUsize,
    }

    impl FixedFetcher {
        pub fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ScriptFetcher for FixedFetcher {
        async fn fetch_script(&self, record: &PackageRecord, dest: &Path) -> PacsmithResult<FetchedScript> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let dir = dest.join(record.base());
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| PacsmithError::filesystem(&dir, "mkdir", e))?;
            tokio::fs::write(dir.join(SCRIPT_NAME), &self.text)
                .await
                .map_err(|e| PacsmithError::filesystem(&dir, "write", e))?;
            FetchedScript::read(&dir).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedFetcher;
    use super::*;
    use crate::package::{InstalledState, Origin};
    use crate::resolver::{Catalog, Resolver};
    use std::sync::atomic::Ordering;

    const SCRIPT: &str = "pkgname=baz\npkgver=1\nbuild() {\n  make\n}\n";

    fn plan() -> BuildPlan {
        let catalog = Catalog::from_records([
            PackageRecord::new("foo", "1-1", Origin::CommunitySource).depends_on(["bar", "baz"]),
            PackageRecord::new("bar", "1-1", Origin::BinaryRepo),
            PackageRecord::new("baz", "1-1", Origin::CommunitySource),
        ]);
        Resolver::new(&catalog, &InstalledState::new()).resolve("foo").unwrap()
    }

    #[tokio::test]
    async fn test_review_flow_records_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FixedFetcher::new(SCRIPT));
        let (gate, mut requests) = ReviewGate::channel(fetcher.clone(), dir.path());

        let reviewer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(request) = requests.recv().await {
                assert_eq!(request.script, SCRIPT);
                seen.push(request.package.clone());
                if request.package == "baz" {
                    request.reject();
                } else {
                    request.approve_with_edits("pkgname=foo\n");
                }
            }
            seen
        });

        let plan = plan();
        let mut ledger = ReviewLedger::new();
        gate.review_plan(&plan, &mut ledger).await.unwrap();
        drop(gate);

        assert_eq!(reviewer.await.unwrap(), vec!["baz", "foo"]);
        assert_eq!(ledger.decision("bar"), ReviewDecision::Pending);
        assert_eq!(ledger.decision("baz"), ReviewDecision::Rejected);
        assert_eq!(ledger.rejected(), vec!["baz"]);

        let foo = ledger.get("foo").unwrap();
        assert_eq!(foo.approved_text(), Some("pkgname=foo\n"));
        assert_eq!(foo.sha256, script_digest("pkgname=foo\n"));
        assert!(ledger.ensure_complete(&plan).is_ok());
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_decided_items_are_not_asked_again() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FixedFetcher::new(SCRIPT));
        let (gate, mut requests) = ReviewGate::channel(fetcher.clone(), dir.path());
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                request.approve();
            }
        });

        let plan = plan();
        let mut ledger = ReviewLedger::new();
        gate.review_plan(&plan, &mut ledger).await.unwrap();
        gate.review_plan(&plan, &mut ledger).await.unwrap();
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);

        let bar = plan.get("bar").unwrap();
        assert_eq!(gate.request_review(bar, &mut ledger).await.unwrap(), ReviewDecision::Approved);
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_request_counts_as_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let (gate, mut requests) = ReviewGate::channel(Arc::new(FixedFetcher::new(SCRIPT)), dir.path());
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                drop(request);
            }
        });

        let plan = plan();
        let mut ledger = ReviewLedger::new();
        let baz = plan.get("baz").unwrap();
        assert_eq!(gate.request_review(baz, &mut ledger).await.unwrap(), ReviewDecision::Rejected);
    }

    #[test]
    fn test_unreviewed_plan_is_refused() {
        let plan = plan();
        match ReviewLedger::new().ensure_complete(&plan) {
            Err(PacsmithError::PlanNotReviewed { pending }) => assert_eq!(pending, vec!["baz", "foo"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_entry_digest_tracks_built_text() {
        let script = FetchedScript {
            dir: PathBuf::from("/tmp/x"),
            text: "original".to_string(),
        };
        let entry = ReviewEntry::new(ReviewDecision::Approved, script.clone());
        assert_eq!(entry.sha256, script_digest("original"));
        assert!(!entry.is_edited());

        let rejected = ReviewEntry::new(ReviewDecision::Rejected, script);
        assert_eq!(rejected.approved_text(), None);
    }
}
