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

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use pacsmith::executor::{ExecutionTicket, FailurePolicy, ItemOutcome, TransactionOutcome};
use pacsmith::log::{Phase, TransactionEvent, TransactionLog};
use pacsmith::package::Origin;
use pacsmith::resolver::{BuildPlan, PlanAction};
use pacsmith::review::{ReviewLedger, ReviewRequest, Severity};
use pacsmith::search::SearchOptions;
use pacsmith::{logging, session, Config, Session};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  pacsmith contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    /// Stop the whole plan at the first failure
    Abort,
    /// Skip only what depends on a failed item
    Skip,
}

#[derive(Parser)]
#[command(name = "pacsmith")]
#[command(version = VERSION)]
#[command(long_version = LONG_VERSION)]
#[command(about = "Resolve, review and build packages from the Arch repositories and the AUR.")]
struct Cli {
    #[arg(short = 'S', long)]
    sync: bool,
    #[arg(short = 'R', long)]
    remove: bool,
    #[arg(short = 's', long)]
    search: bool,
    #[arg(long, help = "Show the transaction history")]
    history: bool,
    #[arg(long, help = "Do not consult the AUR")]
    no_aur: bool,
    #[arg(short = 'A', long, conflicts_with = "repo", help = "Take the target from the AUR")]
    aur: bool,
    #[arg(long, help = "Take the target from the binary repositories")]
    repo: bool,
    #[arg(long, help = "Bypass the proceed prompt (build scripts are still reviewed)")]
    noconfirm: bool,
    #[arg(long, value_enum)]
    failure_policy: Option<PolicyArg>,
    #[arg(short = 'v', long)]
    verbose: bool,
    #[arg(value_name = "TARGETS")]
    targets: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if !cli.sync && !cli.remove && !cli.history {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        return Ok(());
    }

    let mut config = Config::load();
    if cli.no_aur {
        config.aur.enabled = false;
    }
    if let Some(policy) = cli.failure_policy {
        config.transaction.failure_policy = match policy {
            PolicyArg::Abort => FailurePolicy::AbortRemaining,
            PolicyArg::Skip => FailurePolicy::SkipDependents,
        };
    }
    config.validate().map_err(|e| anyhow!("invalid configuration: {}", e))?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    logging::init_with_file(level, config.logging.file.as_deref());

    if cli.history {
        return show_history(&config);
    }
    if cli.targets.is_empty() {
        return Err(anyhow!("no targets specified"));
    }

    let missing = session::missing_tools();
    if !missing.is_empty() {
        println!(
            "{}",
            style(format!("! warning: {} not found in PATH", missing.join(", "))).yellow()
        );
    }

    let (session, reviews) = Session::from_config(config)?;
    let reviewer = spawn_reviewer(reviews);

    let result = if cli.sync && cli.search {
        search(&session, &cli.targets.join(" ")).await
    } else if cli.sync {
        let pin = if cli.aur {
            Some(Origin::CommunitySource)
        } else if cli.repo {
            Some(Origin::BinaryRepo)
        } else {
            None
        };
        install(&session, &cli.targets, pin, cli.noconfirm).await
    } else {
        remove(&session, &cli.targets, cli.noconfirm).await
    };

    // closes the review channel so the prompt thread exits
    drop(session);
    let _ = reviewer.join();
    result
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
    {
        pb.set_style(spinner_style);
    }
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

async fn search(session: &Session, query: &str) -> Result<()> {
    let results = session.search(query, SearchOptions::default()).await;
    for degraded in &results.degraded {
        println!(
            "{}",
            style(format!(":: {} unavailable, results may be incomplete", degraded.source)).yellow()
        );
    }
    if results.hits.is_empty() {
        println!("no matches found.");
        return Ok(());
    }

    for hit in &results.hits {
        let record = &hit.record;
        let mut line = format!(
            "{}/{} {}",
            style(&record.repository).cyan().bold(),
            style(&record.name).bold(),
            style(record.version.as_str()).green()
        );
        if record.installed {
            line.push_str(&format!(" {}", style("[installed]").cyan()));
        }
        if hit.has_aur_alternative() {
            line.push_str(&format!(" {}", style("(also in aur)").dim()));
        }
        println!("{}\n    {}", line, record.description);
    }
    Ok(())
}

async fn install(session: &Session, targets: &[String], pin: Option<Origin>, noconfirm: bool) -> Result<()> {
    let mut failed = 0;
    for target in targets {
        let pb = spinner();
        pb.set_message(format!("resolving {}...", target));
        let mut options = session.resolve_options();
        options.pin = pin;
        let plan = session.resolve(target, options).await;
        pb.finish_and_clear();
        let plan = plan?;

        if plan.is_empty() {
            println!(" {} is up to date -- nothing to do.", target);
            continue;
        }
        print_plan(&plan);
        if !noconfirm && !confirm("proceed with installation?")? {
            return Ok(());
        }

        let mut ledger = ReviewLedger::new();
        if plan.review_items().next().is_some() {
            println!("{}", style(":: reviewing AUR build scripts...").bold());
            session.review(&plan, &mut ledger).await?;
        }
        for rejected in ledger.rejected() {
            println!("{}", style(format!(":: {} rejected, it and its dependents will be skipped", rejected)).yellow());
        }

        let ticket = session.execute(plan, ledger)?;
        failed += run_ticket(session.log(), ticket).await?;
    }

    if failed > 0 {
        return Err(anyhow!("{} package(s) did not complete", failed));
    }
    Ok(())
}

async fn remove(session: &Session, targets: &[String], noconfirm: bool) -> Result<()> {
    let mut failed = 0;
    for target in targets {
        let plan = session.removal_plan(target).await?;
        print_plan(&plan);
        if !noconfirm && !confirm("remove this package?")? {
            return Ok(());
        }
        let ticket = session.execute(plan, ReviewLedger::new())?;
        failed += run_ticket(session.log(), ticket).await?;
    }
    if failed > 0 {
        return Err(anyhow!("{} package(s) were not removed", failed));
    }
    Ok(())
}

fn print_plan(plan: &BuildPlan) {
    let removing = plan.items.iter().any(|i| i.action == PlanAction::Remove);
    if removing {
        println!("{}", style("\nREMOVAL").red().bold());
    } else {
        println!("{}", style("\nINSTALLATION").green().bold());
    }

    let mut t = Table::new();
    t.load_preset(UTF8_FULL);
    t.set_header(vec!["package", "version", "repo", "required by"]);
    for item in &plan.items {
        let mut name = item.name().to_string();
        if item.build_only {
            name.push_str(" (make)");
        }
        t.add_row(vec![
            name,
            item.record.version.to_string(),
            item.record.repository.clone(),
            if item.required_by.is_empty() {
                "-".to_string()
            } else {
                item.required_by.join(", ")
            },
        ]);
    }
    println!("{}", t);

    if !plan.satisfied.is_empty() {
        let met: Vec<String> = plan
            .satisfied
            .iter()
            .map(|s| if s.provider == s.name { s.name.clone() } else { format!("{} ({})", s.name, s.provider) })
            .collect();
        println!("Already installed: {}", met.join(", "));
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("\n{} {} [Y/n] ", style("::").bold().cyan(), question);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let answer = input.trim().to_lowercase();
    Ok(answer.is_empty() || answer.starts_with('y'))
}

/// Render events while the plan runs; Ctrl-C cancels the running item.
/// Returns the number of items that did not complete.
async fn run_ticket(log: &TransactionLog, ticket: ExecutionTicket) -> Result<usize> {
    let mut events = Box::pin(log.stream());
    let mut last_seq = log.last_seq();
    let canceller = ticket.canceller();
    let outcome = ticket.wait();
    tokio::pin!(outcome);

    let pb = spinner();
    let outcomes = loop {
        tokio::select! {
            result = &mut outcome => break result?,
            Some(event) = events.next() => {
                last_seq = event.seq;
                render_event(&pb, &event);
            }
            _ = tokio::signal::ctrl_c() => {
                pb.println(format!("{}", style(":: cancelling...").yellow()));
                canceller.cancel();
            }
        }
    };
    // events appended after the last one we saw
    for event in log.since(last_seq) {
        render_event(&pb, &event);
    }
    pb.finish_and_clear();

    print_outcomes(&outcomes);
    Ok(outcomes.iter().filter(|o| !o.is_success()).count())
}

fn render_event(pb: &ProgressBar, event: &TransactionEvent) {
    match event.phase {
        Phase::Done => pb.println(format!("{} {}", style("✓").green().bold(), event.message)),
        Phase::Failed => pb.println(format!(
            "{} {}: {}",
            style("✗").red().bold(),
            style(&event.item).bold(),
            event.message
        )),
        phase => {
            pb.set_message(format!("{} {}", phase, event.item));
            pb.println(format!("   {}", style(&event.message).dim()));
        }
    }
}

fn print_outcomes(outcomes: &[ItemOutcome]) {
    let mut t = Table::new();
    t.load_preset(UTF8_FULL);
    t.set_header(vec!["package", "result"]);
    for item in outcomes {
        let result = match &item.outcome {
            TransactionOutcome::Success => style("done".to_string()).green().to_string(),
            TransactionOutcome::Failed { reason } => style(format!("failed: {}", reason)).red().to_string(),
            TransactionOutcome::Skipped { reason } => style(format!("skipped: {}", reason)).yellow().to_string(),
        };
        t.add_row(vec![item.name.clone(), result]);
    }
    println!("{}", t);
}

fn show_history(config: &Config) -> Result<()> {
    let path = config
        .logging
        .history_file
        .as_deref()
        .ok_or_else(|| anyhow!("no history file configured"))?;
    if !path.exists() {
        println!("no transactions recorded yet.");
        return Ok(());
    }

    println!("{}", style(":: transaction history (last 20 entries)...").bold());
    let events = TransactionLog::load_history(path)?;
    let mut t = Table::new();
    t.load_preset(UTF8_FULL);
    t.set_header(vec!["time", "package", "phase", "message"]);
    for event in events.iter().filter(|e| matches!(e.phase, Phase::Done | Phase::Failed)).rev().take(20) {
        t.add_row(vec![
            event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            event.item.clone(),
            event.phase.to_string(),
            event.message.clone(),
        ]);
    }
    println!("{}", t);
    Ok(())
}

/// Answer review requests on a plain thread; stdin reads block
fn spawn_reviewer(mut reviews: mpsc::Receiver<ReviewRequest>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while let Some(request) = reviews.blocking_recv() {
            if let Err(e) = review_prompt(request) {
                eprintln!("{} review failed: {}", style("error:").red().bold(), e);
            }
        }
    })
}

fn review_prompt(request: ReviewRequest) -> Result<()> {
    println!(
        "\n{} {} {} ({})",
        style(":: review build script for").bold(),
        style(&request.package).bold().cyan(),
        style(request.version.as_str()).green(),
        request.script_path.display()
    );

    let report = &request.report;
    let score = format!("safety score {}/100", report.score);
    if report.flagged() {
        println!("   {}", style(score).red().bold());
    } else {
        println!("   {}", style(score).green());
    }
    for finding in &report.findings {
        let label = match finding.severity {
            Severity::Critical | Severity::High => style(finding.severity.to_string()).red().bold(),
            Severity::Medium => style(finding.severity.to_string()).yellow(),
            Severity::Low => style(finding.severity.to_string()).dim(),
        };
        match finding.line {
            Some(line) => println!("   [{}] line {}: {}", label, line, finding.description),
            None => println!("   [{}] {}", label, finding.description),
        }
    }

    loop {
        print!("{} [v]iew, [a]pprove, [r]eject, [e]dit? ", style("::").bold().cyan());
        io::stdout().flush()?;
        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            request.reject();
            return Ok(());
        }
        match input.trim().to_lowercase().as_str() {
            "v" | "view" => {
                for (idx, line) in request.script.lines().enumerate() {
                    println!("{:>4} {}", style(idx + 1).dim(), line);
                }
            }
            "a" | "approve" => {
                request.approve();
                return Ok(());
            }
            "r" | "reject" => {
                request.reject();
                return Ok(());
            }
            "e" | "edit" => {
                let edited = edit_script(&request.script)?;
                if edited == request.script {
                    println!("   no changes, approving the original");
                    request.approve();
                } else {
                    request.approve_with_edits(edited);
                }
                return Ok(());
            }
            _ => println!("   please answer v, a, r or e"),
        }
    }
}

/// Open a temporary copy of the script in `$EDITOR`
fn edit_script(script: &str) -> Result<String> {
    let mut file = tempfile::Builder::new().prefix("PKGBUILD.").tempfile()?;
    file.write_all(script.as_bytes())?;
    file.flush()?;

    let editor = std::env::var("EDITOR")
        .ok()
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| "vi".to_string());
    let status = std::process::Command::new(&editor).arg(file.path()).status()?;
    if !status.success() {
        return Err(anyhow!("{} exited with {}", editor, status));
    }
    Ok(std::fs::read_to_string(file.path())?)
}
