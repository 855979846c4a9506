// gantry: a multi-language build system and test runner.
// Copyright (C) 2024 International Digital Economy Academy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// For inquiries, you can contact us via e-mail at jichuruanjian@idea.edu.cn.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use gantrybuild::entry::run_build as drive_build;
use gantrybuild::follow::client::{FollowOptions, follow};
use gantrybuild::follow::server::FollowServer;
use gantrybuild::schedule::{Mode, Scheduler};
use gantrycore::state::{BuildOptions, BuildState};
use gantryutil::label::BuildLabel;
use gantryutil::lock::RepoLock;
use gantryutil::stats::ResourceSampler;

use crate::build_file::JsonParser;
use crate::monitor::Monitor;
use crate::results_file::JsonResultReader;
use crate::shell::ShellExecutor;

/// Exit code for configuration and usage errors.
const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Parser)]
#[clap(name = "gantry", about = "A multi-language build system and test runner")]
pub struct GantryCli {
    #[clap(flatten)]
    pub flags: UniversalFlags,
    #[clap(subcommand)]
    pub subcommand: GantrySubcommands,
}

#[derive(Debug, Parser)]
pub struct UniversalFlags {
    /// The workspace root; defaults to the current directory.
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,

    /// Print plain progress lines instead of colored ones.
    #[clap(long, global = true)]
    pub plain_output: bool,

    /// Do not take the workspace repo lock.
    #[clap(long, global = true)]
    pub nolock: bool,
}

#[derive(Debug, Parser)]
pub enum GantrySubcommands {
    /// Build the given targets
    Build(BuildArgs),
    /// Build and test the given targets
    Test(TestArgs),
    /// Parse the given packages and list their targets
    Query(QueryArgs),
    /// Attach to a build running in another process and mirror its progress
    Follow(FollowArgs),
    /// Remove all build outputs
    Clean(CleanArgs),
    /// Print the version
    Version,
}

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Labels to build, e.g. `//src/core:lib`, `//src/...`, or `-` to read
    /// labels from stdin.
    #[clap(required = true)]
    pub targets: Vec<String>,

    /// Number of local worker threads.
    #[clap(short = 'j', long, default_value_t = default_threads())]
    pub num_threads: usize,

    /// Number of remote executor workers.
    #[clap(long, default_value_t = 0)]
    pub remote_executors: usize,

    /// Only select targets carrying one of these labels.
    #[clap(long)]
    pub include: Vec<String>,

    /// Never select targets carrying one of these labels; wins over include.
    #[clap(long)]
    pub exclude: Vec<String>,

    /// Keep going after a failure instead of stopping the build.
    #[clap(long)]
    pub keep_going: bool,

    /// Keep scratch build/test directories around for debugging.
    #[clap(long)]
    pub keep_workdirs: bool,

    /// Cap concurrency per target label, e.g. `--limit java=1`. Repeatable.
    #[clap(long, value_parser = parse_limit)]
    pub limit: Vec<(String, usize)>,

    /// Serve the follow stream on this port while building.
    #[clap(long)]
    pub follow_port: Option<u16>,
}

#[derive(Debug, Parser)]
pub struct TestArgs {
    #[clap(flatten)]
    pub build: BuildArgs,

    /// Run every test this many times.
    #[clap(long, default_value_t = 1)]
    pub num_runs: u32,

    /// Collect and aggregate coverage.
    #[clap(long)]
    pub coverage: bool,

    /// Exit zero even when tests fail.
    #[clap(long)]
    pub failing_tests_ok: bool,
}

#[derive(Debug, Parser)]
pub struct QueryArgs {
    /// Labels whose packages should be parsed and listed.
    #[clap(required = true)]
    pub targets: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct FollowArgs {
    /// Address of the primary build's follow server, host:port.
    #[clap(default_value = "127.0.0.1:7977")]
    pub address: String,

    /// Connection retries before giving up.
    #[clap(long, default_value_t = 3)]
    pub retries: u32,
}

#[derive(Debug, Parser)]
pub struct CleanArgs {}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(4, usize::from)
}

fn parse_limit(s: &str) -> Result<(String, usize), String> {
    let (label, max) = s
        .split_once('=')
        .ok_or_else(|| format!("`{s}` is not of the form label=N"))?;
    let max: usize = max
        .parse()
        .map_err(|_| format!("`{max}` is not a number"))?;
    if label.is_empty() {
        return Err("limit label must not be empty".to_owned());
    }
    Ok((label.to_owned(), max))
}

fn workspace_root(flags: &UniversalFlags) -> anyhow::Result<PathBuf> {
    let root = match &flags.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };
    dunce::canonicalize(&root).with_context(|| format!("cannot resolve {}", root.display()))
}

/// Resolve command-line target strings into labels, expanding `-` from
/// stdin. Returns `None` (after printing) on a malformed label.
fn resolve_labels(targets: &[String]) -> Option<Vec<BuildLabel>> {
    let mut labels = Vec::new();
    let mut strings: Vec<String> = Vec::new();
    for t in targets {
        if t == "-" {
            for line in std::io::stdin().lock().lines() {
                let line = line.ok()?;
                let line = line.trim();
                if !line.is_empty() {
                    strings.push(line.to_owned());
                }
            }
        } else {
            strings.push(t.clone());
        }
    }
    for s in &strings {
        match s.parse::<BuildLabel>() {
            Ok(label) => labels.push(label),
            Err(e) => {
                eprintln!("{}: {}", "error".red().bold(), e);
                return None;
            }
        }
    }
    Some(labels)
}

fn build_options(flags: &UniversalFlags, args: &BuildArgs) -> anyhow::Result<BuildOptions> {
    Ok(BuildOptions {
        root: workspace_root(flags)?,
        need_build: true,
        num_threads: args.num_threads.max(1),
        num_remote_executors: args.remote_executors,
        include: args.include.clone(),
        exclude: args.exclude.clone(),
        keep_going: args.keep_going,
        keep_workdirs: args.keep_workdirs,
        limits: args.limit.clone(),
        ..Default::default()
    })
}

struct Invocation {
    scheduler: Arc<Scheduler>,
    sampler: Arc<ResourceSampler>,
    monitor: Monitor,
    server: Option<FollowServer>,
    _lock: Option<RepoLock>,
}

fn prepare(
    flags: &UniversalFlags,
    options: BuildOptions,
    follow_port: Option<u16>,
) -> anyhow::Result<Invocation> {
    let lock = if flags.nolock {
        None
    } else {
        let out_dir = options.root.join(gantryutil::OUT_DIR);
        Some(RepoLock::lock(&out_dir).context("cannot lock the workspace")?)
    };

    let state = Arc::new(BuildState::new(options));
    let scheduler = Scheduler::new(
        Arc::clone(&state),
        Arc::new(JsonParser::new()),
        Arc::new(ShellExecutor::new()),
        Arc::new(JsonResultReader::new()),
        None,
    );
    let sampler = Arc::new(ResourceSampler::start());
    let monitor = Monitor::start(
        state.bus.subscribe("monitor"),
        flags.plain_output,
    );
    let server = match follow_port {
        Some(port) => Some(
            FollowServer::start(Arc::clone(&state), Arc::clone(&sampler), port)
                .context("cannot start the follow server")?,
        ),
        None => None,
    };

    // One interrupt stops the build; the second one kills us outright.
    let interrupt_target = Arc::clone(&scheduler);
    let mut interrupted = false;
    ctrlc::set_handler(move || {
        if interrupted {
            std::process::exit(1);
        }
        interrupted = true;
        eprintln!("Interrupted, stopping...");
        interrupt_target.stop_all();
    })
    .context("cannot install the interrupt handler")?;

    Ok(Invocation {
        scheduler,
        sampler,
        monitor,
        server,
        _lock: lock,
    })
}

fn finish(invocation: Invocation) {
    if let Some(server) = invocation.server {
        server.shutdown();
    }
    invocation.monitor.stop();
}

pub fn run_build(flags: &UniversalFlags, args: BuildArgs) -> anyhow::Result<i32> {
    let Some(labels) = resolve_labels(&args.targets) else {
        return Ok(EXIT_CONFIG);
    };
    let options = build_options(flags, &args)?;
    let invocation = prepare(flags, options, args.follow_port)?;

    let summary = drive_build(
        &invocation.scheduler,
        labels,
        Mode::Normal,
        invocation.sampler.worker_count(),
    )?;

    let code = summary.exit_code(false);
    let verdict = if code == 0 {
        format!("{} {} targets built.", "Finished.".bright_green().bold(), summary.built)
    } else {
        format!(
            "{} {} built, {} failed, {} stopped.",
            "Failed.".red().bold(),
            summary.built,
            summary.failed + summary.hard_failures.len(),
            summary.stopped
        )
    };
    finish(invocation);
    println!("{verdict}");
    Ok(code)
}

pub fn run_test(flags: &UniversalFlags, args: TestArgs) -> anyhow::Result<i32> {
    let Some(labels) = resolve_labels(&args.build.targets) else {
        return Ok(EXIT_CONFIG);
    };
    let mut options = build_options(flags, &args.build)?;
    options.need_tests = true;
    options.need_coverage = args.coverage;
    options.num_test_runs = args.num_runs.max(1);
    options.failing_tests_ok = args.failing_tests_ok;
    let invocation = prepare(flags, options, args.build.follow_port)?;

    let summary = drive_build(
        &invocation.scheduler,
        labels,
        Mode::Normal,
        invocation.sampler.worker_count(),
    )?;

    let code = summary.exit_code(args.failing_tests_ok);
    let flakes: usize = summary.suites.iter().map(|s| s.flakes()).sum();
    let verdict = if summary.tests_failed() {
        format!(
            "{} {} of {} tests passed.",
            "Failed.".red().bold(),
            summary.tests_passed(),
            summary.tests_run()
        )
    } else {
        let mut v = format!(
            "{} {} tests passed.",
            "Finished.".bright_green().bold(),
            summary.tests_run()
        );
        if flakes > 0 {
            v.push_str(&format!(" ({flakes} flaky)"));
        }
        v
    };
    finish(invocation);
    println!("{verdict}");
    if let Some(coverage) = &summary.coverage {
        if let Some(total) = coverage.total_percentage {
            println!("Total coverage: {total:.1}%");
        }
    }
    Ok(code)
}

pub fn run_query(flags: &UniversalFlags, args: QueryArgs) -> anyhow::Result<i32> {
    let Some(labels) = resolve_labels(&args.targets) else {
        return Ok(EXIT_CONFIG);
    };
    let mut options = build_options(
        flags,
        &BuildArgs {
            targets: args.targets.clone(),
            num_threads: default_threads(),
            remote_executors: 0,
            include: Vec::new(),
            exclude: Vec::new(),
            keep_going: true,
            keep_workdirs: false,
            limit: Vec::new(),
            follow_port: None,
        },
    )?;
    options.need_build = false;
    let invocation = prepare(flags, options, None)?;

    let summary = drive_build(
        &invocation.scheduler,
        labels,
        Mode::ForParseOnly,
        invocation.sampler.worker_count(),
    )?;

    let mut targets: Vec<String> = invocation
        .scheduler
        .state
        .graph
        .packages()
        .iter()
        .flat_map(|p| p.all_targets())
        .map(|t| t.label.to_string())
        .collect();
    targets.sort();
    finish(invocation);
    for t in targets {
        println!("{t}");
    }
    Ok(if summary.hard_failures.is_empty() { 0 } else { 1 })
}

pub fn run_follow(flags: &UniversalFlags, args: FollowArgs) -> anyhow::Result<i32> {
    let state = Arc::new(BuildState::new(BuildOptions {
        root: workspace_root(flags)?,
        ..Default::default()
    }));
    let monitor = Monitor::start(state.bus.subscribe("monitor"), flags.plain_output);
    let options = FollowOptions {
        retries: args.retries,
        ..Default::default()
    };
    let outcome = follow(&format!("http://{}", args.address), &state, &options)?;
    monitor.stop();
    use gantrybuild::follow::client::FollowOutcome;
    match outcome {
        FollowOutcome::Completed => {
            println!("{} Remote build completed.", "Finished.".bright_green().bold());
            Ok(0)
        }
        FollowOutcome::Disconnected => {
            println!("{} Disconnected from the remote build.", "Failed.".red().bold());
            Ok(1)
        }
    }
}

pub fn run_clean(flags: &UniversalFlags, _args: CleanArgs) -> anyhow::Result<i32> {
    let root = workspace_root(flags)?;
    let out_dir = root.join(gantryutil::OUT_DIR);
    if out_dir.exists() {
        std::fs::remove_dir_all(&out_dir)
            .with_context(|| format!("cannot remove {}", out_dir.display()))?;
    }
    println!("{} cleaned {}", "Finished.".bright_green().bold(), out_dir.display());
    Ok(0)
}

pub fn run_version() -> anyhow::Result<i32> {
    println!("gantry {}", env!("CARGO_PKG_VERSION"));
    Ok(0)
}
