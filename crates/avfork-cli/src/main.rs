// Entry point for the `avfork` command line tool.
//
// `run` starts one program through the process invoker and exits with its
// code, `bench` measures spawn latency, and `limits` prints the resource
// limits a spawned child would inherit.

use anyhow::{Context, Result};
use avfork::{
    Command, ProcessCancelledError, ProcessInvoker, SpawnSettings, Stdio, TracingTraceWriter,
};
use avfork_syscall::{prlimit, Priority, PrlimitResource, Rlimit, RLIM_INFINITY};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Exit code used when the run was cancelled with Ctrl-C.
const CANCELLED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "avfork", version, about = "Spawn processes with avfork")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program and exit with its exit code.
    Run(RunArgs),
    /// Measure how long spawning a program takes.
    Bench(BenchArgs),
    /// Print the current resource limits.
    Limits,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Working directory of the child.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Set an environment variable in the child (KEY=VALUE). May be repeated.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Start the child with only the variables given by --env.
    #[arg(long)]
    env_clear: bool,

    /// Limit the number of open files in the child.
    #[arg(long)]
    nofile: Option<u64>,

    /// Nice value of the child (-20..=19).
    #[arg(long, allow_hyphen_values = true)]
    nice: Option<i32>,

    /// Print a JSON summary to stdout once the child exits.
    #[arg(long)]
    json: bool,

    /// JSON settings file. AVFORK_* variables still override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Program to run.
    program: String,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// Number of spawns.
    #[arg(long, default_value_t = 100)]
    count: u32,

    /// Print the result as JSON.
    #[arg(long)]
    json: bool,

    /// Program to spawn.
    program: String,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Serialize, Debug)]
struct RunReport {
    program: String,
    exit_code: i32,
    cancelled: bool,
    elapsed_ms: u128,
}

#[derive(Serialize, Debug, PartialEq)]
struct BenchStats {
    count: usize,
    mean_us: u128,
    min_us: u128,
    max_us: u128,
}

impl BenchStats {
    fn from_samples(samples: &[Duration]) -> Option<BenchStats> {
        let min = samples.iter().min()?;
        let max = samples.iter().max()?;
        let total: Duration = samples.iter().sum();
        Some(BenchStats {
            count: samples.len(),
            mean_us: total.as_micros() / samples.len() as u128,
            min_us: min.as_micros(),
            max_us: max.as_micros(),
        })
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("empty variable name in '{s}'")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Quote one argument so that `avfork::shell_split` yields it unchanged.
fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && !arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\'));
    if plain {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn join_args(args: &[String]) -> String {
    args.iter()
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_limit(value: u64) -> String {
    if value == RLIM_INFINITY {
        "unlimited".to_string()
    } else {
        value.to_string()
    }
}

fn load_settings(config: Option<&PathBuf>) -> Result<SpawnSettings> {
    match config {
        Some(path) => {
            let mut settings = SpawnSettings::load(path)?;
            settings.apply_overrides(|key| std::env::var(key).ok());
            let global = SpawnSettings::global();
            if settings.pool_capacity != global.pool_capacity {
                tracing::warn!(
                    "Ignoring pool_capacity={} from {path:?}: the stack pool is sized by {} ({})",
                    settings.pool_capacity,
                    avfork::settings::ENV_POOL_CAPACITY,
                    global.pool_capacity
                );
            }
            Ok(settings)
        }
        None => Ok(SpawnSettings::global().clone()),
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn install_ctrlc_handler(token: &CancellationToken) {
    let token = token.clone();
    if let Err(err) = ctrlc::set_handler(move || token.cancel()) {
        tracing::warn!("Failed to install Ctrl-C handler: {err}");
    }
}

async fn run(args: RunArgs) -> Result<i32> {
    let settings = load_settings(args.config.as_ref())?;
    let trace = TracingTraceWriter::new("avfork").with_stdout(settings.print_log_to_stdout);

    let mut invoker = ProcessInvoker::with_settings(Arc::new(trace), &settings);
    if args.env_clear {
        invoker.env_clear();
    }
    if let Some(nofile) = args.nofile {
        invoker.rlimit(PrlimitResource::Nofile, Rlimit::new(nofile, nofile));
    }
    if let Some(nice) = args.nice {
        let priority = Priority::new(nice)
            .with_context(|| format!("Nice value {nice} is outside -20..=19"))?;
        invoker.priority(priority);
    }

    let mut stdout_rx = invoker
        .take_stdout_receiver()
        .context("stdout receiver already taken")?;
    let mut stderr_rx = invoker
        .take_stderr_receiver()
        .context("stderr receiver already taken")?;

    // With --json, stdout is reserved for the report
    let json = args.json;
    let forward_stdout = tokio::spawn(async move {
        while let Some(line) = stdout_rx.recv().await {
            if json {
                eprintln!("{}", line.data);
            } else {
                println!("{}", line.data);
            }
        }
    });
    let forward_stderr = tokio::spawn(async move {
        while let Some(line) = stderr_rx.recv().await {
            eprintln!("{}", line.data);
        }
    });

    let cancel = CancellationToken::new();
    install_ctrlc_handler(&cancel);

    let environment: HashMap<String, String> = args.env.into_iter().collect();
    let working_directory = args
        .cwd
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let arguments = join_args(&args.args);

    let start = Instant::now();
    let result = invoker
        .execute(
            &working_directory,
            &args.program,
            &arguments,
            Some(&environment),
            false,
            false,
            cancel,
        )
        .await;
    let elapsed = start.elapsed();

    // Closing the channels ends the forwarders
    drop(invoker);
    let _ = forward_stdout.await;
    let _ = forward_stderr.await;

    let (exit_code, cancelled) = match result {
        Ok(code) => (code, false),
        Err(err) => match err.downcast_ref::<ProcessCancelledError>() {
            Some(_) => (CANCELLED_EXIT_CODE, true),
            None => return Err(err),
        },
    };

    if args.json {
        let report = RunReport {
            program: args.program,
            exit_code,
            cancelled,
            elapsed_ms: elapsed.as_millis(),
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    // -1 means the child was killed by a signal
    Ok(if exit_code < 0 { 1 } else { exit_code })
}

async fn bench(args: BenchArgs) -> Result<i32> {
    anyhow::ensure!(args.count > 0, "--count must be at least 1");

    let mut cmd = Command::new(&args.program);
    cmd.args(&args.args)
        .stdin(Stdio::Null)
        .stdout(Stdio::Null)
        .stderr(Stdio::Null);

    let mut samples = Vec::with_capacity(args.count as usize);
    for _ in 0..args.count {
        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", args.program))?;
        samples.push(start.elapsed());
        child.wait().await?;
    }

    let stats = BenchStats::from_samples(&samples).context("no samples collected")?;
    if args.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!(
            "{} spawns of '{}': mean {}us, min {}us, max {}us",
            stats.count, args.program, stats.mean_us, stats.min_us, stats.max_us
        );
    }
    Ok(0)
}

fn limits() -> Result<i32> {
    println!("{:<12} {:>12} {:>12}", "RESOURCE", "SOFT", "HARD");
    for resource in PrlimitResource::ALL {
        let limit = prlimit(None, resource, None)
            .with_context(|| format!("Failed to read limit '{}'", resource.name()))?;
        println!(
            "{:<12} {:>12} {:>12}",
            resource.name(),
            format_limit(limit.cur),
            format_limit(limit.max)
        );
    }
    Ok(0)
}

fn run_cli(cli: Cli) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Run(args) => run(args).await,
            Commands::Bench(args) => bench(args).await,
            Commands::Limits => limits(),
        }
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Diagnostics go to stderr so they never mix with the child's stdout
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match run_cli(cli) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            tracing::error!("avfork failed: {e:#}");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_options() {
        let cli = Cli::try_parse_from([
            "avfork", "run", "--cwd", "/tmp", "--env", "A=1", "--env", "B=x=y", "--env-clear",
            "--nofile", "64", "--nice", "-5", "--json", "--", "ls", "-l", "/",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(
            args.env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert!(args.env_clear);
        assert_eq!(args.nofile, Some(64));
        assert_eq!(args.nice, Some(-5));
        assert!(args.json);
        assert_eq!(args.program, "ls");
        assert_eq!(args.args, vec!["-l", "/"]);
    }

    #[test]
    fn parse_run_requires_program() {
        assert!(Cli::try_parse_from(["avfork", "run"]).is_err());
    }

    #[test]
    fn parse_bench_defaults() {
        let cli = Cli::try_parse_from(["avfork", "bench", "--", "true"]).unwrap();
        let Commands::Bench(args) = cli.command else {
            panic!("expected bench");
        };
        assert_eq!(args.count, 100);
        assert!(!args.json);
        assert_eq!(args.program, "true");
        assert!(args.args.is_empty());
    }

    #[test]
    fn parse_limits() {
        let cli = Cli::try_parse_from(["avfork", "limits"]).unwrap();
        assert!(matches!(cli.command, Commands::Limits));
    }

    #[test]
    fn env_pair_parsing() {
        assert_eq!(
            parse_env_pair("KEY=value").unwrap(),
            ("KEY".to_string(), "value".to_string())
        );
        assert_eq!(
            parse_env_pair("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_env_pair("novalue").is_err());
        assert!(parse_env_pair("=x").is_err());
    }

    #[test]
    fn joined_args_split_back_unchanged() {
        let args: Vec<String> = ["plain", "two words", "it's", "", r"back\slash", "\"q\""]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(avfork::shell_split(&join_args(&args)), args);
    }

    #[test]
    fn limits_format_infinity() {
        assert_eq!(format_limit(RLIM_INFINITY), "unlimited");
        assert_eq!(format_limit(1024), "1024");
    }

    #[test]
    fn bench_stats() {
        let samples = [
            Duration::from_micros(10),
            Duration::from_micros(30),
            Duration::from_micros(20),
        ];
        assert_eq!(
            BenchStats::from_samples(&samples),
            Some(BenchStats {
                count: 3,
                mean_us: 20,
                min_us: 10,
                max_us: 30,
            })
        );
        assert_eq!(BenchStats::from_samples(&[]), None);
    }

    fn workflow() -> serde_yaml::Value {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../.github/workflows/rust.yml");
        let text = std::fs::read_to_string(&path).unwrap();
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn workflow_runs_on_push_and_pull_request() {
        let doc = workflow();
        let triggers = doc["on"].as_mapping().unwrap();
        assert!(triggers.contains_key("push"));
        assert!(triggers.contains_key("pull_request"));

        assert_eq!(doc["env"]["CARGO_TERM_COLOR"].as_str(), Some("always"));
        assert_eq!(doc["env"]["DEBUG"].as_bool(), Some(true));
    }

    #[test]
    fn workflow_matrix_has_two_images() {
        let doc = workflow();
        let job = &doc["jobs"]["build"];
        let images = job["strategy"]["matrix"]["os"].as_sequence().unwrap();
        assert_eq!(images.len(), 2);
        assert_ne!(images[0], images[1]);
        assert_eq!(job["container"].as_str(), Some("rust:1-bookworm"));
    }

    #[test]
    fn workflow_tests_run_without_output_capture() {
        let doc = workflow();
        let steps = doc["jobs"]["build"]["steps"].as_sequence().unwrap();
        let runs: Vec<&str> = steps.iter().filter_map(|step| step["run"].as_str()).collect();

        let test_step = runs.iter().find(|run| run.contains("cargo test")).unwrap();
        assert!(test_step.contains("cargo test -- --nocapture"));
        assert!(test_step.contains("ulimit -s unlimited"));

        let build = runs.iter().position(|run| run.contains("cargo build")).unwrap();
        let test = runs.iter().position(|run| run.contains("cargo test")).unwrap();
        assert!(build < test);

        let checkout = steps
            .iter()
            .find(|step| step["uses"].as_str().is_some_and(|u| u.starts_with("actions/checkout")))
            .unwrap();
        assert_eq!(checkout["with"]["submodules"].as_str(), Some("recursive"));
    }

    #[test]
    fn config_file_settings_reach_the_invoker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avfork.json");
        std::fs::write(&path, r#"{"stack_size": 1048576, "sigint_timeout_ms": 10}"#).unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.stack_size, 1048576);
        assert_eq!(settings.sigint_timeout_ms, 10);

        let invoker =
            ProcessInvoker::with_settings(Arc::new(avfork::NullTraceWriter), &settings);
        assert_eq!(invoker.stack_size(), 1048576);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_settings(Some(&PathBuf::from("/nonexistent/avfork.json"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read settings"));
    }

    #[tokio::test]
    async fn run_returns_child_exit_code() {
        let args = RunArgs {
            cwd: None,
            env: vec![],
            env_clear: false,
            nofile: None,
            nice: None,
            json: false,
            config: None,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
        };
        assert_eq!(run(args).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn bench_rejects_zero_count() {
        let args = BenchArgs {
            count: 0,
            json: false,
            program: "true".to_string(),
            args: vec![],
        };
        assert!(bench(args).await.is_err());
    }
}
