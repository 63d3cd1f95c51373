use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use workspace_sandbox::fetch::GitHubTreeFetcher;
use workspace_sandbox::sandbox::local::LocalBooter;
use workspace_sandbox::sandbox::{FileTreeNode, SandboxRegistry};
use workspace_sandbox::store::{SnapshotCache, SqliteSnapshotStore};
use workspace_sandbox::{Config, Orchestrator, Phase, StateUpdate};

const HELP: &str = "commands: refresh | retry | branch [NAME] | tree | write PATH CONTENT | quit";

#[derive(Parser)]
#[command(name = "workspace-sandbox")]
#[command(version, about = "Boot a GitHub project into a local sandbox and run its dev server")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a repository and supervise it interactively
    Boot {
        /// Repository in owner/name form
        repo: String,
        /// Branch to check out (default branch when omitted)
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("workspace_sandbox=info")),
        )
        .init();

    let cli = Cli::parse();
    let (config, source) = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => print_config(&config, source.as_deref()),
        Commands::Boot { repo, branch } => run(config, repo, branch).await,
    }
}

fn print_config(config: &Config, source: Option<&Path>) -> Result<()> {
    match source {
        Some(path) => println!("# loaded from {}", path.display()),
        None => match Config::default_path() {
            Some(path) => println!("# built-in defaults (no file at {})", path.display()),
            None => println!("# built-in defaults"),
        },
    }
    println!("# snapshot db: {}", config.db_path().display());
    print!("{}", config.to_toml()?);
    Ok(())
}

fn snapshot_cache(config: &Config) -> SnapshotCache {
    if !config.cache.enabled {
        return SnapshotCache::disabled();
    }
    match SqliteSnapshotStore::open(&config.db_path()) {
        Ok(store) => SnapshotCache::new(Arc::new(store)),
        Err(e) => {
            tracing::warn!("Snapshot cache unavailable, continuing without it: {e:#}");
            SnapshotCache::disabled()
        }
    }
}

async fn run(config: Config, repo: String, branch: Option<String>) -> Result<()> {
    let fetcher = Arc::new(GitHubTreeFetcher::new(
        &config.github.api_base,
        config.github.token.clone(),
    )?);
    let registry = Arc::new(SandboxRegistry::new(Arc::new(LocalBooter)));
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator_config(&repo, branch),
        registry,
        fetcher,
        snapshot_cache(&config),
    ));

    let printer = tokio::spawn(print_states(orchestrator.subscribe()));
    in_background(&orchestrator, |o| async move { o.boot().await });
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&orchestrator, line.trim()).await {
                    break;
                }
            }
        }
    }

    orchestrator.teardown().await;
    printer.abort();
    Ok(())
}

/// Run a boot-style operation without blocking the command loop. Failures are
/// already reflected in the state stream.
fn in_background<F, Fut>(orchestrator: &Arc<Orchestrator>, op: F)
where
    F: FnOnce(Arc<Orchestrator>) -> Fut,
    Fut: std::future::Future<Output = Result<(), workspace_sandbox::OrchestratorError>> + Send + 'static,
{
    let fut = op(orchestrator.clone());
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            tracing::debug!("Background operation ended with: {e}");
        }
    });
}

/// Returns `false` when the session should end.
async fn handle_command(orchestrator: &Arc<Orchestrator>, line: &str) -> bool {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "refresh" => match orchestrator.refresh().await {
            Ok(summary) => println!(
                "refreshed: {} written, {} removed",
                summary.written, summary.removed
            ),
            Err(e) => eprintln!("refresh failed: {e}"),
        },
        "retry" => in_background(orchestrator, |o| async move { o.retry().await }),
        "branch" => {
            let branch = (!rest.is_empty()).then(|| rest.to_string());
            in_background(orchestrator, |o| async move {
                o.set_branch(branch).await.map(|_| ())
            });
        }
        "tree" => match orchestrator.file_tree().await {
            Ok(nodes) => print_tree(&nodes, 0),
            Err(e) => eprintln!("{e}"),
        },
        "write" => match rest.split_once(char::is_whitespace) {
            Some((path, contents)) => {
                match orchestrator.write_file(path, contents.to_string()).await {
                    Ok(()) => println!("wrote {path}"),
                    Err(e) => eprintln!("write failed: {e}"),
                }
            }
            None => eprintln!("usage: write PATH CONTENT"),
        },
        "quit" | "exit" => return false,
        "help" => println!("{HELP}"),
        other => eprintln!("unknown command {other:?}; {HELP}"),
    }
    true
}

fn print_tree(nodes: &[FileTreeNode], depth: usize) {
    for node in nodes {
        let suffix = if node.children.is_some() { "/" } else { "" };
        println!("{}{}{suffix}", "  ".repeat(depth), node.name);
        if let Some(children) = &node.children {
            print_tree(children, depth + 1);
        }
    }
}

async fn print_states(mut updates: mpsc::UnboundedReceiver<StateUpdate>) {
    let mut last_phase = None;
    let mut last_url = None;

    while let Some(update) = updates.recv().await {
        let state = match update {
            StateUpdate::Output(line) => {
                println!("  | {line}");
                continue;
            }
            StateUpdate::Snapshot(state) => state,
        };
        if last_phase == Some(state.phase) && last_url == state.preview_url {
            continue;
        }
        match state.phase {
            Phase::Running => println!(
                "[running] {}",
                state.preview_url.as_deref().unwrap_or("(no url)")
            ),
            Phase::Error => println!(
                "[error: {}] {} (type `retry`)",
                state.error_kind.map(|k| k.label()).unwrap_or("unknown"),
                state.error.as_deref().unwrap_or("")
            ),
            phase => println!("[{phase}]"),
        }
        last_phase = Some(state.phase);
        last_url = state.preview_url;
    }
}
