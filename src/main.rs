use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use monox::config::Config;
use monox::run::{DryRunMode, LogPrefix, Run, RunOptions};
use monox::workspace::PackageGraph;

const CONFIG_FILE: &str = "monox.toml";

#[derive(Parser)]
#[command(name = "monox")]
#[command(about = "Incremental task runner for monorepo workspaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: monox.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tasks across workspace packages
    Run {
        /// Task names to run
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Restrict the run to specific packages (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,

        /// Run every ready task immediately, ignoring dependency order
        #[arg(long)]
        parallel: bool,

        /// Worker pool size
        #[arg(long, default_value_t = monox::engine::DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// Keep running unrelated tasks after a failure
        #[arg(long)]
        continue_on_error: bool,

        /// Task prefix on log lines: auto or none
        #[arg(long, default_value = "auto")]
        log_prefix: String,

        /// Override every task's output mode
        #[arg(long)]
        output_mode: Option<String>,

        /// Write the run summary to .turbo/runs/
        #[arg(long)]
        summarize: bool,

        /// Plan without executing; "json" or "text"
        #[arg(long, value_name = "MODE", num_args = 0..=1, default_missing_value = "text")]
        dry: Option<String>,

        /// Disable the cache for this run
        #[arg(long)]
        no_cache: bool,

        /// Arguments forwarded to the spawned task commands
        #[arg(last = true)]
        pass_through: Vec<String>,
    },

    /// List tasks defined in the pipeline
    List,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let config_path = std::fs::canonicalize(&config_path)
        .with_context(|| format!("Could not find config file: {}", config_path.display()))?;

    let repo_root = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = Config::load(&config_path)
        .with_context(|| format!("Could not load {}", config_path.display()))?;

    match cli.command {
        Commands::Run {
            tasks,
            filters,
            parallel,
            concurrency,
            continue_on_error,
            log_prefix,
            output_mode,
            summarize,
            dry,
            no_cache,
            pass_through,
        } => {
            let opts = RunOptions {
                targets: tasks,
                filters,
                parallel,
                concurrency,
                continue_on_error,
                log_prefix: parse_log_prefix(&log_prefix)?,
                output_mode: output_mode
                    .as_deref()
                    .map(|s| s.parse().map_err(anyhow::Error::msg))
                    .transpose()?,
                summarize,
                dry: parse_dry_mode(dry.as_deref())?,
                cache_enabled: !no_cache,
                pass_through_args: pass_through,
            };

            let package_graph =
                PackageGraph::discover(&repo_root, &config.workspace.packages)?;
            package_graph.validate()?;

            let run = Run::new(repo_root, config, package_graph, opts);
            let rt = tokio::runtime::Runtime::new()?;
            let exit_code = rt.block_on(run.run())?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Commands::List => cmd_list(&config),
    }
}

fn parse_log_prefix(raw: &str) -> Result<LogPrefix> {
    match raw {
        "auto" => Ok(LogPrefix::Auto),
        "none" => Ok(LogPrefix::None),
        other => anyhow::bail!("invalid log prefix '{other}' (expected auto or none)"),
    }
}

fn parse_dry_mode(raw: Option<&str>) -> Result<DryRunMode> {
    match raw {
        None => Ok(DryRunMode::Off),
        Some("json") => Ok(DryRunMode::Json),
        Some("text") | Some("") => Ok(DryRunMode::Text),
        Some(other) => anyhow::bail!("invalid dry-run mode '{other}' (expected text or json)"),
    }
}

fn cmd_list(config: &Config) -> Result<()> {
    if config.pipeline.is_empty() {
        println!("  {}", "No tasks defined".dimmed());
        return Ok(());
    }

    println!("{}", "Pipeline:".bold());
    for key in config.task_keys() {
        let definition = &config.pipeline[key];
        println!("  {} {}", "•".green(), key.cyan());
        if !definition.depends_on.is_empty() {
            println!(
                "    {} {}",
                "dependsOn:".dimmed(),
                definition.depends_on.join(", ")
            );
        }
        if !definition.outputs.is_empty() {
            println!(
                "    {} {}",
                "outputs:".dimmed(),
                definition.outputs.join(", ")
            );
        }
        if !definition.env.is_empty() {
            println!("    {} {}", "env:".dimmed(), definition.env.join(", "));
        }
        if !definition.cache {
            println!("    {} {}", "cache:".dimmed(), "false".yellow());
        }
        if definition.persistent {
            println!("    {} {}", "persistent:".dimmed(), "true".yellow());
        }
    }

    Ok(())
}
