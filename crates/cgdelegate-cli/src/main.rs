use anyhow::{anyhow, Context, Result};
use byte_unit::{Byte, UnitType};
use cgdelegate_cli::config::DEFAULT_CONFIG_PATH;
use cgdelegate_cli::{Config, ContainerState, StateStore};
use cgdelegate_core::{CgroupManager, FreezerState, Stats, VERSION};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Limits at or above this are the kernel's "no limit"
const UNLIMITED_BYTES: u64 = 1 << 62;

/// cgdelegate - systemd-delegated cgroup v1 manager
///
/// Creates, updates and removes the cgroups of one container through a
/// transient systemd unit
#[derive(Parser, Debug)]
#[command(name = "cgdelegate")]
#[command(version = VERSION)]
#[command(about = "Manage container cgroups delegated by systemd", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Container name (overrides container.cgroup.name)
    #[arg(short, long)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the container's unit and cgroups, optionally moving a process in
    Apply {
        /// Process to place in the cgroups
        #[arg(short, long)]
        pid: Option<u32>,
    },

    /// Push the configured limits to a running container
    Set,

    /// Freeze every process of the container
    Freeze,

    /// Thaw the container
    Thaw,

    /// Show the freezer state
    State,

    /// Show resource usage
    Stats {
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// List processes in the container
    Pids {
        /// Include processes in nested cgroups
        #[arg(short, long)]
        all: bool,
    },

    /// Show the cgroup directory of every controller
    Paths,

    /// Stop the unit and remove the cgroups
    Destroy,

    /// Create the nested cgroup for the container's init
    ChildCreate,

    /// Move a process into the nested cgroup
    ChildApply {
        #[arg(short, long)]
        pid: u32,
    },

    /// Show the nested cgroup directories
    ChildPaths,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    if let Some(name) = cli.name {
        config.container.cgroup.name = name;
    }

    let _guard = init_logging(&config)?;

    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

    let store = StateStore::new(&config.state.dir);

    match cli.command {
        Commands::Apply { pid } => apply(&config, &store, pid)?,
        Commands::Set => {
            open(&config, &store)?.set(&config.container.cgroup)?;
            println!("{}", "Limits updated".green());
        }
        Commands::Freeze => {
            open(&config, &store)?.freeze(FreezerState::Frozen)?;
            println!("{}", "Container frozen".cyan());
        }
        Commands::Thaw => {
            open(&config, &store)?.freeze(FreezerState::Thawed)?;
            println!("{}", "Container thawed".green());
        }
        Commands::State => {
            let state = open(&config, &store)?.get_freezer_state()?;
            let shown = match state {
                FreezerState::Frozen => state.to_string().cyan(),
                FreezerState::Thawed => state.to_string().green(),
                FreezerState::Undefined => state.to_string().yellow(),
            };
            println!("{}", shown);
        }
        Commands::Stats { json } => {
            let stats = open(&config, &store)?.get_stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&config.container.cgroup.name, &stats);
            }
        }
        Commands::Pids { all } => {
            let manager = open(&config, &store)?;
            let pids = if all {
                manager.get_all_pids()?
            } else {
                manager.get_pids()?
            };
            for pid in pids {
                println!("{}", pid);
            }
        }
        Commands::Paths => {
            let manager = open(&config, &store)?;
            println!(
                "{} {}",
                "===".green().bold(),
                format!("{} ({})", config.container.cgroup.unit_name(), manager.get_type())
                    .green()
                    .bold()
            );
            print_paths(manager.get_paths());
        }
        Commands::Destroy => destroy(&config, &store)?,
        Commands::ChildCreate => {
            let manager = open(&config, &store)?;
            manager.create_child_cgroup(&config.container)?;
            println!("{}", "Child cgroup created".green());
            print_paths(manager.get_child_cgroup_paths());
        }
        Commands::ChildApply { pid } => {
            open(&config, &store)?.apply_child_cgroup(pid)?;
            println!("{}", format!("Process {} moved to child cgroup", pid).green());
        }
        Commands::ChildPaths => {
            print_paths(open(&config, &store)?.get_child_cgroup_paths());
        }
    }

    Ok(())
}

/// Create the container's cgroups and remember where they are
fn apply(config: &Config, store: &StateStore, pid: Option<u32>) -> Result<()> {
    let cgroup = &config.container.cgroup;
    let manager = CgroupManager::new(cgroup.clone());

    if let Err(e) = manager.apply(pid) {
        // A unit may already be running; don't leave it behind
        if !cgroup.is_join_mode() {
            if let Err(cleanup) = manager.destroy() {
                warn!("Cleanup after failed apply also failed: {}", cleanup);
            }
        }
        return Err(e).with_context(|| format!("Failed to apply cgroups of {}", cgroup.name));
    }

    let state = ContainerState {
        unit: cgroup.unit_name(),
        paths: manager.get_paths(),
    };
    store.save(&cgroup.name, &state)?;

    info!(
        "Applied {} with {} controllers",
        state.unit,
        state.paths.len()
    );
    println!("{}", format!("Applied {}", state.unit).green().bold());
    Ok(())
}

/// Stop the unit, remove the cgroups and forget the container
fn destroy(config: &Config, store: &StateStore) -> Result<()> {
    let cgroup = &config.container.cgroup;
    let manager = match store.load(&cgroup.name)? {
        Some(state) => CgroupManager::with_paths(cgroup.clone(), state.paths),
        None => {
            warn!(
                "No state for {}, stopping the unit without removing directories",
                cgroup.name
            );
            CgroupManager::new(cgroup.clone())
        }
    };

    manager
        .destroy()
        .with_context(|| format!("Failed to destroy cgroups of {}", cgroup.name))?;
    store.remove(&cgroup.name)?;

    println!("{}", format!("Destroyed {}", cgroup.unit_name()).green());
    Ok(())
}

/// Manager for a container applied by an earlier invocation
fn open(config: &Config, store: &StateStore) -> Result<CgroupManager> {
    let cgroup = &config.container.cgroup;
    let state = store
        .load(&cgroup.name)?
        .ok_or_else(|| anyhow!("Container {} has not been applied", cgroup.name))?;

    Ok(CgroupManager::with_paths(cgroup.clone(), state.paths))
}

fn print_paths(paths: std::collections::HashMap<String, PathBuf>) {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    if paths.is_empty() {
        println!("{}", "No cgroup paths".yellow());
    }
    for (name, path) in paths {
        println!("  {:<14} {}", name.cyan(), path.display());
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= UNLIMITED_BYTES {
        return "unlimited".to_string();
    }
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{:.2}", adjusted)
}

fn format_nanos(nanos: u64) -> String {
    format!("{:.3}s", nanos as f64 / 1_000_000_000.0)
}

fn print_stats(name: &str, stats: &Stats) {
    println!("{}", format!("=== {} ===", name).green().bold());

    let memory = &stats.memory;
    println!("\n{}", "Memory:".cyan());
    println!("  Usage:     {}", format_bytes(memory.usage.usage));
    println!("  Max usage: {}", format_bytes(memory.usage.max_usage));
    println!("  Limit:     {}", format_bytes(memory.usage.limit));
    println!("  Cache:     {}", format_bytes(memory.cache));
    if memory.usage.failcnt > 0 {
        println!(
            "  {}",
            format!("Limit hit {} times", memory.usage.failcnt).red()
        );
    }

    let cpu = &stats.cpu;
    println!("\n{}", "CPU:".cyan());
    println!("  Total:  {}", format_nanos(cpu.usage.total_usage));
    println!("  User:   {}", format_nanos(cpu.usage.usage_in_usermode));
    println!("  System: {}", format_nanos(cpu.usage.usage_in_kernelmode));
    if cpu.throttling.throttled_periods > 0 {
        println!(
            "  {}",
            format!(
                "Throttled in {} of {} periods ({:.1}%)",
                cpu.throttling.throttled_periods,
                cpu.throttling.periods,
                cpu.throttling.throttle_percentage()
            )
            .yellow()
        );
    }

    println!("\n{}", "Pids:".cyan());
    let limit = if stats.pids.limit == 0 {
        "unlimited".to_string()
    } else {
        stats.pids.limit.to_string()
    };
    println!("  {} (limit: {})", stats.pids.current, limit);

    if !stats.cpuset.cpus.is_empty() {
        println!("\n{}", "Cpuset:".cyan());
        println!("  CPUs: {:?}", stats.cpuset.cpus);
        println!("  Mems: {:?}", stats.cpuset.mems);
    }

    let mut hugetlb: Vec<_> = stats.hugetlb.iter().collect();
    hugetlb.sort_by(|a, b| a.0.cmp(b.0));
    for (pagesize, usage) in hugetlb {
        println!(
            "\n{} {}",
            format!("Hugetlb {}:", pagesize).cyan(),
            format_bytes(usage.usage)
        );
    }

    println!();
}

/// Initialize logging to stderr and, if configured, a daily rotated file
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .map_err(|e| anyhow!("Invalid log level {:?}: {}", config.logging.level, e))?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let Some(log_dir) = &config.logging.log_dir else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, &config.logging.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .with(filter)
        .init();

    Ok(Some(guard))
}
