//! clusterkit CLI: bootstrap, tear down and inspect a cluster.
//!
//! # Usage
//!
//! ```text
//! clusterkit up
//! clusterkit up --workers-only --hosts w4,w5
//! clusterkit reset --hosts w2
//! clusterkit check
//! clusterkit status
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::warn;

use clusterkit_core::engine::{ClusterReport, Orchestrator, RunMode, RunState};
use clusterkit_core::error::Result;
use clusterkit_core::inventory::{HostSelection, Inventory, Role};
use clusterkit_core::lock::RunLock;
use clusterkit_core::logging::init_tracing;
use clusterkit_core::recipe::{kubeadm, Phase, RecipeRegistry};
use clusterkit_core::transport::SshTransport;
use clusterkit_core::EngineConfig;

#[derive(Parser)]
#[command(name = "clusterkit", version, about = "Bootstrap a cluster over SSH")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Inventory file
    #[arg(short, long, global = true, default_value = "inventory.yaml")]
    inventory: PathBuf,
    /// Engine configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Recipe overrides, merged over the built-in kubeadm recipes
    #[arg(long, global = true)]
    recipes: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare hosts, initialize the master, join workers, wait for readiness
    Up {
        /// Join workers using the persisted credential; leave the master alone
        #[arg(long, conflicts_with = "master_only")]
        workers_only: bool,
        /// Prepare and initialize the master only
        #[arg(long)]
        master_only: bool,
        /// Comma-separated host names (default: all)
        #[arg(long)]
        hosts: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Tear down cluster state on the selected hosts
    Reset {
        /// Comma-separated host names (default: all)
        #[arg(long)]
        hosts: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate inventory, config and recipes without connecting
    Check,
    /// Query node status once from the master
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.global.verbose { "debug" } else { "info" };
    if let Err(e) = init_tracing(level) {
        eprintln!("clusterkit: cannot initialize logging: {}", e);
    }

    match execute(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("clusterkit: {}", e);
            ExitCode::from(1)
        }
    }
}

struct Loaded {
    inventory: Inventory,
    config: EngineConfig,
    registry: RecipeRegistry,
}

fn load(args: &GlobalArgs) -> Result<Loaded> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = state_dir_override() {
        config.state_dir = dir;
    }
    let inventory = Inventory::load(&args.inventory)?;
    let mut registry = kubeadm::registry();
    if let Some(path) = &args.recipes {
        registry.apply_file(path)?;
    }
    Ok(Loaded {
        inventory,
        config,
        registry,
    })
}

fn state_dir_override() -> Option<PathBuf> {
    std::env::var("CLUSTERKIT_STATE_DIR")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn orchestrator(loaded: Loaded) -> Result<Orchestrator> {
    let transport = SshTransport::new(loaded.config.connect_timeout())?;
    Ok(Orchestrator::new(
        loaded.inventory,
        loaded.registry,
        loaded.config,
        Arc::new(transport),
    ))
}

fn run_mode(workers_only: bool, master_only: bool) -> RunMode {
    match (workers_only, master_only) {
        (true, _) => RunMode::WorkersOnly,
        (_, true) => RunMode::MasterOnly,
        _ => RunMode::Full,
    }
}

fn exit_code(state: RunState) -> u8 {
    match state {
        RunState::Converged => 0,
        RunState::PartiallyFailed => 2,
        _ => 1,
    }
}

fn print_report(report: &ClusterReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn execute(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Up {
            workers_only,
            master_only,
            hosts,
            json,
        } => {
            let loaded = load(&cli.global)?;
            let _lock = RunLock::acquire(&loaded.config.state_dir)?;
            let reports_dir = loaded.config.reports_dir();
            let engine = orchestrator(loaded)?;

            let selection = HostSelection::parse(hosts.as_deref().unwrap_or(""));
            let report = engine.run(run_mode(*workers_only, *master_only), &selection);
            if let Err(e) = report.save(&reports_dir) {
                warn!(error = %e, "could not write report");
            }
            print_report(&report, *json)?;
            Ok(ExitCode::from(exit_code(report.state)))
        }
        Commands::Reset { hosts, json } => {
            let loaded = load(&cli.global)?;
            let _lock = RunLock::acquire(&loaded.config.state_dir)?;
            let reports_dir = loaded.config.reports_dir();
            let engine = orchestrator(loaded)?;

            let report = engine.reset(&HostSelection::parse(hosts.as_deref().unwrap_or("")))?;
            if let Err(e) = report.save(&reports_dir) {
                warn!(error = %e, "could not write report");
            }
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_text());
            }
            Ok(ExitCode::from(if report.all_succeeded() { 0 } else { 2 }))
        }
        Commands::Check => {
            let loaded = load(&cli.global)?;
            println!("{}", check_summary(&loaded));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let engine = orchestrator(load(&cli.global)?)?;
            let nodes = engine.status()?;
            let ready = nodes.iter().filter(|n| n.ready).count();
            for n in &nodes {
                println!("{:<24} {}", n.name, if n.ready { "Ready" } else { "NotReady" });
            }
            println!("{}/{} ready", ready, nodes.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn check_summary(loaded: &Loaded) -> String {
    let inv = &loaded.inventory;
    let mut out = format!(
        "inventory: {} host(s), master {}, {} worker(s)\n",
        inv.len(),
        inv.master().name,
        inv.workers().len()
    );
    for phase in [
        Phase::Preparation,
        Phase::MasterInit,
        Phase::WorkerJoin,
        Phase::Verification,
        Phase::Reset,
    ] {
        for role in [Role::Master, Role::Worker] {
            if let Some(spec) = loaded.registry.get(phase, role) {
                out.push_str(&format!("recipe {:<13} {:<7} {} step(s)\n", phase.as_str(), role, spec.steps.len()));
            }
        }
    }
    out.push_str(&format!(
        "state dir: {}\nmax concurrency: {}",
        loaded.config.state_dir.display(),
        loaded.config.max_concurrency
    ));
    out
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(RunState::Converged), 0);
        assert_eq!(exit_code(RunState::PartiallyFailed), 2);
        assert_eq!(exit_code(RunState::Failed), 1);
    }

    #[test]
    fn up_flags_select_mode() {
        assert_eq!(run_mode(false, false), RunMode::Full);
        assert_eq!(run_mode(true, false), RunMode::WorkersOnly);
        assert_eq!(run_mode(false, true), RunMode::MasterOnly);
        let parsed = Cli::try_parse_from(["clusterkit", "up", "--workers-only", "--master-only"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn global_args_after_subcommand() {
        let cli = Cli::try_parse_from(["clusterkit", "up", "--hosts", "w1,w2", "-i", "hosts.yaml", "-v"]).unwrap();
        assert_eq!(cli.global.inventory, PathBuf::from("hosts.yaml"));
        assert!(cli.global.verbose);
        match cli.command {
            Commands::Up { hosts, json, .. } => {
                assert_eq!(hosts.as_deref(), Some("w1,w2"));
                assert!(!json);
            }
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn state_dir_from_env() {
        std::env::set_var("CLUSTERKIT_STATE_DIR", "/tmp/clusterkit-test-state");
        assert_eq!(state_dir_override(), Some(PathBuf::from("/tmp/clusterkit-test-state")));
        std::env::remove_var("CLUSTERKIT_STATE_DIR");
        assert_eq!(state_dir_override(), None);
    }

    #[test]
    fn check_reports_inventory_and_recipes() {
        let dir = std::env::temp_dir().join(format!("clusterkit-cli-check-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let inv = dir.join("inventory.yaml");
        std::fs::write(
            &inv,
            "defaults: { user: root }\nhosts:\n  - { name: m1, address: 10.0.0.10, role: master }\n  - { name: w1, address: 10.0.0.11, role: worker }\n",
        )
        .unwrap();
        let args = GlobalArgs {
            inventory: inv,
            config: None,
            recipes: None,
            verbose: false,
        };
        let summary = check_summary(&load(&args).unwrap());
        assert!(summary.contains("2 host(s), master m1, 1 worker(s)"));
        assert!(summary.contains("master_init"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
