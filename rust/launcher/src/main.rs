//! smplfit launcher CLI
//!
//! Runs the SMPL silhouette-fitting train/test programs and optionally powers
//! the machine off afterwards.

use std::process::ExitCode;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use smplfit_config::{LaunchMode, ParamOverrides};
use smplfit_launcher::{
    config::{ConfigError, LauncherConfig, POWEROFF_TRIGGER},
    launch::Launcher,
    state::StateManager,
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "smplfit", about = "SMPL silhouette-fitting run launcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training program
    Train(LaunchArgs),
    /// Run the test program
    Test(LaunchArgs),
    /// Show recorded launches
    Status(LedgerArgs),
    /// Forget recorded launches
    Reset {
        #[command(flatten)]
        ledger: LedgerArgs,

        /// Launch keys to forget (e.g. train/debug)
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Args)]
struct LedgerArgs {
    /// Path to state file (defaults to `[launcher] state_file`)
    #[arg(short, long)]
    state: Option<String>,

    /// Path to launcher.toml (defaults to ./launcher.toml if present)
    #[arg(short, long)]
    config: Option<String>,
}

impl LedgerArgs {
    fn state_manager(&self) -> Result<StateManager, ConfigError> {
        let path = match &self.state {
            Some(state) => state.clone(),
            None => LauncherConfig::discover(self.config.as_deref())?.launcher.state_file,
        };
        Ok(StateManager::new(path))
    }
}

#[derive(Args)]
struct LaunchArgs {
    /// `poweroff` to shut the machine down after a successful run; any other
    /// value keeps it running
    after: String,

    /// Path to launcher.toml (defaults to ./launcher.toml if present)
    #[arg(short, long)]
    config: Option<String>,

    /// Python interpreter
    #[arg(long)]
    python: Option<String>,

    /// Print what would run without touching anything
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    overrides: ParamOverrides,
}

#[tokio::main]
async fn main() -> ExitCode {
    // tracing needs to be initialized with indicatif_layer to not clobber the spinner
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => launch(LaunchMode::Train, args).await,
        Commands::Test(args) => launch(LaunchMode::Test, args).await,
        Commands::Status(ledger) => match ledger.state_manager() {
            Ok(state_manager) => status(&state_manager),
            Err(e) => {
                eprintln!("ERROR: {e}");
                ExitCode::FAILURE
            }
        },
        Commands::Reset { ledger, keys } => {
            let state_manager = match ledger.state_manager() {
                Ok(state_manager) => state_manager,
                Err(e) => {
                    eprintln!("ERROR: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let mut code = ExitCode::SUCCESS;
            for key in &keys {
                match state_manager.reset_run(key) {
                    Ok(true) => println!("Reset: {key}"),
                    Ok(false) => println!("Not found: {key}"),
                    Err(e) => {
                        eprintln!("Error resetting {key}: {e}");
                        code = ExitCode::FAILURE;
                    }
                }
            }
            code
        }
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "smplfit", &mut std::io::stdout());
            ExitCode::SUCCESS
        }
    }
}

async fn launch(mode: LaunchMode, args: LaunchArgs) -> ExitCode {
    let mut config = match LauncherConfig::discover(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(python) = args.python {
        config.launcher.python = python;
        config.profile_mut(mode).python = None;
    }
    args.overrides.apply(&mut config.profile_mut(mode).params);

    let launcher = Launcher::new(config);

    if args.dry_run {
        return match launcher.plan(mode, &args.after) {
            Ok(plan) => {
                println!("=== Dry Run: {} ===", plan.key);
                println!("Create:  {}", plan.log_dir.display());
                println!("Remove:  {}", plan.tensorboard_dir.display());
                println!("Run:     {}", plan.command_line());
                println!("Log:     {}", plan.log_file.display());
                for (k, v) in &plan.env {
                    println!("Env:     {k}={v}");
                }
                if plan.poweroff.is_armed() {
                    for argv in plan.poweroff.commands() {
                        println!("Then:    {}", argv.join(" "));
                    }
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("ERROR: {e}");
                ExitCode::from(e.exit_code())
            }
        };
    }

    if args.after == POWEROFF_TRIGGER {
        println!("Poweroff after successful run: enabled");
    }

    match launcher.launch(mode, &args.after).await {
        Ok(outcome) => {
            println!();
            println!("=== {} complete ===", outcome.key);
            if let Some(checkpoint) = outcome.checkpoint {
                println!("Checkpoint: {}", checkpoint.display());
            }
            if outcome.poweroff_requests > 0 {
                println!("Issued {} shutdown request(s)", outcome.poweroff_requests);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn status(state_manager: &StateManager) -> ExitCode {
    let ledger = match state_manager.load() {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };

    if ledger.runs.is_empty() {
        println!("No launches in state file.");
        return ExitCode::SUCCESS;
    }

    println!("=== Launch Status ===");
    println!();

    for (key, run) in &ledger.runs {
        print!("{key}: {}", run.status);

        if let Some(pid) = run.pid {
            print!(" (PID: {pid})");
        }
        if let Some(code) = run.exit_code {
            print!(" [exit: {code}]");
        }
        print!(" [launches: {}]", run.launches);
        if let Some(ref finished) = run.finished_at {
            print!(" [finished: {finished}]");
        }
        println!();

        println!("  Log: {}", run.log_file);
        if let Some(ref checkpoint) = run.checkpoint {
            println!("  Checkpoint: {checkpoint}");
        }
        if let Some(last) = run.errors.last() {
            for line in last.lines() {
                println!("  Error: {line}");
            }
        }
    }

    ExitCode::SUCCESS
}
