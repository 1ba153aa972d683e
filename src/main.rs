use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use reconpipe::catalog::{TargetList, ToolCatalog};
use reconpipe::config::Config;
use reconpipe::task::{Stage, TaskId, TaskResult};
use reconpipe::{rlog, Engine, Result, TaskError};

/// reconpipe - run recon and scanning tools against target domains
#[derive(Parser, Debug)]
#[command(name = "reconpipe")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RECONPIPE_DEBUG=1     Enable debug logging (alternative to --debug)\n    RECONPIPE_LOG=LEVEL   Log level: error, warn, info, debug, trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.reconpipe/reconpipe.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Tool catalog (defaults to ./config.json)
    #[arg(short = 'c', long)]
    pub catalog: Option<PathBuf>,

    /// Target domain list (defaults to ./target_domains.json)
    #[arg(short = 't', long)]
    pub targets: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Operator inputs shared by `run` and `pipe`.
#[derive(clap::Args, Debug, Clone, PartialEq)]
pub struct TargetArgs {
    /// Comma-separated target domains
    #[arg(short = 'D', long)]
    pub domains: Option<String>,

    /// Use every domain from the target list
    #[arg(long, conflicts_with = "domains")]
    pub all_targets: bool,

    /// Output directory; must exist. Tools run with it as working directory
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List catalog tools and known targets
    List,

    /// Write the current settings, with defaults filled in, to ~/.reconpipe/reconpipe.toml
    Init {
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },

    /// Run one tool and stream its output
    Run {
        /// Tool label, e.g. "[recon] subfinder"
        tool: String,

        #[command(flatten)]
        target: TargetArgs,

        /// Extra arguments passed to the tool after the domains
        #[arg(short = 'a', long, default_value = "", allow_hyphen_values = true)]
        args: String,
    },

    /// Run a tool, then feed the hosts it prints into a second tool
    Pipe {
        /// First tool label
        first: String,

        /// Second tool label
        second: String,

        #[command(flatten)]
        target: TargetArgs,

        /// Extra arguments for the first tool
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        first_args: String,

        /// Extra arguments for the second tool
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        second_args: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    reconpipe::log::init(cli.debug);

    match run_cli(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli(cli: Cli) -> Result<ExitCode> {
    let config = Config::load()?;
    let Cli {
        catalog,
        targets,
        command,
        ..
    } = cli;
    let catalog_path = catalog.unwrap_or_else(|| config.catalog_path());
    let targets_path = targets.unwrap_or_else(|| config.targets_path());

    match command {
        Command::Init { force } => init_config(&config, force),
        Command::List => {
            let (engine, targets) = load_engine(&config, &catalog_path, &targets_path)?;
            list(&engine, &targets);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { tool, target, args } => {
            let (engine, targets) = load_engine(&config, &catalog_path, &targets_path)?;
            let domains = resolve_domains(&engine, &targets, &target)?;
            let task = engine.build_task(&tool, &domains, &args, &target.output_dir)?;
            run_async(move |cancel| async move { Ok(engine.run(task, cancel)) })
        }
        Command::Pipe {
            first,
            second,
            target,
            first_args,
            second_args,
        } => {
            let (engine, targets) = load_engine(&config, &catalog_path, &targets_path)?;
            let domains = resolve_domains(&engine, &targets, &target)?;
            let next = engine.build_task(&second, &domains, &second_args, &target.output_dir)?;
            let task = engine
                .build_task(&first, &domains, &first_args, &target.output_dir)?
                .with_pipe_target(next);
            run_async(move |cancel| async move { engine.run_piped(task, cancel) })
        }
    }
}

fn load_engine(
    config: &Config,
    catalog_path: &Path,
    targets_path: &Path,
) -> Result<(Engine, TargetList)> {
    let catalog = ToolCatalog::load(catalog_path)?;
    let targets = if targets_path.exists() {
        TargetList::load(targets_path)?
    } else {
        TargetList::default()
    };
    rlog!(
        "reconpipe starting: catalog={} targets={}",
        catalog_path.display(),
        targets_path.display()
    );
    Ok((Engine::new(catalog, config.engine()), targets))
}

fn init_config(config: &Config, force: bool) -> Result<ExitCode> {
    let path = Config::config_path()?;
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        return Ok(ExitCode::FAILURE);
    }
    let path = config.with_defaults().save()?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn list(engine: &Engine, targets: &TargetList) {
    println!("Tools:");
    for label in engine.catalog().labels() {
        println!("  {}", label);
    }
    if !targets.domains.is_empty() {
        println!();
        println!("Targets:");
        for domain in &targets.domains {
            println!("  {}", domain);
        }
    }
}

/// Explicit domains, else the whole target list, else the catalog default.
fn resolve_domains(engine: &Engine, targets: &TargetList, args: &TargetArgs) -> Result<String> {
    if let Some(domains) = &args.domains {
        return Ok(domains.clone());
    }
    if args.all_targets {
        return Ok(targets.joined());
    }
    Ok(engine
        .catalog()
        .default_target()
        .map(str::to_string)
        .unwrap_or_default())
}

/// Start the run on a fresh runtime, wire Ctrl-C to cancellation and print
/// results until the channel closes.
fn run_async<F, Fut>(start: F) -> Result<ExitCode>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Result<mpsc::Receiver<TaskResult>>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                rlog!("Ctrl-C received, canceling");
                on_signal.cancel();
            }
        });

        let rx = start(cancel).await?;
        print_results(rx).await
    })
}

async fn print_results(mut rx: mpsc::Receiver<TaskResult>) -> Result<ExitCode> {
    let mut printed: HashMap<TaskId, usize> = HashMap::new();
    let mut worst: Option<TaskError> = None;
    let mut stdout = io::stdout();

    while let Some(result) = rx.recv().await {
        let seen = printed.entry(result.task_id).or_insert_with(|| {
            let _ = writeln!(stdout, "==> {} [{}]", banner(&result), result.category);
            0
        });
        if result.output.len() > *seen {
            stdout.write_all(&result.output[*seen..])?;
            stdout.flush()?;
            *seen = result.output.len();
        }

        if result.is_final {
            match &result.error {
                None => writeln!(stdout, "==> {} finished", result.task_name)?,
                Some(e) => {
                    writeln!(stdout, "==> {} {}", result.task_name, e)?;
                    // A real failure outranks a cancellation.
                    let replace = match &worst {
                        None => true,
                        Some(w) => w.is_cancellation(),
                    };
                    if replace {
                        worst = Some(e.clone());
                    }
                }
            }
        }
    }

    Ok(match worst {
        None => ExitCode::SUCCESS,
        Some(TaskError::Canceled) => ExitCode::from(130),
        Some(_) => ExitCode::FAILURE,
    })
}

fn banner(result: &TaskResult) -> String {
    match result.stage {
        Stage::Single => result.task_name.clone(),
        Stage::First => format!("{} (stage 1)", result.task_name),
        Stage::Second => format!("{} (stage 2)", result.task_name),
    }
}
