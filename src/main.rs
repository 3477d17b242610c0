//! # zxscript: The Main Entry Point
//!
//! This module handles Command Line Interface (CLI) parsing, logging initialization,
//! and dispatching commands to the appropriate sub-modules.
//!
//! `zxscript hello.cs arg1 arg2` runs a script directly. Settings are edited with
//! `zxscript settings ...` and always target an explicit directory (`--dir`).

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

mod cache;
mod discovery;
mod error;
mod invariant_ppt;
mod paths;
mod project;
mod resolver;
mod runner;
mod settings;
mod toolchain;

use error::{ZxError, exit_code_for};
use project::ProjectOptions;
use runner::{InlineScript, ScriptRunner, Workspace};
use settings::{AddOutcome, SettingsRecord};
use toolchain::DotnetToolchain;

/// The primary Command Line Interface (CLI) configuration.
#[derive(Parser)]
#[command(name = "zxscript")]
#[command(about = "Run a C# file as a script, with references inherited from parent directories", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Script to run when no sub-command is given, followed by its arguments.
    ///
    /// Everything after the script belongs to the script, even `-v`; zxscript
    /// options have to come first.
    #[arg(value_name = "SCRIPT [ARGS]", trailing_var_arg = true, allow_hyphen_values = true, num_args = 1..)]
    command_line: Vec<String>,

    #[command(flatten)]
    project: ProjectArgs,

    /// Directory holding the generated build projects.
    #[arg(long, env = "ZXSCRIPT_WORK_DIR", global = true)]
    work_dir: Option<PathBuf>,

    /// Turn on verbose logging.
    ///
    /// - `-v`: Info
    /// - `-vv`: Debug
    /// - `-vvv`: Trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// Options baked into the generated project.
#[derive(Args, Debug, Clone)]
struct ProjectArgs {
    /// Target framework of the generated project.
    #[arg(short = 'f', long = "framework", default_value = "net8.0", global = true)]
    target_framework: String,

    /// ProcessX package version referenced by every script.
    #[arg(long, default_value = "1.5.3", global = true)]
    processx_version: String,
}

impl From<&ProjectArgs> for ProjectOptions {
    fn from(args: &ProjectArgs) -> Self {
        ProjectOptions {
            target_framework: args.target_framework.clone(),
            processx_version: args.processx_version.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build the script if it changed, then run it.
    #[command(visible_alias = "r")]
    Run {
        /// Wait for Enter when the script exits with a non-zero code.
        #[arg(long)]
        stop_on_error: bool,

        /// The script, then the arguments forwarded to it untouched.
        #[arg(
            value_name = "SCRIPT [ARGS]",
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            num_args = 1..
        )]
        command_line: Vec<String>,
    },
    /// Create the script from a template if missing and generate its project.
    #[command(visible_alias = "e")]
    Edit { script: PathBuf },
    /// Run a snippet of code, e.g. `zxscript inline 'log(1234);'`.
    #[command(visible_alias = "inl")]
    Inline {
        /// The code, then the arguments forwarded to it untouched.
        #[arg(
            value_name = "CODE [ARGS]",
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            num_args = 1..
        )]
        command_line: Vec<String>,
    },
    /// Delete every generated project and build output.
    #[command(visible_alias = "rc")]
    ResetCache,
    /// Inspect or edit ZxScriptSettings.json files.
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
    /// Check every settings file below a directory for broken references.
    Doctor {
        #[arg(default_value = ".")]
        dir: PathBuf,

        #[arg(long, default_value_t = 8)]
        max_depth: usize,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Show every settings file that applies to a directory, outermost first.
    #[command(visible_alias = "sl")]
    List {
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Add a package, or change its version. Without `--version` the latest is used.
    #[command(visible_alias = "sapa")]
    AddPackage {
        name: String,
        #[arg(long, default_value = "")]
        version: String,
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    #[command(visible_alias = "srpa")]
    RemovePackage {
        name: String,
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Reference a project; the path is relative to `--dir`.
    #[command(visible_alias = "sapr")]
    AddProject {
        path: String,
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    #[command(visible_alias = "srpr")]
    RemoveProject {
        path: String,
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Compile an extra source file with every script; relative to `--dir`.
    #[command(visible_alias = "saf")]
    AddFile {
        path: String,
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    #[command(visible_alias = "srf")]
    RemoveFile {
        path: String,
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Script output owns stdout, so diagnostics go to stderr and stay quiet by default.
    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = TermLogger::init(log_level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto);

    let workspace = Workspace::new(cli.work_dir.clone().unwrap_or_else(Workspace::default_root));
    let options = ProjectOptions::from(&cli.project);

    let result = match cli.command {
        Some(Commands::Run { stop_on_error, command_line }) => match split_command_line(command_line) {
            Some((script, args)) => {
                run_script(Path::new(&script), &args, &workspace, &options, stop_on_error).await
            }
            None => Ok(0),
        },
        Some(Commands::Edit { script }) => edit_script(&script, &workspace, &options),
        Some(Commands::Inline { command_line }) => match split_command_line(command_line) {
            Some((code, args)) => run_inline(&code, &args, &workspace, &options).await,
            None => Ok(0),
        },
        Some(Commands::ResetCache) => {
            info!("Resetting work directory {:?}", workspace.root());
            workspace.reset().map(|_| 0).map_err(anyhow::Error::from)
        }
        Some(Commands::Settings { action }) => settings_command(action),
        Some(Commands::Doctor { dir, max_depth }) => {
            discovery::doctor(&dir, max_depth).map(|unhealthy| if unhealthy == 0 { 0 } else { 1 })
        }
        None => match split_command_line(cli.command_line) {
            Some((script, args)) => run_script(Path::new(&script), &args, &workspace, &options, false).await,
            None => {
                use clap::CommandFactory;
                let _ = Cli::command().print_help();
                Ok(0)
            }
        },
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if matches!(e.downcast_ref::<ZxError>(), Some(ZxError::Cancelled)) {
                warn!("Cancelled");
            } else {
                error!("{:#}", e);
            }
            std::process::exit(exit_code_for(&e));
        }
    }
}

/// Splits `SCRIPT [ARGS]` into the script (or inline code) and its arguments.
fn split_command_line(mut command_line: Vec<String>) -> Option<(String, Vec<String>)> {
    if command_line.is_empty() {
        return None;
    }
    let first = command_line.remove(0);
    Some((first, command_line))
}

async fn run_script(
    script: &Path,
    args: &[String],
    workspace: &Workspace,
    options: &ProjectOptions,
    stop_on_error: bool,
) -> Result<i32> {
    let runner = ScriptRunner::new(script, workspace)?;
    info!("Running {:?}", runner.script());
    runner.prepare(options)?;

    let cancel = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Ctrl+C");
        } else {
            // No signal handler available: never cancel.
            std::future::pending::<()>().await;
        }
    };
    let code = runner.run(&DotnetToolchain::default(), args, cancel).await?;

    if code != 0 && stop_on_error {
        println!();
        println!("ExitCode {}", code);
        println!("Press Enter to continue...");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    }
    Ok(code)
}

fn edit_script(script: &Path, workspace: &Workspace, options: &ProjectOptions) -> Result<i32> {
    runner::create_from_template(script)?;
    let runner = ScriptRunner::new(script, workspace)?;
    runner.prepare(options)?;

    let build_cache = runner.cache();
    if cache::needs_rebuild(runner.script(), build_cache.snapshot_path())? {
        info!("{:?} will be rebuilt on the next run", runner.script());
    }
    println!("{}", project::project_file(runner.project_dir()).display());
    Ok(0)
}

async fn run_inline(code: &str, args: &[String], workspace: &Workspace, options: &ProjectOptions) -> Result<i32> {
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let inline = InlineScript::create(&cwd, code)?;
    run_script(inline.path(), args, workspace, options, false).await
}

fn settings_command(action: SettingsCommand) -> Result<i32> {
    match action {
        SettingsCommand::List { dir } => {
            ensure_dir(&dir)?;
            match resolver::resolve_chain(&dir)? {
                Some(chain) => chain.write_listing(&mut std::io::stdout().lock())?,
                None => println!("No settings files apply to {}", dir.display()),
            }
            Ok(0)
        }
        SettingsCommand::AddPackage { name, version, dir } => {
            edit_settings(&dir, |record| record.try_add_package_ref(&name, &version, &DotnetToolchain::default()))
        }
        SettingsCommand::RemovePackage { name, dir } => {
            edit_settings(&dir, |record| {
                record.remove_package_ref(&name);
                Ok(())
            })
        }
        SettingsCommand::AddProject { path, dir } => {
            edit_settings(&dir, |record| report_add(record.add_project_ref(&dir, &path)?, &path))
        }
        SettingsCommand::RemoveProject { path, dir } => {
            edit_settings(&dir, |record| {
                record.remove_project_ref(&dir, &path);
                Ok(())
            })
        }
        SettingsCommand::AddFile { path, dir } => {
            edit_settings(&dir, |record| report_add(record.add_file_ref(&dir, &path)?, &path))
        }
        SettingsCommand::RemoveFile { path, dir } => {
            edit_settings(&dir, |record| {
                record.remove_file_ref(&dir, &path);
                Ok(())
            })
        }
    }
}

/// Load, mutate and save the settings of `dir`. Nothing is saved if `edit` fails.
fn edit_settings<F>(dir: &Path, edit: F) -> Result<i32>
where
    F: FnOnce(&mut SettingsRecord) -> Result<(), ZxError>,
{
    ensure_dir(dir)?;
    let mut record = SettingsRecord::load(dir)?;
    edit(&mut record)?;
    record.save(dir)?;
    Ok(0)
}

fn report_add(outcome: AddOutcome, path: &str) -> Result<(), ZxError> {
    if outcome == AddOutcome::AlreadyPresent {
        warn!("{} is already referenced", path);
    } else {
        info!("Added {}", path);
    }
    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<(), ZxError> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(ZxError::NotFound { what: "settings directory", path: dir.to_path_buf() })
    }
}
