use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use rampkit_core::config::PackagerConfig;
use rampkit_core::files::FileLists;
use rampkit_core::metadata::MetadataPair;
use rampkit_core::package::{CancelToken, PackageEvent, PackageOutcome, Packager};
use rampkit_core::watch::sweep_orphaned_packages;
use std::collections::HashMap;
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rampkit")]
#[command(about = "Build uncompressed RAMP archive packages with a METS descriptor", version)]
struct Cli {
    /// Log more (-v for info, -vv for debug). RUST_LOG overrides this.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a package from session and contributor files
    Pack {
        #[command(flatten)]
        input: PackageArgs,

        /// Overwrite an existing package without asking
        #[arg(short = 'y', long)]
        yes: bool,

        /// Program to open the finished package with; the package is deleted
        /// once the program releases it
        #[arg(long, value_name = "PROGRAM")]
        open_with: Option<PathBuf>,
    },
    /// Show which files would be packaged
    Summary {
        #[command(flatten)]
        input: PackageArgs,
    },
    /// Delete packages left behind by earlier runs
    Sweep {
        /// Directory holding packages
        #[arg(long, env = "RAMPKIT_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct PackageArgs {
    /// Title of the session
    #[arg(long, required = true)]
    title: String,

    /// Identifier of the session, used as the package file name
    #[arg(long, required = true)]
    id: String,

    /// A session file (repeatable)
    #[arg(short, long = "session", value_name = "FILE")]
    sessions: Vec<PathBuf>,

    /// A contributor file as NAME=FILE (repeatable)
    #[arg(short, long = "contributor", value_name = "NAME=FILE", value_parser = parse_contributor)]
    contributors: Vec<(String, PathBuf)>,

    /// Description for a file as FILE_NAME=TEXT (repeatable)
    #[arg(short, long = "description", value_name = "FILE_NAME=TEXT", value_parser = parse_key_value)]
    descriptions: Vec<(String, String)>,

    /// Extra descriptor field as KEY=VALUE (repeatable)
    #[arg(short, long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    meta: Vec<(String, String)>,

    /// Directory the package is written to
    #[arg(long, env = "RAMPKIT_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Directory under which files are staged
    #[arg(long, env = "RAMPKIT_STAGING_DIR")]
    staging_dir: Option<PathBuf>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("missing key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_contributor(s: &str) -> Result<(String, PathBuf), String> {
    let (name, file) = parse_key_value(s)?;
    if file.is_empty() {
        return Err(format!("missing file in '{s}'"));
    }
    Ok((name, PathBuf::from(file)))
}

impl PackageArgs {
    fn config(&self) -> PackagerConfig {
        let mut config = PackagerConfig::default();
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(dir) = &self.staging_dir {
            config.staging_root = dir.clone();
        }
        config
    }

    fn file_lists(&self) -> FileLists {
        let mut files = FileLists::new();
        files.extend("", self.sessions.iter().cloned());
        for (name, file) in &self.contributors {
            files.add(name.clone(), file.clone());
        }
        files
    }

    fn packager(&self) -> Result<Packager> {
        let descriptions: HashMap<String, String> = self.descriptions.iter().cloned().collect();
        let pairs: Vec<MetadataPair> = self
            .meta
            .iter()
            .map(|(key, value)| MetadataPair::new(key.clone(), value.clone()))
            .collect();

        let packager = Packager::builder(self.title.clone(), self.id.clone())
            .config(self.config())
            .file_description(move |group, file| {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match descriptions.get(&name) {
                    Some(text) => text.clone(),
                    None if group.is_empty() => "Session file".to_string(),
                    None => format!("Contributor file ({group})"),
                }
            })
            .metadata_pairs(move || pairs.clone())
            .build()?;
        Ok(packager)
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn print_summary(files: &FileLists, title: &str) {
    for line in files.summary(title).lines() {
        if let Some(warning) = line.strip_prefix("Warning: ") {
            println!("{} {}", style("WARNING:").yellow().bold(), warning);
        } else {
            println!("{line}");
        }
    }
}

/// Opens the package with `program` and waits until the program lets go of it.
fn hand_off(packager: &Packager, package: &Path, program: &Path, cancel: &CancelToken) -> Result<()> {
    if !package.exists() {
        return Err(anyhow!(
            "The package {} was removed before it could be opened.",
            package.display()
        ));
    }

    Command::new(program).arg(package).spawn().map_err(|e| {
        anyhow!(
            "There was an error attempting to open the package with {}: {e}",
            program.display()
        )
    })?;
    packager.watch_package(package, cancel)?;

    println!(
        "Waiting for {} to release the package...",
        style(program.display()).cyan()
    );
    if !packager.wait_for_watch() && cancel.is_cancelled() {
        println!("Stopped waiting; the package was left at {}.", package.display());
    }
    Ok(())
}

fn pack(input: &PackageArgs, yes: bool, open_with: Option<&Path>, cancel: CancelToken) -> Result<()> {
    let files = input.file_lists();
    let packager = input.packager()?;

    print_summary(&files, &input.title);
    println!();

    let package_path = packager.package_path();
    if package_path.exists() && !yes {
        if !stdout().is_terminal() {
            return Err(anyhow!(
                "{} already exists; pass --yes to overwrite it.",
                package_path.display()
            ));
        }
        if !confirm_operation(&format!("{} already exists. Overwrite it?", package_path.display()))? {
            println!("Packaging cancelled.");
            return Ok(());
        }
    }

    let pb = ProgressBar::new(files.total_units());
    pb.set_prefix("Packaging");
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {pos}/{len} {msg}")?
            .progress_chars("■ "),
    );

    let outcome = packager.create_package(files, cancel.clone(), |event| match event {
        PackageEvent::State(state) => debug!(%state, "job state"),
        PackageEvent::Status(message) => pb.println(style(message).green().to_string()),
        PackageEvent::Progress {
            message, completed, ..
        } => {
            pb.set_position(*completed);
            pb.set_message(message.clone());
        }
        PackageEvent::Error { error, message } => pb.println(format!(
            "{} {}\n    {}",
            style("ERROR:").red().bold(),
            message,
            error
        )),
        PackageEvent::Finished(_) => {}
    })?;

    match outcome {
        PackageOutcome::Completed { package, descriptor } => {
            pb.finish_with_message("Package complete.");
            println!(
                "\n✨ Ready to hand the package to RAMP: {} ({} files).",
                style(package.display()).cyan(),
                descriptor.files.len()
            );
            if let Some(program) = open_with {
                hand_off(&packager, &package, program, &cancel)?;
            }
            Ok(())
        }
        PackageOutcome::Cancelled => {
            pb.abandon_with_message("Cancelled.");
            println!("Packaging cancelled.");
            Ok(())
        }
        PackageOutcome::Failed => {
            pb.abandon_with_message("❌ Packaging failed.");
            Err(anyhow!("Packaging failed for session '{}'.", input.title))
        }
    }
}

fn main() -> Result<()> {
    // This flag allows for graceful cancellation of the packaging job.
    let cancel = CancelToken::new();
    let c = cancel.clone();

    // Set up the Ctrl+C handler to cancel the job at the next file boundary.
    ctrlc::set_handler(move || {
        c.cancel();
    })?;

    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Pack {
            input,
            yes,
            open_with,
        } => pack(&input, yes, open_with.as_deref(), cancel)?,
        Commands::Summary { input } => {
            print_summary(&input.file_lists(), &input.title);
        }
        Commands::Sweep { output_dir } => {
            let config = PackagerConfig::default();
            let dir = output_dir.unwrap_or(config.output_dir);
            let removed = sweep_orphaned_packages(&dir, &config.package_extension, &config.retry)?;
            if removed.is_empty() {
                println!("No orphaned packages found in {}.", dir.display());
                return Ok(());
            }

            println!("Removed {} orphaned packages:", removed.len());
            for path in removed {
                println!("  {}", style(path.display()).cyan());
            }
        }
    }

    Ok(())
}
