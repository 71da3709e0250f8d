//! appdrop - declarative application installer
//!
//! Usage:
//!   appdrop install <descriptor>    Fetch, verify and install an application
//!   appdrop uninstall <identifier>  Remove an installed application
//!   appdrop list                    List installed applications
//!   appdrop info <identifier>       Show what an install placed where
//!   appdrop check <descriptor>      Validate a descriptor without side effects
//!   appdrop fetch <descriptor>      Download and verify without installing
//!   appdrop config                  Print a template config.toml

use anyhow::{Context, Result};
use appdrop::config::{generate_template, AppdropConfig, InstallContext, Overrides};
use appdrop::fetcher::HttpFetcher;
use appdrop::installer::{InstallEvent, InstallOptions, InstallStatus, Installer};
use appdrop::{FetchError, InstallError, PackageDescriptor};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable holding a tracing filter (e.g. `appdrop=debug`)
const LOG_ENV: &str = "APPDROP_LOG";

#[derive(Parser)]
#[command(name = "appdrop")]
#[command(version)]
#[command(about = "Install applications from declarative package descriptors")]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Path to config.toml (default: the user config directory)
    #[arg(long, global = true, value_name = "FILE", env = "APPDROP_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding install receipts
    #[arg(long, global = true, value_name = "DIR", env = "APPDROP_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install an application from a descriptor file
    Install {
        /// Path to the descriptor (.toml)
        descriptor: PathBuf,

        /// Directory to place application bundles in
        #[arg(long, value_name = "DIR")]
        target: Option<PathBuf>,

        /// Reinstall even if this version is already installed
        #[arg(long)]
        reinstall: bool,

        /// Trust descriptors that disable integrity verification
        #[arg(long)]
        allow_unverified: bool,

        /// Seconds before the download is abandoned
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Remove an installed application
    Uninstall {
        /// Identifier of the installed package (e.g., comet)
        identifier: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List installed applications
    List,

    /// Show details of an installed application
    Info {
        /// Identifier of the installed package
        identifier: String,
    },

    /// Validate a descriptor without fetching anything
    Check {
        /// Path to the descriptor (.toml)
        descriptor: PathBuf,

        /// Print the normalized descriptor
        #[arg(long)]
        print: bool,
    },

    /// Download and verify an archive without installing it
    Fetch {
        /// Path to the descriptor (.toml)
        descriptor: PathBuf,

        /// Trust descriptors that disable integrity verification
        #[arg(long)]
        allow_unverified: bool,

        /// Seconds before the download is abandoned
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Print a template config.toml
    Config,
}

// Console helper for output control
struct Console {
    quiet: bool,
    verbose: bool,
}

impl Console {
    fn new(quiet: bool, verbose: bool) -> Self {
        Self { quiet, verbose }
    }

    fn log(&self, msg: impl std::fmt::Display) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    fn verbose(&self, msg: impl std::fmt::Display) {
        if self.verbose && !self.quiet {
            println!("  {}", msg);
        }
    }

    fn success(&self, msg: impl std::fmt::Display) {
        if !self.quiet {
            println!("✅ {}", msg);
        }
    }

    fn warn(&self, msg: impl std::fmt::Display) {
        if !self.quiet {
            eprintln!("⚠️  {}", msg);
        }
    }

    fn error(&self, msg: impl std::fmt::Display) {
        eprintln!("❌ {}", msg); // Always print errors
    }

    fn spinner(&self, msg: &str) -> Option<ProgressBar> {
        if self.quiet {
            None
        } else {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.set_message(msg.to_string());
            pb.enable_steady_tick(Duration::from_millis(100));
            Some(pb)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);
    let console = Console::new(cli.quiet, cli.verbose);

    match run(cli, &console) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            console.error(format!("{:#}", err));
            if let Some(hint) = retry_hint(&err) {
                console.warn(hint);
            }
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_logging(quiet: bool, verbose: bool) {
    let default = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}

/// Exit code for the first install error in the chain, 1 for anything else
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<InstallError>())
        .map(InstallError::exit_code)
        .unwrap_or(1)
}

/// Advice for fetch failures that can go away on their own
fn retry_hint(err: &anyhow::Error) -> Option<&'static str> {
    let kind = err.chain().find_map(|cause| match cause.downcast_ref::<InstallError>() {
        Some(InstallError::Fetch { kind, .. }) => Some(kind),
        _ => None,
    })?;
    if !kind.is_retryable() {
        return None;
    }
    Some(match kind {
        FetchError::Expired => "The download link has expired; refresh the descriptor's url and try again",
        _ => "This failure may be temporary; try again later",
    })
}

fn run(cli: Cli, console: &Console) -> Result<()> {
    let config = AppdropConfig::load(cli.config.as_deref())?;
    let mut overrides = Overrides {
        state_dir: cli.state_dir,
        ..Default::default()
    };

    match cli.command {
        Commands::Install {
            descriptor,
            target,
            reinstall,
            allow_unverified,
            timeout,
        } => {
            overrides.target = target;
            overrides.allow_unverified = allow_unverified;
            overrides.timeout_secs = timeout;
            let context = config.resolve(&overrides)?;
            cmd_install(&descriptor, context, reinstall, console)
        }
        Commands::Uninstall { identifier, yes } => {
            cmd_uninstall(&identifier, config.resolve(&overrides)?, yes, console)
        }
        Commands::List => cmd_list(config.resolve(&overrides)?),
        Commands::Info { identifier } => cmd_info(&identifier, config.resolve(&overrides)?),
        Commands::Check { descriptor, print } => cmd_check(&descriptor, print, console),
        Commands::Fetch {
            descriptor,
            allow_unverified,
            timeout,
        } => {
            overrides.allow_unverified = allow_unverified;
            overrides.timeout_secs = timeout;
            cmd_fetch(&descriptor, config.resolve(&overrides)?, console)
        }
        Commands::Config => {
            print!("{}", generate_template());
            Ok(())
        }
    }
}

fn load_descriptor(path: &Path) -> Result<PackageDescriptor, InstallError> {
    Ok(PackageDescriptor::from_file(path)?)
}

fn installer(context: InstallContext) -> Result<Installer<HttpFetcher>> {
    let fetcher = HttpFetcher::new(&context.user_agent).context("Failed to set up the downloader")?;
    Ok(Installer::new(fetcher, context))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to start async runtime")
}

/// Install a descriptor
fn cmd_install(path: &Path, context: InstallContext, reinstall: bool, console: &Console) -> Result<()> {
    let descriptor = load_descriptor(path)?;

    console.log(format!(
        "📦 Installing {} v{}\n",
        descriptor.display_name(),
        descriptor.version()
    ));
    console.verbose(format!("Target: {:?}", context.target_root));
    console.verbose(format!("Source: {}", descriptor.url()));

    let rt = runtime()?;
    let outcome = rt.block_on(async {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let installer = installer(context)?.with_events(tx);

        let spinner = console.spinner("Preparing...");
        let progress = {
            let spinner = spinner.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Some(pb) = &spinner {
                        pb.set_message(describe(&event));
                    }
                }
            })
        };

        let options = InstallOptions {
            reinstall,
            ..Default::default()
        };
        let result = installer.install(descriptor, &options).await;
        drop(installer);

        // The installer logs the skipped-verification warning itself
        let _ = progress.await;
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }
        anyhow::Ok(result?)
    })?;

    match outcome.status {
        InstallStatus::AlreadyInstalled => {
            console.log(format!(
                "{} v{} is already installed (use --reinstall to install it again)",
                outcome.identifier, outcome.version
            ));
        }
        status => {
            let verb = match status {
                InstallStatus::Upgraded => "Upgraded",
                InstallStatus::Reinstalled => "Reinstalled",
                _ => "Installed",
            };
            console.success(format!("{} {} v{}", verb, outcome.identifier, outcome.version));
            if let Some(sha256) = &outcome.verified_sha256 {
                console.verbose(format!("sha256: {}", sha256));
            }
        }
    }
    for path in &outcome.paths {
        console.log(format!("   {}", path.display()));
    }

    Ok(())
}

fn describe(event: &InstallEvent) -> String {
    match event {
        InstallEvent::AlreadyInstalled { version } => format!("v{} already installed", version),
        InstallEvent::Fetching { host } => format!("Downloading from {}...", host),
        InstallEvent::Fetched { bytes } => format!("Downloaded {} bytes", bytes),
        InstallEvent::DigestVerified { .. } => "Checksum verified".to_string(),
        InstallEvent::VerificationSkipped { .. } => "Checksum verification skipped".to_string(),
        InstallEvent::Extracting { format } => format!("Extracting {} archive...", format),
        InstallEvent::Placed { path } => format!("Placed {}", path.display()),
        InstallEvent::Removed { path } => format!("Removed {}", path.display()),
    }
}

/// Uninstall an installed package
fn cmd_uninstall(identifier: &str, context: InstallContext, yes: bool, console: &Console) -> Result<()> {
    let installer = installer(context)?;
    let receipt = installer
        .installed(identifier)?
        .ok_or_else(|| InstallError::NotInstalled {
            identifier: identifier.to_string(),
        })?;

    console.log(format!("🧹 Uninstalling: {} v{}\n", identifier, receipt.version));
    for path in &receipt.artifacts {
        console.log(format!("   {}", path.display()));
    }

    // Confirmation prompt (unless --yes or --quiet)
    if !yes && !console.quiet {
        print!("\n⚠️  Are you sure you want to uninstall {}? [y/N] ", identifier);
        std::io::Write::flush(&mut std::io::stdout())?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            console.log("\nCancelled.");
            return Ok(());
        }
    }

    let rt = runtime()?;
    let outcome = rt.block_on(installer.uninstall(identifier))?;

    if outcome.removed.len() < receipt.artifacts.len() {
        console.warn("Some recorded artifacts were already gone or outside the target directory");
    }
    console.success(format!("{} has been uninstalled.", identifier));
    Ok(())
}

/// List installed packages
fn cmd_list(context: InstallContext) -> Result<()> {
    let receipts = installer(context)?.list()?;
    if receipts.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }

    for receipt in receipts {
        let marker = if receipt.missing_artifacts().is_empty() {
            ""
        } else {
            "  (damaged)"
        };
        println!("{}\t{}{}", receipt.identifier, receipt.version, marker);
    }
    Ok(())
}

/// Show one receipt
fn cmd_info(identifier: &str, context: InstallContext) -> Result<()> {
    let receipt = installer(context)?
        .installed(identifier)?
        .ok_or_else(|| InstallError::NotInstalled {
            identifier: identifier.to_string(),
        })?;

    println!("Identifier:   {}", receipt.identifier);
    if let Some(name) = &receipt.name {
        println!("Name:         {}", name);
    }
    println!("Version:      {}", receipt.version);
    println!("Source:       {}", receipt.source_host);
    match &receipt.verified_sha256 {
        Some(sha256) => println!("Verified:     sha256 {}", sha256),
        None => println!("Verified:     no (checksum skipped by descriptor)"),
    }
    println!("Installed at: {}", receipt.installed_at);

    let missing = receipt.missing_artifacts();
    println!("Artifacts:");
    for path in &receipt.artifacts {
        let marker = if missing.contains(path) { "  (missing)" } else { "" };
        println!("  {}{}", path.display(), marker);
    }
    Ok(())
}

/// Validate a descriptor
fn cmd_check(path: &Path, print: bool, console: &Console) -> Result<()> {
    let descriptor = load_descriptor(path)?;

    if print {
        print!("{}", descriptor.to_toml().map_err(InstallError::from)?);
        return Ok(());
    }

    console.success(format!(
        "{} v{} is a valid descriptor",
        descriptor.identifier(),
        descriptor.version()
    ));
    for action in descriptor.install_actions() {
        console.log(format!("   {}", action));
    }
    if !descriptor.integrity().is_verified() {
        console.warn("This descriptor disables integrity verification");
    }
    Ok(())
}

/// Fetch and verify without installing
fn cmd_fetch(path: &Path, context: InstallContext, console: &Console) -> Result<()> {
    let descriptor = load_descriptor(path)?;
    let installer = installer(context)?;

    let spinner = console.spinner(&format!("Downloading {}...", descriptor.identifier()));
    let rt = runtime()?;
    let fetched = rt.block_on(installer.fetch(&descriptor, &InstallOptions::default()));
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let fetched = fetched?;

    match &fetched.verified_sha256 {
        Some(sha256) => console.success(format!(
            "Fetched {} bytes, sha256 {} verified",
            fetched.bytes.len(),
            sha256
        )),
        None => {
            console.success(format!("Fetched {} bytes", fetched.bytes.len()));
            // Digest for descriptor authors; nothing was checked against it
            console.log(format!("   sha256 {}", appdrop::integrity::sha256_hex(&fetched.bytes)));
        }
    }
    Ok(())
}
