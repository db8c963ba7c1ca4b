//! hostseed - Main entry point

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use hostseed::cli::{Cli, Commands, ConnectionArgs, TarballCommands, resolve_setup};
use hostseed::config::ProvisionConfig;
use hostseed::orchestrator::{ConsoleReporter, Reporter, RunContext};
use hostseed::process_guard::{self, ProcessGuard};
use hostseed::runner::CommandRunner;
use hostseed::session::SshSession;
use hostseed::transfer::{self, ScpTransfer};
use hostseed::{plan, tarball};
use tracing_subscriber::EnvFilter;

/// Log to stderr so step headers on stdout stay readable
fn init_logger(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    tracing::debug!("hostseed {} starting", env!("CARGO_PKG_VERSION"));

    // Tear down ssh/scp children on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        tracing::warn!("Failed to initialize signal handlers: {}", e);
    }
    let guard = ProcessGuard::new();

    let result = match cli.command {
        Commands::Setup {
            connection,
            reboot_time,
            tcp_ports,
        } => resolve_setup(&connection, reboot_time, tcp_ports.as_deref())
            .and_then(|config| run_setup(&config, cli.dry_run)),
        Commands::Validate { config } => validate(&config),
        Commands::Tarballs { command } => match command {
            TarballCommands::Upload { connection, source } => {
                upload(&connection, source, cli.dry_run)
            }
            TarballCommands::List { connection } => list(&connection),
        },
    };

    let code = exit_code(&result);
    drop(guard);
    std::process::exit(code);
}

/// 0 on success; otherwise report the error chain and return 1.
fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("{}", format!("✗ {:#}", e).red());
            1
        }
    }
}

fn connect(config: &ProvisionConfig, dry_run: bool) -> Result<CommandRunner> {
    let session = SshSession::connect(&config.connect_options())
        .with_context(|| format!("Unable to establish a connection to {}", config.ssh_target()))?;
    Ok(CommandRunner::new(Box::new(session)).with_dry_run(dry_run))
}

fn run_setup(config: &ProvisionConfig, dry_run: bool) -> Result<()> {
    config.validate()?;
    let plan = plan::setup_plan(config)?;
    let mut reporter = ConsoleReporter;
    reporter.note(&format!("Connecting to {}", config.ssh_target()));
    let mut ctx = RunContext::new(connect(config, dry_run)?);

    let report = plan.run(&mut ctx, &mut reporter);
    if let Err(e) = ctx.close() {
        tracing::warn!("Failed to close connection: {}", e);
    }
    let report = report?;

    tracing::debug!("{} step(s) completed", report.completed.len());
    if dry_run {
        reporter.note("Dry run complete. No changes were made.");
    } else {
        reporter.note("Setup is complete. Your server is now ready to use!");
    }
    Ok(())
}

fn validate(path: &std::path::Path) -> Result<()> {
    tracing::info!("Validating configuration file: {:?}", path);
    let config = ProvisionConfig::load_from_file(path)?;
    config.validate().context("Configuration validation failed")?;
    println!("✓ Configuration file is valid");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn upload(
    connection: &ConnectionArgs,
    source: Option<std::path::PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let config = connection.resolve()?;
    config.validate_connection()?;

    let source = match source {
        Some(dir) => dir,
        None => std::env::current_dir().context("Could not get current working directory")?,
    };
    let source = source
        .canonicalize()
        .with_context(|| format!("Cannot read source directory {:?}", source))?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = tarball::tarball_name(&source, now, tarball::git_short_sha(&source).as_deref())?;

    let out_dir = tempfile::Builder::new()
        .prefix("hostseed-tarball-")
        .tempdir()
        .context("Unable to create a local temp directory")?;
    let local = tarball::create_tarball(&source, out_dir.path(), &name)?;

    let mut runner = connect(&config, dry_run)?;
    let mut scp = ScpTransfer::new(config.ssh_target());
    let remote = transfer::upload_verified(&mut runner, &mut scp, &local, &config.tarball_dir)?;
    runner.close()?;
    println!("{}", format!("✓ Uploaded {}", remote).green());
    Ok(())
}

fn list(connection: &ConnectionArgs) -> Result<()> {
    let config = connection.resolve()?;
    config.validate_connection()?;

    let mut runner = connect(&config, false)?;
    let names = transfer::list_tarballs(&mut runner, &config.tarball_dir)?;
    runner.close()?;

    if names.is_empty() {
        println!("No tarballs uploaded to {} yet", config.tarball_dir);
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}
