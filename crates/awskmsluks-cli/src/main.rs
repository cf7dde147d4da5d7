//! awskmsluks command-line interface: format LUKS devices with KMS-wrapped
//! passphrases and unlock them again at boot.

use anyhow::{Context, Result};
use awskmsluks_aws::{ArchiveDestination, AwsSession, KmsAuthority, S3Archive};
use awskmsluks_core::{
    host::host_identity, logging, BuildInfo, KeyArn, KmsLuksConfig, KmsLuksService, Passphrase,
    UnlockOutcome, DEFAULT_CONFIG_PATH,
};
use awskmsluks_luks::SystemLuksTool;
use clap::{ArgGroup, CommandFactory, Parser};
use log::debug;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Service = KmsLuksService<KmsAuthority, S3Archive, SystemLuksTool>;

/// Command-line options. Exactly one action may be given.
#[derive(Parser, Debug)]
#[command(
    name = "awskmsluks",
    about = "Format and unlock LUKS devices with passphrases wrapped by AWS KMS.",
    disable_version_flag = true,
    group(
        ArgGroup::new("action")
            .args(["encrypt", "open", "uuid", "restore", "version"])
            .multiple(false)
    )
)]
struct Cli {
    /// Path to the awskmsluks configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Generate a new key and format DEVICE with it.
    #[arg(long, value_name = "DEVICE")]
    encrypt: Option<PathBuf>,

    /// Unlock every device with a cached key for this host.
    #[arg(long)]
    open: bool,

    /// Print the passphrase for UUID to stdout (no trailing newline).
    #[arg(long, value_name = "UUID")]
    uuid: Option<String>,

    /// Copy the archived key for UUID back into the local key store.
    #[arg(long, value_name = "UUID")]
    restore: Option<String>,

    /// Print version and build information.
    #[arg(long)]
    version: bool,
}

/// The single action selected on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Encrypt(PathBuf),
    Open,
    Passphrase(String),
    Restore(String),
    Version,
    Usage,
}

impl Cli {
    fn action(&self) -> Action {
        if self.version {
            Action::Version
        } else if let Some(device) = &self.encrypt {
            Action::Encrypt(device.clone())
        } else if self.open {
            Action::Open
        } else if let Some(uuid) = &self.uuid {
            Action::Passphrase(uuid.clone())
        } else if let Some(uuid) = &self.restore {
            Action::Restore(uuid.clone())
        } else {
            Action::Usage
        }
    }
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    match run() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Dispatch the requested action; returns the process exit code.
fn run() -> Result<i32> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.action() {
        Action::Version => {
            println!("{}", build_info());
            Ok(0)
        }
        Action::Encrypt(device) => {
            let service = build_service(&cli.config)?;
            let report = service.encrypt(&device)?;
            println!(
                "Formatted {} with key {} (record at {})",
                report.device.display(),
                report.uuid,
                report.key_path.display()
            );
            Ok(0)
        }
        Action::Open => {
            let service = build_service(&cli.config)?;
            let outcomes = service.unlock_all()?;
            if outcomes.is_empty() {
                println!(
                    "No keys cached for {} under {}.",
                    service.fqdn(),
                    service.cache().root().display()
                );
            }
            let failed = report_outcomes(&outcomes, &mut io::stdout(), &mut io::stderr())?;
            Ok(if failed > 0 { 1 } else { 0 })
        }
        Action::Passphrase(uuid) => {
            let service = build_service(&cli.config)?;
            let passphrase = service.passphrase(&uuid)?;
            write_passphrase(&mut io::stdout().lock(), &passphrase)?;
            Ok(0)
        }
        Action::Restore(uuid) => {
            let service = build_service(&cli.config)?;
            let path = service.restore(&uuid)?;
            println!("Restored key {uuid} to {}", path.display());
            Ok(0)
        }
        Action::Usage => print_usage(&mut io::stdout()),
    }
}

/// Print help for a run without an action; such a run always fails.
fn print_usage(out: &mut impl Write) -> Result<i32> {
    writeln!(out, "{}", Cli::command().render_help())?;
    Ok(1)
}

/// Emit the passphrase exactly, with no trailing newline, so it can feed a keyscript.
fn write_passphrase(out: &mut impl Write, passphrase: &Passphrase) -> io::Result<()> {
    out.write_all(passphrase.as_bytes())?;
    out.flush()
}

/// One line per record; returns how many failed.
fn report_outcomes(
    outcomes: &[UnlockOutcome],
    out: &mut impl Write,
    err: &mut impl Write,
) -> io::Result<usize> {
    let mut failed = 0usize;
    for outcome in outcomes {
        match &outcome.result {
            Ok(name) => writeln!(out, "{}: unlocked as /dev/mapper/{name}", outcome.label())?,
            Err(reason) => {
                failed += 1;
                writeln!(err, "{}: {reason}", outcome.label())?;
            }
        }
    }
    if failed > 0 {
        writeln!(err, "{failed} of {} device(s) failed to unlock", outcomes.len())?;
    }
    Ok(failed)
}

fn build_service(config_path: &Path) -> Result<Service> {
    let config = KmsLuksConfig::load(config_path)?;
    debug!("loaded configuration from {}", config.path.display());

    let fqdn = host_identity()?;
    let arn = KeyArn::parse(&config.cmk_arn)?;
    let destination = ArchiveDestination::parse(&config.key_archive_bucket)?;
    let tool = SystemLuksTool::from_config(&config);

    let session = AwsSession::load().context("failed to initialise AWS SDK")?;
    let archive = S3Archive::new(session.clone(), destination, Some(&arn.region));
    let authority = KmsAuthority::new(session);

    Ok(KmsLuksService::new(
        Arc::new(config),
        fqdn,
        authority,
        archive,
        tool,
    ))
}

fn build_info() -> BuildInfo {
    BuildInfo::new(
        env!("CARGO_PKG_VERSION"),
        option_env!("AWSKMSLUKS_GIT_HASH"),
        option_env!("AWSKMSLUKS_BUILD_TIME"),
    )
}
