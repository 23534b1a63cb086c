//! roestbak-provision CLI entrypoint.
//!
//! Wires the production collaborators (apt, DKMS, systemd, rustup, ureq)
//! into the library's workflow and renders the results.

use clap::Parser;
use roestbak_provisioner::cli::{ApplyArgs, Cli, Command, DeployArgs, DigestArgs, StatusArgs};
use roestbak_provisioner::config::ProvisionConfig;
use roestbak_provisioner::dirs::SystemBaseDirs;
use roestbak_provisioner::dkms::DkmsRegistry;
use roestbak_provisioner::error::{ProvisionError, Result};
use roestbak_provisioner::exec::SystemCommandExecutor;
use roestbak_provisioner::extraction::TarExtractor;
use roestbak_provisioner::fetch::HttpDownloader;
use roestbak_provisioner::fleet::{deploy_host, run_on_hosts};
use roestbak_provisioner::logging::{StderrLogger, level_for};
use roestbak_provisioner::output::{
    FatalErrorFormatter, format_apply_report, format_host_reports, format_json, format_status,
    write_stderr_line,
};
use roestbak_provisioner::packages::AptPackageManager;
use roestbak_provisioner::service::SystemctlManager;
use roestbak_provisioner::tree_digest::compute_tree_digest;
use roestbak_provisioner::workflow::{HostSystems, apply, status};
use std::io::Write;

fn main() {
    let cli = Cli::parse();
    // Only fails if a logger is already installed.
    let _ = StderrLogger::new(level_for(cli.verbosity, cli.quiet)).install();
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let exit_code = exit_code_for_run_result(run(&cli, &mut stdout, &mut stderr), &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

/// Runs the selected command, returning the process exit code.
fn run(cli: &Cli, stdout: &mut dyn Write, stderr: &mut dyn Write) -> Result<i32> {
    match &cli.command {
        Command::Apply(args) => run_apply(args, cli.quiet, stdout, stderr),
        Command::Status(args) => run_status(args, stdout),
        Command::Digest(args) => run_digest(args, stdout),
        Command::Deploy(args) => run_deploy(args, stderr),
    }
}

fn load_config(path: &camino::Utf8Path) -> Result<ProvisionConfig> {
    Ok(ProvisionConfig::load(path, &SystemBaseDirs)?)
}

fn run_apply(
    args: &ApplyArgs,
    quiet: bool,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<i32> {
    let config = load_config(&args.config)?;
    let executor = SystemCommandExecutor;
    let downloader = HttpDownloader::new(config.timeouts.fetch);
    let registry = DkmsRegistry::new(&executor, config.timeouts.command, config.timeouts.build);
    let packages = AptPackageManager::new(&executor, config.timeouts.build);
    let services = SystemctlManager::new(&executor, config.timeouts.command);
    let systems = HostSystems {
        executor: &executor,
        downloader: &downloader,
        extractor: &TarExtractor,
        registry: &registry,
        packages: &packages,
        services: &services,
    };

    let report = apply(&config, &systems, &args.steps())?;
    if args.json {
        write_line(stdout, format_json(&report))?;
    } else if !quiet {
        write_stderr_line(stderr, format_apply_report(&report));
    }
    Ok(0)
}

fn run_status(args: &StatusArgs, stdout: &mut dyn Write) -> Result<i32> {
    let config = load_config(&args.config)?;
    let executor = SystemCommandExecutor;
    let registry = DkmsRegistry::new(&executor, config.timeouts.command, config.timeouts.build);
    let status = status(&config, &registry)?;
    if args.json {
        write_line(stdout, format_json(&status))?;
    } else {
        write_line(stdout, format_status(&status))?;
    }
    Ok(0)
}

fn run_digest(args: &DigestArgs, stdout: &mut dyn Write) -> Result<i32> {
    let digest = compute_tree_digest(&args.dir)?;
    write_line(stdout, digest)?;
    Ok(0)
}

fn run_deploy(args: &DeployArgs, stderr: &mut dyn Write) -> Result<i32> {
    let config = load_config(&args.config)?;
    let hosts = if args.hosts.is_empty() {
        config.hosts.clone()
    } else {
        args.hosts.clone()
    };
    if hosts.is_empty() {
        return Err(ProvisionError::Config {
            path: config.path.clone(),
            reason: "no hosts configured; set `hosts` or pass --host".to_owned(),
        });
    }

    let executor = SystemCommandExecutor;
    let reports = run_on_hosts(&hosts, |host| deploy_host(&executor, &config.deploy, host));
    write_stderr_line(stderr, format_host_reports(&reports));
    Ok(i32::from(reports.iter().any(|report| !report.succeeded())))
}

fn write_line(stdout: &mut dyn Write, message: impl std::fmt::Display) -> Result<()> {
    writeln!(stdout, "{message}").map_err(|source| ProvisionError::WriteFailed { source })
}

fn exit_code_for_run_result(result: Result<i32>, stderr: &mut dyn Write) -> i32 {
    match result {
        Ok(code) => code,
        Err(err) => {
            write_stderr_line(stderr, FatalErrorFormatter::new(&err));
            if err.is_retryable() {
                write_stderr_line(stderr, "re-running the same command is safe and may succeed");
            }
            1
        }
    }
}
