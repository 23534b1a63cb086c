//! Human and JSON renderings of run results.
//!
//! Everything here returns strings; the binary decides where they go.

use crate::fleet::HostReport;
use crate::orchestrator::InstallOutcome;
use crate::packages::PackageChanges;
use crate::service::ServiceAction;
use crate::workflow::{ApplyReport, HostStatus};
use serde::Serialize;
use std::error::Error;
use std::fmt::{self, Write as _};
use std::io::Write;

/// Write one line, ignoring failures: there is nowhere left to report them.
pub fn write_stderr_line(stderr: &mut dyn Write, message: impl fmt::Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort output.
    }
}

/// Renders an error and its `source()` chain on one line.
///
/// # Examples
///
/// ```
/// use roestbak_provisioner::output::FatalErrorFormatter;
///
/// let error = std::io::Error::other("disk full");
/// assert_eq!(FatalErrorFormatter::new(&error).to_string(), "FATAL: disk full");
/// ```
pub struct FatalErrorFormatter<'a> {
    error: &'a dyn Error,
}

impl<'a> FatalErrorFormatter<'a> {
    /// Wrap `error` for display.
    #[must_use]
    pub fn new(error: &'a dyn Error) -> Self {
        Self { error }
    }
}

impl fmt::Display for FatalErrorFormatter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FATAL: {}", self.error)?;
        let mut next = self.error.source();
        while let Some(source) = next {
            write!(f, " - Caused by: {source}")?;
            next = source.source();
        }
        Ok(())
    }
}

/// Pretty JSON for any report.
#[must_use]
pub fn format_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_owned())
}

/// Human-readable `status` output.
#[must_use]
pub fn format_status(status: &HostStatus) -> String {
    let mut out = format!("module {}\n", status.release);
    let _ = writeln!(out, "  tree:       {}", status.tree);
    let _ = writeln!(out, "  pinned:     {}", status.pinned);
    let computed = status
        .actual
        .as_ref()
        .map_or_else(|| "(no readable tree)".to_owned(), ToString::to_string);
    let _ = writeln!(out, "  computed:   {computed}");
    let _ = writeln!(out, "  source:     {}", match_word(status.matches));
    let _ = writeln!(out, "  registered: {}", yes_no(status.registered));
    let _ = writeln!(out, "  udev rule:  {}", if status.udev_rules_current { "current" } else { "missing or stale" });
    if status.converged() {
        out.push_str("converged");
    } else {
        out.push_str("not converged; run `roestbak-provision apply`");
    }
    out
}

fn match_word(matches: bool) -> &'static str {
    if matches { "match" } else { "mismatch" }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Human-readable summary of an `apply` run.
#[must_use]
pub fn format_apply_report(report: &ApplyReport) -> String {
    let mut lines = Vec::new();
    if let Some(packages) = &report.packages {
        lines.push(format!("packages:  {}", describe_packages(packages)));
    }
    if let Some(toolchain) = &report.toolchain {
        let summary = if toolchain.bootstrapped {
            "bootstrapped"
        } else if toolchain.installed_channel || toolchain.added_components {
            "updated"
        } else {
            "unchanged"
        };
        lines.push(format!("toolchain: {summary}"));
    }
    if let Some(module) = &report.module {
        let summary = match module.outcome {
            InstallOutcome::Current => "unchanged",
            InstallOutcome::Registered => "rebuilt",
            InstallOutcome::Replaced => "replaced and rebuilt",
        };
        lines.push(format!("module:    {summary}"));
    }
    if let Some(udev) = report.udev {
        let summary = if udev.changed() { "installed" } else { "unchanged" };
        lines.push(format!("udev:      {summary}"));
    }
    if let Some(service) = &report.service {
        let summary = match service.action {
            ServiceAction::None if service.changed() => "updated",
            ServiceAction::None => "unchanged",
            ServiceAction::Started => "started",
            ServiceAction::Restarted => "restarted",
            ServiceAction::Stopped => "stopped",
        };
        lines.push(format!("service:   {summary}"));
    }
    lines.join("\n")
}

fn describe_packages(changes: &PackageChanges) -> String {
    if !changes.changed() {
        return "unchanged".to_owned();
    }
    let mut parts = Vec::new();
    if !changes.installed.is_empty() {
        parts.push(format!("installed {}", changes.installed.join(" ")));
    }
    if !changes.removed.is_empty() {
        parts.push(format!("removed {}", changes.removed.join(" ")));
    }
    parts.join("; ")
}

/// One line per host plus a failure count.
#[must_use]
pub fn format_host_reports(reports: &[HostReport]) -> String {
    let mut out = String::new();
    for report in reports {
        match &report.result {
            Ok(()) => {
                let _ = writeln!(out, "{}: ok", report.host);
            }
            Err(error) => {
                let _ = writeln!(out, "{}: {}", report.host, FatalErrorFormatter::new(error));
            }
        }
    }
    let failed = reports.iter().filter(|report| !report.succeeded()).count();
    let _ = write!(out, "{} of {} hosts failed", failed, reports.len());
    out
}
