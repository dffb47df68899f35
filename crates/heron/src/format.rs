//! Human-readable CLI output.
//!
//! JSON output bypasses this module and prints the report objects directly.

use heron_migrate::{MigrationPhase, MigrationState, PhaseReport, CONFIRMATION_PHRASE};
use heron_pki::manager::StageEntry;
use heron_pki::{CertificateStatus, PkiStatus, RemoteVerification};

pub fn pki_status(status: &PkiStatus) {
    println!("PKI Status");
    println!("  Stage:      {}", status.stage);
    println!("  Mode:       {}", status.mode);
    if let Some(run) = &status.run_id {
        println!("  Run:        {run}");
    }
    if let Some(started) = status.started_at {
        println!("  Started:    {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(finished) = status.finished_at {
        println!("  Finished:   {}", finished.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "  CA:         {}",
        match (status.ca_exists, status.ca_valid) {
            (false, _) => "missing",
            (true, false) => "INVALID",
            (true, true) => "valid",
        }
    );
    println!("  Generated:  {}", status.certs_generated);
    if !status.history.is_empty() {
        println!("  Stages:");
        for line in stage_history(&status.history) {
            println!("    {line}");
        }
    }
    println!();

    for cert in &status.identities {
        certificate(cert);
    }
    issues(&status.errors, &status.warnings);
}

/// One line per stage entered, with the time spent before the next one.
fn stage_history(history: &[StageEntry]) -> Vec<String> {
    history
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let at = entry.at.format("%H:%M:%S");
            match history.get(i + 1) {
                Some(next) => {
                    let ms = (next.at - entry.at).num_milliseconds();
                    format!("{at}  {:<13} {ms} ms", entry.stage.to_string())
                }
                None => format!("{at}  {}", entry.stage),
            }
        })
        .collect()
}

fn certificate(cert: &CertificateStatus) {
    let state = if !cert.exists {
        "missing"
    } else if !cert.valid {
        "invalid"
    } else if cert.needs_renewal {
        "renew"
    } else {
        "ok"
    };
    println!("  {} ({state})", cert.identity);
    if let Some(expires) = cert.expires_at {
        let days = cert.days_until_expiry.unwrap_or_default();
        println!("    Expires:     {} ({days} days)", expires.format("%Y-%m-%d"));
    }
    if let Some(fingerprint) = &cert.fingerprint {
        println!("    Fingerprint: {fingerprint}");
    }
    if let Some(reason) = &cert.reason {
        println!("    Reason:      {reason}");
    }
}

fn issues(errors: &[String], warnings: &[String]) {
    if errors.is_empty() && warnings.is_empty() {
        return;
    }
    println!();
    for e in errors {
        println!("  error: {e}");
    }
    for w in warnings {
        println!("  warning: {w}");
    }
}

pub fn remote_verification(results: &[RemoteVerification]) {
    println!("Installed certificates");
    for r in results {
        let mark = if r.ok { "ok" } else { "FAIL" };
        println!("  [{mark}] {}: {}", r.identity, r.detail);
    }
}

pub fn phase_report(report: &PhaseReport) {
    println!(
        "\n== {} ({}) {}",
        report.phase,
        report.service,
        if report.success { "PASSED" } else { "FAILED" }
    );
    for step in &report.steps {
        let mark = if step.ok { "ok" } else { "FAIL" };
        println!("  [{mark}] {}: {}", step.name, step.detail);
    }
    if let Some(count) = report.plaintext_connections {
        println!("  Plaintext clients: {count}");
    }
    for advisory in &report.advisories {
        println!();
        println!("{advisory}");
    }
    if let Some(state) = report.state {
        println!("  Phase now: {state}");
    }
    if let Some(next) = &report.next {
        println!("  Next:      {next}");
    }
    if let Some(command) = &report.rollback_command {
        println!("  Rollback:  {command}");
    }
}

pub fn migration_state(state: &MigrationState) {
    println!("Migration of {} on {}", state.service, state.identity);
    println!("  Phase:   {}", state.phase);
    println!("  Updated: {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(backup) = &state.backup_path {
        println!("  Backup:  {backup}");
    }
    if state.phase == MigrationPhase::VerifiedReady {
        println!("  Ready for: heron migrate --phase disable-password");
    }
}

/// Printed to stderr so `--json` output stays parseable.
pub fn cutover_warning(service: &str, identity: &str, plaintext_connections: u32) {
    eprintln!();
    eprintln!("About to disable password authentication on {service} ({identity}).");
    eprintln!("Plaintext clients right now: {plaintext_connections}");
    eprintln!("Clients without a certificate will be refused after this step.");
    eprintln!("Type {CONFIRMATION_PHRASE} to continue:");
}
