use heron_migrate::{
    MigrationError, MigrationOrchestrator, PhaseReport, RollbackKind, ROLLBACK_COMMAND,
};

use super::print_json;
use crate::cli::{MigrateArgs, PhaseArg, RollbackArg};
use crate::format;
use crate::wiring::Runtime;

pub async fn run(rt: &Runtime, args: &MigrateArgs, json: bool) -> anyhow::Result<bool> {
    let orchestrator = rt.orchestrator()?;

    if args.check_certs {
        let report = orchestrator.check_certs();
        emit(&report, json);
        return Ok(report.success);
    }

    if let Some(rollback) = args.rollback {
        let kind = match rollback {
            RollbackArg::Redis => RollbackKind::Partial,
            RollbackArg::RedisFull => RollbackKind::Full,
        };
        let report = orchestrator.rollback(kind).await?;
        emit(&report, json);
        return Ok(report.success);
    }

    let Some(phase) = args.phase else {
        anyhow::bail!("nothing to do: pass --phase, --rollback or --check-certs");
    };
    let report = match phase {
        PhaseArg::RedisDualAuth => orchestrator.dual_auth().await?,
        PhaseArg::BackendTls => orchestrator.backend_tls(),
        PhaseArg::Verify => orchestrator.verify().await?,
        PhaseArg::DisablePassword => {
            return cutover(&orchestrator, args.confirm.as_deref(), json).await;
        }
        PhaseArg::All => {
            let reports = orchestrator.run_all().await?;
            if json {
                print_json(&reports);
            } else {
                reports.iter().for_each(format::phase_report);
            }
            return Ok(reports.iter().all(|r| r.success));
        }
    };
    emit(&report, json);
    Ok(report.success)
}

/// Gate, confirm, then cut over. Every path out of here prints the
/// rollback command, errors included.
async fn cutover(
    orchestrator: &MigrationOrchestrator,
    confirm: Option<&str>,
    json: bool,
) -> anyhow::Result<bool> {
    match attempt_cutover(orchestrator, confirm, json).await {
        Ok(done) => Ok(done),
        Err(e) => {
            tracing::debug!(error = ?e, "Cutover did not run");
            refused(&format!("{e:#}"), json);
            Ok(false)
        }
    }
}

async fn attempt_cutover(
    orchestrator: &MigrationOrchestrator,
    confirm: Option<&str>,
    json: bool,
) -> anyhow::Result<bool> {
    let gate = match orchestrator.prepare_cutover().await {
        Ok(gate) => gate,
        Err(MigrationError::GateClosed(report)) => {
            emit(&report, json);
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    if !json {
        format::phase_report(gate.report());
    }

    let token = match confirm {
        Some(token) => token.to_string(),
        None => {
            format::cutover_warning(gate.service(), gate.identity(), gate.plaintext_connections());
            read_confirmation().await?
        }
    };

    let confirmation = match gate.confirm(&token) {
        Ok(confirmation) => confirmation,
        Err(e) => {
            refused(&e.to_string(), json);
            return Ok(false);
        }
    };

    let report = orchestrator.disable_password(confirmation).await?;
    emit(&report, json);
    Ok(report.success)
}

fn refused(error: &str, json: bool) {
    if json {
        print_json(&refusal(error));
    } else {
        println!("\n{error}");
        println!("  Rollback:  {ROLLBACK_COMMAND}");
    }
}

fn refusal(error: &str) -> serde_json::Value {
    serde_json::json!({
        "phase": "disable-password",
        "success": false,
        "error": error,
        "rollback_command": ROLLBACK_COMMAND,
    })
}

/// One line from stdin. Blocks without a timeout.
async fn read_confirmation() -> anyhow::Result<String> {
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn emit(report: &PhaseReport, json: bool) {
    if json {
        print_json(report);
    } else {
        format::phase_report(report);
    }
}
