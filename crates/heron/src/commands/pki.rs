use heron_pki::SetupOptions;

use super::print_json;
use crate::cli::SetupArgs;
use crate::format;
use crate::wiring::Runtime;

pub async fn setup(rt: &Runtime, args: &SetupArgs, json: bool) -> anyhow::Result<bool> {
    let options = SetupOptions {
        force: args.force,
        skip_distribution: args.no_dist,
        skip_configuration: args.no_config,
    };
    let ok = rt.manager.setup(options).await;
    show_status(rt, json).await;
    Ok(ok)
}

pub async fn status(rt: &Runtime, json: bool) -> anyhow::Result<bool> {
    let status = rt.manager.status().await;
    let migration = match rt.orchestrator() {
        Ok(orchestrator) => match orchestrator.state() {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "Migration state unreadable");
                None
            }
        },
        Err(e) => {
            tracing::debug!(error = %e, "No migration target");
            None
        }
    };

    if json {
        print_json(&serde_json::json!({
            "pki": status,
            "migration": migration,
        }));
    } else {
        format::pki_status(&status);
        if let Some(state) = &migration {
            println!();
            format::migration_state(state);
        }
    }
    Ok(status.errors.is_empty())
}

pub async fn renew(rt: &Runtime, identities: &[String], json: bool) -> anyhow::Result<bool> {
    let ok = rt.manager.renew(identities).await;
    show_status(rt, json).await;
    Ok(ok)
}

pub async fn verify(rt: &Runtime, json: bool) -> anyhow::Result<bool> {
    let results: Vec<_> = rt
        .manager
        .distributor()
        .verify_distribution_detailed()
        .await
        .into_values()
        .collect();
    let ok = results.iter().all(|r| r.ok);
    if json {
        print_json(&results);
    } else {
        format::remote_verification(&results);
    }
    Ok(ok)
}

async fn show_status(rt: &Runtime, json: bool) {
    let status = rt.manager.status().await;
    if json {
        print_json(&status);
    } else {
        format::pki_status(&status);
    }
}
