use std::sync::Arc;
use vigil_worker::names;
use vigil_worker::{
    HarnessConfig, LocalNetwork, StreamVerificationEngine, VerificationReport, VerifyError, VerifyOptions,
    VersionRegistry, WorkerError, WorkerManager,
};

async fn run_check(
    check: &str,
    manager: &WorkerManager,
    engine: &StreamVerificationEngine,
) -> Result<VerificationReport, Box<dyn std::error::Error>> {
    let creator = manager.get_creator().await.ok_or(WorkerError::NoWorkers)?;
    let receivers = manager.get_all_but_creator().await;

    let report = match check {
        "message" => {
            let group = manager.create_group_between_all(None, &[]).await?;
            engine.verify_message_stream(&group, &receivers).await?
        }
        "metadata" => {
            let group = manager.create_group_between_all(None, &[]).await?;
            engine.verify_metadata_stream(&group, &receivers).await?
        }
        "dm" => engine.verify_dm_stream(&receivers, &creator).await?,
        "conversation" => engine.verify_conversation_stream(&creator, &receivers).await?,
        "consent" => engine.verify_consent_stream(&creator, &receivers).await?,
        other => {
            return Err(format!("unknown check {:?}; expected message, metadata, dm, conversation or consent", other).into())
        }
    };
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = HarnessConfig::from_env()?;
    let worker_count: usize = std::env::var("VIGIL_WORKERS")
        .unwrap_or_else(|_| "3".to_string())
        .parse()?;
    let message_count: usize = std::env::var("VIGIL_MESSAGES")
        .unwrap_or_else(|_| "5".to_string())
        .parse()?;
    let check = std::env::var("VIGIL_CHECK").unwrap_or_else(|_| "message".to_string());

    let network = LocalNetwork::new();
    let registry = VersionRegistry::local(&network)?.with_forced_version(config.forced_version.as_deref())?;
    log::info!(
        "Running {} check on {} with {} workers (default version {})",
        check,
        config.network,
        worker_count.max(2),
        registry.default_version().tag()
    );

    let manager = WorkerManager::new(config.clone(), Arc::new(registry));
    let engine = StreamVerificationEngine::new(VerifyOptions::from_config(&config).with_count(message_count));

    let outcome = match manager.create_workers(&names::fixed_names(worker_count.max(2))).await {
        Ok(_) => run_check(&check, &manager, &engine).await,
        Err(e) => Err(e.into()),
    };

    // Workers are closed whether or not the check ran
    if let Err(e) = manager.terminate_all(false).await {
        log::warn!("{}", e);
    }

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            if let Some(VerifyError::SendTimeout(after)) = e.downcast_ref::<VerifyError>() {
                log::error!("Probes were not all sent within {:?}", after);
            }
            return Err(e);
        }
    };

    println!("{}", report.to_json_pretty()?);
    if !report.almost_all_received {
        log::error!(
            "Only {:.1}% of events were received (tolerance {:.1}%)",
            report.reception_percentage,
            config.high_tolerance
        );
        std::process::exit(1);
    }
    Ok(())
}
