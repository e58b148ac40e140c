//! Fleet master.
//!
//! Loads the desired fleet shape, constructs the Vagrant driver, and runs
//! one reconciliation pass against it. Exits nonzero when any machine
//! failed or was skipped, after reporting every per-machine outcome.

use std::sync::Arc;

use anyhow::Result;
use fleet_vat::VatId;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_master::config::MasterConfig;
use fleet_master::driver::ComputeDriver;
use fleet_master::master::run_master;
use fleet_master::vagrant::VagrantDriver;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet master");

    let config = MasterConfig::from_env()?;
    info!(
        machines = config.fleet.desired_machines().len(),
        restart_all = config.restart.all,
        restart_listed = config.restart.machines.len(),
        "Configuration loaded"
    );

    let vagrant = VagrantDriver::new(config.vagrant.clone()).await?;
    info!(
        bind = %vagrant.master_bind_address(),
        log_sink = %vagrant.log_sink_address(),
        "Vagrant driver ready"
    );
    let driver: Arc<dyn ComputeDriver> = Arc::new(vagrant);

    // The master's routing identity for this incarnation; every machine
    // is handed it so it can address the master back.
    let master_id = VatId::generate();

    let report = run_master(
        driver,
        master_id,
        &config,
        config.restart.all,
        &config.restart.machines,
    )
    .await?;

    for failure in &report.failed {
        warn!(
            machine = %failure.id,
            op = ?failure.op,
            category = failure.error.category(),
            error = %failure.error,
            "Machine failed"
        );
    }
    for (machine, missing) in &report.skipped {
        warn!(machine = %machine, missing = %missing, "Machine skipped");
    }

    if !report.is_converged() {
        anyhow::bail!(
            "reconciliation finished with {} failed and {} skipped machines",
            report.failed.len(),
            report.skipped.len()
        );
    }

    info!(running = report.running.len(), "Fleet converged");
    Ok(())
}
