//! Master control loop: one reconciliation pass over the fleet.
//!
//! The loop compares the desired fleet shape against what the compute
//! driver reports as running, then issues the minimal boot/run/stop calls
//! to converge: missing machines are booted and run, surplus machines are
//! decommissioned, restart-listed machines get a forced agent restart.
//! Machines in one start tier are driven concurrently; a machine's `run`
//! is never issued before its own `boot` completed.
//!
//! Failure of one machine never aborts the pass. Outcomes are tracked per
//! machine and reported in aggregate; the only hard aborts are
//! configuration errors (raised before any driver call) and discovery
//! failure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fleet_id::{IdError, MachineId, MachineType};
use fleet_vat::{VatId, VatPath};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::MasterConfig;
use crate::driver::{ComputeDriver, DriverError};
use crate::policy::PolicyError;

/// Errors that abort a reconciliation pass outright.
///
/// Per-machine failures never surface here; they are aggregated in the
/// [`ReconcileReport`].
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// A restart directive names an unparseable machine. Raised before
    /// any driver call.
    #[error("invalid machine name '{text}' in restart list")]
    InvalidRestartId {
        text: String,
        #[source]
        source: IdError,
    },

    /// Fleet discovery failed; nothing was attempted.
    #[error("machine discovery failed")]
    Discovery(#[source] DriverError),

    /// The dependency table cannot be ordered.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Lifecycle states the loop tracks for each machine within a pass.
///
/// A forced restart is a `Running` self-transition that replaces the
/// machine's bootstrap path. `Stopped` is terminal for the pass; a later
/// pass may boot the same id again as a fresh incarnation, never reusing
/// the old path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Unknown,
    Booting,
    Booted,
    Running,
    Stopping,
    Stopped,
}

/// The driver operation during which a machine failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOp {
    Boot,
    Run,
    Stop,
}

/// One machine's failure within a pass.
#[derive(Debug)]
pub struct MachineFailure {
    pub id: MachineId,
    pub op: DriverOp,
    /// The state the loop held for the machine when the operation failed.
    pub state: MachineState,
    pub error: DriverError,
}

/// Outcome of one reconciliation pass. A pass with failures still reports
/// every success; no machine silently drops out of attention.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Machines now running, with their current bootstrap path.
    pub running: BTreeMap<MachineId, VatPath>,

    /// Subset of `running` whose agent was forcibly restarted.
    pub restarted: BTreeSet<MachineId>,

    /// Machines decommissioned because the shape no longer wants them.
    pub stopped: BTreeSet<MachineId>,

    /// Machines not attempted, keyed to the dependency type that had
    /// nothing running.
    pub skipped: BTreeMap<MachineId, MachineType>,

    /// Machines that failed, with the operation and error category.
    pub failed: Vec<MachineFailure>,

    /// Peer bootstrap paths each running machine should reach, per the
    /// fan-out policy. Recomputed in full every pass.
    pub peers: BTreeMap<MachineId, BTreeMap<MachineId, VatPath>>,
}

impl ReconcileReport {
    /// True when every desired machine is running and nothing failed.
    pub fn is_converged(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

enum StartOutcome {
    Running {
        id: MachineId,
        path: VatPath,
        restarted: bool,
    },
    Failed(MachineFailure),
}

/// Runs one reconciliation pass.
///
/// `should_restart` forces an agent restart on every desired machine;
/// `machines_to_restart` names individual machines to force-restart.
/// Continuous re-convergence is the caller's loop, not this function's.
#[instrument(skip_all, fields(restart_all = should_restart))]
pub async fn run_master(
    driver: Arc<dyn ComputeDriver>,
    master_id: VatId,
    config: &MasterConfig,
    should_restart: bool,
    machines_to_restart: &[String],
) -> Result<ReconcileReport, MasterError> {
    // Configuration errors abort before infrastructure is touched.
    let mut restart_set = BTreeSet::new();
    for text in machines_to_restart {
        let id = MachineId::parse(text).map_err(|source| MasterError::InvalidRestartId {
            text: text.clone(),
            source,
        })?;
        restart_set.insert(id);
    }
    let policy = config.policy();
    let tiers = policy.tiers()?;

    let existing: BTreeSet<MachineId> = driver
        .list_machines()
        .await
        .map_err(MasterError::Discovery)?
        .into_iter()
        .collect();
    let desired: BTreeSet<MachineId> = config.fleet.desired_machines().into_iter().collect();
    info!(
        existing = existing.len(),
        desired = desired.len(),
        "Reconciling fleet"
    );

    let mut report = ReconcileReport::default();

    // Decommission machines the shape no longer wants, concurrently.
    let mut stops = JoinSet::new();
    for id in existing.difference(&desired).copied() {
        let driver = Arc::clone(&driver);
        stops.spawn(async move {
            debug!(machine = %id, state = ?MachineState::Stopping, "Decommissioning machine");
            (id, driver.stop(id).await)
        });
    }
    while let Some(joined) = stops.join_next().await {
        let (id, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Stop task aborted");
                continue;
            }
        };
        match outcome {
            // An id the backend already forgot is as stopped as it gets.
            Ok(()) | Err(DriverError::NotFound(_)) => {
                info!(machine = %id, state = ?MachineState::Stopped, "Machine stopped");
                report.stopped.insert(id);
            }
            Err(error) => {
                warn!(machine = %id, error = %error, "Stop failed");
                report.failed.push(MachineFailure {
                    id,
                    op: DriverOp::Stop,
                    state: MachineState::Stopping,
                    error,
                });
            }
        }
    }

    // Start the desired fleet tier by tier, so no machine comes up before
    // the types it depends on.
    for tier in &tiers {
        let mut starts = JoinSet::new();
        for &ty in tier {
            for id in desired.iter().copied().filter(|m| m.machine_type() == ty) {
                let missing_dep = policy.depends_on(ty).into_iter().find(|dep| {
                    config.fleet.count(*dep) > 0
                        && !report.running.keys().any(|r| r.machine_type() == *dep)
                });
                if let Some(missing) = missing_dep {
                    warn!(machine = %id, missing = %missing, "Skipping machine: dependency type not running");
                    report.skipped.insert(id, missing);
                    continue;
                }

                let driver = Arc::clone(&driver);
                let needs_boot = !existing.contains(&id);
                let restart = should_restart || restart_set.contains(&id);
                starts.spawn(start_machine(driver, id, master_id, needs_boot, restart));
            }
        }
        while let Some(joined) = starts.join_next().await {
            match joined {
                Ok(StartOutcome::Running {
                    id,
                    path,
                    restarted,
                }) => {
                    info!(machine = %id, path = %path, state = ?MachineState::Running, restarted, "Machine running");
                    report.running.insert(id, path);
                    if restarted {
                        report.restarted.insert(id);
                    }
                }
                Ok(StartOutcome::Failed(failure)) => {
                    warn!(
                        machine = %failure.id,
                        op = ?failure.op,
                        category = failure.error.category(),
                        error = %failure.error,
                        "Machine failed"
                    );
                    report.failed.push(failure);
                }
                Err(e) => {
                    warn!(error = %e, "Start task aborted");
                }
            }
        }
    }

    // Hand every running machine the paths of the types it consumes.
    let mut peers = BTreeMap::new();
    for &id in report.running.keys() {
        let mut peer_paths = BTreeMap::new();
        for dep in policy.depends_on(id.machine_type()) {
            for (&peer, path) in report
                .running
                .iter()
                .filter(|(peer, _)| peer.machine_type() == dep)
            {
                peer_paths.insert(peer, path.clone());
            }
        }
        peers.insert(id, peer_paths);
    }
    report.peers = peers;

    info!(
        running = report.running.len(),
        restarted = report.restarted.len(),
        stopped = report.stopped.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "Reconciliation pass complete"
    );
    Ok(report)
}

/// Drives one machine through boot → run. `run` for an id is never issued
/// before that same id's `boot` has completed.
async fn start_machine(
    driver: Arc<dyn ComputeDriver>,
    id: MachineId,
    master_id: VatId,
    needs_boot: bool,
    restart: bool,
) -> StartOutcome {
    if needs_boot {
        debug!(machine = %id, state = ?MachineState::Booting, "Booting machine");
        if let Err(error) = driver.boot(id).await {
            return StartOutcome::Failed(MachineFailure {
                id,
                op: DriverOp::Boot,
                state: MachineState::Booting,
                error,
            });
        }
    }

    debug!(machine = %id, state = ?MachineState::Booted, restart, "Starting agent");
    match driver.run(id, &master_id, restart).await {
        Ok(path) => StartOutcome::Running {
            id,
            path,
            restarted: restart,
        },
        Err(error) => StartOutcome::Failed(MachineFailure {
            id,
            op: DriverOp::Run,
            state: MachineState::Booted,
            error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report_is_converged() {
        assert!(ReconcileReport::default().is_converged());
    }

    #[test]
    fn test_skips_break_convergence() {
        let mut report = ReconcileReport::default();
        report.skipped.insert(
            MachineId::new(MachineType::Worker, 0),
            MachineType::Coordinator,
        );
        assert!(!report.is_converged());
    }
}
