//! Compute driver interface and mock implementation.
//!
//! A compute driver is the master's only window onto infrastructure. It
//! can enumerate the machines a backend considers running, power a
//! machine slot on, launch the machine agent on it (yielding the
//! machine's bootstrap path), and power it off again. Backends range from
//! local virtualization to cloud APIs; the master never talks to
//! machines except through the driver and the paths it returns.
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::MachineId;
use fleet_vat::{VatId, VatPath};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Errors a driver can report.
///
/// Every operation either fully completes its stated postcondition or
/// fails with one of these; there is no partial success.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The backend call misfired; the same call may be retried. Retry
    /// policy belongs to the caller, never the driver.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The requested identity cannot be satisfied (quota, naming
    /// collision, resource exhaustion). Retrying the same request will
    /// not help.
    #[error("machine slot cannot be allocated: {0}")]
    Allocation(String),

    /// The backend has no record of the machine. Usually a stale view;
    /// the caller should re-list.
    #[error("no machine known for id {0}")]
    NotFound(MachineId),
}

impl DriverError {
    /// Returns true if the same call may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }

    /// Short category label for aggregate reporting.
    pub fn category(&self) -> &'static str {
        match self {
            DriverError::Transient(_) => "transient",
            DriverError::Allocation(_) => "allocation",
            DriverError::NotFound(_) => "not-found",
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Transient(e.to_string())
    }
}

/// A machine's lifecycle view as reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatus {
    pub id: MachineId,

    /// Current bootstrap path, or `None` if the machine is not powered up
    /// with a running agent. Invalidated the moment any teardown of the
    /// machine begins, not when it completes: the path may already be
    /// unreachable once teardown starts.
    pub path: Option<VatPath>,
}

/// Machine power and process lifecycle over one infrastructure backend.
///
/// All operations are asynchronous and independent per machine. Dropping
/// a call's future does not guarantee the underlying infrastructure
/// operation was aborted; a later [`list_machines`](Self::list_machines)
/// is the only authoritative way to learn the outcome. No operation has
/// an intrinsic timeout.
#[async_trait]
pub trait ComputeDriver: Send + Sync {
    /// The address at which machines reached through this driver see the
    /// master. Stable for the process's lifetime.
    fn master_bind_address(&self) -> SocketAddr;

    /// All machines the backend currently considers running. An empty
    /// fleet is an empty list, not an error.
    async fn list_machines(&self) -> Result<Vec<MachineId>, DriverError>;

    /// Ensures the machine slot for `id` is powered on. Says nothing
    /// about the agent process. Booting an already-booted machine is a
    /// no-op success.
    async fn boot(&self, id: MachineId) -> Result<(), DriverError>;

    /// Ensures the machine agent is running on the (already booted)
    /// machine and returns its freshly established bootstrap path.
    ///
    /// `master_vat_id` is handed to the new process so it can address the
    /// master back. When `require_restart_process` is true, any existing
    /// agent on the machine is terminated and started anew before the
    /// path is established; this is the only way to guarantee a binary or
    /// config update takes effect. A forced restart is usually much
    /// faster than a full stop/boot/run cycle, but not as reliable;
    /// callers may fall back to the full cycle when it fails.
    async fn run(
        &self,
        id: MachineId,
        master_vat_id: &VatId,
        require_restart_process: bool,
    ) -> Result<VatPath, DriverError>;

    /// Powers the machine down. Stopping an already-stopped machine is a
    /// no-op success. The machine's path is dead from the moment this is
    /// invoked, even before it resolves.
    async fn stop(&self, id: MachineId) -> Result<(), DriverError>;
}

/// One driver call, as recorded by [`MockDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    List,
    Boot(MachineId),
    Run { machine: MachineId, restart: bool },
    Stop(MachineId),
}

#[derive(Debug, Clone)]
struct MockMachine {
    path: Option<VatPath>,
}

#[derive(Debug, Default)]
struct MockState {
    /// Powered-on machines. Presence in the map is the backend's notion
    /// of existence; `path` is set once an agent handshake completed.
    machines: BTreeMap<MachineId, MockMachine>,
    fail_boot: BTreeSet<MachineId>,
    fail_run: BTreeSet<MachineId>,
    fail_stop: BTreeSet<MachineId>,
    calls: Vec<DriverCall>,
    next_port: u16,
}

/// Mock driver for testing and development.
///
/// Keeps the whole fleet in memory, hands out monotonically increasing
/// bootstrap addresses, and records every call for assertions. Individual
/// machines can be made to fail each operation.
pub struct MockDriver {
    state: Mutex<MockState>,
    boot_delay: Duration,
    run_delay: Duration,
    boots_in_flight: AtomicUsize,
    boot_overlap: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_port: 7000,
                ..MockState::default()
            }),
            boot_delay: Duration::ZERO,
            run_delay: Duration::ZERO,
            boots_in_flight: AtomicUsize::new(0),
            boot_overlap: AtomicBool::new(false),
        }
    }

    /// Makes every `boot` take this long, for overlap and cancellation
    /// tests.
    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    /// Makes every `run` handshake take this long.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Seeds a machine the backend already considers running.
    pub async fn insert_running(&self, id: MachineId) {
        let mut state = self.state.lock().await;
        state.machines.insert(id, MockMachine { path: None });
    }

    /// Makes `boot(id)` fail with an allocation error.
    pub async fn fail_boot(&self, id: MachineId) {
        self.state.lock().await.fail_boot.insert(id);
    }

    /// Makes `run(id, ..)` fail with a transient error.
    pub async fn fail_run(&self, id: MachineId) {
        self.state.lock().await.fail_run.insert(id);
    }

    /// Makes `stop(id)` fail with a transient error.
    pub async fn fail_stop(&self, id: MachineId) {
        self.state.lock().await.fail_stop.insert(id);
    }

    /// Every driver call so far, in invocation order.
    pub async fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().await.calls.clone()
    }

    /// The machine's current lifecycle view.
    pub async fn status(&self, id: MachineId) -> MachineStatus {
        let state = self.state.lock().await;
        MachineStatus {
            id,
            path: state.machines.get(&id).and_then(|m| m.path.clone()),
        }
    }

    /// True if two `boot` calls were ever in flight at once.
    pub fn boot_overlap_detected(&self) -> bool {
        self.boot_overlap.load(Ordering::SeqCst)
    }

    fn fresh_path(state: &mut MockState) -> VatPath {
        let port = state.next_port;
        state.next_port += 1;
        VatPath::new(VatId::generate(), SocketAddr::from(([127, 0, 0, 1], port)))
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeDriver for MockDriver {
    fn master_bind_address(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 29400))
    }

    async fn list_machines(&self) -> Result<Vec<MachineId>, DriverError> {
        let mut state = self.state.lock().await;
        state.calls.push(DriverCall::List);
        Ok(state.machines.keys().copied().collect())
    }

    async fn boot(&self, id: MachineId) -> Result<(), DriverError> {
        {
            let mut state = self.state.lock().await;
            state.calls.push(DriverCall::Boot(id));
            if state.fail_boot.contains(&id) {
                return Err(DriverError::Allocation(format!(
                    "mock driver configured to fail boot of {id}"
                )));
            }
        }

        let in_flight = self.boots_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        if in_flight > 1 {
            self.boot_overlap.store(true, Ordering::SeqCst);
        }
        if !self.boot_delay.is_zero() {
            tokio::time::sleep(self.boot_delay).await;
        }
        self.boots_in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        state
            .machines
            .entry(id)
            .or_insert(MockMachine { path: None });
        debug!(machine = %id, "[MOCK] Machine booted");
        Ok(())
    }

    async fn run(
        &self,
        id: MachineId,
        _master_vat_id: &VatId,
        require_restart_process: bool,
    ) -> Result<VatPath, DriverError> {
        let (path, fresh) = {
            let mut state = self.state.lock().await;
            state.calls.push(DriverCall::Run {
                machine: id,
                restart: require_restart_process,
            });
            if state.fail_run.contains(&id) {
                return Err(DriverError::Transient(format!(
                    "mock driver configured to fail run on {id}"
                )));
            }
            let existing = match state.machines.get(&id) {
                Some(machine) => machine.path.clone(),
                None => return Err(DriverError::NotFound(id)),
            };
            match existing {
                Some(path) if !require_restart_process => (path, false),
                _ => (Self::fresh_path(&mut state), true),
            }
        };

        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }

        if fresh {
            let mut state = self.state.lock().await;
            // A stop() during the handshake removes the entry; the path
            // we hand back is then already dead and must not be retained.
            if let Some(machine) = state.machines.get_mut(&id) {
                machine.path = Some(path.clone());
            }
        }

        info!(machine = %id, path = %path, "[MOCK] Agent running");
        Ok(path)
    }

    async fn stop(&self, id: MachineId) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        state.calls.push(DriverCall::Stop(id));
        if state.fail_stop.contains(&id) {
            return Err(DriverError::Transient(format!(
                "mock driver configured to fail stop of {id}"
            )));
        }
        state.machines.remove(&id);
        info!(machine = %id, "[MOCK] Machine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fleet_id::MachineType;

    use super::*;

    fn storage0() -> MachineId {
        MachineId::new(MachineType::Storage, 0)
    }

    #[tokio::test]
    async fn test_boot_run_stop_cycle() {
        let driver = MockDriver::new();
        let master = VatId::generate();
        let id = storage0();

        driver.boot(id).await.unwrap();
        let path = driver.run(id, &master, false).await.unwrap();
        assert_eq!(driver.status(id).await.path, Some(path));

        driver.stop(id).await.unwrap();
        assert_eq!(driver.status(id).await.path, None);
        assert!(driver.list_machines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_boot_is_idempotent() {
        let driver = MockDriver::new();
        let id = storage0();

        driver.boot(id).await.unwrap();
        driver.boot(id).await.unwrap();
        assert_eq!(driver.list_machines().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_run_without_boot_is_not_found() {
        let driver = MockDriver::new();
        let master = VatId::generate();

        let err = driver.run(storage0(), &master, false).await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_plain_run_reuses_path_restart_replaces_it() {
        let driver = MockDriver::new();
        let master = VatId::generate();
        let id = storage0();
        driver.boot(id).await.unwrap();

        let first = driver.run(id, &master, false).await.unwrap();
        let again = driver.run(id, &master, false).await.unwrap();
        assert_eq!(first, again);

        let restarted = driver.run(id, &master, true).await.unwrap();
        assert_ne!(first, restarted);
        assert_eq!(driver.status(id).await.path, Some(restarted));
    }

    #[tokio::test]
    async fn test_stop_during_handshake_leaves_machine_unaddressable() {
        let driver = Arc::new(MockDriver::new().with_run_delay(Duration::from_millis(100)));
        let master = VatId::generate();
        let id = storage0();
        driver.boot(id).await.unwrap();

        let running = {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move { driver.run(id, &master, false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.stop(id).await.unwrap();

        // The handshake still resolves with a path, but the machine must
        // not be addressable afterwards.
        running.await.unwrap().unwrap();
        assert_eq!(driver.status(id).await.path, None);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let driver = MockDriver::new();
        let master = VatId::generate();
        let id = storage0();

        driver.fail_boot(id).await;
        let err = driver.boot(id).await.unwrap_err();
        assert_eq!(err.category(), "allocation");

        let other = MachineId::new(MachineType::Worker, 3);
        driver.boot(other).await.unwrap();
        driver.fail_run(other).await;
        let err = driver.run(other, &master, false).await.unwrap_err();
        assert!(err.is_transient());
    }
}
