//! Vagrant-backed reference compute driver.
//!
//! Manages a fleet of local Vagrant virtual machines, one per machine id,
//! named by the canonical id form. Vagrant cannot provision two machines
//! at once (concurrent `vagrant up` invocations race on the shared
//! machine state directory), so boots funnel through a FIFO gate and
//! reach the toolchain strictly one at a time, in arrival order.
//!
//! The driver retains each machine's last bootstrap path: Vagrant itself
//! cannot report one; only the driver, which performed the run handshake,
//! knows it. The retained map is an addressing cache, never the source of
//! truth for existence. `list_machines` always asks the toolchain. The
//! driver also hosts the log-collection endpoint every machine streams
//! records to.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use fleet_id::MachineId;
use fleet_vat::{VatId, VatPath};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::driver::{ComputeDriver, DriverError, MachineStatus};
use crate::logsink::LogSink;

/// Configuration for the Vagrant driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VagrantConfig {
    /// Path to the vagrant binary.
    pub vagrant_path: PathBuf,

    /// Directory holding the Vagrantfile; all commands run here.
    pub fleet_dir: PathBuf,

    /// Command that starts the machine agent inside a VM.
    pub agent_command: String,

    /// Address at which machines reach the master. From inside a NAT'd
    /// Vagrant VM the host is 10.0.2.2.
    pub master_bind_address: SocketAddr,

    /// Address the log-collection endpoint binds to. Port 0 picks an
    /// ephemeral port; machines are given the master-side IP with the
    /// bound port.
    pub log_sink_address: SocketAddr,
}

impl Default for VagrantConfig {
    fn default() -> Self {
        Self {
            vagrant_path: PathBuf::from("vagrant"),
            fleet_dir: PathBuf::from("."),
            agent_command: "/usr/local/bin/fleet-machine".to_string(),
            master_bind_address: SocketAddr::from((Ipv4Addr::new(10, 0, 2, 2), 30400)),
            log_sink_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}

#[derive(Debug, Default)]
struct AddressCache {
    paths: BTreeMap<MachineId, VatPath>,

    /// Bumped the moment teardown of a machine begins. A run handshake
    /// that resolves after the bump must not publish its path: the
    /// address was dead before it was learned.
    halt_epochs: BTreeMap<MachineId, u64>,
}

/// Compute driver over a directory of Vagrant-managed VMs.
pub struct VagrantDriver {
    config: VagrantConfig,
    cache: RwLock<AddressCache>,
    log_sink: LogSink,

    /// Single provisioning slot; see the module docs.
    boot_gate: Mutex<()>,
}

impl VagrantDriver {
    /// Creates the driver and binds its log-collection endpoint. The
    /// endpoint address is fixed before any machine can be told to run.
    pub async fn new(config: VagrantConfig) -> std::io::Result<Self> {
        let log_sink = LogSink::bind(config.log_sink_address).await?;
        let driver = Self {
            config,
            cache: RwLock::new(AddressCache::default()),
            log_sink,
            boot_gate: Mutex::new(()),
        };
        info!(addr = %driver.log_sink_address(), "Log sink ready");
        Ok(driver)
    }

    /// The address machines stream log records to: the master-side IP
    /// with the sink's bound port.
    pub fn log_sink_address(&self) -> SocketAddr {
        SocketAddr::new(
            self.config.master_bind_address.ip(),
            self.log_sink.local_addr().port(),
        )
    }

    /// The machine's lifecycle view per the addressing cache. Existence
    /// is Vagrant's call, not the cache's; use
    /// [`list_machines`](ComputeDriver::list_machines) for that.
    pub async fn status(&self, id: MachineId) -> MachineStatus {
        let cache = self.cache.read().await;
        MachineStatus {
            id,
            path: cache.paths.get(&id).cloned(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.config.vagrant_path);
        cmd.args(args).current_dir(&self.config.fleet_dir);
        cmd
    }

    async fn vagrant_output(&self, args: &[&str]) -> Result<std::process::Output, DriverError> {
        Ok(self.command(args).stdin(Stdio::null()).output().await?)
    }
}

#[async_trait]
impl ComputeDriver for VagrantDriver {
    fn master_bind_address(&self) -> SocketAddr {
        self.config.master_bind_address
    }

    async fn list_machines(&self) -> Result<Vec<MachineId>, DriverError> {
        let output = self
            .vagrant_output(&["status", "--machine-readable"])
            .await?;
        if !output.status.success() {
            return Err(DriverError::Transient(format!(
                "vagrant status exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_status_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn boot(&self, id: MachineId) -> Result<(), DriverError> {
        let name = id.to_string();

        let _slot = self.boot_gate.lock().await;
        info!(machine = %id, "Booting machine");
        let output = self.vagrant_output(&["up", &name]).await?;
        if !output.status.success() {
            return Err(DriverError::Allocation(format!(
                "vagrant up {} exited with {}: {}",
                name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(machine = %id, "Machine booted");
        Ok(())
    }

    async fn run(
        &self,
        id: MachineId,
        master_vat_id: &VatId,
        require_restart_process: bool,
    ) -> Result<VatPath, DriverError> {
        let name = id.to_string();

        if require_restart_process {
            // A machine with no live agent makes pkill exit nonzero;
            // that is not a failure to restart.
            info!(machine = %id, "Terminating existing agent");
            self.vagrant_output(&["ssh", &name, "-c", "sudo pkill -x fleet-machine || true"])
                .await?;
        }

        // Snapshot the teardown epoch; a stop() racing this handshake
        // invalidates the path we are about to learn.
        let epoch = {
            let cache = self.cache.read().await;
            cache.halt_epochs.get(&id).copied().unwrap_or(0)
        };

        let agent = format!(
            "{} --machine {} --log-sink {} --master {}",
            self.config.agent_command,
            name,
            self.log_sink_address(),
            self.config.master_bind_address
        );
        debug!(machine = %id, command = %agent, "Starting agent");
        let mut child = self
            .command(&["ssh", &name, "-c", &agent])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Hand the new process the master's identity, then wait for it to
        // report the bootstrap path it established.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Transient("agent stdin unavailable".to_string()))?;
        let mut hello =
            serde_json::to_vec(master_vat_id).map_err(|e| DriverError::Transient(e.to_string()))?;
        hello.push(b'\n');
        stdin.write_all(&hello).await?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Transient("agent stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DriverError::Transient("agent stderr unavailable".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let Some(line) = lines.next_line().await? else {
            // The session died before the handshake: either the machine
            // does not exist or the agent failed to come up.
            let status = child.wait().await?;
            let mut detail = String::new();
            stderr.read_to_string(&mut detail).await.ok();
            let detail = detail.trim();
            if detail.contains("not created") || detail.contains("unknown machine") {
                return Err(DriverError::NotFound(id));
            }
            return Err(DriverError::Transient(format!(
                "agent on {} exited with {} before the handshake: {}",
                name, status, detail
            )));
        };
        let path: VatPath = serde_json::from_str(&line)
            .map_err(|e| DriverError::Transient(format!("bad handshake from {}: {}", name, e)))?;

        // The ssh session stays attached to the agent; reap it in the
        // background.
        let session_name = name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(machine = %session_name, %status, "Agent session ended"),
                Err(e) => warn!(machine = %session_name, error = %e, "Agent session lost"),
            }
        });

        let mut cache = self.cache.write().await;
        if cache.halt_epochs.get(&id).copied().unwrap_or(0) == epoch {
            cache.paths.insert(id, path.clone());
        } else {
            debug!(machine = %id, "Machine torn down during handshake; path not retained");
        }
        info!(machine = %id, path = %path, "Agent running");
        Ok(path)
    }

    async fn stop(&self, id: MachineId) -> Result<(), DriverError> {
        let name = id.to_string();

        {
            // Invalidate the path the moment teardown begins, not when it
            // completes.
            let mut cache = self.cache.write().await;
            cache.paths.remove(&id);
            *cache.halt_epochs.entry(id).or_insert(0) += 1;
        }

        info!(machine = %id, "Stopping machine");
        let output = self.vagrant_output(&["halt", &name]).await?;
        if !output.status.success() {
            return Err(DriverError::Transient(format!(
                "vagrant halt {} exited with {}: {}",
                name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(machine = %id, "Machine stopped");
        Ok(())
    }
}

/// Parses `vagrant status --machine-readable` output into the running
/// machine ids. Lines are `timestamp,target,type,data`; only
/// `state,running` rows whose target parses as a machine name count.
fn parse_status_output(output: &str) -> Vec<MachineId> {
    let mut machines = Vec::new();
    for line in output.lines() {
        let mut fields = line.splitn(4, ',');
        let (Some(_ts), Some(target), Some(kind), Some(data)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if kind != "state" || data != "running" {
            continue;
        }
        match MachineId::parse(target) {
            Ok(id) => machines.push(id),
            Err(_) => debug!(machine = target, "Ignoring foreign machine in inventory"),
        }
    }
    machines
}

#[cfg(test)]
mod tests {
    use fleet_id::MachineType;

    use super::*;

    #[test]
    fn test_parse_status_output() {
        let output = "\
1700000000,storage0,metadata,provider,virtualbox
1700000000,storage0,state,running
1700000000,worker0,state,poweroff
1700000000,worker1,state,running
1700000000,bastion,state,running
1700000000,,ui,info,Current machine states:
garbage line
";
        let machines = parse_status_output(output);
        assert_eq!(
            machines,
            vec![
                MachineId::new(MachineType::Storage, 0),
                MachineId::new(MachineType::Worker, 1),
            ]
        );
    }

    #[test]
    fn test_parse_status_output_empty() {
        assert!(parse_status_output("").is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = VagrantConfig::default();
        assert_eq!(config.vagrant_path, PathBuf::from("vagrant"));
        assert_eq!(config.master_bind_address.port(), 30400);
        assert_eq!(config.log_sink_address.port(), 0);
    }
}
