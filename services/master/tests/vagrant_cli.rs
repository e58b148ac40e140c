//! Integration tests for the Vagrant driver against a stand-in toolchain.
//!
//! A shell script impersonates the vagrant binary: `up` detects
//! overlapping invocations through a lock file, `status` prints a canned
//! machine-readable inventory, `ssh` answers the run handshake. This
//! exercises the real subprocess plumbing without provisioning anything.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_id::{MachineId, MachineType};
use fleet_master::driver::ComputeDriver;
use fleet_master::vagrant::{VagrantConfig, VagrantDriver};
use fleet_vat::VatId;

fn fake_vagrant(dir: &Path) -> PathBuf {
    let path = dir.join("vagrant");
    let script = format!(
        r#"#!/bin/sh
dir="{dir}"
case "$1" in
  up)
    if [ -e "$dir/lock" ]; then echo "$2" >> "$dir/overlaps"; fi
    touch "$dir/lock"
    sleep 0.2
    rm -f "$dir/lock"
    echo "$2" >> "$dir/booted"
    ;;
  halt)
    echo "$2" >> "$dir/halted"
    ;;
  status)
    printf '1700000000,storage0,metadata,provider,virtualbox\n'
    printf '1700000000,storage0,state,running\n'
    printf '1700000000,worker0,state,poweroff\n'
    printf '1700000000,worker1,state,running\n'
    printf '1700000000,,ui,info,Current machine states:\n'
    ;;
  ssh)
    read -r _hello
    printf '{{"id":"{vat_id}","address":"127.0.0.1:7100"}}\n'
    ;;
esac
exit 0
"#,
        dir = dir.display(),
        vat_id = "ab".repeat(32),
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn driver_config(dir: &Path) -> VagrantConfig {
    VagrantConfig {
        vagrant_path: fake_vagrant(dir),
        fleet_dir: dir.to_path_buf(),
        log_sink_address: "127.0.0.1:0".parse().unwrap(),
        ..VagrantConfig::default()
    }
}

#[tokio::test]
async fn test_list_machines_reads_the_inventory() {
    let dir = tempfile::tempdir().unwrap();
    let driver = VagrantDriver::new(driver_config(dir.path())).await.unwrap();

    let machines = driver.list_machines().await.unwrap();
    assert_eq!(
        machines,
        vec![
            MachineId::new(MachineType::Storage, 0),
            MachineId::new(MachineType::Worker, 1),
        ]
    );
}

#[tokio::test]
async fn test_concurrent_boots_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(VagrantDriver::new(driver_config(dir.path())).await.unwrap());

    let first = {
        let driver = Arc::clone(&driver);
        tokio::spawn(async move { driver.boot(MachineId::new(MachineType::Storage, 0)).await })
    };
    let second = {
        let driver = Arc::clone(&driver);
        tokio::spawn(async move { driver.boot(MachineId::new(MachineType::Worker, 0)).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert!(
        !dir.path().join("overlaps").exists(),
        "provisioning commands overlapped"
    );
    let booted = std::fs::read_to_string(dir.path().join("booted")).unwrap();
    assert_eq!(booted.lines().count(), 2);
}

#[tokio::test]
async fn test_run_handshake_records_the_path_and_stop_invalidates_it() {
    let dir = tempfile::tempdir().unwrap();
    let driver = VagrantDriver::new(driver_config(dir.path())).await.unwrap();
    let storage0 = MachineId::new(MachineType::Storage, 0);

    let path = driver.run(storage0, &VatId::generate(), false).await.unwrap();
    assert_eq!(path.address(), "127.0.0.1:7100".parse().unwrap());
    assert_eq!(driver.status(storage0).await.path, Some(path));

    driver.stop(storage0).await.unwrap();
    assert_eq!(driver.status(storage0).await.path, None);
    let halted = std::fs::read_to_string(dir.path().join("halted")).unwrap();
    assert_eq!(halted.trim(), "storage0");
}
