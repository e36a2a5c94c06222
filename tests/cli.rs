use predicates::prelude::*;
use std::io::Write;

fn proxup() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("proxup").unwrap();
    // Credentials from the developer's shell must not leak into tests.
    for var in [
        "PROXUP_ENDPOINT",
        "PROXUP_API_TOKEN",
        "PROXUP_USERNAME",
        "PROXUP_PASSWORD",
        "PROXUP_INSECURE",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn write_test_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("talos.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(
        f,
        r#"
file_download:
  resource_name: talos-iso
  content_type: iso
  datastore_id: local
  file_name: talos.iso
  node_name: pve1
  url: https://example.com/talos.iso

virtual_machine:
  resource_name: talos
  name: talos-vm
  node_name: pve1
  vm_id: 100
  count: 2
  disks:
    - system:
        interface: scsi0
        datastore_id: local-lvm
        size: 20
  network_devices:
    - lan:
        bridge: vmbr0
  vga:
    type: qxl
  agent:
    enabled: true
  memory:
    dedicated: 4096
  cpu:
    cores: 2
  efi_disk:
    datastore_id: local-lvm
  cdrom:
    enabled: true
    interface: ide3
  operating_system:
    type: l26
"#
    )
    .unwrap();
    path
}

#[test]
fn help_works() {
    proxup()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Declarative Proxmox VM provisioning",
        ));
}

#[test]
fn plan_prints_replicated_vms() {
    let dir = tempfile::tempdir().unwrap();
    write_test_config(&dir);

    proxup()
        .args(["--config-dir", dir.path().to_str().unwrap(), "plan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("talos-1"))
        .stdout(predicate::str::contains("talos-vm-01"))
        .stdout(predicate::str::contains("talos-vm-02"));
}

#[test]
fn plan_json_output_is_structured() {
    let dir = tempfile::tempdir().unwrap();
    write_test_config(&dir);

    proxup()
        .args([
            "--config-dir",
            dir.path().to_str().unwrap(),
            "--output",
            "json",
            "plan",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"downloads\""))
        .stdout(predicate::str::contains("\"talos-vm-02\""));
}

#[test]
fn plan_fails_on_missing_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(
        &path,
        r#"
virtual_machine:
  resource_name: broken
  name: broken-vm
  vm_id: 300
  vga:
    type: std
  memory:
    dedicated: 1024
  cpu:
    cores: 1
  efi_disk:
    datastore_id: local-lvm
  cdrom:
    enabled: true
  operating_system:
    type: l26
"#,
    )
    .unwrap();

    proxup()
        .args(["--config-dir", dir.path().to_str().unwrap(), "plan"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing required section `agent`"));
}

#[test]
fn validate_reports_each_file() {
    let dir = tempfile::tempdir().unwrap();
    write_test_config(&dir);

    proxup()
        .args(["--config-dir", dir.path().to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok:"))
        .stdout(predicate::str::contains("2 VMs"));
}

#[test]
fn invalid_yaml_sibling_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    write_test_config(&dir);
    std::fs::write(dir.path().join("aaa-bad.yaml"), "virtual_machine: [::").unwrap();

    proxup()
        .args(["--config-dir", dir.path().to_str().unwrap(), "plan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("talos-vm-01"));
}

#[test]
fn up_requires_credentials() {
    let dir = tempfile::tempdir().unwrap();
    write_test_config(&dir);

    proxup()
        .args(["--config-dir", dir.path().to_str().unwrap(), "up"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("PROXUP_ENDPOINT"));
}

#[test]
fn up_with_empty_config_dir_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();

    proxup()
        .args(["--config-dir", dir.path().to_str().unwrap(), "up"])
        .env("PROXUP_ENDPOINT", "https://pve.example:8006")
        .env("PROXUP_API_TOKEN", "root@pam!ci=00000000-0000-0000-0000-000000000000")
        .env("PROXUP_USERNAME", "root@pam")
        .env("PROXUP_PASSWORD", "secret")
        .assert()
        .success()
        .stderr(predicate::str::contains("nothing to do"));
}
