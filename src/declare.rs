use std::path::Path;

use serde::Serialize;

use crate::config::{
    self, DiskConfig, LoadedDocument, NetworkDeviceConfig, VirtualMachineConfig,
};
use crate::error::ProvisionError;

// ── Declarations ──────────────────────────────────────────

/// Desired-state description of a boot image download on the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct FileDownloadDeclaration {
    pub resource_name: String,
    pub overwrite: Option<bool>,
    pub overwrite_unmanaged: Option<bool>,
    pub content_type: Option<String>,
    pub datastore_id: Option<String>,
    pub file_name: Option<String>,
    pub node_name: Option<String>,
    pub url: Option<String>,
    pub retain_on_delete: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskDeclaration {
    pub interface: Option<String>,
    pub datastore_id: Option<String>,
    pub file_format: Option<String>,
    pub size: Option<u64>,
    pub iothread: Option<bool>,
    pub ssd: Option<bool>,
    pub discard: Option<String>,
    pub speed_read: Option<u64>,
    pub speed_write: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkDeviceDeclaration {
    pub bridge: Option<String>,
    pub model: Option<String>,
    pub vlan_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VgaDeclaration {
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentDeclaration {
    pub enabled: Option<bool>,
    pub trim: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryDeclaration {
    pub dedicated: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuDeclaration {
    pub architecture: Option<String>,
    pub r#type: Option<String>,
    pub sockets: Option<u32>,
    pub cores: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EfiDiskDeclaration {
    pub datastore_id: Option<String>,
    pub file_format: Option<String>,
    pub pre_enrolled_keys: Option<bool>,
    pub r#type: Option<String>,
}

/// Index of a download declaration within the stack. The optical drive's
/// boot medium is that download's resulting volume, so the VM cannot be
/// realized before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadRef(pub usize);

#[derive(Debug, Clone, Serialize)]
pub struct CdromDeclaration {
    pub enabled: Option<bool>,
    pub interface: Option<String>,
    pub file: DownloadRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatingSystemDeclaration {
    pub r#type: Option<String>,
}

/// Timeouts forwarded to the provider as opaque parameters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeouts {
    pub clone: Option<u64>,
    pub create: Option<u64>,
    pub migrate: Option<u64>,
    pub reboot: Option<u64>,
    pub shutdown: Option<u64>,
    pub start: Option<u64>,
    pub stop: Option<u64>,
}

/// One virtual machine as submitted for realization.
#[derive(Debug, Clone, Serialize)]
pub struct VmDeclaration {
    pub resource_name: String,
    pub name: String,
    pub vm_id: u32,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub node_name: Option<String>,
    pub acpi: Option<bool>,
    pub bios: Option<String>,
    pub machine_type: Option<String>,
    pub boot_orders: Vec<String>,
    pub on_boot: Option<bool>,
    pub started: Option<bool>,
    pub reboot: Option<bool>,
    pub stop_on_destroy: Option<bool>,
    pub keyboard_layout: Option<String>,
    pub scsi_hardware: Option<String>,
    pub timeouts: Timeouts,
    pub vga: VgaDeclaration,
    pub agent: AgentDeclaration,
    pub memory: MemoryDeclaration,
    pub cpu: CpuDeclaration,
    pub efi_disk: EfiDiskDeclaration,
    pub cdrom: CdromDeclaration,
    pub operating_system: OperatingSystemDeclaration,
    pub disks: Vec<DiskDeclaration>,
    pub network_devices: Vec<NetworkDeviceDeclaration>,
    pub ignore_changes: Vec<String>,
}

/// Append-only collection of everything declared across all config files.
/// VM order here is the export order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stack {
    pub downloads: Vec<FileDownloadDeclaration>,
    pub vms: Vec<VmDeclaration>,
}

// ── Builder ───────────────────────────────────────────────

/// Build the full declaration stack from the loaded documents, in order.
pub fn build_stack(docs: &[LoadedDocument]) -> Result<Stack, ProvisionError> {
    let mut stack = Stack::default();
    for doc in docs {
        build_document(doc, &mut stack)?;
    }
    Ok(stack)
}

/// Append one document's declarations: a single download plus `count` VMs
/// referencing it.
fn build_document(doc: &LoadedDocument, stack: &mut Stack) -> Result<(), ProvisionError> {
    let download_ref = DownloadRef(stack.downloads.len());
    stack.downloads.push(build_download(&doc.document));

    let vm = &doc.document.virtual_machine;
    let path = doc.path.as_path();

    let base_resource_name =
        require_field(vm.resource_name.as_deref(), "virtual_machine.resource_name", path)?;
    let base_name = require_field(vm.name.as_deref(), "virtual_machine.name", path)?;
    let base_id = require_field(vm.vm_id, "virtual_machine.vm_id", path)?;

    let vga = require_section(vm.vga.as_ref(), "vga", path)?;
    let agent = require_section(vm.agent.as_ref(), "agent", path)?;
    let memory = require_section(vm.memory.as_ref(), "memory", path)?;
    let cpu = require_section(vm.cpu.as_ref(), "cpu", path)?;
    let efi_disk = require_section(vm.efi_disk.as_ref(), "efi_disk", path)?;
    let cdrom = require_section(vm.cdrom.as_ref(), "cdrom", path)?;
    let operating_system =
        require_section(vm.operating_system.as_ref(), "operating_system", path)?;

    let disks = flatten_disks(vm);
    let network_devices = flatten_network_devices(vm);
    let count = vm.count.unwrap_or(1);

    for i in 0..count {
        stack.vms.push(VmDeclaration {
            // Two independent suffix formats: `-1` for the resource
            // identifier, `-01` for the display name.
            resource_name: format!("{base_resource_name}-{}", i + 1),
            name: format!("{base_name}-0{}", i + 1),
            vm_id: base_id + i,
            description: vm.description.clone(),
            tags: vm.tags.clone(),
            node_name: vm.node_name.clone(),
            acpi: vm.acpi,
            bios: vm.bios.clone(),
            machine_type: vm.machine_type.clone(),
            boot_orders: vm.boot_orders.clone(),
            on_boot: vm.on_boot,
            started: vm.started,
            reboot: vm.reboot,
            stop_on_destroy: vm.stop_on_destroy,
            keyboard_layout: vm.keyboard_layout.clone(),
            scsi_hardware: vm.scsi_hardware.clone(),
            timeouts: Timeouts {
                clone: vm.timeout_clone,
                create: vm.timeout_create,
                migrate: vm.timeout_migrate,
                reboot: vm.timeout_reboot,
                shutdown: vm.timeout_shutdown,
                start: vm.timeout_start,
                stop: vm.timeout_stop,
            },
            vga: VgaDeclaration {
                r#type: vga.r#type.clone(),
            },
            agent: AgentDeclaration {
                enabled: agent.enabled,
                trim: agent.trim,
            },
            memory: MemoryDeclaration {
                dedicated: memory.dedicated,
            },
            cpu: CpuDeclaration {
                architecture: cpu.architecture.clone(),
                r#type: cpu.r#type.clone(),
                sockets: cpu.sockets,
                cores: cpu.cores,
            },
            efi_disk: EfiDiskDeclaration {
                datastore_id: efi_disk.datastore_id.clone(),
                file_format: efi_disk.file_format.clone(),
                pre_enrolled_keys: efi_disk.pre_enrolled_keys,
                r#type: efi_disk.r#type.clone(),
            },
            cdrom: CdromDeclaration {
                enabled: cdrom.enabled,
                interface: cdrom.interface.clone(),
                file: download_ref,
            },
            operating_system: OperatingSystemDeclaration {
                r#type: operating_system.r#type.clone(),
            },
            disks: disks.clone(),
            network_devices: network_devices.clone(),
            ignore_changes: doc.document.resource_options.ignore_changes.clone(),
        });
    }

    Ok(())
}

fn build_download(document: &config::ConfigDocument) -> FileDownloadDeclaration {
    let fd = &document.file_download;
    FileDownloadDeclaration {
        resource_name: fd.resource_name.clone(),
        overwrite: fd.overwrite,
        overwrite_unmanaged: fd.overwrite_unmanaged,
        content_type: fd.content_type.clone(),
        datastore_id: fd.datastore_id.clone(),
        file_name: fd.file_name.clone(),
        node_name: fd.node_name.clone(),
        url: fd.url.clone(),
        retain_on_delete: document.resource_options.retain_on_delete,
    }
}

/// Flatten the `disks` list of single-entry mappings, preserving list order.
/// The label key only names the entry in the config file.
fn flatten_disks(vm: &VirtualMachineConfig) -> Vec<DiskDeclaration> {
    vm.disks
        .iter()
        .flat_map(|entry| entry.values())
        .map(disk_declaration)
        .collect()
}

fn disk_declaration(disk: &DiskConfig) -> DiskDeclaration {
    DiskDeclaration {
        interface: disk.interface.clone(),
        datastore_id: disk.datastore_id.clone(),
        file_format: disk.file_format.clone(),
        size: disk.size,
        iothread: disk.iothread,
        ssd: disk.ssd,
        discard: disk.discard.clone(),
        speed_read: disk.speed.as_ref().and_then(|s| s.read),
        speed_write: disk.speed.as_ref().and_then(|s| s.write),
    }
}

fn flatten_network_devices(vm: &VirtualMachineConfig) -> Vec<NetworkDeviceDeclaration> {
    vm.network_devices
        .iter()
        .flat_map(|entry| entry.values())
        .map(|dev: &NetworkDeviceConfig| NetworkDeviceDeclaration {
            bridge: dev.bridge.clone(),
            model: dev.model.clone(),
            vlan_id: dev.vlan_id,
        })
        .collect()
}

fn require_section<'a, T>(
    value: Option<&'a T>,
    section: &'static str,
    path: &Path,
) -> Result<&'a T, ProvisionError> {
    value.ok_or_else(|| ProvisionError::MissingSection {
        section,
        path: path.display().to_string(),
    })
}

fn require_field<T>(
    value: Option<T>,
    field: &'static str,
    path: &Path,
) -> Result<T, ProvisionError> {
    value.ok_or_else(|| ProvisionError::MissingField {
        field,
        path: path.display().to_string(),
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::config::tests::parse_full_doc;
    use std::path::PathBuf;

    pub fn loaded(document: crate::config::ConfigDocument) -> LoadedDocument {
        LoadedDocument {
            path: PathBuf::from("/tmp/talos.yaml"),
            document,
        }
    }

    #[test]
    fn replication_names_and_ids() {
        let stack = build_stack(&[loaded(parse_full_doc())]).unwrap();
        assert_eq!(stack.downloads.len(), 1);
        assert_eq!(stack.vms.len(), 3);

        let resource_names: Vec<&str> =
            stack.vms.iter().map(|v| v.resource_name.as_str()).collect();
        assert_eq!(resource_names, vec!["talos-1", "talos-2", "talos-3"]);

        let names: Vec<&str> = stack.vms.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["talos-vm-01", "talos-vm-02", "talos-vm-03"]);

        let ids: Vec<u32> = stack.vms.iter().map(|v| v.vm_id).collect();
        assert_eq!(ids, vec![100, 101, 102]);
    }

    #[test]
    fn count_defaults_to_one() {
        let mut doc = parse_full_doc();
        doc.virtual_machine.count = None;
        let stack = build_stack(&[loaded(doc)]).unwrap();
        assert_eq!(stack.vms.len(), 1);
        assert_eq!(stack.vms[0].resource_name, "talos-1");
        assert_eq!(stack.vms[0].name, "talos-vm-01");
    }

    #[test]
    fn missing_agent_section_is_fatal() {
        let mut doc = parse_full_doc();
        doc.virtual_machine.agent = None;
        let err = build_stack(&[loaded(doc)]).unwrap_err();
        match err {
            ProvisionError::MissingSection { section, path } => {
                assert_eq!(section, "agent");
                assert_eq!(path, "/tmp/talos.yaml");
            }
            other => panic!("expected MissingSection, got {other:?}"),
        }
    }

    #[test]
    fn missing_vm_id_is_fatal() {
        let mut doc = parse_full_doc();
        doc.virtual_machine.vm_id = None;
        let err = build_stack(&[loaded(doc)]).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::MissingField {
                field: "virtual_machine.vm_id",
                ..
            }
        ));
    }

    #[test]
    fn disks_flatten_in_source_order() {
        let stack = build_stack(&[loaded(parse_full_doc())]).unwrap();
        let disks = &stack.vms[0].disks;
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].interface.as_deref(), Some("scsi0"));
        assert_eq!(disks[0].size, Some(20));
        assert_eq!(disks[0].iothread, Some(true));
        assert_eq!(disks[1].interface.as_deref(), Some("scsi1"));
        assert_eq!(disks[1].speed_read, Some(300));
        assert_eq!(disks[1].speed_write, Some(150));
    }

    #[test]
    fn network_devices_flatten_in_source_order() {
        let stack = build_stack(&[loaded(parse_full_doc())]).unwrap();
        let nets = &stack.vms[0].network_devices;
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[0].bridge.as_deref(), Some("vmbr0"));
        assert_eq!(nets[0].vlan_id, None);
        assert_eq!(nets[1].bridge.as_deref(), Some("vmbr1"));
        assert_eq!(nets[1].vlan_id, Some(42));
    }

    #[test]
    fn cdrom_references_own_documents_download() {
        let stack = build_stack(&[loaded(parse_full_doc()), loaded(parse_full_doc())]).unwrap();
        assert_eq!(stack.downloads.len(), 2);
        assert_eq!(stack.vms.len(), 6);
        for vm in &stack.vms[..3] {
            assert_eq!(vm.cdrom.file, DownloadRef(0));
        }
        for vm in &stack.vms[3..] {
            assert_eq!(vm.cdrom.file, DownloadRef(1));
        }
    }

    #[test]
    fn download_copies_document_fields() {
        let stack = build_stack(&[loaded(parse_full_doc())]).unwrap();
        let dl = &stack.downloads[0];
        assert_eq!(dl.resource_name, "talos-iso");
        assert_eq!(dl.content_type.as_deref(), Some("iso"));
        assert_eq!(dl.datastore_id.as_deref(), Some("local"));
        assert_eq!(dl.node_name.as_deref(), Some("pve1"));
        assert_eq!(dl.retain_on_delete, Some(true));
    }

    #[test]
    fn ignore_changes_carried_onto_vms() {
        let stack = build_stack(&[loaded(parse_full_doc())]).unwrap();
        assert_eq!(stack.vms[0].ignore_changes, vec!["cdrom"]);
    }
}
