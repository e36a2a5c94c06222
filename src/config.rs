use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ProvisionError;

// ── Document schema ───────────────────────────────────────

/// One parsed configuration file. Every top-level section tolerates
/// absence; required fields inside `virtual_machine` are enforced by the
/// builder (a missing section is a fatal build error, not a parse error).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub file_download: FileDownloadConfig,
    #[serde(default)]
    pub resource_options: ResourceOptionsConfig,
    #[serde(default)]
    pub virtual_machine: VirtualMachineConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileDownloadConfig {
    #[serde(default)]
    pub resource_name: String,
    pub overwrite: Option<bool>,
    pub overwrite_unmanaged: Option<bool>,
    pub content_type: Option<String>,
    pub datastore_id: Option<String>,
    pub file_name: Option<String>,
    pub node_name: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceOptionsConfig {
    pub retain_on_delete: Option<bool>,
    #[serde(default)]
    pub ignore_changes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualMachineConfig {
    pub resource_name: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub node_name: Option<String>,
    pub vm_id: Option<u32>,
    /// Number of VMs to create from this document (defaults to 1).
    pub count: Option<u32>,

    pub acpi: Option<bool>,
    pub bios: Option<String>,
    pub machine_type: Option<String>,
    #[serde(default)]
    pub boot_orders: Vec<String>,
    pub on_boot: Option<bool>,
    pub started: Option<bool>,
    pub reboot: Option<bool>,
    pub stop_on_destroy: Option<bool>,
    pub keyboard_layout: Option<String>,
    pub scsi_hardware: Option<String>,

    pub timeout_clone: Option<u64>,
    pub timeout_create: Option<u64>,
    pub timeout_migrate: Option<u64>,
    pub timeout_reboot: Option<u64>,
    pub timeout_shutdown: Option<u64>,
    pub timeout_start: Option<u64>,
    pub timeout_stop: Option<u64>,

    /// List of single-entry `{ label: disk }` mappings, in boot order.
    #[serde(default)]
    pub disks: Vec<BTreeMap<String, DiskConfig>>,
    /// List of single-entry `{ label: device }` mappings, in slot order.
    #[serde(default)]
    pub network_devices: Vec<BTreeMap<String, NetworkDeviceConfig>>,

    // Required sections, Option-typed so absence survives parsing and the
    // builder can report which one is missing and in which file.
    pub vga: Option<VgaConfig>,
    pub agent: Option<AgentConfig>,
    pub memory: Option<MemoryConfig>,
    pub cpu: Option<CpuConfig>,
    pub efi_disk: Option<EfiDiskConfig>,
    pub cdrom: Option<CdromConfig>,
    pub operating_system: Option<OperatingSystemConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskConfig {
    pub interface: Option<String>,
    pub datastore_id: Option<String>,
    pub file_format: Option<String>,
    /// Size in gigabytes.
    pub size: Option<u64>,
    pub iothread: Option<bool>,
    pub ssd: Option<bool>,
    pub discard: Option<String>,
    pub speed: Option<DiskSpeedConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskSpeedConfig {
    /// Read limit in MB/s.
    pub read: Option<u64>,
    /// Write limit in MB/s.
    pub write: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkDeviceConfig {
    pub bridge: Option<String>,
    pub model: Option<String>,
    pub vlan_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VgaConfig {
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    pub enabled: Option<bool>,
    pub trim: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
    /// Dedicated memory in megabytes.
    pub dedicated: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuConfig {
    pub architecture: Option<String>,
    pub r#type: Option<String>,
    pub sockets: Option<u32>,
    pub cores: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EfiDiskConfig {
    pub datastore_id: Option<String>,
    pub file_format: Option<String>,
    pub pre_enrolled_keys: Option<bool>,
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CdromConfig {
    pub enabled: Option<bool>,
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatingSystemConfig {
    pub r#type: Option<String>,
}

// ── Loader ────────────────────────────────────────────────

/// A parsed document plus the file it came from, for error reporting and
/// stable ordering.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub path: PathBuf,
    pub document: ConfigDocument,
}

/// Load every `.yaml`/`.yml` file in `dir`, in sorted filename order.
///
/// A file that fails to read or parse is logged and skipped; sibling files
/// still load. A missing or empty directory yields an empty list; there is
/// simply nothing to provision.
pub fn load_dir(dir: &Path) -> Vec<LoadedDocument> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "config directory not readable, nothing to provision"
            );
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "yaml" | "yml"))
        })
        .collect();

    // Sorted order keeps export positions stable across runs.
    files.sort();

    let mut docs = Vec::with_capacity(files.len());
    for path in files {
        match load_file(&path) {
            Ok(document) => {
                tracing::debug!(path = %path.display(), "loaded config file");
                docs.push(LoadedDocument { path, document });
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping config file");
            }
        }
    }
    docs
}

/// Read and strictly decode a single configuration file.
pub fn load_file(path: &Path) -> Result<ConfigDocument, ProvisionError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ProvisionError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    serde_yaml::from_str(&contents).map_err(|e| ProvisionError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
