use std::io::IsTerminal;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::declare::{DiskDeclaration, FileDownloadDeclaration, VmDeclaration};
use crate::error::ProvisionError;
use crate::provider::{Provider, RealizedNetworkDevice, RealizedVm};
use crate::settings::ProviderSettings;

/// Task-wait ceiling when the declaration carries no timeout of its own.
const DEFAULT_TASK_TIMEOUT_S: u64 = 600;
/// Image downloads run on the cluster side and can be slow.
const DOWNLOAD_TIMEOUT_S: u64 = 1800;
/// How long to wait for the guest agent to start answering after boot.
const AGENT_TIMEOUT_S: u64 = 300;

/// Thin client for the Proxmox VE HTTP API. Constructed once and passed by
/// reference into every realization call; holds no per-VM state.
pub struct ProxmoxProvider {
    client: reqwest::Client,
    endpoint: String,
    auth_header: String,
}

impl ProxmoxProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.insecure)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProvisionError::Http {
                context: "building HTTP client".into(),
                source: e,
            })?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            auth_header: format!("PVEAPIToken={}", settings.api_token),
        })
    }

    // ── HTTP plumbing ─────────────────────────────────────

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        context: &str,
    ) -> Result<T, ProvisionError> {
        let response = self
            .client
            .get(format!("{}{path}", self.endpoint))
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| ProvisionError::Http {
                context: format!("requesting {context}"),
                source: e,
            })?;
        Self::decode(response, context).await
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        context: &str,
    ) -> Result<T, ProvisionError> {
        let response = self
            .client
            .post(format!("{}{path}", self.endpoint))
            .header("Authorization", &self.auth_header)
            .json(body)
            .send()
            .await
            .map_err(|e| ProvisionError::Http {
                context: format!("requesting {context}"),
                source: e,
            })?;
        Self::decode(response, context).await
    }

    /// Unwrap the `{ "data": ... }` envelope. Non-2xx response bodies are
    /// surfaced verbatim; provider rejections are the operator's to read.
    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        context: &str,
    ) -> Result<T, ProvisionError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Api {
                context: context.to_string(),
                message: format!("HTTP {status}: {}", body.trim()),
            });
        }

        let envelope: ResponseBase<T> =
            response.json().await.map_err(|e| ProvisionError::Http {
                context: format!("decoding {context} response"),
                source: e,
            })?;
        Ok(envelope.data)
    }

    /// Poll a task once per second until it stops, up to `timeout_s`.
    async fn wait_task(
        &self,
        node: &str,
        upid: &str,
        timeout_s: u64,
        context: &str,
    ) -> Result<(), ProvisionError> {
        let spinner = spinner(format!("Waiting for {context}..."));
        let started = Instant::now();

        let result = loop {
            if started.elapsed() > Duration::from_secs(timeout_s) {
                break Err(ProvisionError::Timeout {
                    context: context.to_string(),
                    seconds: timeout_s,
                });
            }

            let status: TaskStatus = self
                .get(
                    &format!("/api2/json/nodes/{node}/tasks/{upid}/status"),
                    "task status",
                )
                .await?;

            if status.status == "stopped" {
                let exit = status.exitstatus.unwrap_or_default();
                if exit == "OK" {
                    break Ok(());
                }
                break Err(ProvisionError::TaskFailed {
                    upid: upid.to_string(),
                    status: exit,
                });
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        if let Some(s) = spinner {
            s.finish_and_clear();
        }
        result
    }

    async fn volume_exists(
        &self,
        node: &str,
        datastore: &str,
        volume_id: &str,
    ) -> Result<bool, ProvisionError> {
        let entries: Vec<StorageContentEntry> = self
            .get(
                &format!("/api2/json/nodes/{node}/storage/{datastore}/content"),
                "storage content listing",
            )
            .await?;
        Ok(entries.iter().any(|e| e.volid == volume_id))
    }

    /// Poll the guest agent until it reports interfaces, then collect the
    /// IPv4 addresses per interface in the reported order.
    async fn wait_agent_ipv4(
        &self,
        node: &str,
        vm_id: u32,
    ) -> Result<Vec<Vec<String>>, ProvisionError> {
        let spinner = spinner(format!("Waiting for guest agent on VM {vm_id}..."));
        let started = Instant::now();

        let result = loop {
            if started.elapsed() > Duration::from_secs(AGENT_TIMEOUT_S) {
                break Err(ProvisionError::Timeout {
                    context: format!("guest agent on VM {vm_id}"),
                    seconds: AGENT_TIMEOUT_S,
                });
            }

            match self
                .get::<AgentInterfaces>(
                    &format!("/api2/json/nodes/{node}/qemu/{vm_id}/agent/network-get-interfaces"),
                    "guest agent interfaces",
                )
                .await
            {
                Ok(interfaces) => {
                    break Ok(interfaces
                        .result
                        .iter()
                        .map(|iface| {
                            iface
                                .ip_addresses
                                .iter()
                                .filter(|a| a.ip_address_type == "ipv4")
                                .map(|a| a.ip_address.clone())
                                .collect()
                        })
                        .collect());
                }
                // The agent answers 500 until the guest service is up.
                Err(ProvisionError::Api { .. }) => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => break Err(e),
            }
        };

        if let Some(s) = spinner {
            s.finish_and_clear();
        }
        result
    }
}

impl Provider for ProxmoxProvider {
    async fn realize_download(
        &self,
        decl: &FileDownloadDeclaration,
    ) -> Result<String, ProvisionError> {
        let at = decl.resource_name.as_str();
        let node = require(decl.node_name.as_deref(), "file_download.node_name", at)?;
        let datastore = require(decl.datastore_id.as_deref(), "file_download.datastore_id", at)?;
        let file_name = require(decl.file_name.as_deref(), "file_download.file_name", at)?;
        let url = require(decl.url.as_deref(), "file_download.url", at)?;
        let content = decl.content_type.as_deref().unwrap_or("iso");

        let volume_id = format!("{datastore}:{content}/{file_name}");

        // Reuse an image already on the datastore unless overwrite is
        // explicitly requested.
        if decl.overwrite != Some(true) && self.volume_exists(node, datastore, &volume_id).await? {
            tracing::info!(volume = %volume_id, "image already present, skipping download");
            return Ok(volume_id);
        }

        tracing::info!(url = %url, volume = %volume_id, node = %node, "downloading boot image");

        let upid: String = self
            .post(
                &format!("/api2/json/nodes/{node}/storage/{datastore}/download-url"),
                &json!({
                    "content": content,
                    "filename": file_name,
                    "url": url,
                }),
                "image download",
            )
            .await?;

        self.wait_task(node, &upid, DOWNLOAD_TIMEOUT_S, &format!("download of {file_name}"))
            .await?;

        tracing::info!(volume = %volume_id, "boot image available");
        Ok(volume_id)
    }

    async fn realize_vm(
        &self,
        decl: &VmDeclaration,
        boot_volume: &str,
    ) -> Result<RealizedVm, ProvisionError> {
        let node = require(
            decl.node_name.as_deref(),
            "virtual_machine.node_name",
            &decl.resource_name,
        )?;

        let params = vm_create_params(decl, boot_volume)?;
        tracing::info!(vmid = decl.vm_id, name = %decl.name, node = %node, "creating VM");
        tracing::debug!(params = %serde_json::Value::Object(params.clone()), "VM create parameters");

        let upid: Option<String> = self
            .post(
                &format!("/api2/json/nodes/{node}/qemu"),
                &Value::Object(params),
                "VM creation",
            )
            .await?;

        if let Some(upid) = upid {
            let timeout = decl.timeouts.create.unwrap_or(DEFAULT_TASK_TIMEOUT_S);
            self.wait_task(node, &upid, timeout, &format!("creation of VM {}", decl.vm_id))
                .await?;
        }

        if decl.started.unwrap_or(false) {
            tracing::info!(vmid = decl.vm_id, "starting VM");
            let upid: Option<String> = self
                .post(
                    &format!("/api2/json/nodes/{node}/qemu/{}/status/start", decl.vm_id),
                    &json!({}),
                    "VM start",
                )
                .await?;
            if let Some(upid) = upid {
                let timeout = decl.timeouts.start.unwrap_or(DEFAULT_TASK_TIMEOUT_S);
                self.wait_task(node, &upid, timeout, &format!("start of VM {}", decl.vm_id))
                    .await?;
            }
        }

        // Read back realized attributes: IPv4 lists come from the guest
        // agent (only reachable on a started VM with the agent enabled),
        // MAC addresses from the realized device config.
        let ipv4_addresses =
            if decl.started.unwrap_or(false) && decl.agent.enabled.unwrap_or(false) {
                self.wait_agent_ipv4(node, decl.vm_id).await?
            } else {
                Vec::new()
            };

        let config: Map<String, Value> = self
            .get(
                &format!("/api2/json/nodes/{node}/qemu/{}/config", decl.vm_id),
                "VM config",
            )
            .await?;
        let network_devices = realized_network_devices(&config);

        Ok(RealizedVm {
            name: decl.name.clone(),
            vm_id: decl.vm_id,
            ipv4_addresses,
            network_devices,
        })
    }
}

// ── Declaration → API parameter rendering ─────────────────

/// Render a VM declaration into the flat parameter map the create endpoint
/// expects. Fields the declaration leaves unset are omitted so the cluster
/// applies its own defaults.
pub fn vm_create_params(
    decl: &VmDeclaration,
    boot_volume: &str,
) -> Result<Map<String, Value>, ProvisionError> {
    let mut params = Map::new();
    params.insert("vmid".into(), decl.vm_id.into());
    params.insert("name".into(), decl.name.clone().into());

    insert_opt(&mut params, "description", decl.description.clone());
    if !decl.tags.is_empty() {
        params.insert("tags".into(), decl.tags.join(";").into());
    }
    insert_flag(&mut params, "acpi", decl.acpi);
    insert_opt(&mut params, "bios", decl.bios.clone());
    insert_opt(&mut params, "machine", decl.machine_type.clone());
    if !decl.boot_orders.is_empty() {
        params.insert(
            "boot".into(),
            format!("order={}", decl.boot_orders.join(";")).into(),
        );
    }
    insert_flag(&mut params, "onboot", decl.on_boot);
    insert_opt(&mut params, "keyboard", decl.keyboard_layout.clone());
    insert_opt(&mut params, "scsihw", decl.scsi_hardware.clone());

    insert_opt(&mut params, "vga", decl.vga.r#type.clone());
    insert_opt(&mut params, "ostype", decl.operating_system.r#type.clone());

    if let Some(enabled) = decl.agent.enabled {
        let mut agent = format!("{}", enabled as u8);
        if let Some(trim) = decl.agent.trim {
            agent.push_str(&format!(",fstrim_cloned_disks={}", trim as u8));
        }
        params.insert("agent".into(), agent.into());
    }

    if let Some(dedicated) = decl.memory.dedicated {
        params.insert("memory".into(), dedicated.into());
    }

    insert_opt(&mut params, "arch", decl.cpu.architecture.clone());
    insert_opt(&mut params, "cpu", decl.cpu.r#type.clone());
    if let Some(sockets) = decl.cpu.sockets {
        params.insert("sockets".into(), sockets.into());
    }
    if let Some(cores) = decl.cpu.cores {
        params.insert("cores".into(), cores.into());
    }

    if let Some(datastore) = &decl.efi_disk.datastore_id {
        let mut efi = format!("{datastore}:1");
        if let Some(t) = &decl.efi_disk.r#type {
            efi.push_str(&format!(",efitype={t}"));
        }
        if let Some(fmt) = &decl.efi_disk.file_format {
            efi.push_str(&format!(",format={fmt}"));
        }
        if let Some(pre) = decl.efi_disk.pre_enrolled_keys {
            efi.push_str(&format!(",pre-enrolled-keys={}", pre as u8));
        }
        params.insert("efidisk0".into(), efi.into());
    }

    if decl.cdrom.enabled != Some(false) {
        let interface = decl.cdrom.interface.as_deref().unwrap_or("ide3");
        params.insert(
            interface.to_string(),
            format!("{boot_volume},media=cdrom").into(),
        );
    }

    for disk in &decl.disks {
        let (key, value) = disk_param(disk, &decl.resource_name)?;
        params.insert(key, value.into());
    }

    for (i, dev) in decl.network_devices.iter().enumerate() {
        let mut spec = dev.model.clone().unwrap_or_else(|| "virtio".to_string());
        if let Some(bridge) = &dev.bridge {
            spec.push_str(&format!(",bridge={bridge}"));
        }
        if let Some(vlan) = dev.vlan_id {
            spec.push_str(&format!(",tag={vlan}"));
        }
        params.insert(format!("net{i}"), spec.into());
    }

    Ok(params)
}

fn disk_param(disk: &DiskDeclaration, at: &str) -> Result<(String, String), ProvisionError> {
    let interface = require(disk.interface.as_deref(), "disks[].interface", at)?;
    let datastore = require(disk.datastore_id.as_deref(), "disks[].datastore_id", at)?;
    let size = require(disk.size, "disks[].size", at)?;

    let mut spec = format!("{datastore}:{size}");
    if let Some(fmt) = &disk.file_format {
        spec.push_str(&format!(",format={fmt}"));
    }
    if let Some(iothread) = disk.iothread {
        spec.push_str(&format!(",iothread={}", iothread as u8));
    }
    if let Some(ssd) = disk.ssd {
        spec.push_str(&format!(",ssd={}", ssd as u8));
    }
    if let Some(discard) = &disk.discard {
        spec.push_str(&format!(",discard={discard}"));
    }
    if let Some(read) = disk.speed_read {
        spec.push_str(&format!(",mbps_rd={read}"));
    }
    if let Some(write) = disk.speed_write {
        spec.push_str(&format!(",mbps_wr={write}"));
    }

    Ok((interface.to_string(), spec))
}

/// Extract realized network devices (`net0`, `net1`, ...) and their MAC
/// addresses from a VM config mapping.
pub fn realized_network_devices(config: &Map<String, Value>) -> Vec<RealizedNetworkDevice> {
    let mut devices: Vec<(usize, String)> = config
        .iter()
        .filter_map(|(key, value)| {
            let index = key.strip_prefix("net")?.parse::<usize>().ok()?;
            let mac = value.as_str().and_then(parse_net_mac)?;
            Some((index, mac))
        })
        .collect();
    devices.sort_by_key(|(index, _)| *index);
    devices
        .into_iter()
        .map(|(index, mac_address)| RealizedNetworkDevice {
            name: format!("net{index}"),
            mac_address,
        })
        .collect()
}

/// Pull the MAC out of a `net{i}` config value, e.g.
/// `virtio=BC:24:11:2E:C8:01,bridge=vmbr0,tag=42`.
pub fn parse_net_mac(value: &str) -> Option<String> {
    let model_pair = value.split(',').next()?;
    let (_, mac) = model_pair.split_once('=')?;
    let is_mac = mac.len() == 17
        && mac
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F' | b'a'..=b'f' | b':'));
    is_mac.then(|| mac.to_string())
}

fn insert_opt(params: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(v) = value {
        params.insert(key.to_string(), v.into());
    }
}

fn insert_flag(params: &mut Map<String, Value>, key: &str, value: Option<bool>) {
    if let Some(v) = value {
        params.insert(key.to_string(), Value::from(v as u8));
    }
}

fn require<T>(value: Option<T>, field: &'static str, at: &str) -> Result<T, ProvisionError> {
    value.ok_or_else(|| ProvisionError::MissingField {
        field,
        path: at.to_string(),
    })
}

fn spinner(message: String) -> Option<ProgressBar> {
    if std::io::stderr().is_terminal() {
        let s = ProgressBar::new_spinner();
        s.set_message(message);
        s.enable_steady_tick(Duration::from_millis(80));
        Some(s)
    } else {
        None
    }
}

// ── Wire types ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ResponseBase<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageContentEntry {
    volid: String,
}

#[derive(Debug, Deserialize)]
struct AgentInterfaces {
    #[serde(default)]
    result: Vec<AgentInterface>,
}

#[derive(Debug, Deserialize)]
struct AgentInterface {
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Debug, Deserialize)]
struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
}
