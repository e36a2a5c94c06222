pub mod proxmox;

use crate::declare::{FileDownloadDeclaration, VmDeclaration};
use crate::error::ProvisionError;
use crate::settings::ProviderSettings;

/// Attributes reported back by the cluster after a VM is realized.
#[derive(Debug, Clone)]
pub struct RealizedVm {
    pub name: String,
    pub vm_id: u32,
    /// IPv4 addresses per reported network interface, in the guest agent's
    /// interface order (the first entry is typically the loopback).
    pub ipv4_addresses: Vec<Vec<String>>,
    /// Realized network devices in slot order.
    pub network_devices: Vec<RealizedNetworkDevice>,
}

#[derive(Debug, Clone)]
pub struct RealizedNetworkDevice {
    pub name: String,
    pub mac_address: String,
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Provider {
    /// Realize an image download on the cluster; returns the volume id the
    /// optical drives reference as boot media.
    async fn realize_download(
        &self,
        decl: &FileDownloadDeclaration,
    ) -> Result<String, ProvisionError>;

    /// Realize one VM declaration and read back its reported attributes.
    /// `boot_volume` is the resolved volume id of the declaration's
    /// download reference.
    async fn realize_vm(
        &self,
        decl: &VmDeclaration,
        boot_volume: &str,
    ) -> Result<RealizedVm, ProvisionError>;
}

pub fn create_provider(
    settings: &ProviderSettings,
) -> Result<proxmox::ProxmoxProvider, ProvisionError> {
    proxmox::ProxmoxProvider::new(settings)
}
