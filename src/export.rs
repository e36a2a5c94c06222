use serde_json::{Map, Value};

use crate::error::ProvisionError;
use crate::provider::RealizedVm;

/// Which guest agent interface slots to read the exported addresses from.
/// The agent reports the loopback first, so slot numbering here is relative
/// to the remaining interfaces.
#[derive(Debug, Clone, Copy)]
pub struct IpSlots {
    pub first: usize,
    pub second: usize,
}

/// A single named output, e.g. `vm1_ip1 = 10.0.0.5`.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub name: String,
    pub value: String,
}

/// Build the six outputs per realized VM: name, id, two IP addresses and
/// two MAC addresses. Output prefixes number VMs by their position across
/// the whole run, starting at 1.
pub fn build_exports(vms: &[RealizedVm], slots: IpSlots) -> Result<Vec<Output>, ProvisionError> {
    let mut outputs = Vec::with_capacity(vms.len() * 6);

    for (position, vm) in vms.iter().enumerate() {
        let prefix = format!("vm{}", position + 1);

        outputs.push(Output {
            name: format!("{prefix}_name"),
            value: vm.name.clone(),
        });
        outputs.push(Output {
            name: format!("{prefix}_id"),
            value: vm.vm_id.to_string(),
        });
        outputs.push(Output {
            name: format!("{prefix}_ip1"),
            value: interface_ip(vm, slots.first, &format!("{prefix}_ip1"))?,
        });
        outputs.push(Output {
            name: format!("{prefix}_ip2"),
            value: interface_ip(vm, slots.second, &format!("{prefix}_ip2"))?,
        });
        outputs.push(Output {
            name: format!("{prefix}_mac1"),
            value: device_mac(vm, 0, &format!("{prefix}_mac1"))?,
        });
        outputs.push(Output {
            name: format!("{prefix}_mac2"),
            value: device_mac(vm, 1, &format!("{prefix}_mac2"))?,
        });
    }

    Ok(outputs)
}

/// First IPv4 address of the `slot`-th interface after the loopback.
/// Out-of-range slots are hard errors; a truncated export table would
/// silently feed wrong addresses to whatever consumes it.
fn interface_ip(vm: &RealizedVm, slot: usize, output: &str) -> Result<String, ProvisionError> {
    let interfaces = vm.ipv4_addresses.get(1..).unwrap_or_default();
    let addresses = interfaces
        .get(slot)
        .ok_or_else(|| ProvisionError::ExportBounds {
            output: output.to_string(),
            vm: vm.name.clone(),
            kind: "interface",
            index: slot,
            available: interfaces.len(),
        })?;
    addresses
        .first()
        .cloned()
        .ok_or_else(|| ProvisionError::ExportBounds {
            output: output.to_string(),
            vm: vm.name.clone(),
            kind: "address",
            index: 0,
            available: 0,
        })
}

fn device_mac(vm: &RealizedVm, index: usize, output: &str) -> Result<String, ProvisionError> {
    vm.network_devices
        .get(index)
        .map(|d| d.mac_address.clone())
        .ok_or_else(|| ProvisionError::ExportBounds {
            output: output.to_string(),
            vm: vm.name.clone(),
            kind: "network device",
            index,
            available: vm.network_devices.len(),
        })
}

pub fn render_text(outputs: &[Output]) -> String {
    let mut text = String::new();
    for output in outputs {
        text.push_str(&format!("{} = {}\n", output.name, output.value));
    }
    text
}

/// JSON object in export order (the map type preserves insertion order).
pub fn render_json(outputs: &[Output]) -> String {
    let mut map = Map::new();
    for output in outputs {
        map.insert(output.name.clone(), Value::String(output.value.clone()));
    }
    serde_json::to_string_pretty(&Value::Object(map)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RealizedNetworkDevice;

    const SLOTS: IpSlots = IpSlots { first: 6, second: 7 };

    fn realized(position: u32) -> RealizedVm {
        // Loopback plus eight bridged interfaces; slots 6 and 7 carry the
        // addresses of interest.
        let mut ipv4 = vec![vec!["127.0.0.1".to_string()]];
        for i in 0..8 {
            ipv4.push(vec![format!("10.0.{i}.{position}")]);
        }
        RealizedVm {
            name: format!("talos-vm-0{position}"),
            vm_id: 99 + position,
            ipv4_addresses: ipv4,
            network_devices: vec![
                RealizedNetworkDevice {
                    name: "net0".to_string(),
                    mac_address: format!("AA:00:00:00:00:0{position}"),
                },
                RealizedNetworkDevice {
                    name: "net1".to_string(),
                    mac_address: format!("BB:00:00:00:00:0{position}"),
                },
            ],
        }
    }

    #[test]
    fn six_outputs_per_vm_in_position_order() {
        let vms: Vec<RealizedVm> = (1..=4).map(realized).collect();
        let outputs = build_exports(&vms, SLOTS).unwrap();
        assert_eq!(outputs.len(), 24);

        let names: Vec<&str> = outputs[..6].iter().map(|o| o.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["vm1_name", "vm1_id", "vm1_ip1", "vm1_ip2", "vm1_mac1", "vm1_mac2"]
        );
        assert_eq!(outputs[18].name, "vm4_name");
        assert_eq!(outputs[18].value, "talos-vm-04");
        assert_eq!(outputs[19].value, "103");
    }

    #[test]
    fn ips_read_from_configured_slots_past_loopback() {
        let outputs = build_exports(&[realized(1)], SLOTS).unwrap();
        assert_eq!(outputs[2].value, "10.0.6.1");
        assert_eq!(outputs[3].value, "10.0.7.1");
    }

    #[test]
    fn macs_come_from_first_two_devices() {
        let outputs = build_exports(&[realized(2)], SLOTS).unwrap();
        assert_eq!(outputs[4].value, "AA:00:00:00:00:02");
        assert_eq!(outputs[5].value, "BB:00:00:00:00:02");
    }

    #[test]
    fn short_interface_list_is_a_hard_error() {
        let mut vm = realized(1);
        vm.ipv4_addresses.truncate(4);
        let err = build_exports(&[vm], SLOTS).unwrap_err();
        match err {
            ProvisionError::ExportBounds {
                output,
                kind,
                index,
                available,
                ..
            } => {
                assert_eq!(output, "vm1_ip1");
                assert_eq!(kind, "interface");
                assert_eq!(index, 6);
                assert_eq!(available, 3);
            }
            other => panic!("expected ExportBounds, got {other:?}"),
        }
    }

    #[test]
    fn interface_without_addresses_is_a_hard_error() {
        let mut vm = realized(1);
        vm.ipv4_addresses[7].clear();
        let err = build_exports(&[vm], SLOTS).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::ExportBounds { kind: "address", .. }
        ));
    }

    #[test]
    fn missing_second_device_is_a_hard_error() {
        let mut vm = realized(1);
        vm.network_devices.truncate(1);
        let err = build_exports(&[vm], SLOTS).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::ExportBounds {
                kind: "network device",
                index: 1,
                available: 1,
                ..
            }
        ));
    }

    #[test]
    fn text_rendering_is_line_per_output() {
        let outputs = build_exports(&[realized(1)], SLOTS).unwrap();
        let text = render_text(&outputs);
        assert!(text.starts_with("vm1_name = talos-vm-01\n"));
        assert!(text.contains("vm1_ip1 = 10.0.6.1\n"));
        assert_eq!(text.lines().count(), 6);
    }

    #[test]
    fn json_rendering_keeps_order() {
        let outputs = build_exports(&[realized(1)], SLOTS).unwrap();
        let json = render_json(&outputs);
        let name_pos = json.find("vm1_name").unwrap();
        let mac_pos = json.find("vm1_mac2").unwrap();
        assert!(name_pos < mac_pos);
        assert!(json.contains("\"vm1_id\": \"100\""));
    }
}
