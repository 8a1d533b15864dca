//! Device and zone registries.
//!
//! Known devices are loaded at startup from a JSON file keyed by device id
//! (`TT:NNNNNN`), each with a display name, a zone id and a zone-master flag.
//! Zone-master devices seed the zone-id -> zone-name table used for display
//! and topic construction. Devices heard on air but absent from the registry
//! are added on the fly with placeholder details and persisted to a separate
//! "new devices" file for the operator to name later.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Zone id this gateway registers itself under.
pub const GATEWAY_ZONE_ID: i32 = 240;

/// Zone id of the stored hot water sensor.
pub const DHW_ZONE_ID: i32 = 250;

/// One entry of the device registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "zoneId")]
    pub zone_id: i32,
    #[serde(rename = "zoneMaster")]
    pub zone_master: bool,
    /// Local zone index on an underfloor heating controller, where this
    /// device is wired to one of its circuits.
    #[serde(rename = "ufh_zoneId", default, skip_serializing_if = "Option::is_none")]
    pub ufh_zone_id: Option<i32>,
}

/// Resolved zone reference for a wire-level zone byte.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRef {
    pub id: i32,
    pub name: String,
    /// Topic path fragment the zone publishes under.
    pub topic: String,
}

/// Map a 2-hex-digit device type code to its short display name.
pub fn device_type_name(code: &str) -> Option<&'static str> {
    match code {
        "01" => Some("CTL"),  // Main evohome touchscreen controller
        "02" => Some("UFH"),  // Underfloor controller, HCC80R or HCE80
        "03" => Some("STAT"), // Wireless thermostat - HCW82
        "04" => Some("TRV"),  // Radiator TRVs, e.g. HR92
        "07" => Some("DHW"),  // Hot water wireless sender
        "10" => Some("OTB"),  // OpenTherm Bridge
        "13" => Some("BDR"),  // BDR relays
        "18" => Some("CUL"),  // This fake HGI80
        "19" => Some("CUL"),  // Also fake HGI80 - used by evofw2
        "30" => Some("GWAY"), // Mobile gateway such as RGS100
        "34" => Some("STAT"), // Wireless round thermostats T87RF2033
        _ => None,
    }
}

/// Device type codes for the controller kinds the decoders special-case.
pub const CTL_TYPE: &str = "01";
pub const UFH_TYPE: &str = "02";
pub const OTB_TYPE: &str = "10";

/// Process-wide device/zone state, loaded once and threaded explicitly
/// through the poll loop and the decoders.
#[derive(Debug)]
pub struct Registry {
    pub devices: HashMap<String, Device>,
    pub zones: HashMap<i32, String>,
    pub controller_id: String,
    pub gateway_id: String,
    new_devices_file: String,
}

impl Registry {
    /// Load the registry, registering this gateway as a synthetic device.
    pub fn load(
        devices_file: &str,
        new_devices_file: &str,
        controller_id: &str,
        gateway_id: &str,
        gateway_name: &str,
    ) -> Result<Self> {
        let mut devices: HashMap<String, Device> = if Path::new(devices_file).exists() {
            let content = std::fs::read_to_string(devices_file)
                .map_err(|e| anyhow!("Failed to read devices file {}: {}", devices_file, e))?;
            serde_json::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse devices file {}: {}", devices_file, e))?
        } else {
            warn!("Devices file '{}' not found, starting empty", devices_file);
            HashMap::new()
        };

        devices.insert(
            gateway_id.to_string(),
            Device {
                name: gateway_name.to_string(),
                zone_id: GATEWAY_ZONE_ID,
                zone_master: true,
                ufh_zone_id: None,
            },
        );

        let mut zones = HashMap::new();
        for device in devices.values() {
            if device.zone_master {
                zones.insert(device.zone_id, device.name.clone());
            }
        }

        Ok(Registry {
            devices,
            zones,
            controller_id: controller_id.to_string(),
            gateway_id: gateway_id.to_string(),
            new_devices_file: new_devices_file.to_string(),
        })
    }

    /// Registry with no devices, for tests and listener-only use.
    pub fn empty(controller_id: &str, gateway_id: &str) -> Self {
        Registry {
            devices: HashMap::new(),
            zones: HashMap::new(),
            controller_id: controller_id.to_string(),
            gateway_id: gateway_id.to_string(),
            new_devices_file: String::new(),
        }
    }

    /// Register a device by hand, updating the zone map when it is the
    /// zone's master.
    pub fn insert_device(&mut self, id: &str, name: &str, zone_id: i32, zone_master: bool) {
        self.devices.insert(
            id.to_string(),
            Device {
                name: name.to_string(),
                zone_id,
                zone_master,
                ufh_zone_id: None,
            },
        );
        if zone_master && zone_id > 0 {
            self.zones.insert(zone_id, name.to_string());
        }
    }

    /// Log the loaded devices, sorted by id, with zone and master marker.
    pub fn log_devices(&self) {
        let mut ids: Vec<&String> = self.devices.keys().collect();
        ids.sort();
        info!("Devices loaded:");
        for id in ids {
            let device = &self.devices[id];
            let master = if device.zone_master { " [Master]" } else { "" };
            info!(
                "   {} - {:<22} - Zone {:<3}{}",
                id, device.name, device.zone_id, master
            );
        }
    }

    /// Display name for a device id, falling back to the raw id.
    pub fn device_name(&self, id: &str) -> String {
        self.devices
            .get(id)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn device_zone(&self, id: &str) -> Option<i32> {
        self.devices.get(id).map(|d| d.zone_id)
    }

    /// Zone display name, falling back to "Zone N".
    pub fn zone_name(&self, zone_id: i32) -> String {
        self.zones
            .get(&zone_id)
            .cloned()
            .unwrap_or_else(|| format!("Zone {}", zone_id))
    }

    pub fn zone_known(&self, zone_id: i32) -> bool {
        self.zones.contains_key(&zone_id)
    }

    /// Record an unrecognized source device, persisting the updated map to
    /// the new-devices file. Returns true when the device was new.
    pub fn note_device(&mut self, id: &str) -> bool {
        if self.devices.contains_key(id) {
            return false;
        }
        info!("NEW DEVICE FOUND: {}", id);
        self.devices.insert(
            id.to_string(),
            Device {
                name: id.to_string(),
                zone_id: -1,
                zone_master: false,
                ufh_zone_id: None,
            },
        );
        if !self.new_devices_file.is_empty() {
            match serde_json::to_string_pretty(&self.devices) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(&self.new_devices_file, json) {
                        warn!(
                            "Failed to write new devices file '{}': {}",
                            self.new_devices_file, e
                        );
                    }
                }
                Err(e) => warn!("Failed to serialize devices: {}", e),
            }
        }
        true
    }

    /// Resolve a wire-level zone byte into a zone id, name and topic.
    ///
    /// Zone bytes below 0x0C are 0-based zone indices; 1 is added to obtain
    /// the external zone id. Higher values are domain sentinels mapped to
    /// fixed pseudo-zones published under `Relays/`.
    pub fn zone_details(&self, zone_byte: u8, source_type: Option<&str>) -> ZoneRef {
        let id = zone_byte as i32;
        if id < 12 {
            let id = id + 1;
            let name = self.zone_name(id);
            return ZoneRef {
                id,
                topic: name.clone(),
                name,
            };
        }
        let name = match zone_byte {
            // Depends on whether the main controller or the UFH controller sent it
            0xFA => {
                if source_type == Some(UFH_TYPE) {
                    "UFH Controller".to_string()
                } else {
                    "BDR DHW Relay".to_string()
                }
            }
            // Boiler relay, or the OpenTherm bridge when one is present
            0xFC => {
                if self.devices.keys().any(|k| k.starts_with("10:")) {
                    "OTB OpenTherm Bridge".to_string()
                } else {
                    "BDR Boiler Relay".to_string()
                }
            }
            // Radiator circuit zone valve relay
            0xF9 => "BDR Radiators Relay".to_string(),
            // Electric underfloor relay
            0x0C => "UFH Electric Relay".to_string(),
            other => format!("RLY {:#04x}", other),
        };
        ZoneRef {
            id,
            topic: format!("Relays/{}", name),
            name,
        }
    }

    /// Find the top-level zone a UFH controller circuit index maps to, by
    /// searching devices carrying a matching `ufh_zoneId` attribute.
    pub fn ufh_zone(&self, ufh_zone_id: i32) -> Option<(i32, String)> {
        for device in self.devices.values() {
            if device.ufh_zone_id == Some(ufh_zone_id) {
                debug!("UFH zone {} matched to {}", ufh_zone_id, device.name);
                return Some((device.zone_id, device.name.clone()));
            }
        }
        None
    }
}
