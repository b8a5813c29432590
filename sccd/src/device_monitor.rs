// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Keeps track of which drivers want which devices. Drivers register a
//! callback with a set of filters at startup; a rescan enumerates every
//! subsystem with at least one registration and offers new devices to the
//! callbacks in registration order.

use hashbrown::HashSet;
use tracing::{debug, warn};

use crate::drivers::DriverId;
use crate::transport::{hidapi_path, usb_path, InputDeviceData, Subsystem};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugFilter {
    Vendor(u16),
    Product(u16),
    /// "vvvv:pppp", the format lsusb uses.
    VidPid(String),
    Path(String),
    Name(String),
    Idx(i32),
    UniqueId(String),
}

impl HotplugFilter {
    pub fn matches(&self, idata: &InputDeviceData) -> bool {
        match self {
            HotplugFilter::Vendor(v) => idata.vendor == *v,
            HotplugFilter::Product(p) => idata.product == *p,
            HotplugFilter::VidPid(s) => {
                format!("{:04x}:{:04x}", idata.vendor, idata.product) == *s
            }
            HotplugFilter::Path(p) => idata.path == *p,
            HotplugFilter::Name(n) => idata.name.as_deref() == Some(n.as_str()),
            HotplugFilter::Idx(i) => idata.idx == Some(*i),
            HotplugFilter::UniqueId(u) => idata.uniq.as_deref() == Some(u.as_str()),
        }
    }
}

struct Registration {
    subsystem: Subsystem,
    driver: DriverId,
    filters: Vec<HotplugFilter>,
}

#[derive(Default)]
pub struct DeviceMonitor {
    registrations: Vec<Registration>,
    /// Paths already claimed by a driver, so one device never binds twice.
    known: HashSet<String>,
    enabled: u32,
}

impl DeviceMonitor {
    pub fn register(&mut self, subsystem: Subsystem, driver: DriverId, filters: Vec<HotplugFilter>) {
        self.registrations.push(Registration {
            subsystem,
            driver,
            filters,
        });
        self.enabled |= subsystem.bit();
    }

    /// Bitmask of subsystems worth enumerating.
    pub fn enabled_subsystems(&self) -> u32 {
        self.enabled
    }

    /// Drivers whose filters all match, in registration order. The first one
    /// to report the device as handled wins.
    pub fn candidates(&self, idata: &InputDeviceData) -> Vec<DriverId> {
        if self.known.contains(&idata.path) {
            return Vec::new();
        }

        self.registrations
            .iter()
            .filter(|r| r.subsystem == idata.subsystem)
            .filter(|r| r.filters.iter().all(|f| f.matches(idata)))
            .map(|r| r.driver)
            .collect()
    }

    pub fn mark_handled(&mut self, path: &str) {
        self.known.insert(path.to_owned());
    }

    pub fn device_removed(&mut self, path: &str) {
        if self.known.remove(path) {
            debug!("device '{}' removed", path);
        }
    }
}

/// Enumerates currently connected devices on the given subsystems.
pub fn enumerate(enabled: u32, hidapi: Option<&mut hidapi::HidApi>) -> Vec<InputDeviceData> {
    let mut found = Vec::new();

    if enabled & Subsystem::Usb.bit() != 0 {
        match rusb::devices() {
            Ok(devices) => {
                for device in devices.iter() {
                    let Ok(desc) = device.device_descriptor() else {
                        continue;
                    };
                    found.push(InputDeviceData {
                        subsystem: Subsystem::Usb,
                        path: usb_path(device.bus_number(), device.address()),
                        vendor: desc.vendor_id(),
                        product: desc.product_id(),
                        name: None,
                        idx: None,
                        uniq: None,
                    });
                }
            }
            Err(e) => warn!("usb enumeration failed: {}", e),
        }
    }

    if enabled & Subsystem::Hidapi.bit() != 0 {
        if let Some(api) = hidapi {
            if let Err(e) = api.refresh_devices() {
                warn!("hidapi enumeration failed: {}", e);
            }
            for info in api.device_list() {
                found.push(InputDeviceData {
                    subsystem: Subsystem::Hidapi,
                    path: hidapi_path(&info.path().to_string_lossy()),
                    vendor: info.vendor_id(),
                    product: info.product_id(),
                    name: info.product_string().map(str::to_owned),
                    idx: Some(info.interface_number()),
                    uniq: info.serial_number().map(str::to_owned),
                });
            }
        }
    }

    if enabled & Subsystem::Evdev.bit() != 0 {
        found.extend(enumerate_evdev());
    }

    found
}

fn enumerate_evdev() -> Vec<InputDeviceData> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir("/dev/input") else {
        return found;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(fname) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !fname.starts_with("event") {
            continue;
        }

        let Ok(device) = evdev::Device::open(&path) else {
            continue;
        };
        let id = device.input_id();
        found.push(InputDeviceData {
            subsystem: Subsystem::Evdev,
            path: path.to_string_lossy().into_owned(),
            vendor: id.vendor(),
            product: id.product(),
            name: device.name().map(str::to_owned),
            idx: None,
            uniq: device.unique_name().map(str::to_owned),
        });
    }

    found
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn idata() -> InputDeviceData {
        InputDeviceData {
            subsystem: Subsystem::Usb,
            path: "/usb/001/002".to_owned(),
            vendor: 0x28de,
            product: 0x1102,
            name: Some("Steam Controller".to_owned()),
            idx: Some(2),
            uniq: None,
        }
    }

    #[test]
    fn filters_and_together() {
        let mut monitor = DeviceMonitor::default();
        monitor.register(
            Subsystem::Usb,
            DriverId::ScByCable,
            vec![
                HotplugFilter::Vendor(0x28de),
                HotplugFilter::Product(0x1102),
            ],
        );
        monitor.register(
            Subsystem::Usb,
            DriverId::SteamDeck,
            vec![
                HotplugFilter::Vendor(0x28de),
                HotplugFilter::Product(0x1205),
            ],
        );

        assert_eq!(monitor.candidates(&idata()), vec![DriverId::ScByCable]);

        let mut deck = idata();
        deck.product = 0x1205;
        assert_eq!(monitor.candidates(&deck), vec![DriverId::SteamDeck]);

        let mut other = idata();
        other.vendor = 0x054c;
        assert_eq!(monitor.candidates(&other), vec![]);
    }

    #[test]
    fn vidpid_name_and_idx_filters() {
        let d = idata();
        assert!(HotplugFilter::VidPid("28de:1102".to_owned()).matches(&d));
        assert!(!HotplugFilter::VidPid("28de:1142".to_owned()).matches(&d));
        assert!(HotplugFilter::Name("Steam Controller".to_owned()).matches(&d));
        assert!(HotplugFilter::Idx(2).matches(&d));
        assert!(!HotplugFilter::Idx(0).matches(&d));
    }

    #[test]
    fn handled_paths_are_remembered() {
        let mut monitor = DeviceMonitor::default();
        monitor.register(
            Subsystem::Usb,
            DriverId::ScByCable,
            vec![HotplugFilter::Vendor(0x28de)],
        );

        assert_eq!(monitor.candidates(&idata()).len(), 1);
        monitor.mark_handled("/usb/001/002");
        assert_eq!(monitor.candidates(&idata()).len(), 0);

        monitor.device_removed("/usb/001/002");
        assert_eq!(monitor.candidates(&idata()).len(), 1);
    }

    #[test]
    fn registration_order_is_preserved() {
        let mut monitor = DeviceMonitor::default();
        monitor.register(
            Subsystem::Usb,
            DriverId::ScByCable,
            vec![HotplugFilter::Vendor(0x28de)],
        );
        monitor.register(
            Subsystem::Usb,
            DriverId::SteamDeck,
            vec![HotplugFilter::Vendor(0x28de)],
        );

        // Both match; first registered wins when it handles the device.
        assert_eq!(
            monitor.candidates(&idata()),
            vec![DriverId::ScByCable, DriverId::SteamDeck]
        );
    }

    #[test]
    fn enabled_subsystem_mask_accumulates() {
        let mut monitor = DeviceMonitor::default();
        assert_eq!(monitor.enabled_subsystems(), 0);

        monitor.register(Subsystem::Usb, DriverId::ScByCable, vec![]);
        monitor.register(Subsystem::Hidapi, DriverId::ScByBt, vec![]);
        assert_eq!(
            monitor.enabled_subsystems(),
            Subsystem::Usb.bit() | Subsystem::Hidapi.bit()
        );
    }
}
