// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Per-device-family drivers. Each registers hotplug callbacks (or, for the
//! remote pad, a listening socket) at startup; matched devices are opened,
//! handshaken and registered as controllers.

pub mod evdev;
pub mod hid;
pub mod remotepad;
pub mod sc;

use tracing::warn;

use crate::daemon::Daemon;
use crate::device_monitor::HotplugFilter;
use crate::transport::{InputDeviceData, Subsystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverId {
    ScByCable,
    ScDongle,
    ScByBt,
    SteamDeck,
    Hid,
    Evdev,
}

/// Registers every driver with the device monitor and starts the socket
/// listeners. Called once, before the initial rescan.
pub fn init(daemon: &mut Daemon) {
    daemon.monitor.register(
        Subsystem::Usb,
        DriverId::ScByCable,
        vec![
            HotplugFilter::Vendor(sc::by_cable::VENDOR_ID),
            HotplugFilter::Product(sc::by_cable::PRODUCT_ID),
        ],
    );
    daemon.monitor.register(
        Subsystem::Usb,
        DriverId::ScDongle,
        vec![
            HotplugFilter::Vendor(sc::dongle::VENDOR_ID),
            HotplugFilter::Product(sc::dongle::PRODUCT_ID),
        ],
    );
    daemon.monitor.register(
        Subsystem::Usb,
        DriverId::SteamDeck,
        vec![
            HotplugFilter::Vendor(sc::deck::VENDOR_ID),
            HotplugFilter::Product(sc::deck::PRODUCT_ID),
        ],
    );
    daemon.monitor.register(
        Subsystem::Hidapi,
        DriverId::ScByBt,
        vec![
            HotplugFilter::Vendor(sc::by_bt::VENDOR_ID),
            HotplugFilter::Product(sc::by_bt::PRODUCT_ID),
        ],
    );
    for product in hid::DS4_PRODUCT_IDS {
        daemon.monitor.register(
            Subsystem::Hidapi,
            DriverId::Hid,
            vec![
                HotplugFilter::Vendor(hid::DS4_VENDOR_ID),
                HotplugFilter::Product(product),
            ],
        );
    }

    evdev::init(daemon);

    if let Err(e) = remotepad::RemotePadDriver::start(daemon) {
        warn!("failed to start remotepad driver: {:#}", e);
    }
}

/// Offers a matched device to a driver. Returns true when the device was
/// handled and should not be offered to anyone else.
pub fn handle_hotplug(daemon: &mut Daemon, driver: DriverId, idata: &InputDeviceData) -> bool {
    match driver {
        DriverId::ScByCable => sc::by_cable::hotplug(daemon, idata),
        DriverId::ScDongle => sc::dongle::hotplug(daemon, idata),
        DriverId::ScByBt => sc::by_bt::hotplug(daemon, idata),
        DriverId::SteamDeck => sc::deck::hotplug(daemon, idata),
        DriverId::Hid => hid::hotplug(daemon, idata),
        DriverId::Evdev => evdev::hotplug(daemon, idata),
    }
}

/// Per-tick transport attention: controllers that poll their device, and
/// dongle endpoints.
pub fn pump(daemon: &mut Daemon) {
    sc::dongle::drive_dongles(daemon);
}
