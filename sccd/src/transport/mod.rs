// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Uniform access to physical devices over libusb and hidapi. Generic evdev
//! controllers read their fd directly and only share the [Subsystem] tag.

mod hidapi;
mod libusb;

pub use hidapi::{hidapi_path, HidapiInputDevice};
pub use libusb::{parse_usb_path, usb_path, UsbInputDevice};

use anyhow::bail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Usb,
    Hidapi,
    Evdev,
}

impl Subsystem {
    pub fn bit(&self) -> u32 {
        match self {
            Subsystem::Usb => 1 << 0,
            Subsystem::Hidapi => 1 << 1,
            Subsystem::Evdev => 1 << 2,
        }
    }
}

/// What the device monitor knows about a device before any driver opens it.
#[derive(Debug, Clone)]
pub struct InputDeviceData {
    pub subsystem: Subsystem,
    /// Opaque to everything but the owning transport. "/usb/003/007",
    /// "/hidapi/<raw path>" or "/dev/input/eventN".
    pub path: String,
    pub vendor: u16,
    pub product: u16,
    pub name: Option<String>,
    /// Interface number, when the subsystem has one.
    pub idx: Option<i32>,
    pub uniq: Option<String>,
}

pub enum InterruptEvent {
    Packet { endpoint: u8, data: Vec<u8> },
    /// Delivered exactly once, when the device is lost. No packets follow.
    Gone,
}

/// An open device. Interrupt input is pumped from the mainloop with zero
/// (or near-zero) timeouts; the synchronous `hid_request` is reserved for
/// driver handshakes and never legal from a decode path.
pub trait InputDevice {
    fn subsystem(&self) -> Subsystem;

    /// Claims (and detaches the kernel driver from) every interface
    /// matching the triple. Only meaningful on libusb; other backends
    /// report one synthetic claim.
    fn claim_interfaces_by(&mut self, class: u8, subclass: u8, protocol: u8) -> usize;

    /// Arranges for repeated delivery of `length`-byte interrupt buffers
    /// from the endpoint. At most one read loop per endpoint.
    fn start_interrupt_read(&mut self, endpoint: u8, length: usize) -> anyhow::Result<()>;

    /// Drains pending interrupt data into `out`.
    fn poll_interrupts(&mut self, out: &mut Vec<InterruptEvent>);

    /// Fire-and-forget HID control-out.
    fn hid_write(&mut self, idx: u16, data: &[u8]);

    /// Synchronous control-out followed by control-in of the same length,
    /// reusing `data` as both buffers.
    fn hid_request(&mut self, idx: u16, data: &mut [u8]) -> anyhow::Result<()>;
}

/// Opens the device a hotplug callback matched.
pub fn open(
    idata: &InputDeviceData,
    hidapi: Option<&::hidapi::HidApi>,
) -> anyhow::Result<Box<dyn InputDevice>> {
    match idata.subsystem {
        Subsystem::Usb => Ok(Box::new(UsbInputDevice::open(&idata.path)?)),
        Subsystem::Hidapi => {
            let Some(api) = hidapi else {
                bail!("hidapi is not initialized");
            };
            Ok(Box::new(HidapiInputDevice::open(api, &idata.path)?))
        }
        Subsystem::Evdev => bail!("evdev devices are not opened through the transport layer"),
    }
}
