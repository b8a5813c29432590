// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use anyhow::{bail, Context};
use rusb::{DeviceHandle, GlobalContext};
use tracing::{trace, warn};

use super::{InputDevice, InterruptEvent, Subsystem};

const CTRL_TIMEOUT: Duration = Duration::from_millis(500);
// libusb treats a zero timeout as infinite, so the per-tick poll uses the
// shortest one it accepts.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);
const MAX_PACKETS_PER_POLL: usize = 16;

/// HID SET_REPORT over the control endpoint.
const HID_SET_REPORT: u8 = 0x09;
const HID_GET_REPORT: u8 = 0x01;
const HID_REPORT_TYPE_FEATURE: u16 = 0x0300;

struct ReadLoop {
    endpoint: u8,
    length: usize,
}

pub struct UsbInputDevice {
    handle: DeviceHandle<GlobalContext>,
    reads: Vec<ReadLoop>,
    gone: bool,
}

/// Splits a synthetic "/usb/<bus>/<addr>" path.
pub fn parse_usb_path(path: &str) -> Option<(u8, u8)> {
    let rest = path.strip_prefix("/usb/")?;
    let (bus, addr) = rest.split_once('/')?;
    Some((bus.parse().ok()?, addr.parse().ok()?))
}

pub fn usb_path(bus: u8, addr: u8) -> String {
    format!("/usb/{:03}/{:03}", bus, addr)
}

impl UsbInputDevice {
    pub fn open(path: &str) -> anyhow::Result<UsbInputDevice> {
        let (bus, addr) =
            parse_usb_path(path).context(format!("bad usb device path '{}'", path))?;

        for device in rusb::devices()?.iter() {
            if device.bus_number() != bus || device.address() != addr {
                continue;
            }

            let handle = device.open().context(format!("opening {}", path))?;
            let _ = handle.set_auto_detach_kernel_driver(true);
            return Ok(UsbInputDevice {
                handle,
                reads: Vec::new(),
                gone: false,
            });
        }

        bail!("device {} not found", path);
    }
}

impl InputDevice for UsbInputDevice {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Usb
    }

    fn claim_interfaces_by(&mut self, class: u8, subclass: u8, protocol: u8) -> usize {
        let device = self.handle.device();
        let configs = match device.device_descriptor() {
            Ok(d) => d.num_configurations(),
            Err(e) => {
                warn!("device_descriptor: {}", e);
                return 0;
            }
        };

        let mut count = 0;
        for c in 0..configs {
            let Ok(config) = device.config_descriptor(c) else {
                continue;
            };
            for interface in config.interfaces() {
                for desc in interface.descriptors() {
                    if desc.class_code() == class
                        && desc.sub_class_code() == subclass
                        && desc.protocol_code() == protocol
                    {
                        match self.handle.claim_interface(desc.interface_number()) {
                            Ok(()) => count += 1,
                            Err(e) => warn!(
                                "claim_interface {}: {}",
                                desc.interface_number(),
                                e
                            ),
                        }
                    }
                }
            }
        }
        count
    }

    fn start_interrupt_read(&mut self, endpoint: u8, length: usize) -> anyhow::Result<()> {
        if self.reads.iter().any(|r| r.endpoint == endpoint) {
            bail!("endpoint {} already has a read loop", endpoint);
        }
        self.reads.push(ReadLoop { endpoint, length });
        Ok(())
    }

    fn poll_interrupts(&mut self, out: &mut Vec<InterruptEvent>) {
        if self.gone {
            return;
        }

        let mut buf = [0u8; 256];
        for read in &self.reads {
            for _ in 0..MAX_PACKETS_PER_POLL {
                let len = read.length.min(buf.len());
                match self.handle.read_interrupt(
                    read.endpoint | rusb::constants::LIBUSB_ENDPOINT_IN,
                    &mut buf[..len],
                    POLL_TIMEOUT,
                ) {
                    Ok(n) => {
                        trace!(endpoint = read.endpoint, n, "interrupt packet");
                        out.push(InterruptEvent::Packet {
                            endpoint: read.endpoint,
                            data: buf[..n].to_vec(),
                        });
                    }
                    Err(rusb::Error::Timeout) => break,
                    Err(e) => {
                        warn!("interrupt read failed: {}", e);
                        self.gone = true;
                        out.push(InterruptEvent::Gone);
                        return;
                    }
                }
            }
        }
    }

    fn hid_write(&mut self, idx: u16, data: &[u8]) {
        if let Err(e) = self.handle.write_control(
            rusb::request_type(
                rusb::Direction::Out,
                rusb::RequestType::Class,
                rusb::Recipient::Interface,
            ),
            HID_SET_REPORT,
            HID_REPORT_TYPE_FEATURE,
            idx,
            data,
            CTRL_TIMEOUT,
        ) {
            warn!("hid_write: {}", e);
        }
    }

    fn hid_request(&mut self, idx: u16, data: &mut [u8]) -> anyhow::Result<()> {
        self.handle
            .write_control(
                rusb::request_type(
                    rusb::Direction::Out,
                    rusb::RequestType::Class,
                    rusb::Recipient::Interface,
                ),
                HID_SET_REPORT,
                HID_REPORT_TYPE_FEATURE,
                idx,
                data,
                CTRL_TIMEOUT,
            )
            .context("hid_request: control out")?;

        self.handle
            .read_control(
                rusb::request_type(
                    rusb::Direction::In,
                    rusb::RequestType::Class,
                    rusb::Recipient::Interface,
                ),
                HID_GET_REPORT,
                HID_REPORT_TYPE_FEATURE,
                idx,
                data,
                CTRL_TIMEOUT,
            )
            .context("hid_request: control in")?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn usb_paths_roundtrip() {
        assert_eq!(usb_path(3, 17), "/usb/003/017");
        assert_eq!(parse_usb_path("/usb/003/017"), Some((3, 17)));
        assert_eq!(parse_usb_path("/usb/3/7"), Some((3, 7)));
        assert_eq!(parse_usb_path("/hidapi/foo"), None);
        assert_eq!(parse_usb_path("/usb/xx/yy"), None);
    }
}
