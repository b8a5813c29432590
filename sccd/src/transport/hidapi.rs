// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::ffi::CString;

use anyhow::{bail, Context};
use hidapi::{HidApi, HidDevice};
use tracing::warn;

use super::{InputDevice, InterruptEvent, Subsystem};

const MAX_PACKETS_PER_POLL: usize = 16;

/// A device opened through hidapi. There is no interrupt callback in the
/// API, so registered read loops are polled with a zero timeout from the
/// mainloop instead.
pub struct HidapiInputDevice {
    dev: HidDevice,
    read: Option<ReadLoop>,
    gone: bool,
}

struct ReadLoop {
    endpoint: u8,
    length: usize,
}

pub fn hidapi_path(raw: &str) -> String {
    format!("/hidapi{}", raw)
}

impl HidapiInputDevice {
    pub fn open(api: &HidApi, path: &str) -> anyhow::Result<HidapiInputDevice> {
        let raw = path
            .strip_prefix("/hidapi")
            .context(format!("bad hidapi device path '{}'", path))?;
        let cpath = CString::new(raw).context("bad hidapi device path")?;

        let dev = api
            .open_path(&cpath)
            .context(format!("opening {}", path))?;
        dev.set_blocking_mode(false)?;

        Ok(HidapiInputDevice {
            dev,
            read: None,
            gone: false,
        })
    }
}

impl InputDevice for HidapiInputDevice {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Hidapi
    }

    fn claim_interfaces_by(&mut self, _class: u8, _subclass: u8, _protocol: u8) -> usize {
        // hidapi claims the interface on open.
        1
    }

    fn start_interrupt_read(&mut self, endpoint: u8, length: usize) -> anyhow::Result<()> {
        if self.read.is_some() {
            bail!("device already has a read loop");
        }
        self.read = Some(ReadLoop { endpoint, length });
        Ok(())
    }

    fn poll_interrupts(&mut self, out: &mut Vec<InterruptEvent>) {
        if self.gone {
            return;
        }
        let Some(read) = &self.read else {
            return;
        };

        let mut buf = [0u8; 256];
        for _ in 0..MAX_PACKETS_PER_POLL {
            let len = read.length.min(buf.len());
            match self.dev.read_timeout(&mut buf[..len], 0) {
                Ok(0) => break,
                Ok(n) => out.push(InterruptEvent::Packet {
                    endpoint: read.endpoint,
                    data: buf[..n].to_vec(),
                }),
                Err(e) => {
                    warn!("hidapi read failed: {}", e);
                    self.gone = true;
                    out.push(InterruptEvent::Gone);
                    return;
                }
            }
        }
    }

    fn hid_write(&mut self, _idx: u16, data: &[u8]) {
        if let Err(e) = self.dev.write(data) {
            warn!("hid_write: {}", e);
        }
    }

    fn hid_request(&mut self, _idx: u16, data: &mut [u8]) -> anyhow::Result<()> {
        // Feature reports carry an extra report-id byte up front.
        let mut buf = vec![0u8; data.len() + 1];
        buf[1..].copy_from_slice(data);

        self.dev
            .send_feature_report(&buf)
            .context("hid_request: send_feature_report")?;
        self.dev
            .get_feature_report(&mut buf)
            .context("hid_request: get_feature_report")?;

        data.copy_from_slice(&buf[1..]);
        Ok(())
    }
}
