// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Generic driver for evdev gamepads. There is no protocol to decode;
//! instead a per-device JSON config from `<config_dir>/devices/` maps event
//! codes to buttons and axes. Matching happens by device name.

use std::os::fd::AsRawFd;
use std::path::Path;

use hashbrown::HashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::controller::{
    Controller, ControllerFlags, ControllerInput, DriveStatus, SCButton,
};
use crate::daemon::Daemon;
use crate::device_monitor::HotplugFilter;
use crate::drivers::DriverId;
use crate::poller::PollSource;
use crate::transport::{InputDeviceData, Subsystem};

fn default_scale() -> f32 {
    1.0
}

fn default_clamp_min() -> i32 {
    -32768
}

fn default_clamp_max() -> i32 {
    32767
}

#[derive(Debug, Clone, Deserialize)]
pub struct AxisConfig {
    pub target: String,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default)]
    pub offset: f32,
    #[serde(default)]
    pub deadzone: f32,
    #[serde(default = "default_clamp_min")]
    pub clamp_min: i32,
    #[serde(default = "default_clamp_max")]
    pub clamp_max: i32,
}

/// One file under the devices directory, e.g. `evdev-Logitech Gamepad
/// F310.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Event code (e.g. "304") to button name (e.g. "A").
    #[serde(default)]
    pub buttons: HashMap<String, String>,
    /// Abs axis code to mapping.
    #[serde(default)]
    pub axes: HashMap<String, AxisConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisTarget {
    StickX,
    StickY,
    LPadX,
    LPadY,
    RPadX,
    RPadY,
    LTrig,
    RTrig,
}

impl AxisTarget {
    fn from_str(s: &str) -> Option<AxisTarget> {
        Some(match s {
            "stick_x" => AxisTarget::StickX,
            "stick_y" => AxisTarget::StickY,
            "lpad_x" => AxisTarget::LPadX,
            "lpad_y" => AxisTarget::LPadY,
            "rpad_x" => AxisTarget::RPadX,
            "rpad_y" => AxisTarget::RPadY,
            "ltrig" => AxisTarget::LTrig,
            "rtrig" => AxisTarget::RTrig,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct AxisMapping {
    target: AxisTarget,
    scale: f32,
    offset: f32,
    deadzone: f32,
    clamp_min: i32,
    clamp_max: i32,
}

impl AxisMapping {
    fn apply(&self, input: &mut ControllerInput, raw: i32) {
        let mut value = raw as f32 * self.scale + self.offset;
        if value.abs() <= self.deadzone {
            value = 0.0;
        }
        let value = (value as i32).clamp(self.clamp_min, self.clamp_max);

        match self.target {
            AxisTarget::StickX => input.stick_x = value as i16,
            AxisTarget::StickY => input.stick_y = value as i16,
            AxisTarget::LPadX => input.lpad_x = value as i16,
            AxisTarget::LPadY => input.lpad_y = value as i16,
            AxisTarget::RPadX => input.rpad_x = value as i16,
            AxisTarget::RPadY => input.rpad_y = value as i16,
            AxisTarget::LTrig => input.ltrig = value.clamp(0, 255) as u8,
            AxisTarget::RTrig => input.rtrig = value.clamp(0, 255) as u8,
        }
    }
}

struct EvdevController {
    dev: evdev::Device,
    fd: std::os::fd::RawFd,
    id: String,
    name: String,
    buttons: HashMap<u16, SCButton>,
    axes: HashMap<u16, AxisMapping>,
    input: ControllerInput,
}

impl Controller for EvdevController {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> &'static str {
        "evdev"
    }

    fn description(&self) -> String {
        format!("<EvDev {}>", self.name)
    }

    fn flags(&self) -> ControllerFlags {
        ControllerFlags::HAS_DPAD
            | ControllerFlags::NO_GRIPS
            | ControllerFlags::HAS_RSTICK
            | ControllerFlags::SEPARATE_STICK
    }

    fn pollable_fd(&self) -> Option<std::os::fd::RawFd> {
        Some(self.fd)
    }

    fn drive(&mut self, frames: &mut Vec<ControllerInput>) -> DriveStatus {
        let events = match self.dev.fetch_events() {
            Ok(events) => events,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return DriveStatus::Idle,
            Err(e) => {
                debug!("{}: {}", self.name, e);
                frames.push(ControllerInput::default());
                return DriveStatus::Disconnected;
            }
        };

        for event in events {
            match event.kind() {
                evdev::InputEventKind::Key(key) => {
                    let Some(b) = self.buttons.get(&key.code()) else {
                        debug!("unknown key code {}", key.code());
                        continue;
                    };
                    if event.value() != 0 {
                        self.input.buttons |= *b;
                    } else {
                        self.input.buttons &= !*b;
                    }
                    frames.push(self.input);
                }
                evdev::InputEventKind::AbsAxis(axis) => {
                    let Some(mapping) = self.axes.get(&axis.0) else {
                        continue;
                    };
                    mapping.apply(&mut self.input, event.value());
                    frames.push(self.input);
                }
                _ => (),
            }
        }
        DriveStatus::Idle
    }
}

/// Loads every device config and registers a name-filtered hotplug callback
/// for each.
pub fn init(daemon: &mut Daemon) {
    let dir = daemon.cfg.devices_dir();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match load_config(&path) {
            Ok(config) => {
                debug!("loaded device config for '{}'", config.name);
                daemon.monitor.register(
                    Subsystem::Evdev,
                    DriverId::Evdev,
                    vec![HotplugFilter::Name(config.name.clone())],
                );
                daemon.evdev_configs.insert(config.name.clone(), config);
            }
            Err(e) => warn!("skipping {}: {:#}", path.display(), e),
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<DeviceConfig> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn compile_mappings(
    config: &DeviceConfig,
) -> (HashMap<u16, SCButton>, HashMap<u16, AxisMapping>) {
    let mut buttons = HashMap::new();
    for (code, name) in &config.buttons {
        let (Ok(code), Some(b)) = (code.parse(), crate::conversions::button_from_name(name))
        else {
            warn!("bad button mapping {} -> {}", code, name);
            continue;
        };
        buttons.insert(code, b);
    }

    let mut axes = HashMap::new();
    for (code, axis) in &config.axes {
        let (Ok(code), Some(target)) = (code.parse(), AxisTarget::from_str(&axis.target)) else {
            warn!("bad axis mapping {} -> {}", code, axis.target);
            continue;
        };
        axes.insert(
            code,
            AxisMapping {
                target,
                scale: axis.scale,
                offset: axis.offset,
                deadzone: axis.deadzone,
                clamp_min: axis.clamp_min,
                clamp_max: axis.clamp_max,
            },
        );
    }

    (buttons, axes)
}

pub fn hotplug(daemon: &mut Daemon, idata: &InputDeviceData) -> bool {
    let Some(name) = &idata.name else {
        return false;
    };
    let Some(config) = daemon.evdev_configs.get(name).cloned() else {
        return false;
    };

    let mut dev = match evdev::Device::open(&idata.path) {
        Ok(dev) => dev,
        Err(e) => {
            warn!("failed to open '{}': {}", idata.path, e);
            return true;
        }
    };

    let fd = dev.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    if let Err(e) = dev.grab() {
        warn!("failed to grab '{}': {}", idata.path, e);
    }

    let free = (0..64)
        .find(|i| daemon.used_auto_serials & (1 << i) == 0)
        .unwrap_or(63);
    daemon.used_auto_serials |= 1 << free;

    let (buttons, axes) = compile_mappings(&config);
    let controller = EvdevController {
        dev,
        fd,
        id: format!("evdev{}", free),
        name: name.clone(),
        buttons,
        axes,
        input: ControllerInput::default(),
    };

    let Some(key) = daemon.add_controller(Box::new(controller), Some(idata.path.clone())) else {
        return true;
    };
    if let Err(e) = daemon.poller.add_fd(fd, PollSource::EvdevController(key)) {
        warn!("failed to register with poller: {:#}", e);
        daemon.remove_controller(key);
        return true;
    }

    debug!("new evdev controller '{}'", name);
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn config_compiles_to_mappings() {
        let config: DeviceConfig = serde_json::from_value(json!({
            "name": "Logitech Gamepad F310",
            "buttons": {"304": "A", "305": "B", "9999": "A", "310": "NOPE"},
            "axes": {
                "0": {"target": "stick_x"},
                "2": {"target": "ltrig", "scale": 1.0, "clamp_min": 0, "clamp_max": 255},
            },
        }))
        .unwrap();

        let (buttons, axes) = compile_mappings(&config);
        assert_eq!(buttons.get(&304), Some(&SCButton::A));
        assert_eq!(buttons.get(&305), Some(&SCButton::B));
        assert_eq!(buttons.len(), 3); // 9999 parses; "NOPE" doesn't map
        assert_eq!(axes.len(), 2);
    }

    #[test]
    fn axis_mapping_applies_scale_and_deadzone() {
        let mapping = AxisMapping {
            target: AxisTarget::StickX,
            scale: 2.0,
            offset: 0.0,
            deadzone: 100.0,
            clamp_min: -32768,
            clamp_max: 32767,
        };

        let mut input = ControllerInput::default();
        mapping.apply(&mut input, 500);
        assert_eq!(input.stick_x, 1000);

        mapping.apply(&mut input, 30);
        assert_eq!(input.stick_x, 0);

        mapping.apply(&mut input, 100_000);
        assert_eq!(input.stick_x, 32767);
    }

    #[test]
    fn trigger_targets_clamp_to_byte_range() {
        let mapping = AxisMapping {
            target: AxisTarget::LTrig,
            scale: 1.0,
            offset: 0.0,
            deadzone: 0.0,
            clamp_min: 0,
            clamp_max: 255,
        };

        let mut input = ControllerInput::default();
        mapping.apply(&mut input, 300);
        assert_eq!(input.ltrig, 255);
    }
}
