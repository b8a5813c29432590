// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;

use anyhow::Context;
use input_linux::{
    sys, AbsoluteAxis, AbsoluteInfo, AbsoluteInfoSetup, EventKind, InputId, Key, RelativeAxis,
    UInputHandle,
};

use super::{VirtualDevice, VirtualDeviceKind};
use crate::controller::Keycode;

const XBOX360_NAME: &[u8] = b"Microsoft X-Box 360 pad";
const XBOX360_VENDOR: u16 = 0x045e;
const XBOX360_PRODUCT: u16 = 0x028e;
const XBOX360_VERSION: u16 = 0x110;

const XBOX360_BUTTONS: &[Key] = &[
    Key::ButtonSouth,
    Key::ButtonEast,
    Key::ButtonNorth,
    Key::ButtonWest,
    Key::ButtonTL,
    Key::ButtonTR,
    Key::ButtonSelect,
    Key::ButtonStart,
    Key::ButtonMode,
    Key::ButtonThumbl,
    Key::ButtonThumbr,
];

fn stick_absinfo() -> AbsoluteInfo {
    AbsoluteInfo {
        value: 0,
        minimum: -32768,
        maximum: 32767,
        fuzz: 16,
        flat: 128,
        resolution: 0,
    }
}

fn trigger_absinfo() -> AbsoluteInfo {
    AbsoluteInfo {
        value: 0,
        minimum: 0,
        maximum: 255,
        fuzz: 0,
        flat: 0,
        resolution: 0,
    }
}

fn hat_absinfo() -> AbsoluteInfo {
    AbsoluteInfo {
        value: 0,
        minimum: -1,
        maximum: 1,
        fuzz: 0,
        flat: 0,
        resolution: 0,
    }
}

fn open_uinput() -> anyhow::Result<UInputHandle<File>> {
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/uinput")
        .context("opening /dev/uinput")?;
    Ok(UInputHandle::new(fd))
}

fn event(type_: u16, code: u16, value: i32) -> sys::input_event {
    sys::input_event {
        time: sys::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        type_,
        code,
        value,
    }
}

/// A uinput-backed virtual device. One instance per kind, per mapper.
pub struct UinputDevice {
    kind: VirtualDeviceKind,
    handle: UInputHandle<File>,
    pending: Vec<sys::input_event>,
    // Fractional carry for relative motion.
    mx: f64,
    my: f64,
    sx: f64,
    sy: f64,
}

impl UinputDevice {
    pub fn keyboard() -> anyhow::Result<Self> {
        let handle = open_uinput()?;
        handle.set_evbit(EventKind::Key)?;
        for code in 1u16..=247 {
            if let Ok(key) = Key::from_code(code) {
                handle.set_keybit(key)?;
            }
        }

        let id = InputId {
            bustype: sys::BUS_USB as u16,
            vendor: 0x28de,
            product: 0x1142,
            version: 1,
        };
        handle.create(&id, b"SC Controller Keyboard", 0, &[])?;

        Ok(Self::wrap(VirtualDeviceKind::Keyboard, handle))
    }

    pub fn mouse() -> anyhow::Result<Self> {
        let handle = open_uinput()?;
        handle.set_evbit(EventKind::Key)?;
        for code in crate::conversions::BTN_MOUSE..=crate::conversions::BTN_TASK {
            if let Ok(key) = Key::from_code(code) {
                handle.set_keybit(key)?;
            }
        }

        handle.set_evbit(EventKind::Relative)?;
        handle.set_relbit(RelativeAxis::X)?;
        handle.set_relbit(RelativeAxis::Y)?;
        handle.set_relbit(RelativeAxis::Wheel)?;
        handle.set_relbit(RelativeAxis::HorizontalWheel)?;

        let id = InputId {
            bustype: sys::BUS_USB as u16,
            vendor: 0x28de,
            product: 0x1142,
            version: 1,
        };
        handle.create(&id, b"SC Controller Mouse", 0, &[])?;

        Ok(Self::wrap(VirtualDeviceKind::Mouse, handle))
    }

    /// Emulates an X-Box 360 pad, which is what most games expect to find.
    pub fn gamepad() -> anyhow::Result<Self> {
        let handle = open_uinput()?;
        handle.set_evbit(EventKind::Key)?;
        for key in XBOX360_BUTTONS {
            handle.set_keybit(*key)?;
        }

        handle.set_evbit(EventKind::Absolute)?;
        let abs = [
            AbsoluteInfoSetup {
                axis: AbsoluteAxis::X,
                info: stick_absinfo(),
            },
            AbsoluteInfoSetup {
                axis: AbsoluteAxis::Y,
                info: stick_absinfo(),
            },
            AbsoluteInfoSetup {
                axis: AbsoluteAxis::RX,
                info: stick_absinfo(),
            },
            AbsoluteInfoSetup {
                axis: AbsoluteAxis::RY,
                info: stick_absinfo(),
            },
            AbsoluteInfoSetup {
                axis: AbsoluteAxis::Z,
                info: trigger_absinfo(),
            },
            AbsoluteInfoSetup {
                axis: AbsoluteAxis::RZ,
                info: trigger_absinfo(),
            },
            AbsoluteInfoSetup {
                axis: AbsoluteAxis::Hat0X,
                info: hat_absinfo(),
            },
            AbsoluteInfoSetup {
                axis: AbsoluteAxis::Hat0Y,
                info: hat_absinfo(),
            },
        ];

        let id = InputId {
            bustype: sys::BUS_USB as u16,
            vendor: XBOX360_VENDOR,
            product: XBOX360_PRODUCT,
            version: XBOX360_VERSION,
        };
        handle.create(&id, XBOX360_NAME, 0, &abs)?;

        Ok(Self::wrap(VirtualDeviceKind::Gamepad, handle))
    }

    fn wrap(kind: VirtualDeviceKind, handle: UInputHandle<File>) -> Self {
        UinputDevice {
            kind,
            handle,
            pending: Vec::with_capacity(16),
            mx: 0.0,
            my: 0.0,
            sx: 0.0,
            sy: 0.0,
        }
    }
}

impl VirtualDevice for UinputDevice {
    fn kind(&self) -> VirtualDeviceKind {
        self.kind
    }

    fn name(&self) -> String {
        match self.kind {
            VirtualDeviceKind::Keyboard => "<UInput Keyboard>".to_owned(),
            VirtualDeviceKind::Mouse => "<UInput Mouse>".to_owned(),
            VirtualDeviceKind::Gamepad => "<UInput Gamepad>".to_owned(),
            VirtualDeviceKind::Dummy => "<UInput?>".to_owned(),
        }
    }

    fn key_press(&mut self, key: Keycode) {
        self.pending.push(event(sys::EV_KEY as u16, key, 1));
    }

    fn key_release(&mut self, key: Keycode) {
        self.pending.push(event(sys::EV_KEY as u16, key, 0));
    }

    fn set_axis(&mut self, axis: u16, value: i32) {
        self.pending.push(event(sys::EV_ABS as u16, axis, value));
    }

    fn mouse_move(&mut self, dx: f64, dy: f64) {
        self.mx += dx;
        self.my += dy;
    }

    fn mouse_scroll(&mut self, dx: f64, dy: f64) {
        self.sx += dx;
        self.sy += dy;
    }

    fn flush(&mut self) {
        let dx = self.mx.trunc();
        let dy = self.my.trunc();
        self.mx -= dx;
        self.my -= dy;
        if dx != 0.0 {
            self.pending
                .push(event(sys::EV_REL as u16, sys::REL_X as u16, dx as i32));
        }
        if dy != 0.0 {
            self.pending
                .push(event(sys::EV_REL as u16, sys::REL_Y as u16, dy as i32));
        }

        let sx = self.sx.trunc();
        let sy = self.sy.trunc();
        self.sx -= sx;
        self.sy -= sy;
        if sx != 0.0 {
            self.pending.push(event(
                sys::EV_REL as u16,
                sys::REL_HWHEEL as u16,
                sx as i32,
            ));
        }
        if sy != 0.0 {
            self.pending
                .push(event(sys::EV_REL as u16, sys::REL_WHEEL as u16, sy as i32));
        }

        if self.pending.is_empty() {
            return;
        }

        self.pending.push(event(
            sys::EV_SYN as u16,
            sys::SYN_REPORT as u16,
            0,
        ));
        if let Err(e) = self.handle.write(&self.pending) {
            tracing::warn!("uinput write failed: {}", e);
        }
        self.pending.clear();
    }
}

impl Drop for UinputDevice {
    fn drop(&mut self) {
        let _ = self.handle.dev_destroy();
    }
}
