// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Table-driven HID report decoder, plus the DualShock 4 driver built on
//! top of it. The decoder maps byte/bit-offset fields to axes and a button
//! block; decoding is pure, the same bytes always produce the same state.

use tracing::{debug, warn};

use crate::controller::{
    Controller, ControllerFlags, ControllerInput, DriveStatus, SCButton, STICK_PAD_MAX,
    STICK_PAD_MIN,
};
use crate::daemon::Daemon;
use crate::transport::{self, InputDevice, InputDeviceData, InterruptEvent};

pub const AXIS_COUNT: usize = 17;

// Axis slot assignments, matching [crate::controller::ControllerInput].
pub const AXIS_LPAD_X: usize = 0;
pub const AXIS_LPAD_Y: usize = 1;
pub const AXIS_RPAD_X: usize = 2;
pub const AXIS_RPAD_Y: usize = 3;
pub const AXIS_STICK_X: usize = 4;
pub const AXIS_STICK_Y: usize = 5;
pub const AXIS_LTRIG: usize = 6;
pub const AXIS_RTRIG: usize = 7;
pub const AXIS_GPITCH: usize = 8;
pub const AXIS_GROLL: usize = 9;
pub const AXIS_GYAW: usize = 10;
pub const AXIS_CPAD_X: usize = 15;
pub const AXIS_CPAD_Y: usize = 16;

pub const BUTTON_DISABLED: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisMode {
    Disabled,
    /// Scaled and offset into [-1, 1], deadzoned, then expanded by
    /// `clamp_max`. Sets `button` while outside the deadzone, which is how
    /// the pad touch bits get synthesized.
    Axis {
        button: u32,
        scale: f32,
        offset: f32,
        clamp_min: i32,
        clamp_max: i32,
        deadzone: f32,
    },
    /// Raw field value, no conversion.
    AxisNoScale,
    /// Two bits of a button field, mapped to the axis extremes.
    DPad {
        button: u32,
        bit_low: u8,
        bit_high: u8,
        min: i32,
        max: i32,
    },
    /// 4-bit hatswitch: 8 directions plus centered, written to this axis
    /// slot and the next one.
    Hatswitch { button: u32, min: i32, max: i32 },
    DS4Accel,
    DS4Gyro,
    DS4Touchpad,
}

#[derive(Debug, Clone, Copy)]
pub struct AxisData {
    pub mode: AxisMode,
    pub byte_offset: usize,
    pub bit_offset: u8,
    pub size: u8,
}

impl AxisData {
    pub const DISABLED: AxisData = AxisData {
        mode: AxisMode::Disabled,
        byte_offset: 0,
        bit_offset: 0,
        size: 8,
    };
}

#[derive(Debug, Clone, Copy)]
pub struct ButtonData {
    pub enabled: bool,
    pub byte_offset: usize,
    pub bit_offset: u8,
    /// Maps report bit index to a [SCButton] bit position, or
    /// [BUTTON_DISABLED].
    pub button_map: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HidInput {
    pub buttons: u32,
    pub axes: [i32; AXIS_COUNT],
}

pub struct HidDecoder {
    pub axes: [AxisData; AXIS_COUNT],
    pub buttons: ButtonData,
    pub packet_size: usize,
    old_state: HidInput,
    state: HidInput,
}

fn grab_value(data: &[u8], byte_offset: usize, bit_offset: u8) -> u64 {
    let mut raw = [0u8; 8];
    for (i, slot) in raw.iter_mut().enumerate() {
        *slot = data.get(byte_offset + i).copied().unwrap_or(0);
    }
    u64::from_le_bytes(raw) >> bit_offset
}

fn grab_with_size(size: u8, data: &[u8], byte_offset: usize, bit_offset: u8) -> i64 {
    let val = grab_value(data, byte_offset, bit_offset);
    match size {
        16 => val as u16 as i64,
        32 => val as u32 as i64,
        64 => val as i64,
        _ => val as u8 as i64,
    }
}

impl HidDecoder {
    pub fn new(axes: [AxisData; AXIS_COUNT], buttons: ButtonData, packet_size: usize) -> Self {
        HidDecoder {
            axes,
            buttons,
            packet_size,
            old_state: HidInput::default(),
            state: HidInput::default(),
        }
    }

    pub fn state(&self) -> &HidInput {
        &self.state
    }

    /// Decodes one report. Returns true when anything changed.
    pub fn decode(&mut self, data: &[u8]) -> bool {
        self.old_state = self.state;
        self.state.buttons = 0;

        for i in 0..AXIS_COUNT {
            let axis = self.axes[i];
            match axis.mode {
                AxisMode::Disabled => (),
                AxisMode::Axis {
                    button,
                    scale,
                    offset,
                    clamp_min,
                    clamp_max,
                    deadzone,
                } => {
                    let raw = grab_with_size(axis.size, data, axis.byte_offset, axis.bit_offset);
                    let fval = raw as f32 * scale + offset;
                    if fval >= -deadzone && fval <= deadzone {
                        self.state.axes[i] = 0;
                    } else {
                        self.state.buttons |= button;
                        self.state.axes[i] =
                            ((fval * clamp_max as f32) as i32).clamp(clamp_min, clamp_max);
                    }
                }
                AxisMode::AxisNoScale => {
                    self.state.axes[i] =
                        grab_with_size(axis.size, data, axis.byte_offset, axis.bit_offset) as i32;
                }
                AxisMode::DPad {
                    button,
                    bit_low,
                    bit_high,
                    min,
                    max,
                } => {
                    let value = grab_value(data, axis.byte_offset, axis.bit_offset) as u32;
                    if (value >> bit_low) & 1 != 0 {
                        self.state.buttons |= button;
                        self.state.axes[i] = min;
                    } else if (value >> bit_high) & 1 != 0 {
                        self.state.buttons |= button;
                        self.state.axes[i] = max;
                    } else {
                        self.state.axes[i] = 0;
                    }
                }
                AxisMode::Hatswitch { button, min, max } => {
                    let value = grab_value(data, axis.byte_offset, axis.bit_offset) as u8 & 0b1111;
                    let (x, y) = match value {
                        0 => (0, max),      // up
                        1 => (max, max),    // up-right
                        2 => (max, 0),      // right
                        3 => (max, min),    // down-right
                        4 => (0, min),      // down
                        5 => (min, min),    // down-left
                        6 => (min, 0),      // left
                        7 => (min, max),    // up-left
                        _ => (0, 0),        // centered
                    };
                    if value < 8 {
                        self.state.buttons |= button;
                    }
                    self.state.axes[i] = x;
                    if i + 1 < AXIS_COUNT {
                        self.state.axes[i + 1] = y;
                    }
                }
                AxisMode::DS4Accel => {
                    let value = grab_value(data, axis.byte_offset, axis.bit_offset) as u16;
                    self.state.axes[i] = value as i16 as i32;
                }
                AxisMode::DS4Gyro => {
                    let value = grab_value(data, axis.byte_offset, axis.bit_offset) as u16;
                    self.state.axes[i] = -(value as i16 as i32);
                }
                AxisMode::DS4Touchpad => {
                    let value = grab_value(data, axis.byte_offset, axis.bit_offset) as u16;
                    self.state.axes[i] = (value & 0x0fff) as i32;
                }
            }
        }

        if self.buttons.enabled {
            let value =
                grab_value(data, self.buttons.byte_offset, self.buttons.bit_offset) as u32;
            for i in 0..32 {
                let target = self.buttons.button_map[i];
                if target != BUTTON_DISABLED {
                    let bit = (value >> i) & 1;
                    self.state.buttons |= bit << target;
                }
            }
        }

        self.old_state != self.state
    }
}

////// DualShock 4 //////

pub const DS4_VENDOR_ID: u16 = 0x054c;
pub const DS4_PRODUCT_IDS: [u16; 2] = [0x05c4, 0x09cc];

const DS4_PACKET_SIZE: usize = 64;

fn ds4_stick(byte_offset: usize, button: u32, invert: bool) -> AxisData {
    AxisData {
        mode: AxisMode::Axis {
            button,
            scale: if invert { -1.0 / 127.5 } else { 1.0 / 127.5 },
            offset: if invert { 1.0 } else { -1.0 },
            clamp_min: STICK_PAD_MIN as i32,
            clamp_max: STICK_PAD_MAX as i32,
            deadzone: 0.06,
        },
        byte_offset,
        bit_offset: 0,
        size: 8,
    }
}

/// The USB input report layout of the DualShock 4, expressed as a decoder
/// table. The dpad (a hatswitch) plays the left pad, the right stick plays
/// the right pad and the center touchpad reports through the DS4Touchpad
/// fields.
pub fn ds4_decoder() -> HidDecoder {
    let mut axes = [AxisData::DISABLED; AXIS_COUNT];

    axes[AXIS_STICK_X] = ds4_stick(1, 0, false);
    axes[AXIS_STICK_Y] = ds4_stick(2, 0, true);
    axes[AXIS_RPAD_X] = ds4_stick(3, SCButton::RPADTOUCH.bits(), false);
    axes[AXIS_RPAD_Y] = ds4_stick(4, SCButton::RPADTOUCH.bits(), true);

    axes[AXIS_LPAD_X] = AxisData {
        mode: AxisMode::Hatswitch {
            button: SCButton::LPADTOUCH.bits(),
            min: STICK_PAD_MIN as i32,
            max: STICK_PAD_MAX as i32,
        },
        byte_offset: 5,
        bit_offset: 0,
        size: 8,
    };

    axes[AXIS_LTRIG] = AxisData {
        mode: AxisMode::AxisNoScale,
        byte_offset: 8,
        bit_offset: 0,
        size: 8,
    };
    axes[AXIS_RTRIG] = AxisData {
        mode: AxisMode::AxisNoScale,
        byte_offset: 9,
        bit_offset: 0,
        size: 8,
    };

    axes[AXIS_GPITCH] = AxisData {
        mode: AxisMode::DS4Gyro,
        byte_offset: 13,
        bit_offset: 0,
        size: 16,
    };
    axes[AXIS_GYAW] = AxisData {
        mode: AxisMode::DS4Gyro,
        byte_offset: 15,
        bit_offset: 0,
        size: 16,
    };
    axes[AXIS_GROLL] = AxisData {
        mode: AxisMode::DS4Gyro,
        byte_offset: 17,
        bit_offset: 0,
        size: 16,
    };

    axes[AXIS_CPAD_X] = AxisData {
        mode: AxisMode::DS4Touchpad,
        byte_offset: 36,
        bit_offset: 0,
        size: 16,
    };
    axes[AXIS_CPAD_Y] = AxisData {
        mode: AxisMode::DS4Touchpad,
        byte_offset: 37,
        bit_offset: 4,
        size: 16,
    };

    let mut button_map = [BUTTON_DISABLED; 32];
    // The button block starts at byte 5 bit 4: square, cross, circle,
    // triangle, then byte 6: L1, R1, L2, R2, share, options, L3, R3, then
    // byte 7: PS, touchpad click.
    let assignments: [(usize, SCButton); 14] = [
        (0, SCButton::X),
        (1, SCButton::A),
        (2, SCButton::B),
        (3, SCButton::Y),
        (4, SCButton::LB),
        (5, SCButton::RB),
        (6, SCButton::LT),
        (7, SCButton::RT),
        (8, SCButton::BACK),
        (9, SCButton::START),
        (10, SCButton::STICKPRESS),
        (11, SCButton::RPADPRESS),
        (12, SCButton::C),
        (13, SCButton::CPADPRESS),
    ];
    for (bit, button) in assignments {
        button_map[bit] = button.bits().trailing_zeros() as u8;
    }

    HidDecoder::new(
        axes,
        ButtonData {
            enabled: true,
            byte_offset: 5,
            bit_offset: 4,
            button_map,
        },
        DS4_PACKET_SIZE,
    )
}

/// Converts decoded state to a [ControllerInput], adding the parts the
/// table can't express: touchpad touch detection and coordinate scaling.
pub fn ds4_convert(state: &HidInput, raw: &[u8]) -> ControllerInput {
    let mut input = ControllerInput {
        buttons: SCButton::from_bits_retain(state.buttons),
        ltrig: state.axes[AXIS_LTRIG] as u8,
        rtrig: state.axes[AXIS_RTRIG] as u8,
        stick_x: state.axes[AXIS_STICK_X] as i16,
        stick_y: state.axes[AXIS_STICK_Y] as i16,
        lpad_x: state.axes[AXIS_LPAD_X] as i16,
        lpad_y: state.axes[AXIS_LPAD_Y] as i16,
        rpad_x: state.axes[AXIS_RPAD_X] as i16,
        rpad_y: state.axes[AXIS_RPAD_Y] as i16,
        ..Default::default()
    };

    input.gyro.gpitch = state.axes[AXIS_GPITCH] as i16;
    input.gyro.groll = state.axes[AXIS_GROLL] as i16;
    input.gyro.gyaw = state.axes[AXIS_GYAW] as i16;

    // Touchpad: finger 1 slot at byte 35, active-low bit 7.
    let touching = raw.get(35).map(|b| b & 0x80 == 0).unwrap_or(false);
    if touching {
        input.buttons |= SCButton::CPADTOUCH;
        // 1920x942 touchpad units, rescaled to the axis range.
        let x = (state.axes[AXIS_CPAD_X] as i32).min(1919);
        let y = (state.axes[AXIS_CPAD_Y] as i32).min(941);
        input.cpad_x = (x * 0xffff / 1919 - 0x8000) as i16;
        input.cpad_y = (0x7fff - y * 0xffff / 941) as i16;
    }

    input
}

struct Ds4Controller {
    dev: Box<dyn InputDevice>,
    decoder: HidDecoder,
    id: String,
}

impl Controller for Ds4Controller {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> &'static str {
        "ds4"
    }

    fn description(&self) -> String {
        format!("<DS4 {}>", self.id)
    }

    fn flags(&self) -> ControllerFlags {
        ControllerFlags::HAS_RSTICK
            | ControllerFlags::SEPARATE_STICK
            | ControllerFlags::HAS_CPAD
            | ControllerFlags::HAS_DPAD
            | ControllerFlags::EUREL_GYROS
            | ControllerFlags::NO_GRIPS
    }

    fn gyro_enabled(&self) -> bool {
        // The DS4 always streams motion data.
        true
    }

    fn wants_pump(&self) -> bool {
        true
    }

    fn drive(&mut self, frames: &mut Vec<ControllerInput>) -> DriveStatus {
        let mut events = Vec::new();
        self.dev.poll_interrupts(&mut events);

        for event in events {
            match event {
                InterruptEvent::Packet { data, .. } => {
                    if data.len() < self.decoder.packet_size || data[0] != 0x01 {
                        continue;
                    }
                    if self.decoder.decode(&data) {
                        frames.push(ds4_convert(self.decoder.state(), &data));
                    }
                }
                InterruptEvent::Gone => {
                    debug!("{} disconnected", self.description());
                    frames.push(ControllerInput::default());
                    return DriveStatus::Disconnected;
                }
            }
        }
        DriveStatus::Idle
    }
}

pub fn hotplug(daemon: &mut Daemon, idata: &InputDeviceData) -> bool {
    let mut dev = {
        let api = daemon.hidapi();
        match transport::open(idata, api) {
            Ok(dev) => dev,
            Err(e) => {
                warn!("failed to open '{}': {:#}", idata.path, e);
                return true;
            }
        }
    };

    if let Err(e) = dev.start_interrupt_read(0, DS4_PACKET_SIZE) {
        warn!("{:#}", e);
        return true;
    }

    let id = match &idata.uniq {
        Some(uniq) if !uniq.is_empty() => format!("ds4{}", uniq.replace(char::is_whitespace, "")),
        _ => {
            let free = (0..64)
                .find(|i| daemon.used_auto_serials & (1 << i) == 0)
                .unwrap_or(63);
            daemon.used_auto_serials |= 1 << free;
            format!("ds4{}", free)
        }
    };

    debug!(id, "new DualShock 4 connected");
    let controller = Ds4Controller {
        dev,
        decoder: ds4_decoder(),
        id,
    };
    daemon
        .add_controller(Box::new(controller), Some(idata.path.clone()))
        .is_some()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ds4_packet() -> [u8; 64] {
        let mut p = [0u8; 64];
        p[0] = 0x01;
        // Sticks centered, hat centered, touchpad inactive.
        p[1] = 128;
        p[2] = 128;
        p[3] = 128;
        p[4] = 128;
        p[5] = 0x08;
        p[35] = 0x80;
        p
    }

    #[test]
    fn decode_is_pure() {
        let p = ds4_packet();
        let mut a = ds4_decoder();
        let mut b = ds4_decoder();
        a.decode(&p);
        b.decode(&p);
        assert_eq!(a.state(), b.state());

        // Re-decoding the same bytes reports no change.
        assert!(!a.decode(&p));
    }

    #[test]
    fn hatswitch_cardinals_and_diagonals() {
        let mut dec = ds4_decoder();
        let expected: [(u8, (i32, i32)); 9] = [
            (0, (0, 32767)),
            (1, (32767, 32767)),
            (2, (32767, 0)),
            (3, (32767, -32768)),
            (4, (0, -32768)),
            (5, (-32768, -32768)),
            (6, (-32768, 0)),
            (7, (-32768, 32767)),
            (8, (0, 0)),
        ];

        for (hat, (x, y)) in expected {
            let mut p = ds4_packet();
            p[5] = hat;
            dec.decode(&p);
            assert_eq!(
                (dec.state().axes[AXIS_LPAD_X], dec.state().axes[AXIS_LPAD_Y]),
                (x, y),
                "hat value {}",
                hat
            );

            let touched = dec.state().buttons & SCButton::LPADTOUCH.bits() != 0;
            assert_eq!(touched, hat < 8);
        }
    }

    #[test]
    fn stick_scaling_and_deadzone() {
        let mut dec = ds4_decoder();

        let mut p = ds4_packet();
        p[1] = 255;
        dec.decode(&p);
        assert_eq!(dec.state().axes[AXIS_STICK_X], 32767);

        p[1] = 0;
        dec.decode(&p);
        assert_eq!(dec.state().axes[AXIS_STICK_X], -32767);

        // Around center lands in the deadzone.
        p[1] = 129;
        dec.decode(&p);
        assert_eq!(dec.state().axes[AXIS_STICK_X], 0);
    }

    #[test]
    fn buttons_map_to_sc_bits() {
        let mut dec = ds4_decoder();
        let mut p = ds4_packet();
        p[5] |= 0x20; // cross
        p[6] = 0x03; // L1 + R1
        p[7] = 0x01; // PS
        dec.decode(&p);

        let buttons = SCButton::from_bits_retain(dec.state().buttons);
        assert_eq!(
            buttons,
            SCButton::A | SCButton::LB | SCButton::RB | SCButton::C
        );
    }

    #[test]
    fn triggers_pass_through() {
        let mut dec = ds4_decoder();
        let mut p = ds4_packet();
        p[8] = 200;
        p[9] = 10;
        dec.decode(&p);

        let input = ds4_convert(dec.state(), &p);
        assert_eq!(input.ltrig, 200);
        assert_eq!(input.rtrig, 10);
    }

    #[test]
    fn touchpad_touch_bit_accompanies_coordinates() {
        let mut dec = ds4_decoder();
        let mut p = ds4_packet();
        dec.decode(&p);
        let input = ds4_convert(dec.state(), &p);
        assert!(!input.buttons.contains(SCButton::CPADTOUCH));
        assert_eq!((input.cpad_x, input.cpad_y), (0, 0));

        p[35] = 0x01; // finger down
        p[36] = 0xff;
        p[37] = 0x03; // x = 1023
        dec.decode(&p);
        let input = ds4_convert(dec.state(), &p);
        assert!(input.buttons.contains(SCButton::CPADTOUCH));
        assert_ne!(input.cpad_x, 0);
    }
}
