// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Steam Deck built-in controller. The packet resembles the wired
//! controller's, but with a 64-bit button word, 16-bit triggers, and both
//! sticks reported separately. Left alone, the deck drops back into its
//! HID-mouse ("lizard") mode, so the mappings are re-cleared on a fixed
//! packet cadence.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use super::{i16_at, u16_at, u32_at, ScController, ScKind, ScPhase, ScState, SharedDev};
use crate::controller::{AxisValue, ControllerInput, SCButton, STICK_PAD_MAX, STICK_PAD_MIN};
use crate::daemon::Daemon;
use crate::transport::{self, InputDeviceData, Subsystem};

pub const VENDOR_ID: u16 = 0x28de;
pub const PRODUCT_ID: u16 = 0x1205;

const ENDPOINT: u8 = 3;
const CONTROL_IDX: u16 = 2;
const PACKET_SIZE: usize = 128;
const UNLIZARD_INTERVAL: u32 = 100;
// Deck sticks tend to rest at a non-zero position.
const STICK_DEADZONE: AxisValue = 3000;

// Bit positions in the 64-bit button word.
const SDB_DOTS: u64 = 1 << 50;
const SDB_RSTICKPRESS: u64 = 1 << 26;
const SDB_LSTICKPRESS: u64 = 1 << 22;
const SDB_RGRIP2: u64 = 1 << 42;
const SDB_LGRIP2: u64 = 1 << 41;
const SDB_DPAD_DOWN: u64 = 1 << 11;
const SDB_DPAD_LEFT: u64 = 1 << 10;
const SDB_DPAD_RIGHT: u64 = 1 << 9;
const SDB_DPAD_UP: u64 = 1 << 8;

/// Buttons whose deck bit position matches the common layout once shifted
/// into place (everything in bits 0..=20 except the dpad).
const DIRECTLY_TRANSLATABLE: u64 = 0b1_1111_1111_0000_1111_1111;

fn map_button(raw: u64, from: u64, to: SCButton) -> SCButton {
    if raw & from != 0 {
        to
    } else {
        SCButton::empty()
    }
}

fn map_dpad(raw: u64, low: u64, high: u64) -> AxisValue {
    if raw & low != 0 {
        STICK_PAD_MIN
    } else if raw & high != 0 {
        STICK_PAD_MAX
    } else {
        0
    }
}

fn apply_deadzone(value: AxisValue, deadzone: AxisValue) -> AxisValue {
    if value > -deadzone && value < deadzone {
        0
    } else {
        value
    }
}

pub fn decode(state: &mut ScState, data: &[u8]) -> Option<ControllerInput> {
    if data.len() < 56 || data[0] != super::PT_INPUT {
        return None;
    }

    let seq = u32_at(data, 4);
    if seq % UNLIZARD_INTERVAL == 0 {
        // Keeps lizard mode from coming back.
        state.clear_mappings();
    }

    let raw = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let buttons = SCButton::from_bits_retain((((raw & DIRECTLY_TRANSLATABLE) << 8) & 0xffff_ffff) as u32)
        | map_button(raw, SDB_DOTS, SCButton::DOTS)
        | map_button(raw, SDB_LSTICKPRESS, SCButton::STICKPRESS)
        | map_button(raw, SDB_RSTICKPRESS, SCButton::RSTICKPRESS)
        | map_button(raw, SDB_LGRIP2, SCButton::LGRIP2)
        | map_button(raw, SDB_RGRIP2, SCButton::RGRIP2);
    state.input.buttons = buttons;

    state.input.ltrig = (u16_at(data, 44) >> 7) as u8;
    state.input.rtrig = (u16_at(data, 46) >> 7) as u8;

    state.input.stick_x = apply_deadzone(i16_at(data, 48), STICK_DEADZONE);
    state.input.stick_y = apply_deadzone(i16_at(data, 50), STICK_DEADZONE);
    state.input.rstick_x = apply_deadzone(i16_at(data, 52), STICK_DEADZONE);
    state.input.rstick_y = apply_deadzone(i16_at(data, 54), STICK_DEADZONE);

    state.input.lpad_x = i16_at(data, 16);
    state.input.lpad_y = i16_at(data, 18);
    state.input.rpad_x = i16_at(data, 20);
    state.input.rpad_y = i16_at(data, 22);

    state.input.gyro.accel_x = i16_at(data, 24);
    state.input.gyro.accel_y = i16_at(data, 26);
    state.input.gyro.accel_z = i16_at(data, 28);
    state.input.gyro.gpitch = i16_at(data, 30);
    state.input.gyro.groll = i16_at(data, 32);
    state.input.gyro.gyaw = i16_at(data, 34);
    state.input.gyro.q0 = i16_at(data, 36);
    state.input.gyro.q1 = i16_at(data, 38);
    state.input.gyro.q2 = i16_at(data, 40);
    state.input.gyro.q3 = i16_at(data, 42);

    state.input.dpad_x = map_dpad(raw, SDB_DPAD_LEFT, SDB_DPAD_RIGHT);
    state.input.dpad_y = map_dpad(raw, SDB_DPAD_DOWN, SDB_DPAD_UP);

    Some(state.input)
}

pub fn hotplug(daemon: &mut Daemon, idata: &InputDeviceData) -> bool {
    let dev = {
        let api = daemon.hidapi();
        match transport::open(idata, api) {
            Ok(dev) => dev,
            Err(e) => {
                warn!("failed to open '{}': {:#}", idata.path, e);
                return true;
            }
        }
    };

    let is_usb = dev.subsystem() == Subsystem::Usb;
    let dev: SharedDev = Rc::new(RefCell::new(dev));
    let mut state = ScState::new(dev.clone(), ScKind::Deck, CONTROL_IDX);

    if is_usb && dev.borrow_mut().claim_interfaces_by(3, 0, 0) == 0 {
        warn!("failed to claim interfaces");
        return true;
    }
    if !state.configure() || !state.clear_mappings() {
        warn!("failed to configure deck");
        return true;
    }

    let ignore_serials = daemon.cfg.get_bool("ignore_serials");
    if !state.read_serial(ignore_serials, &mut daemon.used_auto_serials) {
        warn!("failed to read serial number");
        return true;
    }
    if let Err(e) = dev.borrow_mut().start_interrupt_read(ENDPOINT, PACKET_SIZE) {
        warn!("{:#}", e);
        return true;
    }

    debug!("Steam Deck with serial {} successfully configured", state.serial);
    state.phase = ScPhase::Ready;
    let controller = ScController::new(Rc::new(RefCell::new(state)), true);
    daemon
        .add_controller(Box::new(controller), Some(idata.path.clone()))
        .is_some()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state() -> ScState {
        let dummy = ScState::new(
            // No device; the unlizard ping is a no-op in tests.
            Rc::new(RefCell::new(
                Box::new(NullDev) as Box<dyn crate::transport::InputDevice>
            )),
            ScKind::Deck,
            CONTROL_IDX,
        );
        dummy
    }

    struct NullDev;

    impl crate::transport::InputDevice for NullDev {
        fn subsystem(&self) -> Subsystem {
            Subsystem::Usb
        }

        fn claim_interfaces_by(&mut self, _: u8, _: u8, _: u8) -> usize {
            0
        }

        fn start_interrupt_read(&mut self, _: u8, _: usize) -> anyhow::Result<()> {
            Ok(())
        }

        fn poll_interrupts(&mut self, _: &mut Vec<crate::transport::InterruptEvent>) {}

        fn hid_write(&mut self, _: u16, _: &[u8]) {}

        fn hid_request(&mut self, _: u16, _: &mut [u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn packet(buttons: u64, lstick: (i16, i16), triggers: (u16, u16)) -> [u8; 64] {
        let mut p = [0u8; 64];
        p[0] = super::super::PT_INPUT;
        p[4..8].copy_from_slice(&1u32.to_le_bytes()); // seq, not on the ping cadence
        p[8..16].copy_from_slice(&buttons.to_le_bytes());
        p[44..46].copy_from_slice(&triggers.0.to_le_bytes());
        p[46..48].copy_from_slice(&triggers.1.to_le_bytes());
        p[48..50].copy_from_slice(&lstick.0.to_le_bytes());
        p[50..52].copy_from_slice(&lstick.1.to_le_bytes());
        p
    }

    #[test]
    fn direct_buttons_shift_into_place() {
        let mut s = state();
        // Deck bits 7 (A) and 0 (RT).
        let frame = decode(&mut s, &packet((1 << 7) | 1, (0, 0), (0, 0))).unwrap();
        assert_eq!(frame.buttons, SCButton::A | SCButton::RT);
    }

    #[test]
    fn extended_buttons_map_individually() {
        let mut s = state();
        let raw = SDB_LSTICKPRESS | SDB_RSTICKPRESS | SDB_LGRIP2 | SDB_DOTS;
        let frame = decode(&mut s, &packet(raw, (0, 0), (0, 0))).unwrap();
        assert_eq!(
            frame.buttons,
            SCButton::STICKPRESS | SCButton::RSTICKPRESS | SCButton::LGRIP2 | SCButton::DOTS
        );
    }

    #[test]
    fn dpad_bits_become_axes() {
        let mut s = state();
        let frame = decode(&mut s, &packet(SDB_DPAD_LEFT | SDB_DPAD_UP, (0, 0), (0, 0))).unwrap();
        assert_eq!(frame.dpad_x, STICK_PAD_MIN);
        assert_eq!(frame.dpad_y, STICK_PAD_MAX);
        // The dpad does not leak into the button word.
        assert_eq!(frame.buttons, SCButton::empty());
    }

    #[test]
    fn stick_deadzone_and_triggers() {
        let mut s = state();
        let frame = decode(&mut s, &packet(0, (2999, -15000), (0x7fff, 0))).unwrap();
        assert_eq!(frame.stick_x, 0);
        assert_eq!(frame.stick_y, -15000);
        assert_eq!(frame.ltrig, 0xff);
        assert_eq!(frame.rtrig, 0);
    }
}
