// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Steam Controller connected over bluetooth. Input arrives as 20-byte
//! reports; a report can declare itself the first half of a long packet,
//! with the continuation concatenated before decoding. A 16-bit bitmap in
//! the header says which field groups are present; absent fields keep their
//! previous values.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use super::{i16_at, u16_at, u32_at, ScController, ScKind, ScPhase, ScState, SharedDev};
use crate::controller::{ControllerInput, SCButton};
use crate::daemon::Daemon;
use crate::transport::{self, InputDeviceData, Subsystem};

pub const VENDOR_ID: u16 = 0x28de;
pub const PRODUCT_ID: u16 = 0x1106;

const ENDPOINT: u8 = 3;
const CONTROL_IDX: u16 = 0;
const PACKET_SIZE: usize = 20;
const LONG_PACKET: u8 = 0x80;

const BUTTON: u16 = 0x0010;
const TRIGGERS: u16 = 0x0020;
const STICK: u16 = 0x0080;
const LPAD: u16 = 0x0100;
const RPAD: u16 = 0x0200;
const GYRO: u16 = 0x1800;
const PING: u16 = 0x5000;

// Bit positions in the bluetooth button word. Bits 8..11 are the dpad the
// controller computes itself; bit 21 is unused.
const BT_BUTTONS: [SCButton; 23] = [
    SCButton::RT,
    SCButton::LT,
    SCButton::RB,
    SCButton::LB,
    SCButton::Y,
    SCButton::B,
    SCButton::X,
    SCButton::A,
    SCButton::empty(),
    SCButton::empty(),
    SCButton::empty(),
    SCButton::empty(),
    SCButton::BACK,
    SCButton::C,
    SCButton::START,
    SCButton::LGRIP,
    SCButton::RGRIP,
    SCButton::LPADPRESS,
    SCButton::RPADPRESS,
    SCButton::LPADTOUCH,
    SCButton::RPADTOUCH,
    SCButton::empty(),
    SCButton::STICKPRESS,
];

pub fn decode(state: &mut ScState, data: &[u8]) -> Option<ControllerInput> {
    if data.len() < PACKET_SIZE {
        return None;
    }

    if state.long_packet {
        // Second half of a segmented packet; the leading tag byte is
        // dropped and the rest lands after the first 20 bytes.
        let buf = &mut state.bt_buf;
        buf[PACKET_SIZE..2 * PACKET_SIZE - 1].copy_from_slice(&data[1..PACKET_SIZE]);
        state.long_packet = false;
    } else {
        state.bt_buf[..PACKET_SIZE].copy_from_slice(&data[..PACKET_SIZE]);
        if state.bt_buf[1] == LONG_PACKET {
            state.long_packet = true;
            return None;
        }
    }

    let buf = state.bt_buf;
    let ptype = u16_at(&buf, 2);
    if ptype & PING == PING {
        // Keepalive; mutates nothing.
        return None;
    }

    let mut off = 4;
    let mut any = false;

    if ptype & BUTTON == BUTTON {
        any = true;
        let mut raw = u32_at(&buf, off);
        let mut buttons = SCButton::empty();
        for mapped in BT_BUTTONS {
            if raw & 1 != 0 {
                buttons |= mapped;
            }
            raw >>= 1;
        }
        state.input.buttons = buttons;
        off += 3;
    }
    if ptype & TRIGGERS == TRIGGERS {
        any = true;
        state.input.ltrig = buf[off];
        state.input.rtrig = buf[off + 1];
        off += 2;
    }
    if ptype & STICK == STICK {
        any = true;
        state.input.stick_x = i16_at(&buf, off);
        state.input.stick_y = i16_at(&buf, off + 2);
        off += 4;
    }
    if ptype & LPAD == LPAD {
        any = true;
        state.input.lpad_x = i16_at(&buf, off);
        state.input.lpad_y = i16_at(&buf, off + 2);
        off += 4;
    }
    if ptype & RPAD == RPAD {
        any = true;
        state.input.rpad_x = i16_at(&buf, off);
        state.input.rpad_y = i16_at(&buf, off + 2);
        off += 4;
    }
    if ptype & GYRO == GYRO {
        any = true;
        state.input.gyro.gpitch = i16_at(&buf, off);
        state.input.gyro.groll = i16_at(&buf, off + 2);
        state.input.gyro.gyaw = i16_at(&buf, off + 4);
        state.input.gyro.q0 = i16_at(&buf, off + 6);
        state.input.gyro.q1 = i16_at(&buf, off + 8);
        state.input.gyro.q2 = i16_at(&buf, off + 10);
        state.input.gyro.q3 = i16_at(&buf, off + 12);
    }

    any.then_some(state.input)
}

pub fn hotplug(daemon: &mut Daemon, idata: &InputDeviceData) -> bool {
    debug!("bluetooth steam controller at {}", idata.path);
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

    debug_assert_eq!(dev.subsystem(), Subsystem::Hidapi);
    let dev: SharedDev = Rc::new(RefCell::new(dev));
    let mut state = ScState::new(dev.clone(), ScKind::Bt, CONTROL_IDX);

    let ignore_serials = daemon.cfg.get_bool("ignore_serials");
    if !state.read_serial(ignore_serials, &mut daemon.used_auto_serials) {
        warn!("failed to read serial number");
        return true;
    }
    if !state.clear_mappings() || !state.configure() {
        warn!("failed to configure controller");
        return true;
    }
    if let Err(e) = dev.borrow_mut().start_interrupt_read(ENDPOINT, PACKET_SIZE) {
        warn!("{:#}", e);
        return true;
    }

    debug!("new bluetooth Steam Controller with serial {}", state.serial);
    state.phase = ScPhase::Ready;
    let controller = ScController::new(Rc::new(RefCell::new(state)), true);
    daemon
        .add_controller(Box::new(controller), Some(idata.path.clone()))
        .is_some()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::ControllerInput;
    use pretty_assertions::assert_eq;

    fn state() -> ScState {
        ScState {
            dev: None,
            kind: ScKind::Bt,
            phase: ScPhase::Ready,
            serial: "BT01".to_owned(),
            id: "scBT01".to_owned(),
            idx: 0,
            gyro_enabled: true,
            idle_timeout: 600,
            led_level: 50,
            hdata: Default::default(),
            input: ControllerInput::default(),
            long_packet: false,
            bt_buf: [0; 40],
        }
    }

    fn packet(ptype: u16, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; PACKET_SIZE];
        p[2..4].copy_from_slice(&ptype.to_le_bytes());
        p[4..4 + payload.len()].copy_from_slice(payload);
        p
    }

    #[test]
    fn buttons_map_through_the_bit_table() {
        let mut s = state();
        // Bits 0 (RT) and 7 (A) and 22 (stick press).
        let raw: u32 = (1 << 0) | (1 << 7) | (1 << 22);
        let frame = decode(&mut s, &packet(BUTTON, &raw.to_le_bytes()[..3])).unwrap();
        assert_eq!(
            frame.buttons,
            SCButton::RT | SCButton::A | SCButton::STICKPRESS
        );
    }

    #[test]
    fn absent_fields_keep_previous_values() {
        let mut s = state();

        let mut payload = Vec::new();
        payload.extend_from_slice(&1000i16.to_le_bytes());
        payload.extend_from_slice(&2000i16.to_le_bytes());
        decode(&mut s, &packet(STICK, &payload)).unwrap();

        // A trigger-only packet must not disturb the stick.
        let frame = decode(&mut s, &packet(TRIGGERS, &[77, 88])).unwrap();
        assert_eq!((frame.stick_x, frame.stick_y), (1000, 2000));
        assert_eq!((frame.ltrig, frame.rtrig), (77, 88));
    }

    #[test]
    fn identical_packets_decode_identically() {
        let mut payload = vec![0u8; 9];
        payload[..3].copy_from_slice(&((1u32 << 4) | (1 << 5)).to_le_bytes()[..3]);
        payload[3] = 11;
        payload[4] = 22;
        payload[5..7].copy_from_slice(&500i16.to_le_bytes());
        payload[7..9].copy_from_slice(&(-500i16).to_le_bytes());
        let p = packet(BUTTON | TRIGGERS | STICK, &payload);

        let mut a = state();
        let mut b = state();
        assert_eq!(decode(&mut a, &p), decode(&mut b, &p));
    }

    #[test]
    fn ping_packets_mutate_nothing() {
        let mut s = state();
        decode(&mut s, &packet(STICK, &[0x10, 0x27, 0x10, 0x27])).unwrap();
        let before = s.input;

        assert!(decode(&mut s, &packet(PING, &[])).is_none());
        assert_eq!(s.input, before);
    }

    #[test]
    fn all_zero_type_mask_reports_nothing() {
        let mut s = state();
        assert!(decode(&mut s, &packet(0, &[])).is_none());
    }

    #[test]
    fn long_packets_reassemble() {
        let mut s = state();

        // First half: tagged long, carrying a stick update whose second
        // coordinate lands in the continuation.
        let mut first = vec![0u8; PACKET_SIZE];
        first[1] = LONG_PACKET;
        let mut second = vec![0u8; PACKET_SIZE];

        // Full 39-byte payload as it should look after reassembly.
        let mut full = [0u8; 39];
        full[1] = LONG_PACKET;
        full[2..4].copy_from_slice(&(STICK | RPAD).to_le_bytes());
        full[4..6].copy_from_slice(&123i16.to_le_bytes());
        full[6..8].copy_from_slice(&(-123i16).to_le_bytes());
        full[8..10].copy_from_slice(&3000i16.to_le_bytes());
        full[10..12].copy_from_slice(&(-3000i16).to_le_bytes());

        first.copy_from_slice(&full[..PACKET_SIZE]);
        second[1..PACKET_SIZE].copy_from_slice(&full[PACKET_SIZE..]);

        // No state change until the continuation arrives.
        assert!(decode(&mut s, &first).is_none());
        assert!(s.long_packet);
        assert_eq!(s.input, ControllerInput::default());

        let frame = decode(&mut s, &second).unwrap();
        assert!(!s.long_packet);
        assert_eq!((frame.stick_x, frame.stick_y), (123, -123));
        assert_eq!((frame.rpad_x, frame.rpad_y), (3000, -3000));
    }
}
