// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Steam Controller family: wired, dongle-bound wireless, bluetooth, and
//! the Steam Deck. The variants share the handshake and most of the packet
//! vocabulary; the per-variant wire formats live in the sibling modules.

pub mod by_bt;
pub mod by_cable;
pub mod deck;
pub mod dongle;

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::controller::{
    Controller, ControllerFlags, ControllerInput, DriveStatus, HapticData, HapticPos, SCButton,
};
use crate::transport::{InputDevice, InterruptEvent};

pub type SharedDev = Rc<RefCell<Box<dyn InputDevice>>>;

// Packet types.
pub const PT_INPUT: u8 = 0x01;
pub const PT_HOTPLUG: u8 = 0x03;
pub const PT_IDLE: u8 = 0x04;
pub const PT_OFF: u8 = 0x9f;
pub const PT_CLEAR_MAPPINGS: u8 = 0x81;
pub const PT_CONFIGURE: u8 = 0x87;
pub const PT_LIZARD_BUTTONS: u8 = 0x85;
pub const PT_LIZARD_MOUSE: u8 = 0x8e;
pub const PT_FEEDBACK: u8 = 0x8f;
pub const PT_GET_SERIAL: u8 = 0xae;
pub const PT_BT_PREFIX: u8 = 0xc0;

pub const PL_LED: u8 = 0x03;
pub const PL_CONFIGURE: u8 = 0x15;
pub const PL_CONFIGURE_BT: u8 = 0x0f;
pub const PL_GET_SERIAL: u8 = 0x15;

pub const CT_LED: u8 = 0x2d;
pub const CT_CONFIGURE: u8 = 0x32;
pub const CT_CONFIGURE_BT: u8 = 0x18;

const REQUEST_SIZE: usize = 64;

// The stick-tilt flag the wired controller sets in its button word. Not a
// button; always stripped after decoding.
const B_STICKTILT: u32 = 1 << 31;

// Dpad bits the controller computes on its own. Cleared after decoding; the
// daemon derives dpad state from pad positions instead.
const DPAD_BITS: u32 = 0b1111 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScKind {
    Wired,
    Wireless,
    Bt,
    Deck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScPhase {
    NotConfigured,
    Ready,
    Failed,
}

pub fn i16_at(data: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([data[off], data[off + 1]])
}

pub fn u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

pub fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// Everything the daemon knows about one Steam Controller. Dongle slots and
/// the registered [ScController] shell share this through an `Rc`.
pub struct ScState {
    pub dev: Option<SharedDev>,
    pub kind: ScKind,
    pub phase: ScPhase,
    pub serial: String,
    pub id: String,
    pub idx: u16,
    pub gyro_enabled: bool,
    pub idle_timeout: u16,
    pub led_level: u8,
    hdata: [HapticData; 2],
    pub input: ControllerInput,
    // Reassembly state for segmented bluetooth packets.
    pub long_packet: bool,
    pub bt_buf: [u8; 40],
}

impl ScState {
    pub fn new(dev: SharedDev, kind: ScKind, idx: u16) -> ScState {
        ScState {
            dev: Some(dev),
            kind,
            phase: ScPhase::NotConfigured,
            serial: String::new(),
            id: String::new(),
            idx,
            gyro_enabled: true,
            idle_timeout: 10 * 60,
            led_level: 50,
            hdata: [
                HapticData {
                    pos: HapticPos::Right,
                    ..Default::default()
                },
                HapticData {
                    pos: HapticPos::Left,
                    ..Default::default()
                },
            ],
            input: ControllerInput::default(),
            long_packet: false,
            bt_buf: [0; 40],
        }
    }

    fn bt_offset(&self) -> usize {
        if self.kind == ScKind::Bt {
            2
        } else {
            0
        }
    }

    fn request(&self, data: &mut [u8]) -> bool {
        let Some(dev) = &self.dev else {
            // Disconnected but not deallocated yet.
            return false;
        };

        match dev.borrow_mut().hid_request(self.idx, data) {
            Ok(()) => true,
            Err(e) => {
                warn!("request to {} failed: {:#}", self.id, e);
                false
            }
        }
    }

    fn update_ids(&mut self) {
        match self.kind {
            ScKind::Deck => {
                self.id = format!("deck{}", self.serial);
            }
            _ => {
                self.id = format!("sc{}", self.serial);
            }
        }
    }

    pub fn description(&self) -> String {
        match self.kind {
            ScKind::Wired => format!("<SCByCable {}>", self.serial),
            ScKind::Wireless => format!("<SC {}>", self.serial),
            ScKind::Bt => format!("<SCByBt {}>", self.serial),
            ScKind::Deck => format!("<Deck {}>", self.serial),
        }
    }

    /// Reads the serial number the id derives from. With `ignore_serials`
    /// (a workaround for controllers that drop when asked), ids come from a
    /// shared bitmap of synthetic serials instead.
    pub fn read_serial(&mut self, ignore_serials: bool, used_serials: &mut u64) -> bool {
        if ignore_serials {
            let free = (0..64).find(|i| *used_serials & (1 << i) == 0).unwrap_or(63);
            *used_serials |= 1 << free;
            self.serial = free.to_string();
            self.update_ids();
            return true;
        }

        let off = self.bt_offset();
        let mut data = [0u8; REQUEST_SIZE];
        data[off] = PT_GET_SERIAL;
        data[off + 1] = PL_GET_SERIAL;
        data[off + 2] = 0x01;
        if off > 0 {
            data[0] = PT_BT_PREFIX;
        }

        if !self.request(&mut data) {
            return false;
        }

        if self.kind == ScKind::Bt {
            if data[4] == 0 {
                // Freshly connected and not yet able to answer.
                return false;
            }
        } else if data[0] != PT_GET_SERIAL {
            return false;
        }

        let raw = &data[3 + off..13 + off];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let serial = String::from_utf8_lossy(&raw[..end]).into_owned();
        if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_graphic()) {
            return false;
        }

        self.serial = serial;
        self.update_ids();
        true
    }

    /// Takes the controller out of lizard (HID keyboard/mouse) mode, so
    /// input arrives as raw packets.
    pub fn clear_mappings(&mut self) -> bool {
        let off = self.bt_offset();
        let mut data = [0u8; REQUEST_SIZE];
        data[off] = PT_CLEAR_MAPPINGS;
        data[off + 1] = 0x01;
        if off > 0 {
            data[0] = PT_BT_PREFIX;
        }
        self.request(&mut data)
    }

    /// The reverse of `clear_mappings`; hands the controller back to its
    /// built-in keyboard/mouse emulation.
    pub fn lizard_mode(&mut self) -> bool {
        let mut data = [0u8; REQUEST_SIZE];
        data[0] = PT_LIZARD_BUTTONS;
        data[1] = 0x01;
        if !self.request(&mut data) {
            return false;
        }

        data = [0u8; REQUEST_SIZE];
        data[0] = PT_LIZARD_MOUSE;
        self.request(&mut data)
    }

    /// Applies idle timeout, gyro enablement and led level.
    pub fn configure(&mut self) -> bool {
        match self.kind {
            ScKind::Deck => {
                let mut data = [0u8; REQUEST_SIZE];
                data[..4].copy_from_slice(&[PT_CONFIGURE, 0x03, 0x08, 0x07]);
                self.request(&mut data)
            }
            ScKind::Bt => {
                let mut gyro = [0u8; REQUEST_SIZE];
                gyro[..16].copy_from_slice(&[
                    PT_BT_PREFIX,
                    PT_CONFIGURE,
                    PL_CONFIGURE_BT,
                    CT_CONFIGURE_BT,
                    0x00,
                    0x00,
                    0x31,
                    0x02,
                    0x00,
                    0x08,
                    0x07,
                    0x00,
                    0x07,
                    0x07,
                    0x00,
                    0x30,
                ]);
                gyro[16] = if self.gyro_enabled { 0x14 } else { 0 };
                gyro[18] = 0x2e;
                if !self.request(&mut gyro) {
                    return false;
                }

                let mut leds = [0u8; REQUEST_SIZE];
                leds[..5].copy_from_slice(&[
                    PT_BT_PREFIX,
                    PT_CONFIGURE,
                    PL_LED,
                    CT_LED,
                    self.led_level,
                ]);
                self.request(&mut leds)
            }
            _ => {
                let mut gyro = [0u8; REQUEST_SIZE];
                gyro[..18].copy_from_slice(&[
                    PT_CONFIGURE,
                    PL_CONFIGURE,
                    CT_CONFIGURE,
                    (self.idle_timeout & 0xff) as u8,
                    (self.idle_timeout >> 8) as u8,
                    0x18,
                    0x00,
                    0x00,
                    0x31,
                    0x02,
                    0x00,
                    0x08,
                    0x07,
                    0x00,
                    0x07,
                    0x07,
                    0x00,
                    0x30,
                ]);
                gyro[18] = if self.gyro_enabled { 0x1c } else { 0 };
                gyro[20] = 0x2e;
                if !self.request(&mut gyro) {
                    return false;
                }

                let mut leds = [0u8; REQUEST_SIZE];
                leds[..4].copy_from_slice(&[PT_CONFIGURE, PL_LED, CT_LED, self.led_level]);
                self.request(&mut leds)
            }
        }
    }

    pub fn send_turnoff(&mut self) -> bool {
        let mut data = [0u8; REQUEST_SIZE];
        data[..6].copy_from_slice(&[PT_OFF, 0x04, b'o', b'f', b'f', b'!']);
        self.request(&mut data)
    }

    /// Haptic events generated while processing a frame are merged together
    /// and sent out at once when the frame is flushed.
    pub fn queue_haptic(&mut self, haptic: &HapticData) {
        if matches!(haptic.pos, HapticPos::Right | HapticPos::Both) {
            merge_haptic(&mut self.hdata[0], haptic);
        }
        if matches!(haptic.pos, HapticPos::Left | HapticPos::Both) {
            merge_haptic(&mut self.hdata[1], haptic);
        }
    }

    pub fn flush_haptics(&mut self) {
        for i in 0..2 {
            if self.hdata[i].enabled() {
                let mut packet = [0u8; REQUEST_SIZE];
                packet[0] = PT_FEEDBACK;
                packet[1] = 0x07;
                packet[2] = i as u8;
                packet[3..5].copy_from_slice(&self.hdata[i].amplitude.to_le_bytes());
                packet[5..7].copy_from_slice(&self.hdata[i].period.to_le_bytes());
                packet[7..9].copy_from_slice(&1u16.to_le_bytes());

                if let Some(dev) = &self.dev {
                    dev.borrow_mut().hid_write(self.idx, &packet);
                }
            }
            self.hdata[i].disable();
        }
    }

    /// Decodes the 64-byte wired/wireless input packet. The same packet
    /// region multiplexes stick and left-pad coordinates, discriminated by
    /// the touch and tilt bits.
    pub fn decode_wired(&mut self, data: &[u8]) -> Option<ControllerInput> {
        if data.len() < 48 || data[2] != PT_INPUT {
            return None;
        }

        self.input.ltrig = data[11];
        self.input.rtrig = data[12];
        self.input.rpad_x = i16_at(data, 20);
        self.input.rpad_y = i16_at(data, 22);

        self.input.gyro.accel_x = i16_at(data, 28);
        self.input.gyro.accel_y = i16_at(data, 30);
        self.input.gyro.accel_z = i16_at(data, 32);
        self.input.gyro.gpitch = i16_at(data, 34);
        self.input.gyro.groll = i16_at(data, 36);
        self.input.gyro.gyaw = i16_at(data, 38);
        self.input.gyro.q0 = i16_at(data, 40);
        self.input.gyro.q1 = i16_at(data, 42);
        self.input.gyro.q2 = i16_at(data, 44);
        self.input.gyro.q3 = i16_at(data, 46);

        let mut buttons = ((data[10] as u32) << 24) | ((u16_at(data, 8) as u32) << 8);
        let lpadtouch = buttons & SCButton::LPADTOUCH.bits() != 0;
        let sticktilt = buttons & B_STICKTILT != 0;

        if lpadtouch && !sticktilt {
            self.input.stick_x = 0;
            self.input.stick_y = 0;
        } else if !lpadtouch {
            self.input.stick_x = i16_at(data, 16);
            self.input.stick_y = i16_at(data, 18);
        }
        if !(lpadtouch || sticktilt) {
            self.input.lpad_x = 0;
            self.input.lpad_y = 0;
        } else if lpadtouch {
            self.input.lpad_x = i16_at(data, 16);
            self.input.lpad_y = i16_at(data, 18);
        }

        // The controller reports a stick click through the LPADPRESS bit,
        // with the tilt flag telling the two apart.
        if buttons & SCButton::LPADPRESS.bits() != 0 && sticktilt {
            buttons &= !SCButton::LPADPRESS.bits();
            buttons |= SCButton::STICKPRESS.bits();
        }

        buttons &= !(DPAD_BITS | B_STICKTILT);
        self.input.buttons = SCButton::from_bits_retain(buttons);

        Some(self.input)
    }

    pub fn mark_disconnected(&mut self) {
        self.dev = None;
        self.phase = ScPhase::Failed;
    }
}

fn merge_haptic(target: &mut HapticData, src: &HapticData) {
    target.amplitude = target.amplitude.saturating_add(src.amplitude);
    target.period = if target.period == 0 {
        src.period
    } else {
        ((target.period as u32 + src.period as u32) / 2) as u16
    };
}

/// The registry-facing shell around a shared [ScState]. Directly connected
/// controllers pump their own device; dongle slots are pumped by the dongle
/// (see [dongle]).
pub struct ScController {
    pub state: Rc<RefCell<ScState>>,
    pumped: bool,
}

impl ScController {
    pub fn new(state: Rc<RefCell<ScState>>, pumped: bool) -> ScController {
        ScController { state, pumped }
    }

    fn decode(&self, data: &[u8], frames: &mut Vec<ControllerInput>) {
        let mut state = self.state.borrow_mut();
        let frame = match state.kind {
            ScKind::Bt => by_bt::decode(&mut state, data),
            ScKind::Deck => deck::decode(&mut state, data),
            _ => state.decode_wired(data),
        };
        if let Some(frame) = frame {
            frames.push(frame);
        }
    }
}

impl Controller for ScController {
    fn id(&self) -> String {
        self.state.borrow().id.clone()
    }

    fn kind(&self) -> &'static str {
        match self.state.borrow().kind {
            ScKind::Deck => "deck",
            _ => "sc",
        }
    }

    fn description(&self) -> String {
        self.state.borrow().description()
    }

    fn flags(&self) -> ControllerFlags {
        ControllerFlags::empty()
    }

    fn set_gyro_enabled(&mut self, enabled: bool) {
        let mut state = self.state.borrow_mut();
        state.gyro_enabled = enabled;
        state.configure();
    }

    fn gyro_enabled(&self) -> bool {
        self.state.borrow().gyro_enabled
    }

    fn haptic_effect(&mut self, haptic: &HapticData) {
        self.state.borrow_mut().queue_haptic(haptic);
    }

    fn flush(&mut self) {
        self.state.borrow_mut().flush_haptics();
    }

    fn turnoff(&mut self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.kind == ScKind::Wireless {
            state.send_turnoff()
        } else {
            false
        }
    }

    fn defunct(&self) -> bool {
        self.state.borrow().phase == ScPhase::Failed
    }

    fn wants_pump(&self) -> bool {
        self.pumped
    }

    fn drive(&mut self, frames: &mut Vec<ControllerInput>) -> DriveStatus {
        let dev = match &self.state.borrow().dev {
            Some(dev) => dev.clone(),
            None => return DriveStatus::Disconnected,
        };

        let mut events = Vec::new();
        dev.borrow_mut().poll_interrupts(&mut events);

        for event in events {
            match event {
                InterruptEvent::Packet { data, .. } => self.decode(&data, frames),
                InterruptEvent::Gone => {
                    debug!("{} disconnected", self.state.borrow().description());
                    self.state.borrow_mut().mark_disconnected();
                    // Release everything downstream with a zeroed frame.
                    frames.push(ControllerInput::default());
                    return DriveStatus::Disconnected;
                }
            }
        }
        DriveStatus::Idle
    }
}

impl Drop for ScController {
    fn drop(&mut self) {
        // Hand the controller back to its built-in emulation, so it stays
        // usable without the daemon.
        let mut state = self.state.borrow_mut();
        if state.phase == ScPhase::Ready && matches!(state.kind, ScKind::Wired | ScKind::Deck) {
            state.lizard_mode();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state() -> ScState {
        let mut s = ScState {
            dev: None,
            kind: ScKind::Wired,
            phase: ScPhase::Ready,
            serial: "TEST01".to_owned(),
            id: String::new(),
            idx: 2,
            gyro_enabled: true,
            idle_timeout: 600,
            led_level: 50,
            hdata: [HapticData::default(), HapticData::default()],
            input: ControllerInput::default(),
            long_packet: false,
            bt_buf: [0; 40],
        };
        s.update_ids();
        s
    }

    pub fn wired_packet(buttons: u32, ltrig: u8, lpad: (i16, i16), rpad: (i16, i16)) -> [u8; 64] {
        let mut p = [0u8; 64];
        p[2] = PT_INPUT;
        p[8..10].copy_from_slice(&(((buttons >> 8) & 0xffff) as u16).to_le_bytes());
        p[10] = (buttons >> 24) as u8;
        p[11] = ltrig;
        p[16..18].copy_from_slice(&lpad.0.to_le_bytes());
        p[18..20].copy_from_slice(&lpad.1.to_le_bytes());
        p[20..22].copy_from_slice(&rpad.0.to_le_bytes());
        p[22..24].copy_from_slice(&rpad.1.to_le_bytes());
        p
    }

    #[test]
    fn ids_derive_from_serial() {
        let s = state();
        assert_eq!(s.id, "scTEST01");
        assert_eq!(s.description(), "<SCByCable TEST01>");
    }

    #[test]
    fn wired_buttons_and_triggers() {
        let mut s = state();
        let p = wired_packet(SCButton::A.bits() | SCButton::RT.bits(), 200, (0, 0), (0, 0));
        let frame = s.decode_wired(&p).unwrap();

        assert_eq!(frame.buttons, SCButton::A | SCButton::RT);
        assert_eq!(frame.ltrig, 200);
    }

    #[test]
    fn non_input_packets_are_ignored() {
        let mut s = state();
        let mut p = wired_packet(SCButton::A.bits(), 0, (0, 0), (0, 0));
        p[2] = PT_IDLE;
        assert!(s.decode_wired(&p).is_none());
    }

    #[test]
    fn stick_vs_lpad_multiplexing() {
        let mut s = state();

        // No touch, no tilt: coordinates belong to the stick.
        let p = wired_packet(0, 0, (1000, -1000), (0, 0));
        let frame = s.decode_wired(&p).unwrap();
        assert_eq!((frame.stick_x, frame.stick_y), (1000, -1000));
        assert_eq!((frame.lpad_x, frame.lpad_y), (0, 0));

        // Touching the pad: coordinates belong to the pad, stick reads
        // centered.
        let p = wired_packet(SCButton::LPADTOUCH.bits(), 0, (500, 600), (0, 0));
        let frame = s.decode_wired(&p).unwrap();
        assert_eq!((frame.stick_x, frame.stick_y), (0, 0));
        assert_eq!((frame.lpad_x, frame.lpad_y), (500, 600));

        // Touch and tilt at once: both are live, stick keeps its previous
        // value.
        let p = wired_packet(SCButton::LPADTOUCH.bits() | B_STICKTILT, 0, (7, 8), (0, 0));
        let frame = s.decode_wired(&p).unwrap();
        assert_eq!((frame.lpad_x, frame.lpad_y), (7, 8));
        assert_eq!((frame.stick_x, frame.stick_y), (0, 0));
    }

    #[test]
    fn stickpress_comes_from_lpadpress_with_tilt() {
        let mut s = state();

        let p = wired_packet(SCButton::LPADPRESS.bits() | B_STICKTILT, 0, (0, 0), (0, 0));
        let frame = s.decode_wired(&p).unwrap();
        assert!(frame.buttons.contains(SCButton::STICKPRESS));
        assert!(!frame.buttons.contains(SCButton::LPADPRESS));

        // Without the tilt bit, LPADPRESS passes through.
        let p = wired_packet(
            SCButton::LPADPRESS.bits() | SCButton::LPADTOUCH.bits(),
            0,
            (0, 0),
            (0, 0),
        );
        let frame = s.decode_wired(&p).unwrap();
        assert!(frame.buttons.contains(SCButton::LPADPRESS));
        assert!(!frame.buttons.contains(SCButton::STICKPRESS));
    }

    #[test]
    fn dpad_bits_are_always_cleared() {
        let mut s = state();
        let p = wired_packet(SCButton::A.bits() | DPAD_BITS, 0, (0, 0), (0, 0));
        let frame = s.decode_wired(&p).unwrap();
        assert_eq!(frame.buttons, SCButton::A);
    }

    #[test]
    fn haptics_merge_until_flush() {
        let mut s = state();
        let h = HapticData {
            pos: HapticPos::Both,
            amplitude: 0x9000,
            frequency: 0.0,
            period: 100,
        };
        s.queue_haptic(&h);
        s.queue_haptic(&h);

        // Amplitudes add with saturation, periods average.
        assert_eq!(s.hdata[0].amplitude, 0xffff);
        assert_eq!(s.hdata[0].period, 100);

        s.flush_haptics();
        assert!(!s.hdata[0].enabled());
        assert!(!s.hdata[1].enabled());
    }

    #[test]
    fn synthetic_serials_from_bitmap() {
        let mut used = 0b111u64;
        let mut s = state();
        assert!(s.read_serial(true, &mut used));
        assert_eq!(s.serial, "3");
        assert_eq!(s.id, "sc3");
        assert_eq!(used, 0b1111);
    }
}
