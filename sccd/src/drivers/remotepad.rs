// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Remote RetroPad driver, speaking the protocol of RetroArch's
//! libretro-net-retropad core. Each UDP peer becomes its own controller.

use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::Rc;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::controller::{
    Controller, ControllerFlags, ControllerInput, SCButton, STICK_PAD_MAX, STICK_PAD_MIN,
    TRIGGER_MAX,
};
use crate::daemon::{ControllerKey, Daemon};
use crate::poller::PollSource;

pub const PORT: u16 = 55400;

/// How long a turned-off pad's address stays banned before the slot is
/// forgotten entirely.
pub const BAN_MS: u32 = 10_000;

// Button ids for the RetroPad. L2/R2/L3/R3 correspond to the PS1
// DualShock.
const RETRO_B: i32 = 0;
const RETRO_Y: i32 = 1;
const RETRO_SELECT: i32 = 2;
const RETRO_START: i32 = 3;
const RETRO_UP: i32 = 4;
const RETRO_DOWN: i32 = 5;
const RETRO_LEFT: i32 = 6;
const RETRO_RIGHT: i32 = 7;
const RETRO_A: i32 = 8;
const RETRO_X: i32 = 9;
const RETRO_L: i32 = 10;
const RETRO_R: i32 = 11;
const RETRO_L2: i32 = 12;
const RETRO_R2: i32 = 13;
const RETRO_L3: i32 = 14;
const RETRO_R3: i32 = 15;

const RETRO_DEVICE_JOYPAD: i32 = 1;
const RETRO_DEVICE_ANALOG: i32 = 5;
const RETRO_INDEX_ANALOG_LEFT: i32 = 0;
const RETRO_INDEX_ANALOG_RIGHT: i32 = 1;
const RETRO_ID_ANALOG_X: i32 = 0;
const RETRO_ID_ANALOG_Y: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMsg {
    pub device: i32,
    pub index: i32,
    pub id: i32,
    pub state: u16,
}

pub fn parse_message(data: &[u8]) -> Option<RemoteMsg> {
    if data.len() < 18 {
        return None;
    }

    let int_at =
        |off: usize| i32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
    Some(RemoteMsg {
        // The leading field is the RetroArch port number, unused here.
        device: int_at(4),
        index: int_at(8),
        id: int_at(12),
        state: u16::from_le_bytes([data[16], data[17]]),
    })
}

fn button_for(id: i32) -> SCButton {
    match id {
        RETRO_B => SCButton::B,
        RETRO_Y => SCButton::Y,
        RETRO_SELECT => SCButton::BACK,
        RETRO_START => SCButton::START,
        RETRO_A => SCButton::A,
        RETRO_X => SCButton::X,
        RETRO_L => SCButton::LB,
        RETRO_R => SCButton::RB,
        RETRO_L2 => SCButton::LT,
        RETRO_R2 => SCButton::RT,
        RETRO_L3 => SCButton::STICKPRESS,
        RETRO_R3 => SCButton::RPADPRESS,
        _ => SCButton::empty(),
    }
}

pub fn apply_message(input: &mut ControllerInput, msg: &RemoteMsg) {
    match msg.device {
        RETRO_DEVICE_JOYPAD => {
            let b = button_for(msg.id);
            if !b.is_empty() {
                if msg.state != 0 {
                    input.buttons |= b;
                } else {
                    input.buttons &= !b;
                }
            }

            match msg.id {
                RETRO_UP => input.rpad_y = if msg.state != 0 { STICK_PAD_MIN } else { 0 },
                RETRO_DOWN => input.rpad_y = if msg.state != 0 { STICK_PAD_MAX } else { 0 },
                RETRO_LEFT => input.rpad_x = if msg.state != 0 { STICK_PAD_MIN } else { 0 },
                RETRO_RIGHT => input.rpad_x = if msg.state != 0 { STICK_PAD_MAX } else { 0 },
                RETRO_L2 => input.ltrig = if msg.state != 0 { TRIGGER_MAX } else { 0 },
                RETRO_R2 => input.rtrig = if msg.state != 0 { TRIGGER_MAX } else { 0 },
                RETRO_SELECT | RETRO_START => {
                    // Start and select held together emulate the C button.
                    if input.buttons.contains(SCButton::BACK | SCButton::START) {
                        input.buttons &= !(SCButton::BACK | SCButton::START);
                        input.buttons |= SCButton::C;
                    } else {
                        input.buttons &= !SCButton::C;
                    }
                }
                _ => (),
            }
        }
        RETRO_DEVICE_ANALOG => match (msg.index, msg.id) {
            (RETRO_INDEX_ANALOG_LEFT, RETRO_ID_ANALOG_X) => {
                input.stick_x = msg.state as i16;
            }
            (RETRO_INDEX_ANALOG_LEFT, RETRO_ID_ANALOG_Y) => {
                input.stick_y = -(msg.state as i16);
            }
            (RETRO_INDEX_ANALOG_RIGHT, RETRO_ID_ANALOG_X) => {
                input.rpad_x = msg.state as i16;
            }
            (RETRO_INDEX_ANALOG_RIGHT, RETRO_ID_ANALOG_Y) => {
                input.rpad_y = -(msg.state as i16);
            }
            _ => (),
        },
        _ => (),
    }
}

pub struct PadState {
    pub id: String,
    pub address: IpAddr,
    pub input: ControllerInput,
    pub removed: bool,
}

struct PadEntry {
    key: Option<ControllerKey>,
    state: Rc<RefCell<PadState>>,
}

pub struct RemotePadDriver {
    socket: mio::net::UdpSocket,
    pads: HashMap<IpAddr, PadEntry>,
    next_id: u32,
}

struct RemotePadController {
    state: Rc<RefCell<PadState>>,
}

impl Controller for RemotePadController {
    fn id(&self) -> String {
        self.state.borrow().id.clone()
    }

    fn kind(&self) -> &'static str {
        "rpad"
    }

    fn description(&self) -> String {
        format!("<RemotePad at {}>", self.state.borrow().address)
    }

    fn flags(&self) -> ControllerFlags {
        ControllerFlags::HAS_DPAD
            | ControllerFlags::NO_GRIPS
            | ControllerFlags::HAS_RSTICK
            | ControllerFlags::SEPARATE_STICK
    }

    fn turnoff(&mut self) -> bool {
        // There is no way to turn off a remote pad. Instead its address is
        // banned for a while, in the hope that the user closes RetroArch in
        // the meantime.
        self.state.borrow_mut().removed = true;
        true
    }

    fn defunct(&self) -> bool {
        self.state.borrow().removed
    }
}

impl RemotePadDriver {
    pub fn start(daemon: &mut Daemon) -> anyhow::Result<()> {
        let addr: std::net::SocketAddr = format!("0.0.0.0:{}", PORT).parse().unwrap();
        let mut socket = mio::net::UdpSocket::bind(addr)?;
        daemon.poller.add(&mut socket, PollSource::RemotePad)?;
        info!("remotepad: listening on {}", addr);

        daemon.remotepad = Some(RemotePadDriver {
            socket,
            pads: HashMap::new(),
            next_id: 0,
        });
        Ok(())
    }
}

/// Drains the UDP socket. Called when the poller reports it readable.
pub fn datagram_ready(daemon: &mut Daemon) {
    let Some(mut driver) = daemon.remotepad.take() else {
        return;
    };

    let mut buf = [0u8; 64];
    loop {
        let (len, peer) = match driver.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("remotepad recv failed: {}", e);
                break;
            }
        };

        let Some(msg) = parse_message(&buf[..len]) else {
            warn!("remotepad: invalid data received");
            continue;
        };

        handle_message(daemon, &mut driver, peer.ip(), &msg);
    }

    daemon.remotepad = Some(driver);
}

fn handle_message(daemon: &mut Daemon, driver: &mut RemotePadDriver, peer: IpAddr, msg: &RemoteMsg) {
    let entry = match driver.pads.get_mut(&peer) {
        Some(entry) => entry,
        None => {
            driver.next_id += 1;
            let state = Rc::new(RefCell::new(PadState {
                id: format!("rpad{}", driver.next_id),
                address: peer,
                input: ControllerInput::default(),
                removed: false,
            }));

            let controller = RemotePadController {
                state: state.clone(),
            };
            let Some(key) = daemon.add_controller(Box::new(controller), None) else {
                warn!("failed to add remote pad for {}", peer);
                return;
            };

            debug!("new remote pad at {}", peer);
            driver.pads.insert(
                peer,
                PadEntry {
                    key: Some(key),
                    state,
                },
            );
            driver.pads.get_mut(&peer).unwrap()
        }
    };

    let frame = {
        let mut state = entry.state.borrow_mut();
        if state.removed {
            // Banned until the cleanup task forgets the address.
            return;
        }
        apply_message(&mut state.input, msg);
        state.input
    };

    if let Some(key) = entry.key {
        daemon.feed_frame(key, &frame);
    }
}

/// Forgets pads whose ban expired. Scheduled when a pad is turned off.
pub fn cleanup(daemon: &mut Daemon) {
    if let Some(driver) = &mut daemon.remotepad {
        driver.pads.retain(|_, entry| !entry.state.borrow().removed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn msg(device: i32, index: i32, id: i32, state: u16) -> RemoteMsg {
        RemoteMsg {
            device,
            index,
            id,
            state,
        }
    }

    #[test]
    fn parses_wire_format() {
        let mut data = [0u8; 20];
        data[0..4].copy_from_slice(&55400i32.to_le_bytes());
        data[4..8].copy_from_slice(&RETRO_DEVICE_JOYPAD.to_le_bytes());
        data[8..12].copy_from_slice(&0i32.to_le_bytes());
        data[12..16].copy_from_slice(&RETRO_A.to_le_bytes());
        data[16..18].copy_from_slice(&1u16.to_le_bytes());

        assert_eq!(
            parse_message(&data),
            Some(msg(RETRO_DEVICE_JOYPAD, 0, RETRO_A, 1))
        );
        assert_eq!(parse_message(&data[..10]), None);
    }

    #[test]
    fn buttons_press_and_release() {
        let mut input = ControllerInput::default();
        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_A, 1));
        assert_eq!(input.buttons, SCButton::A);

        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_A, 0));
        assert_eq!(input.buttons, SCButton::empty());
    }

    #[test]
    fn start_plus_select_becomes_c() {
        let mut input = ControllerInput::default();
        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_SELECT, 1));
        assert_eq!(input.buttons, SCButton::BACK);

        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_START, 1));
        assert_eq!(input.buttons, SCButton::C);

        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_START, 0));
        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_SELECT, 0));
        assert!(!input.buttons.contains(SCButton::C));
    }

    #[test]
    fn dpad_maps_to_pad_axes() {
        let mut input = ControllerInput::default();
        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_LEFT, 1));
        assert_eq!(input.rpad_x, STICK_PAD_MIN);

        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_LEFT, 0));
        assert_eq!(input.rpad_x, 0);
    }

    #[test]
    fn triggers_are_digital() {
        let mut input = ControllerInput::default();
        apply_message(&mut input, &msg(RETRO_DEVICE_JOYPAD, 0, RETRO_L2, 1));
        assert_eq!(input.ltrig, TRIGGER_MAX);
        assert!(input.buttons.contains(SCButton::LT));
    }

    #[test]
    fn analog_sticks() {
        let mut input = ControllerInput::default();
        apply_message(
            &mut input,
            &msg(RETRO_DEVICE_ANALOG, RETRO_INDEX_ANALOG_LEFT, RETRO_ID_ANALOG_X, 1000),
        );
        assert_eq!(input.stick_x, 1000);

        apply_message(
            &mut input,
            &msg(RETRO_DEVICE_ANALOG, RETRO_INDEX_ANALOG_LEFT, RETRO_ID_ANALOG_Y, 1000),
        );
        assert_eq!(input.stick_y, -1000);

        apply_message(
            &mut input,
            &msg(RETRO_DEVICE_ANALOG, RETRO_INDEX_ANALOG_RIGHT, RETRO_ID_ANALOG_X, 500),
        );
        assert_eq!(input.rpad_x, 500);
    }
}
