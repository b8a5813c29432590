// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The wireless dongle. One USB device carries up to four controllers,
//! each on its own interrupt endpoint. Slots exist from the moment the
//! dongle is plugged; a controller is registered only once it announces
//! itself and survives the serial handshake.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use super::{ScController, ScKind, ScPhase, ScState, SharedDev, PT_HOTPLUG, PT_INPUT};
use crate::controller::ControllerInput;
use crate::daemon::{ControllerKey, Daemon};
use crate::transport::{self, InputDeviceData, InterruptEvent, Subsystem};

pub const VENDOR_ID: u16 = 0x28de;
pub const PRODUCT_ID: u16 = 0x1142;

const FIRST_ENDPOINT: u8 = 2;
const CTRLS_PER_DONGLE: usize = 4;
const FIRST_CONTROL_IDX: u16 = 1;
const PACKET_SIZE: usize = 64;

pub struct Dongle {
    pub path: String,
    dev: SharedDev,
    slots: Vec<Rc<RefCell<ScState>>>,
    keys: [Option<ControllerKey>; CTRLS_PER_DONGLE],
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
    if is_usb && dev.borrow_mut().claim_interfaces_by(3, 0, 0) == 0 {
        warn!("failed to claim interfaces");
        return true;
    }

    let mut slots = Vec::with_capacity(CTRLS_PER_DONGLE);
    for i in 0..CTRLS_PER_DONGLE {
        let state = ScState::new(
            dev.clone(),
            ScKind::Wireless,
            FIRST_CONTROL_IDX + i as u16,
        );
        slots.push(Rc::new(RefCell::new(state)));

        if let Err(e) = dev
            .borrow_mut()
            .start_interrupt_read(FIRST_ENDPOINT + i as u8, PACKET_SIZE)
        {
            warn!("failed to configure dongle: {:#}", e);
            return true;
        }
    }

    debug!("steam controller dongle at {}", idata.path);
    daemon.sc_dongles.push(Dongle {
        path: idata.path.clone(),
        dev,
        slots,
        keys: [None; CTRLS_PER_DONGLE],
    });
    true
}

/// Pumps every dongle once. Called from the mainloop each tick.
pub fn drive_dongles(daemon: &mut Daemon) {
    let mut dongles = std::mem::take(&mut daemon.sc_dongles);
    dongles.retain_mut(|dongle| drive_dongle(daemon, dongle));
    // Hotplug only happens on rescans, never while the pump is running, so
    // nothing can have been added in the meantime.
    daemon.sc_dongles = dongles;
}

fn drive_dongle(daemon: &mut Daemon, dongle: &mut Dongle) -> bool {
    let mut events = Vec::new();
    dongle.dev.borrow_mut().poll_interrupts(&mut events);

    for event in events {
        match event {
            InterruptEvent::Gone => {
                debug!("dongle disconnected");
                for i in 0..CTRLS_PER_DONGLE {
                    dongle.slots[i].borrow_mut().mark_disconnected();
                    if let Some(key) = dongle.keys[i].take() {
                        daemon.feed_frame(key, &ControllerInput::default());
                        daemon.remove_controller(key);
                    }
                }
                daemon.device_gone(&dongle.path);
                return false;
            }
            InterruptEvent::Packet { endpoint, data } => {
                if endpoint < FIRST_ENDPOINT
                    || endpoint >= FIRST_ENDPOINT + CTRLS_PER_DONGLE as u8
                {
                    continue;
                }
                let idx = (endpoint - FIRST_ENDPOINT) as usize;
                slot_packet(daemon, dongle, idx, &data);
            }
        }
    }
    true
}

fn slot_packet(daemon: &mut Daemon, dongle: &mut Dongle, idx: usize, data: &[u8]) {
    if data.len() < 5 {
        return;
    }

    let slot = dongle.slots[idx].clone();

    if data[2] == PT_HOTPLUG {
        if data[4] == 1 {
            // Controller went away; the slot stays for the next one.
            slot.borrow_mut().phase = ScPhase::NotConfigured;
            if let Some(key) = dongle.keys[idx].take() {
                daemon.feed_frame(key, &ControllerInput::default());
                daemon.remove_controller(key);
            }
        }
        return;
    }
    if data[2] != PT_INPUT {
        return;
    }

    let phase = slot.borrow().phase;
    match phase {
        ScPhase::Failed => (),
        ScPhase::NotConfigured => {
            // First packet from a freshly woken controller. If the serial
            // request fails the controller just isn't ready; the next
            // packet retries.
            let ignore_serials = daemon.cfg.get_bool("ignore_serials");
            let mut state = slot.borrow_mut();
            if !state.read_serial(ignore_serials, &mut daemon.used_auto_serials) {
                return;
            }
            if !state.clear_mappings() || !state.configure() {
                state.phase = ScPhase::Failed;
                return;
            }
            state.phase = ScPhase::Ready;
            debug!("new wireless Steam Controller with serial {}", state.serial);
            drop(state);

            match daemon.add_controller(Box::new(ScController::new(slot, false)), None) {
                Some(key) => dongle.keys[idx] = Some(key),
                None => {
                    dongle.slots[idx].borrow_mut().phase = ScPhase::Failed;
                }
            }
        }
        ScPhase::Ready => {
            let frame = slot.borrow_mut().decode_wired(data);
            if let (Some(frame), Some(key)) = (frame, dongle.keys[idx]) {
                daemon.feed_frame(key, &frame);
            }
        }
    }
}
