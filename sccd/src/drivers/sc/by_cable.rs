// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A single Steam Controller connected directly over USB.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use super::{ScController, ScKind, ScPhase, ScState, SharedDev};
use crate::daemon::Daemon;
use crate::transport::{self, InputDeviceData, Subsystem};

pub const VENDOR_ID: u16 = 0x28de;
pub const PRODUCT_ID: u16 = 0x1102;

const ENDPOINT: u8 = 3;
const CONTROL_IDX: u16 = 2;
const PACKET_SIZE: usize = 64;

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
    let mut state = ScState::new(dev.clone(), ScKind::Wired, CONTROL_IDX);

    if is_usb && dev.borrow_mut().claim_interfaces_by(3, 0, 0) == 0 {
        warn!("failed to claim interfaces");
        return true;
    }

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

    debug!("new wired Steam Controller with serial {} connected", state.serial);
    state.phase = ScPhase::Ready;
    let controller = ScController::new(Rc::new(RefCell::new(state)), true);
    daemon
        .add_controller(Box::new(controller), Some(idata.path.clone()))
        .is_some()
}
