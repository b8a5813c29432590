// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::rc::Rc;

use bitflags::bitflags;

use crate::controller::{
    Axis, ControllerFlags, ControllerInput, HapticData, Keycode, PadStickTrigger, SCButton,
};
use crate::conversions::{BTN_GEAR_UP, BTN_JOYSTICK, BTN_MOUSE, BTN_TASK, KEY_CNT};
use crate::daemon::ClientKey;
use crate::profile::{EmptyProfile, Profile};
use crate::scheduler::TaskFn;
use crate::virtual_device::VirtualDevice;

bitflags! {
    /// Which virtual devices have pending output this frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncMask: u8 {
        const KEYBOARD = 1 << 0;
        const MOUSE    = 1 << 1;
        const GAMEPAD  = 1 << 2;
    }
}

/// Requests from profile actions that need the daemon's context to execute.
pub enum SpecialAction {
    Profile(String),
    Turnoff,
    Menu(String),
    OsdKeyboard,
    Cemuhook([f32; 6]),
}

/// Side effects accumulated while processing one frame. The daemon drains
/// this after `flush` and applies everything with the full context (the
/// controller for haptics, the client table for lock events, the scheduler).
#[derive(Default)]
pub struct MapperOutput {
    pub haptics: Vec<HapticData>,
    pub client_events: Vec<(ClientKey, String)>,
    pub schedules: Vec<(u32, TaskFn)>,
    pub specials: Vec<SpecialAction>,
    pub cancel_tasks: bool,
}

impl MapperOutput {
    pub fn is_empty(&self) -> bool {
        self.haptics.is_empty()
            && self.client_events.is_empty()
            && self.schedules.is_empty()
            && self.specials.is_empty()
            && !self.cancel_tasks
    }
}

/// Translates [ControllerInput] frames into virtual-device output by
/// diffing against the previous frame and dispatching profile actions.
/// One mapper exists per assigned controller, plus the default one that
/// holds the profile while nothing is connected.
pub struct Mapper {
    profile: Rc<dyn Profile>,
    profile_filename: Option<String>,
    controller_id: Option<String>,
    c_flags: ControllerFlags,
    pub gyro_enabled: bool,

    keyboard: Box<dyn VirtualDevice>,
    mouse: Box<dyn VirtualDevice>,
    gamepad: Box<dyn VirtualDevice>,

    old_state: ControllerInput,
    state: ControllerInput,
    // Per-keycode press counter, so overlapping actions targeting the same
    // key reference-count the physical press.
    keys: [u8; KEY_CNT],
    to_sync: SyncMask,
    output: MapperOutput,
}

impl Mapper {
    pub fn new(
        keyboard: Box<dyn VirtualDevice>,
        mouse: Box<dyn VirtualDevice>,
        gamepad: Box<dyn VirtualDevice>,
    ) -> Self {
        Mapper {
            profile: Rc::new(EmptyProfile),
            profile_filename: None,
            controller_id: None,
            c_flags: ControllerFlags::empty(),
            gyro_enabled: false,
            keyboard,
            mouse,
            gamepad,
            old_state: ControllerInput::default(),
            state: ControllerInput::default(),
            keys: [0; KEY_CNT],
            to_sync: SyncMask::empty(),
            output: MapperOutput::default(),
        }
    }

    pub fn profile(&self) -> Rc<dyn Profile> {
        self.profile.clone()
    }

    /// Swaps the active profile. With `cancel_effects`, anything the old
    /// profile still holds down is released and its pending tasks are
    /// cancelled by the daemon.
    pub fn set_profile(&mut self, profile: Rc<dyn Profile>, cancel_effects: bool) {
        if cancel_effects {
            self.release_virtual_buttons();
            self.output.cancel_tasks = true;
        }
        self.profile = profile;
    }

    pub fn set_profile_filename(&mut self, filename: Option<String>) {
        self.profile_filename = filename;
    }

    pub fn profile_filename(&self) -> Option<&str> {
        self.profile_filename.as_deref()
    }

    pub fn attach_controller(&mut self, id: &str, flags: ControllerFlags, gyro_enabled: bool) {
        self.controller_id = Some(id.to_owned());
        self.c_flags = flags;
        self.gyro_enabled = gyro_enabled;
        self.old_state = ControllerInput::default();
        self.state = ControllerInput::default();
        self.to_sync = SyncMask::empty();
    }

    pub fn detach_controller(&mut self) {
        self.controller_id = None;
        self.c_flags = ControllerFlags::empty();
        self.gyro_enabled = false;
        self.old_state = ControllerInput::default();
        self.state = ControllerInput::default();
        self.to_sync = SyncMask::empty();
    }

    pub fn controller_id(&self) -> Option<&str> {
        self.controller_id.as_deref()
    }

    pub fn has_controller(&self) -> bool {
        self.controller_id.is_some()
    }

    pub fn flags(&self) -> ControllerFlags {
        self.c_flags
    }

    pub fn state(&self) -> &ControllerInput {
        &self.state
    }

    pub fn old_state(&self) -> &ControllerInput {
        &self.old_state
    }

    pub fn is_pressed(&self, b: SCButton) -> bool {
        self.state.buttons.contains(b)
    }

    pub fn was_pressed(&self, b: SCButton) -> bool {
        self.old_state.buttons.contains(b)
    }

    pub fn is_touched(&self, pad: PadStickTrigger) -> bool {
        self.state.buttons.contains(pad.touch_button())
    }

    pub fn was_touched(&self, pad: PadStickTrigger) -> bool {
        self.old_state.buttons.contains(pad.touch_button())
    }

    /// Processes one frame from the controller. Dispatch order: buttons,
    /// stick, gyro, triggers, pads; the daemon flushes afterwards.
    pub fn input(&mut self, i: &ControllerInput) {
        self.old_state = self.state;
        self.state = *i;

        let profile = self.profile.clone();

        let changed = self.old_state.buttons ^ self.state.buttons;
        if !changed.is_empty() {
            for bit in 0..32 {
                let b = SCButton::from_bits_retain(1 << bit);
                if !changed.contains(b) {
                    continue;
                }
                let action = profile.get_button(b);
                if self.state.buttons.contains(b) {
                    action.button_press(self);
                } else {
                    action.button_release(self);
                }
            }
        }

        if self.old_state.stick_x != self.state.stick_x
            || self.old_state.stick_y != self.state.stick_y
        {
            let (x, y) = (self.state.stick_x, self.state.stick_y);
            profile.get_stick().whole(self, x, y, PadStickTrigger::Stick);
        }

        if self.gyro_enabled {
            let gyro = self.state.gyro;
            profile.get_gyro().gyro(self, &gyro);
        }

        if self.old_state.ltrig != self.state.ltrig {
            let (old, new) = (self.old_state.ltrig, self.state.ltrig);
            profile
                .get_trigger(PadStickTrigger::LTrigger)
                .trigger(self, old, new, PadStickTrigger::LTrigger);
        }
        if self.old_state.rtrig != self.state.rtrig {
            let (old, new) = (self.old_state.rtrig, self.state.rtrig);
            profile
                .get_trigger(PadStickTrigger::RTrigger)
                .trigger(self, old, new, PadStickTrigger::RTrigger);
        }

        if self.old_state.lpad_x != self.state.lpad_x
            || self.old_state.lpad_y != self.state.lpad_y
        {
            let (x, y) = (self.state.lpad_x, self.state.lpad_y);
            profile
                .get_pad(PadStickTrigger::LPad)
                .whole(self, x, y, PadStickTrigger::LPad);
        }

        if self.old_state.rpad_x != self.state.rpad_x
            || self.old_state.rpad_y != self.state.rpad_y
        {
            let (x, y) = (self.state.rpad_x, self.state.rpad_y);
            profile
                .get_pad(PadStickTrigger::RPad)
                .whole(self, x, y, PadStickTrigger::RPad);
        }

        if self.c_flags.contains(ControllerFlags::HAS_CPAD)
            && (self.old_state.cpad_x != self.state.cpad_x
                || self.old_state.cpad_y != self.state.cpad_y)
        {
            let (x, y) = (self.state.cpad_x, self.state.cpad_y);
            profile
                .get_pad(PadStickTrigger::CPad)
                .whole(self, x, y, PadStickTrigger::CPad);
        }
    }

    /// Commits pending writes on every dirty virtual device.
    pub fn flush(&mut self) {
        if self.to_sync.contains(SyncMask::MOUSE) {
            self.mouse.flush();
        }
        if self.to_sync.contains(SyncMask::KEYBOARD) {
            self.keyboard.flush();
        }
        if self.to_sync.contains(SyncMask::GAMEPAD) {
            self.gamepad.flush();
        }
        self.to_sync = SyncMask::empty();
    }

    pub fn take_output(&mut self) -> MapperOutput {
        std::mem::take(&mut self.output)
    }

    fn mask_for(key: Keycode) -> SyncMask {
        if (BTN_JOYSTICK..=BTN_GEAR_UP).contains(&key) {
            SyncMask::GAMEPAD
        } else if (BTN_MOUSE..=BTN_TASK).contains(&key) {
            SyncMask::MOUSE
        } else {
            SyncMask::KEYBOARD
        }
    }

    fn device_for(&mut self, key: Keycode) -> &mut dyn VirtualDevice {
        let mask = Self::mask_for(key);
        self.to_sync |= mask;
        if mask == SyncMask::GAMEPAD {
            self.gamepad.as_mut()
        } else if mask == SyncMask::MOUSE {
            self.mouse.as_mut()
        } else {
            self.keyboard.as_mut()
        }
    }

    /// Emulates pressing a key on the virtual device matching the keycode.
    /// The physical down event is only emitted on the 0→1 transition;
    /// with `release_press`, an already-held key is released and pressed
    /// again instead.
    pub fn key_press(&mut self, key: Keycode, release_press: bool) {
        if key == 0 || key as usize >= KEY_CNT {
            return;
        }

        let count = self.keys[key as usize];
        let dev = self.device_for(key);
        if count == 0 {
            dev.key_press(key);
        } else if release_press {
            dev.key_release(key);
            dev.key_press(key);
        }

        if self.keys[key as usize] < 0xFE {
            self.keys[key as usize] += 1;
        }
    }

    /// The physical up event is only emitted on the 1→0 transition.
    pub fn key_release(&mut self, key: Keycode) {
        if key == 0 || key as usize >= KEY_CNT {
            return;
        }

        match self.keys[key as usize] {
            0 => (),
            1 => {
                self.device_for(key).key_release(key);
                self.keys[key as usize] = 0;
            }
            _ => self.keys[key as usize] -= 1,
        }
    }

    pub fn is_virtual_key_pressed(&self, key: Keycode) -> bool {
        (key as usize) < KEY_CNT && self.keys[key as usize] > 0
    }

    /// Emits up events for everything still held and zeroes the counters.
    /// Used on controller disconnect and profile change.
    pub fn release_virtual_buttons(&mut self) {
        for key in 1..KEY_CNT as Keycode {
            if self.keys[key as usize] > 0 {
                self.keys[key as usize] = 0;
                self.device_for(key).key_release(key);
            }
        }
    }

    pub fn set_axis(&mut self, axis: Axis, value: i32) {
        self.gamepad.set_axis(axis, value);
        self.to_sync |= SyncMask::GAMEPAD;
    }

    pub fn move_mouse(&mut self, dx: f64, dy: f64) {
        self.mouse.mouse_move(dx, dy);
        self.to_sync |= SyncMask::MOUSE;
    }

    pub fn move_wheel(&mut self, dx: f64, dy: f64) {
        self.mouse.mouse_scroll(dx, dy);
        self.to_sync |= SyncMask::MOUSE;
    }

    /// Queues a haptic effect for the assigned controller; delivered by the
    /// daemon when the frame is flushed.
    pub fn haptic_effect(&mut self, haptic: &HapticData) {
        self.output.haptics.push(*haptic);
    }

    /// Queues a line for a client socket (locked and observed sources).
    pub fn send_client_event(&mut self, client: ClientKey, line: String) {
        self.output.client_events.push((client, line));
    }

    /// Schedules a callback through the core scheduler, tagged with this
    /// mapper so teardown can cancel it.
    pub fn schedule(&mut self, delay: u32, callback: TaskFn) {
        self.output.schedules.push((delay, callback));
    }

    /// Requests that don't make sense without daemon context. Unknown kinds
    /// are reported as unhandled by the daemon.
    pub fn special_action(&mut self, action: SpecialAction) {
        self.output.specials.push(action);
    }
}
