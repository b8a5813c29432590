// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Per-source input locking. A client may lock named sources (buttons,
//! pads, the stick, triggers), which temporarily routes their events to
//! that client instead of the profile. The OSD uses this to read controller
//! input without taking the device away from the game.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::actions::Action;
use crate::controller::{AxisValue, PadStickTrigger, SCButton, TriggerValue};
use crate::daemon::ClientKey;
use crate::mapper::Mapper;
use crate::profile::Profile;

/// Minimum axis-unit movement between reported whole-pad events, to keep
/// wire traffic down. Edge values (0) always pass.
const MIN_DIFFERENCE: i32 = 300;

macro_rules! sources {
    ($(($variant:ident, $name:literal)),* $(,)?) => {
        /// Everything a client can ask to lock. It resembles [SCButton],
        /// but covers whole pads and triggers too.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Source {
            $($variant),*
        }

        pub const ALL_SOURCES: &[Source] = &[$(Source::$variant),*];

        impl Source {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Source::$variant => $name),*
                }
            }

            pub fn from_str(s: &str) -> Option<Source> {
                match s {
                    $($name => Some(Source::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

sources! {
    (LPadTouch, "LPADTOUCH"),
    (RPadTouch, "RPADTOUCH"),
    (LPadPress, "LPADPRESS"),
    (RPadPress, "RPADPRESS"),
    (LGrip, "LGRIP"),
    (RGrip, "RGRIP"),
    (Start, "START"),
    (C, "C"),
    (Back, "BACK"),
    (A, "A"),
    (X, "X"),
    (B, "B"),
    (Y, "Y"),
    (Lb, "LB"),
    (Rb, "RB"),
    (CPadTouch, "CPADTOUCH"),
    (CPadPress, "CPADPRESS"),
    (StickPress, "STICKPRESS"),
    (LTrigger, "LTRIGGER"),
    (RTrigger, "RTRIGGER"),
    (Stick, "STICK"),
    (LPad, "LPAD"),
    (RPad, "RPAD"),
    (CPad, "CPAD"),
}

impl Source {
    fn index(&self) -> usize {
        ALL_SOURCES.iter().position(|s| s == self).unwrap()
    }

    fn from_button(b: SCButton) -> Option<Source> {
        Some(match b {
            SCButton::RPADTOUCH => Source::RPadTouch,
            SCButton::LPADTOUCH => Source::LPadTouch,
            SCButton::RPADPRESS => Source::RPadPress,
            SCButton::LPADPRESS => Source::LPadPress,
            SCButton::RGRIP => Source::RGrip,
            SCButton::LGRIP => Source::LGrip,
            SCButton::START => Source::Start,
            SCButton::C => Source::C,
            SCButton::BACK => Source::Back,
            SCButton::A => Source::A,
            SCButton::X => Source::X,
            SCButton::B => Source::B,
            SCButton::Y => Source::Y,
            SCButton::LB => Source::Lb,
            SCButton::RB => Source::Rb,
            SCButton::CPADTOUCH => Source::CPadTouch,
            SCButton::CPADPRESS => Source::CPadPress,
            SCButton::STICKPRESS => Source::StickPress,
            _ => return None,
        })
    }

    fn button(&self) -> Option<SCButton> {
        Some(match self {
            Source::RPadTouch => SCButton::RPADTOUCH,
            Source::LPadTouch => SCButton::LPADTOUCH,
            Source::RPadPress => SCButton::RPADPRESS,
            Source::LPadPress => SCButton::LPADPRESS,
            Source::RGrip => SCButton::RGRIP,
            Source::LGrip => SCButton::LGRIP,
            Source::Start => SCButton::START,
            Source::C => SCButton::C,
            Source::Back => SCButton::BACK,
            Source::A => SCButton::A,
            Source::X => SCButton::X,
            Source::B => SCButton::B,
            Source::Y => SCButton::Y,
            Source::Lb => SCButton::LB,
            Source::Rb => SCButton::RB,
            Source::CPadTouch => SCButton::CPADTOUCH,
            Source::CPadPress => SCButton::CPADPRESS,
            Source::StickPress => SCButton::STICKPRESS,
            _ => return None,
        })
    }

    fn from_pst(what: PadStickTrigger) -> Option<Source> {
        Some(match what {
            PadStickTrigger::LPad => Source::LPad,
            PadStickTrigger::RPad => Source::RPad,
            PadStickTrigger::LTrigger => Source::LTrigger,
            PadStickTrigger::RTrigger => Source::RTrigger,
            PadStickTrigger::CPad => Source::CPad,
            PadStickTrigger::Stick => Source::Stick,
            PadStickTrigger::Gyro => return None,
        })
    }
}

#[derive(Default)]
struct LockSlot {
    owner: Cell<Option<ClientKey>>,
    observers: RefCell<Vec<ClientKey>>,
    old_x: Cell<AxisValue>,
    old_y: Cell<AxisValue>,
}

impl LockSlot {
    fn active(&self) -> bool {
        self.owner.get().is_some() || !self.observers.borrow().is_empty()
    }
}

struct LockShared {
    original: RefCell<Rc<dyn Profile>>,
    slots: Vec<LockSlot>,
}

/// The proxy profile installed while anything is locked or observed.
/// Affected sources resolve to a reporting action; everything else falls
/// through to the wrapped profile.
pub struct LockProfile {
    shared: Rc<LockShared>,
    actions: Vec<Rc<dyn Action>>,
}

impl LockProfile {
    pub fn new(original: Rc<dyn Profile>) -> LockProfile {
        let shared = Rc::new(LockShared {
            original: RefCell::new(original),
            slots: ALL_SOURCES.iter().map(|_| LockSlot::default()).collect(),
        });

        let actions = ALL_SOURCES
            .iter()
            .map(|source| {
                Rc::new(LockedAction {
                    source: *source,
                    shared: shared.clone(),
                }) as Rc<dyn Action>
            })
            .collect();

        LockProfile { shared, actions }
    }

    pub fn original(&self) -> Rc<dyn Profile> {
        self.shared.original.borrow().clone()
    }

    /// Swaps the wrapped profile without touching the locks. Used when the
    /// profile changes while sources are held.
    pub fn set_original(&self, profile: Rc<dyn Profile>) {
        *self.shared.original.borrow_mut() = profile;
    }

    /// All-or-nothing: if any source is already owned, nothing changes and
    /// the offending source is returned.
    pub fn try_lock(&self, client: ClientKey, sources: &[Source]) -> Result<(), Source> {
        for source in sources {
            if self.shared.slots[source.index()].owner.get().is_some() {
                return Err(*source);
            }
        }

        for source in sources {
            self.shared.slots[source.index()].owner.set(Some(client));
        }
        Ok(())
    }

    pub fn observe(&self, client: ClientKey, sources: &[Source]) {
        for source in sources {
            let mut observers = self.shared.slots[source.index()].observers.borrow_mut();
            if !observers.contains(&client) {
                observers.push(client);
            }
        }
    }

    /// Releases everything the client holds, locks and observations both.
    pub fn release_client(&self, client: ClientKey) {
        for slot in &self.shared.slots {
            if slot.owner.get() == Some(client) {
                slot.owner.set(None);
            }
            slot.observers.borrow_mut().retain(|c| *c != client);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.shared.slots.iter().all(|s| !s.active())
    }
}

impl Profile for LockProfile {
    fn get_button(&self, b: SCButton) -> Rc<dyn Action> {
        match Source::from_button(b) {
            Some(src) if self.shared.slots[src.index()].active() => {
                self.actions[src.index()].clone()
            }
            _ => self.shared.original.borrow().get_button(b),
        }
    }

    fn get_trigger(&self, what: PadStickTrigger) -> Rc<dyn Action> {
        match Source::from_pst(what) {
            Some(src) if self.shared.slots[src.index()].active() => {
                self.actions[src.index()].clone()
            }
            _ => self.shared.original.borrow().get_trigger(what),
        }
    }

    fn get_pad(&self, what: PadStickTrigger) -> Rc<dyn Action> {
        match Source::from_pst(what) {
            Some(src) if self.shared.slots[src.index()].active() => {
                self.actions[src.index()].clone()
            }
            _ => self.shared.original.borrow().get_pad(what),
        }
    }

    fn get_stick(&self) -> Rc<dyn Action> {
        let src = Source::Stick;
        if self.shared.slots[src.index()].active() {
            self.actions[src.index()].clone()
        } else {
            self.shared.original.borrow().get_stick()
        }
    }

    fn get_gyro(&self) -> Rc<dyn Action> {
        // Gyro is not lockable.
        self.shared.original.borrow().get_gyro()
    }

    fn as_lock(&self) -> Option<&LockProfile> {
        Some(self)
    }
}

struct LockedAction {
    source: Source,
    shared: Rc<LockShared>,
}

impl LockedAction {
    fn slot(&self) -> &LockSlot {
        &self.shared.slots[self.source.index()]
    }

    fn send(&self, m: &mut Mapper, suffix: &str) {
        let id = m.controller_id().unwrap_or("?").to_owned();
        let line = format!("Event: {} {} {}\n", id, self.source.as_str(), suffix);

        let slot = self.slot();
        if let Some(owner) = slot.owner.get() {
            m.send_client_event(owner, line);
        } else {
            for observer in slot.observers.borrow().iter() {
                m.send_client_event(*observer, line.clone());
            }
        }
    }

    /// Observed (but unlocked) sources still reach the real profile.
    fn forwards(&self) -> bool {
        self.slot().owner.get().is_none()
    }
}

impl Action for LockedAction {
    fn describe(&self) -> String {
        "<locked>".to_owned()
    }

    fn button_press(&self, m: &mut Mapper) {
        self.send(m, "1");
        if self.forwards() {
            if let Some(b) = self.source.button() {
                self.shared.original.borrow().get_button(b).button_press(m);
            }
        }
    }

    fn button_release(&self, m: &mut Mapper) {
        self.send(m, "0");
        if self.forwards() {
            if let Some(b) = self.source.button() {
                self.shared
                    .original
                    .borrow()
                    .get_button(b)
                    .button_release(m);
            }
        }
    }

    fn whole(&self, m: &mut Mapper, x: AxisValue, y: AxisValue, what: PadStickTrigger) {
        let slot = self.slot();
        let (old_x, old_y) = (slot.old_x.get() as i32, slot.old_y.get() as i32);
        if x == 0
            || y == 0
            || (x as i32 - old_x).abs() > MIN_DIFFERENCE
            || (y as i32 - old_y).abs() > MIN_DIFFERENCE
        {
            slot.old_x.set(x);
            slot.old_y.set(y);
            self.send(m, &format!("{} {}", x, y));
        }

        if self.forwards() {
            let original = self.shared.original.borrow();
            let action = match what {
                PadStickTrigger::Stick => original.get_stick(),
                _ => original.get_pad(what),
            };
            action.whole(m, x, y, what);
        }
    }

    fn trigger(&self, m: &mut Mapper, old: TriggerValue, new: TriggerValue, what: PadStickTrigger) {
        self.send(m, &format!("{} {}", new, old));
        if self.forwards() {
            self.shared
                .original
                .borrow()
                .get_trigger(what)
                .trigger(m, old, new, what);
        }
    }

    fn compressed(self: Rc<Self>) -> Rc<dyn Action> {
        self
    }
}

/// Ensures the mapper's profile is a [LockProfile], wrapping the current
/// one if necessary, and runs `f` on it. Removes the wrapper afterwards if
/// nothing is locked or observed anymore.
fn with_lock_profile<T>(m: &mut Mapper, f: impl FnOnce(&LockProfile) -> T) -> T {
    let profile = m.profile();
    let result = if let Some(lp) = profile.as_lock() {
        f(lp)
    } else {
        let lp = Rc::new(LockProfile::new(profile));
        m.set_profile(lp.clone(), false);
        f(&lp)
    };

    let profile = m.profile();
    if let Some(lp) = profile.as_lock() {
        if lp.is_idle() {
            let original = lp.original();
            m.set_profile(original, false);
        }
    }
    result
}

fn parse_sources<'a>(tokens: &[&'a str]) -> Result<Vec<Source>, &'a str> {
    tokens
        .iter()
        .map(|t| Source::from_str(t).ok_or(*t))
        .collect()
}

/// Atomically locks the named sources for a client. On failure nothing
/// changes and the offending token is returned.
pub fn lock_on_mapper(m: &mut Mapper, client: ClientKey, tokens: &[&str]) -> Result<(), String> {
    if tokens.is_empty() {
        // Successfully locked nothing.
        return Ok(());
    }

    let sources = parse_sources(tokens).map_err(str::to_owned)?;
    with_lock_profile(m, |lp| {
        lp.try_lock(client, &sources)
            .map_err(|s| s.as_str().to_owned())
    })
}

/// Subscribes a client to the named sources without locking them.
pub fn observe_on_mapper(m: &mut Mapper, client: ClientKey, tokens: &[&str]) -> Result<(), String> {
    if tokens.is_empty() {
        return Ok(());
    }

    let sources = parse_sources(tokens).map_err(str::to_owned)?;
    with_lock_profile(m, |lp| {
        lp.observe(client, &sources);
        Ok(())
    })
}

/// Releases every lock and observation the client holds on this mapper,
/// restoring the original profile once the wrapper is idle.
pub fn unlock_on_mapper(m: &mut Mapper, client: ClientKey) {
    let profile = m.profile();
    let Some(lp) = profile.as_lock() else {
        return;
    };

    lp.release_client(client);
    if lp.is_idle() {
        let original = lp.original();
        m.set_profile(original, false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::ControllerInput;
    use crate::profile::JsonProfile;
    use crate::virtual_device::recording::{Recorded, Recording, RecordingDevice};
    use crate::virtual_device::VirtualDeviceKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use slotmap::SlotMap;

    fn client_keys(n: usize) -> Vec<ClientKey> {
        let mut map: SlotMap<ClientKey, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn mapper() -> (Mapper, Recording) {
        let (keyboard, kb) = RecordingDevice::new(VirtualDeviceKind::Keyboard);
        let (mouse, _) = RecordingDevice::new(VirtualDeviceKind::Mouse);
        let (gamepad, _) = RecordingDevice::new(VirtualDeviceKind::Gamepad);
        let mut m = Mapper::new(Box::new(keyboard), Box::new(mouse), Box::new(gamepad));
        m.attach_controller("sc1", Default::default(), false);
        m.set_profile(
            Rc::new(
                JsonProfile::from_value(&json!({
                    "buttons": {"A": "button(KEY_A)"},
                }))
                .unwrap(),
            ),
            false,
        );
        (m, kb)
    }

    fn press_a(m: &mut Mapper) {
        let mut frame = ControllerInput::default();
        frame.buttons = SCButton::A;
        m.input(&frame);
        m.input(&ControllerInput::default());
    }

    #[test]
    fn locked_button_reaches_client_not_keyboard() {
        let (mut m, kb) = mapper();
        let keys = client_keys(1);

        lock_on_mapper(&mut m, keys[0], &["A"]).unwrap();
        press_a(&mut m);

        assert!(kb.borrow().is_empty());
        let out = m.take_output();
        assert_eq!(
            out.client_events,
            vec![
                (keys[0], "Event: sc1 A 1\n".to_owned()),
                (keys[0], "Event: sc1 A 0\n".to_owned()),
            ]
        );
    }

    #[test]
    fn unlock_restores_the_original_profile() {
        let (mut m, kb) = mapper();
        let keys = client_keys(1);
        let before = m.profile();

        lock_on_mapper(&mut m, keys[0], &["A", "B"]).unwrap();
        assert!(m.profile().as_lock().is_some());

        unlock_on_mapper(&mut m, keys[0]);
        assert!(Rc::ptr_eq(&m.profile(), &before));

        press_a(&mut m);
        assert_eq!(
            *kb.borrow(),
            vec![Recorded::KeyPress(30), Recorded::KeyRelease(30)]
        );
    }

    #[test]
    fn lock_is_all_or_nothing() {
        let (mut m, _) = mapper();
        let keys = client_keys(2);

        lock_on_mapper(&mut m, keys[0], &["A"]).unwrap();
        let err = lock_on_mapper(&mut m, keys[1], &["B", "A"]).unwrap_err();
        assert_eq!(err, "A");

        // B must not have been taken by the failed request.
        lock_on_mapper(&mut m, keys[1], &["B"]).unwrap();
    }

    #[test]
    fn unknown_source_fails_without_wrapper() {
        let (mut m, _) = mapper();
        let keys = client_keys(1);
        let before = m.profile();

        let err = lock_on_mapper(&mut m, keys[0], &["A", "WHAT"]).unwrap_err();
        assert_eq!(err, "WHAT");
        assert!(Rc::ptr_eq(&m.profile(), &before));
    }

    #[test]
    fn zero_sources_locks_trivially() {
        let (mut m, _) = mapper();
        let keys = client_keys(1);
        let before = m.profile();

        lock_on_mapper(&mut m, keys[0], &[]).unwrap();
        assert!(Rc::ptr_eq(&m.profile(), &before));
    }

    #[test]
    fn whole_pad_events_are_throttled() {
        let (mut m, _) = mapper();
        let keys = client_keys(1);
        lock_on_mapper(&mut m, keys[0], &["LPAD"]).unwrap();

        let mut frame = ControllerInput::default();
        frame.buttons = SCButton::LPADTOUCH;
        frame.lpad_x = 1000;
        frame.lpad_y = 1000;
        m.input(&frame);

        // Small move, below the reporting threshold.
        frame.lpad_x = 1100;
        m.input(&frame);

        // Large move.
        frame.lpad_x = 2000;
        m.input(&frame);

        let events: Vec<String> = m
            .take_output()
            .client_events
            .into_iter()
            .map(|(_, l)| l)
            .collect();
        assert_eq!(
            events,
            vec![
                "Event: sc1 LPAD 1000 1000\n".to_owned(),
                "Event: sc1 LPAD 2000 1000\n".to_owned(),
            ]
        );
    }

    #[test]
    fn observers_get_events_and_actions_still_run() {
        let (mut m, kb) = mapper();
        let keys = client_keys(1);

        observe_on_mapper(&mut m, keys[0], &["A"]).unwrap();
        press_a(&mut m);

        assert_eq!(
            *kb.borrow(),
            vec![Recorded::KeyPress(30), Recorded::KeyRelease(30)]
        );
        assert_eq!(m.take_output().client_events.len(), 2);

        unlock_on_mapper(&mut m, keys[0]);
        assert!(m.profile().as_lock().is_none());
    }

    #[test]
    fn trigger_lock_reports_new_then_old() {
        let (mut m, _) = mapper();
        let keys = client_keys(1);
        lock_on_mapper(&mut m, keys[0], &["LTRIGGER"]).unwrap();

        let mut frame = ControllerInput::default();
        frame.ltrig = 200;
        m.input(&frame);

        let out = m.take_output();
        assert_eq!(
            out.client_events,
            vec![(keys[0], "Event: sc1 LTRIGGER 200 0\n".to_owned())]
        );
    }
}
