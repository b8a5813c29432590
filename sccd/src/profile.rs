// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context;
use hashbrown::HashMap;
use serde_json::Value;
use tracing::warn;

use crate::actions::{self, Action, NamedAction};
use crate::controller::{PadStickTrigger, SCButton};
use crate::lock::LockProfile;

/// A mapping from input sources to actions. Immutable at runtime and shared
/// between the mapper and whatever wraps it (see [LockProfile]).
pub trait Profile {
    fn get_button(&self, b: SCButton) -> Rc<dyn Action>;
    fn get_trigger(&self, what: PadStickTrigger) -> Rc<dyn Action>;
    fn get_pad(&self, what: PadStickTrigger) -> Rc<dyn Action>;
    fn get_stick(&self) -> Rc<dyn Action>;
    fn get_gyro(&self) -> Rc<dyn Action>;

    fn is_template(&self) -> bool {
        false
    }

    fn version(&self) -> u32 {
        1
    }

    /// Collapses nested wrapper actions in place. Idempotent.
    fn compress(&self) {}

    /// Non-None when this profile is the lock wrapper. Used so a profile
    /// switch while sources are locked replaces the wrapped profile instead
    /// of the wrapper.
    fn as_lock(&self) -> Option<&LockProfile> {
        None
    }
}

/// The profile a mapper starts with when nothing could be loaded.
pub struct EmptyProfile;

impl Profile for EmptyProfile {
    fn get_button(&self, _b: SCButton) -> Rc<dyn Action> {
        actions::no_action()
    }

    fn get_trigger(&self, _what: PadStickTrigger) -> Rc<dyn Action> {
        actions::no_action()
    }

    fn get_pad(&self, _what: PadStickTrigger) -> Rc<dyn Action> {
        actions::no_action()
    }

    fn get_stick(&self) -> Rc<dyn Action> {
        actions::no_action()
    }

    fn get_gyro(&self) -> Rc<dyn Action> {
        actions::no_action()
    }
}

struct Slots {
    buttons: HashMap<u32, Rc<dyn Action>>,
    triggers: [Rc<dyn Action>; 2],
    pads: [Rc<dyn Action>; 3],
    stick: Rc<dyn Action>,
    gyro: Rc<dyn Action>,
}

/// A profile loaded from a `.sccprofile` JSON file.
pub struct JsonProfile {
    slots: RefCell<Slots>,
    is_template: bool,
    version: u32,
}

fn parse_entry(v: &Value) -> anyhow::Result<Rc<dyn Action>> {
    match v {
        Value::Null => Ok(actions::no_action()),
        Value::String(s) => actions::parse_action(s),
        Value::Object(o) => {
            let action = match o.get("action") {
                Some(Value::String(s)) => actions::parse_action(s)?,
                _ => actions::no_action(),
            };
            match o.get("name").and_then(Value::as_str) {
                Some(name) => Ok(Rc::new(NamedAction::new(name.to_owned(), action))),
                None => Ok(action),
            }
        }
        _ => anyhow::bail!("unexpected action value: {}", v),
    }
}

fn parse_slot(root: &Value, key: &str) -> Rc<dyn Action> {
    match root.get(key) {
        None => actions::no_action(),
        Some(v) => parse_entry(v).unwrap_or_else(|e| {
            warn!("ignoring '{}' binding: {:#}", key, e);
            actions::no_action()
        }),
    }
}

impl JsonProfile {
    pub fn load(path: &Path) -> anyhow::Result<JsonProfile> {
        let content = std::fs::read_to_string(path)
            .context(format!("opening {}", path.display()))?;
        let root: Value = serde_json::from_str(&content)
            .context(format!("decoding {}", path.display()))?;
        Self::from_value(&root)
    }

    pub fn from_value(root: &Value) -> anyhow::Result<JsonProfile> {
        let mut buttons = HashMap::new();
        if let Some(map) = root.get("buttons").and_then(Value::as_object) {
            for (name, entry) in map {
                let Some(b) = crate::conversions::button_from_name(name) else {
                    warn!("ignoring binding for unknown button '{}'", name);
                    continue;
                };
                match parse_entry(entry) {
                    Ok(action) => {
                        buttons.insert(b.bits(), action);
                    }
                    Err(e) => warn!("ignoring '{}' binding: {:#}", name, e),
                }
            }
        }

        let slots = Slots {
            buttons,
            triggers: [
                parse_slot(root, "trigger_left"),
                parse_slot(root, "trigger_right"),
            ],
            pads: [
                parse_slot(root, "pad_left"),
                parse_slot(root, "pad_right"),
                parse_slot(root, "cpad"),
            ],
            stick: parse_slot(root, "stick"),
            gyro: parse_slot(root, "gyro"),
        };

        Ok(JsonProfile {
            slots: RefCell::new(slots),
            is_template: root
                .get("is_template")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            version: root.get("version").and_then(Value::as_u64).unwrap_or(1) as u32,
        })
    }
}

fn pad_index(what: PadStickTrigger) -> Option<usize> {
    match what {
        PadStickTrigger::LPad => Some(0),
        PadStickTrigger::RPad => Some(1),
        PadStickTrigger::CPad => Some(2),
        _ => None,
    }
}

impl Profile for JsonProfile {
    fn get_button(&self, b: SCButton) -> Rc<dyn Action> {
        self.slots
            .borrow()
            .buttons
            .get(&b.bits())
            .cloned()
            .unwrap_or_else(actions::no_action)
    }

    fn get_trigger(&self, what: PadStickTrigger) -> Rc<dyn Action> {
        match what {
            PadStickTrigger::LTrigger => self.slots.borrow().triggers[0].clone(),
            PadStickTrigger::RTrigger => self.slots.borrow().triggers[1].clone(),
            _ => actions::no_action(),
        }
    }

    fn get_pad(&self, what: PadStickTrigger) -> Rc<dyn Action> {
        match pad_index(what) {
            Some(i) => self.slots.borrow().pads[i].clone(),
            None => actions::no_action(),
        }
    }

    fn get_stick(&self) -> Rc<dyn Action> {
        self.slots.borrow().stick.clone()
    }

    fn get_gyro(&self) -> Rc<dyn Action> {
        self.slots.borrow().gyro.clone()
    }

    fn is_template(&self) -> bool {
        self.is_template
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn compress(&self) {
        let mut slots = self.slots.borrow_mut();
        for action in slots.buttons.values_mut() {
            *action = action.clone().compressed();
        }
        for action in slots.triggers.iter_mut().chain(slots.pads.iter_mut()) {
            *action = action.clone().compressed();
        }
        slots.stick = slots.stick.clone().compressed();
        slots.gyro = slots.gyro.clone().compressed();
    }
}

/// Resolves a profile name to a file in the profiles directory.
pub fn find_profile(profiles_dir: &Path, name: &str) -> Option<PathBuf> {
    let path = profiles_dir.join(format!("{}.sccprofile", name));
    path.exists().then_some(path)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn profile() -> JsonProfile {
        JsonProfile::from_value(&json!({
            "buttons": {
                "A": "button(KEY_ENTER)",
                "B": {"action": "button(KEY_ESC)", "name": "Cancel"},
                "WHAT": "button(KEY_A)",
            },
            "stick": "XY(axis(ABS_X), axis(ABS_Y))",
            "trigger_left": "axis(ABS_Z)",
            "pad_right": "mouse()",
            "version": 1,
        }))
        .unwrap()
    }

    #[test]
    fn lookups() {
        let p = profile();
        assert_eq!(p.get_button(SCButton::A).describe(), "button(28)");
        assert_eq!(p.get_button(SCButton::B).describe(), "Cancel");
        assert_eq!(p.get_button(SCButton::X).describe(), "None");
        assert_eq!(p.get_stick().describe(), "XY(axis(0), axis(1))");
        assert_eq!(
            p.get_trigger(PadStickTrigger::LTrigger).describe(),
            "axis(2)"
        );
        assert_eq!(p.get_pad(PadStickTrigger::RPad).describe(), "mouse()");
        assert_eq!(p.get_pad(PadStickTrigger::LPad).describe(), "None");
    }

    #[test]
    fn returned_actions_are_shared() {
        let p = profile();
        let a = p.get_button(SCButton::A);
        let b = p.get_button(SCButton::A);
        assert!(Rc::ptr_eq(&a, &b));
        // Dropping a returned reference leaves the profile intact.
        drop(a);
        assert_eq!(p.get_button(SCButton::A).describe(), "button(28)");
    }

    #[test]
    fn compress_is_idempotent() {
        let p = profile();
        p.compress();
        assert_eq!(p.get_button(SCButton::B).describe(), "button(1)");
        p.compress();
        assert_eq!(p.get_button(SCButton::B).describe(), "button(1)");
    }
}
