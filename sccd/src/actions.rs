// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The small set of built-in actions the daemon can execute on its own. The
//! full action language lives in the profile editor; what reaches the daemon
//! through profile files is limited to direct key, axis and mouse bindings.

use std::rc::Rc;

use anyhow::{bail, Context};

use crate::controller::{
    AxisValue, GyroInput, Keycode, PadStickTrigger, TriggerValue, TRIGGER_HALF,
};
use crate::conversions;
use crate::mapper::Mapper;

/// What to do with an input event. Actions are shared (`Rc`); anything
/// long-running they start is owned by the mapper that invoked them.
pub trait Action {
    fn describe(&self) -> String;

    fn button_press(&self, _m: &mut Mapper) {}
    fn button_release(&self, _m: &mut Mapper) {}

    /// A single axis of a stick or pad moved.
    fn axis(&self, _m: &mut Mapper, _value: AxisValue, _what: PadStickTrigger) {}

    /// A whole stick or pad position update.
    fn whole(&self, _m: &mut Mapper, _x: AxisValue, _y: AxisValue, _what: PadStickTrigger) {}

    fn trigger(&self, _m: &mut Mapper, _old: TriggerValue, _new: TriggerValue, _what: PadStickTrigger) {
    }

    fn gyro(&self, _m: &mut Mapper, _gyro: &GyroInput) {}

    /// Collapses wrapper nodes. Idempotent.
    fn compressed(self: Rc<Self>) -> Rc<dyn Action>;
}

struct NoAction;

impl Action for NoAction {
    fn describe(&self) -> String {
        "None".to_owned()
    }

    fn compressed(self: Rc<Self>) -> Rc<dyn Action> {
        self
    }
}

thread_local! {
    static NO_ACTION: Rc<dyn Action> = Rc::new(NoAction);
}

/// The inert singleton action.
pub fn no_action() -> Rc<dyn Action> {
    NO_ACTION.with(|a| a.clone())
}

/// Presses a key (or mouse/gamepad button) on the matching virtual device.
pub struct ButtonAction {
    keycode: Keycode,
}

impl ButtonAction {
    pub fn new(keycode: Keycode) -> Self {
        ButtonAction { keycode }
    }
}

impl Action for ButtonAction {
    fn describe(&self) -> String {
        format!("button({})", self.keycode)
    }

    fn button_press(&self, m: &mut Mapper) {
        m.key_press(self.keycode, false);
    }

    fn button_release(&self, m: &mut Mapper) {
        m.key_release(self.keycode);
    }

    fn axis(&self, m: &mut Mapper, value: AxisValue, _what: PadStickTrigger) {
        let held = m.is_virtual_key_pressed(self.keycode);
        if (value as i32).unsigned_abs() > 0x4000 {
            if !held {
                m.key_press(self.keycode, false);
            }
        } else if held {
            m.key_release(self.keycode);
        }
    }

    fn trigger(&self, m: &mut Mapper, old: TriggerValue, new: TriggerValue, _what: PadStickTrigger) {
        if new >= TRIGGER_HALF && old < TRIGGER_HALF {
            m.key_press(self.keycode, false);
        } else if new < TRIGGER_HALF && old >= TRIGGER_HALF {
            m.key_release(self.keycode);
        }
    }

    fn compressed(self: Rc<Self>) -> Rc<dyn Action> {
        self
    }
}

/// Feeds a gamepad axis. Trigger input is rescaled from 0..255.
pub struct AxisAction {
    target: u16,
    min: i32,
    max: i32,
}

impl AxisAction {
    pub fn new(target: u16, min: i32, max: i32) -> Self {
        AxisAction { target, min, max }
    }

    fn emit(&self, m: &mut Mapper, value: AxisValue) {
        let span = (self.max - self.min) as i64;
        let v = self.min as i64 + (value as i64 + 0x8000) * span / 0xFFFF;
        m.set_axis(self.target, v as i32);
    }
}

impl Action for AxisAction {
    fn describe(&self) -> String {
        format!("axis({})", self.target)
    }

    fn axis(&self, m: &mut Mapper, value: AxisValue, _what: PadStickTrigger) {
        self.emit(m, value);
    }

    fn whole(&self, m: &mut Mapper, x: AxisValue, y: AxisValue, _what: PadStickTrigger) {
        // A bare axis() bound to a whole stick or pad picks the matching
        // coordinate.
        let v = match self.target {
            0x01 | 0x04 | 0x11 => y, // ABS_Y, ABS_RY, ABS_HAT0Y
            _ => x,
        };
        self.emit(m, v);
    }

    fn trigger(&self, m: &mut Mapper, _old: TriggerValue, new: TriggerValue, _what: PadStickTrigger) {
        let span = (self.max - self.min) as i64;
        let v = self.min as i64 + new as i64 * span / 255;
        m.set_axis(self.target, v as i32);
    }

    fn compressed(self: Rc<Self>) -> Rc<dyn Action> {
        self
    }
}

/// Moves the virtual mouse. Bound to a pad, position maps to velocity; bound
/// to gyro, yaw/pitch steer the pointer.
pub struct MouseAction;

impl Action for MouseAction {
    fn describe(&self) -> String {
        "mouse()".to_owned()
    }

    fn whole(&self, m: &mut Mapper, x: AxisValue, y: AxisValue, _what: PadStickTrigger) {
        m.move_mouse(x as f64 / 1000.0, -(y as f64) / 1000.0);
    }

    fn axis(&self, m: &mut Mapper, value: AxisValue, _what: PadStickTrigger) {
        m.move_wheel(0.0, value as f64 / 10000.0);
    }

    fn gyro(&self, m: &mut Mapper, gyro: &GyroInput) {
        m.move_mouse(-(gyro.gyaw as f64) / 8.0, -(gyro.gpitch as f64) / 8.0);
    }

    fn compressed(self: Rc<Self>) -> Rc<dyn Action> {
        self
    }
}

/// Splits a whole-position event into per-coordinate child actions.
pub struct XYAction {
    x: Rc<dyn Action>,
    y: Rc<dyn Action>,
}

impl XYAction {
    pub fn new(x: Rc<dyn Action>, y: Rc<dyn Action>) -> Self {
        XYAction { x, y }
    }
}

impl Action for XYAction {
    fn describe(&self) -> String {
        format!("XY({}, {})", self.x.describe(), self.y.describe())
    }

    fn whole(&self, m: &mut Mapper, x: AxisValue, y: AxisValue, what: PadStickTrigger) {
        self.x.axis(m, x, what);
        self.y.axis(m, y, what);
    }

    fn compressed(self: Rc<Self>) -> Rc<dyn Action> {
        Rc::new(XYAction {
            x: self.x.clone().compressed(),
            y: self.y.clone().compressed(),
        })
    }
}

/// A display-name wrapper around another action. Collapsed by `compress`.
pub struct NamedAction {
    name: String,
    inner: Rc<dyn Action>,
}

impl NamedAction {
    pub fn new(name: String, inner: Rc<dyn Action>) -> Self {
        NamedAction { name, inner }
    }
}

impl Action for NamedAction {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn button_press(&self, m: &mut Mapper) {
        self.inner.button_press(m);
    }

    fn button_release(&self, m: &mut Mapper) {
        self.inner.button_release(m);
    }

    fn axis(&self, m: &mut Mapper, value: AxisValue, what: PadStickTrigger) {
        self.inner.axis(m, value, what);
    }

    fn whole(&self, m: &mut Mapper, x: AxisValue, y: AxisValue, what: PadStickTrigger) {
        self.inner.whole(m, x, y, what);
    }

    fn trigger(&self, m: &mut Mapper, old: TriggerValue, new: TriggerValue, what: PadStickTrigger) {
        self.inner.trigger(m, old, new, what);
    }

    fn gyro(&self, m: &mut Mapper, gyro: &GyroInput) {
        self.inner.gyro(m, gyro);
    }

    fn compressed(self: Rc<Self>) -> Rc<dyn Action> {
        self.inner.clone().compressed()
    }
}

fn split_args(s: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                args.push(s[start..i].trim());
                start = i + 1;
            }
            _ => (),
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        args.push(last);
    }
    args
}

/// Parses an action description from a profile file.
pub fn parse_action(s: &str) -> anyhow::Result<Rc<dyn Action>> {
    let s = s.trim();
    if s.is_empty() || s == "None" {
        return Ok(no_action());
    }

    let open = s.find('(').context(format!("malformed action '{}'", s))?;
    if !s.ends_with(')') {
        bail!("malformed action '{}'", s);
    }

    let name = &s[..open];
    let args = split_args(&s[open + 1..s.len() - 1]);

    match name {
        "button" => {
            let arg = match args[..] {
                [arg] => arg,
                _ => bail!("button() takes one argument"),
            };
            let keycode = match conversions::keycode_from_name(arg) {
                Some(code) => code,
                None => arg.parse().context(format!("unknown key '{}'", arg))?,
            };
            if keycode == 0 {
                bail!("invalid keycode 0");
            }
            Ok(Rc::new(ButtonAction::new(keycode)))
        }
        "axis" => {
            let (target, min, max) = match args[..] {
                [axis] => (axis, None, None),
                [axis, min, max] => (axis, Some(min), Some(max)),
                _ => bail!("axis() takes one or three arguments"),
            };
            let target = match conversions::axis_from_name(target) {
                Some(a) => a,
                None => target.parse().context(format!("unknown axis '{}'", target))?,
            };
            // Trigger axes default to their hardware range.
            let (dmin, dmax) = match target {
                0x02 | 0x05 => (0, 255),
                0x10 | 0x11 => (-1, 1),
                _ => (-32768, 32767),
            };
            let min = min.map(|v| v.parse::<i32>()).transpose()?.unwrap_or(dmin);
            let max = max.map(|v| v.parse::<i32>()).transpose()?.unwrap_or(dmax);
            Ok(Rc::new(AxisAction::new(target, min, max)))
        }
        "mouse" => Ok(Rc::new(MouseAction)),
        "XY" => {
            let (x, y) = match args[..] {
                [x, y] => (x, y),
                _ => bail!("XY() takes two arguments"),
            };
            Ok(Rc::new(XYAction::new(parse_action(x)?, parse_action(y)?)))
        }
        _ => bail!("unsupported action '{}'", s),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_buttons() {
        assert_eq!(parse_action("button(KEY_A)").unwrap().describe(), "button(30)");
        assert_eq!(parse_action("button(30)").unwrap().describe(), "button(30)");
        assert!(parse_action("button(KEY_NOPE)").is_err());
        assert!(parse_action("button(0)").is_err());
    }

    #[test]
    fn parses_axes_and_compounds() {
        assert_eq!(parse_action("axis(ABS_X)").unwrap().describe(), "axis(0)");
        assert_eq!(
            parse_action("XY(axis(ABS_X), axis(ABS_Y))").unwrap().describe(),
            "XY(axis(0), axis(1))"
        );
        assert_eq!(parse_action("None").unwrap().describe(), "None");
        assert!(parse_action("teleport()").is_err());
    }

    #[test]
    fn named_wrapper_compresses_away() {
        let inner = parse_action("button(KEY_A)").unwrap();
        let named: Rc<dyn Action> =
            Rc::new(NamedAction::new("Jump".to_owned(), inner));
        assert_eq!(named.describe(), "Jump");

        let compressed = named.compressed();
        assert_eq!(compressed.describe(), "button(30)");
        // Idempotent.
        assert_eq!(compressed.compressed().describe(), "button(30)");
    }
}
