// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Static name tables for the Linux input subsystem. `KEY_*` numbering is
//! canonical across the daemon, whatever the output backend.

use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::controller::SCButton;

pub const KEY_CNT: usize = 0x300;

pub const BTN_MOUSE: u16 = 0x110;
pub const BTN_TASK: u16 = 0x117;
pub const BTN_JOYSTICK: u16 = 0x120;
pub const BTN_GEAR_UP: u16 = 0x151;

const KEYCODES: &[(&str, u16)] = &[
    ("KEY_ESC", 1),
    ("KEY_1", 2),
    ("KEY_2", 3),
    ("KEY_3", 4),
    ("KEY_4", 5),
    ("KEY_5", 6),
    ("KEY_6", 7),
    ("KEY_7", 8),
    ("KEY_8", 9),
    ("KEY_9", 10),
    ("KEY_0", 11),
    ("KEY_MINUS", 12),
    ("KEY_EQUAL", 13),
    ("KEY_BACKSPACE", 14),
    ("KEY_TAB", 15),
    ("KEY_Q", 16),
    ("KEY_W", 17),
    ("KEY_E", 18),
    ("KEY_R", 19),
    ("KEY_T", 20),
    ("KEY_Y", 21),
    ("KEY_U", 22),
    ("KEY_I", 23),
    ("KEY_O", 24),
    ("KEY_P", 25),
    ("KEY_LEFTBRACE", 26),
    ("KEY_RIGHTBRACE", 27),
    ("KEY_ENTER", 28),
    ("KEY_LEFTCTRL", 29),
    ("KEY_A", 30),
    ("KEY_S", 31),
    ("KEY_D", 32),
    ("KEY_F", 33),
    ("KEY_G", 34),
    ("KEY_H", 35),
    ("KEY_J", 36),
    ("KEY_K", 37),
    ("KEY_L", 38),
    ("KEY_SEMICOLON", 39),
    ("KEY_APOSTROPHE", 40),
    ("KEY_GRAVE", 41),
    ("KEY_LEFTSHIFT", 42),
    ("KEY_BACKSLASH", 43),
    ("KEY_Z", 44),
    ("KEY_X", 45),
    ("KEY_C", 46),
    ("KEY_V", 47),
    ("KEY_B", 48),
    ("KEY_N", 49),
    ("KEY_M", 50),
    ("KEY_COMMA", 51),
    ("KEY_DOT", 52),
    ("KEY_SLASH", 53),
    ("KEY_RIGHTSHIFT", 54),
    ("KEY_KPASTERISK", 55),
    ("KEY_LEFTALT", 56),
    ("KEY_SPACE", 57),
    ("KEY_CAPSLOCK", 58),
    ("KEY_F1", 59),
    ("KEY_F2", 60),
    ("KEY_F3", 61),
    ("KEY_F4", 62),
    ("KEY_F5", 63),
    ("KEY_F6", 64),
    ("KEY_F7", 65),
    ("KEY_F8", 66),
    ("KEY_F9", 67),
    ("KEY_F10", 68),
    ("KEY_NUMLOCK", 69),
    ("KEY_SCROLLLOCK", 70),
    ("KEY_KP7", 71),
    ("KEY_KP8", 72),
    ("KEY_KP9", 73),
    ("KEY_KPMINUS", 74),
    ("KEY_KP4", 75),
    ("KEY_KP5", 76),
    ("KEY_KP6", 77),
    ("KEY_KPPLUS", 78),
    ("KEY_KP1", 79),
    ("KEY_KP2", 80),
    ("KEY_KP3", 81),
    ("KEY_KP0", 82),
    ("KEY_KPDOT", 83),
    ("KEY_F11", 87),
    ("KEY_F12", 88),
    ("KEY_KPENTER", 96),
    ("KEY_RIGHTCTRL", 97),
    ("KEY_KPSLASH", 98),
    ("KEY_SYSRQ", 99),
    ("KEY_RIGHTALT", 100),
    ("KEY_HOME", 102),
    ("KEY_UP", 103),
    ("KEY_PAGEUP", 104),
    ("KEY_LEFT", 105),
    ("KEY_RIGHT", 106),
    ("KEY_END", 107),
    ("KEY_DOWN", 108),
    ("KEY_PAGEDOWN", 109),
    ("KEY_INSERT", 110),
    ("KEY_DELETE", 111),
    ("KEY_MUTE", 113),
    ("KEY_VOLUMEDOWN", 114),
    ("KEY_VOLUMEUP", 115),
    ("KEY_POWER", 116),
    ("KEY_PAUSE", 119),
    ("KEY_LEFTMETA", 125),
    ("KEY_RIGHTMETA", 126),
    ("KEY_COMPOSE", 127),
    ("KEY_STOP", 128),
    ("KEY_FORWARD", 159),
    ("KEY_NEXTSONG", 163),
    ("KEY_PLAYPAUSE", 164),
    ("KEY_PREVIOUSSONG", 165),
    ("KEY_BACK", 158),
    ("BTN_LEFT", 0x110),
    ("BTN_RIGHT", 0x111),
    ("BTN_MIDDLE", 0x112),
    ("BTN_SIDE", 0x113),
    ("BTN_EXTRA", 0x114),
    ("BTN_FORWARD", 0x115),
    ("BTN_BACK", 0x116),
    ("BTN_TASK", 0x117),
    ("BTN_A", 0x130),
    ("BTN_B", 0x131),
    ("BTN_X", 0x133),
    ("BTN_Y", 0x134),
    ("BTN_TL", 0x136),
    ("BTN_TR", 0x137),
    ("BTN_TL2", 0x138),
    ("BTN_TR2", 0x139),
    ("BTN_SELECT", 0x13a),
    ("BTN_START", 0x13b),
    ("BTN_MODE", 0x13c),
    ("BTN_THUMBL", 0x13d),
    ("BTN_THUMBR", 0x13e),
];

const AXES: &[(&str, u16)] = &[
    ("ABS_X", 0x00),
    ("ABS_Y", 0x01),
    ("ABS_Z", 0x02),
    ("ABS_RX", 0x03),
    ("ABS_RY", 0x04),
    ("ABS_RZ", 0x05),
    ("ABS_HAT0X", 0x10),
    ("ABS_HAT0Y", 0x11),
];

lazy_static! {
    static ref KEYCODE_MAP: HashMap<&'static str, u16> = KEYCODES.iter().copied().collect();
    static ref AXIS_MAP: HashMap<&'static str, u16> = AXES.iter().copied().collect();
}

pub fn keycode_from_name(name: &str) -> Option<u16> {
    KEYCODE_MAP.get(name).copied()
}

pub fn axis_from_name(name: &str) -> Option<u16> {
    AXIS_MAP.get(name).copied()
}

/// Button names as used in profile files and per-device configs.
pub fn button_from_name(name: &str) -> Option<SCButton> {
    Some(match name {
        "A" => SCButton::A,
        "B" => SCButton::B,
        "X" => SCButton::X,
        "Y" => SCButton::Y,
        "C" => SCButton::C,
        "START" => SCButton::START,
        "BACK" => SCButton::BACK,
        "LB" => SCButton::LB,
        "RB" => SCButton::RB,
        "LT" => SCButton::LT,
        "RT" => SCButton::RT,
        "LGRIP" => SCButton::LGRIP,
        "RGRIP" => SCButton::RGRIP,
        "LPAD" => SCButton::LPADPRESS,
        "RPAD" => SCButton::RPADPRESS,
        "LPADTOUCH" => SCButton::LPADTOUCH,
        "RPADTOUCH" => SCButton::RPADTOUCH,
        "LPADPRESS" => SCButton::LPADPRESS,
        "RPADPRESS" => SCButton::RPADPRESS,
        "CPADTOUCH" => SCButton::CPADTOUCH,
        "CPADPRESS" => SCButton::CPADPRESS,
        "STICKPRESS" => SCButton::STICKPRESS,
        "RSTICKPRESS" => SCButton::RSTICKPRESS,
        "LGRIP2" => SCButton::LGRIP2,
        "RGRIP2" => SCButton::RGRIP2,
        "DOTS" => SCButton::DOTS,
        _ => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_keycodes() {
        assert_eq!(keycode_from_name("KEY_A"), Some(30));
        assert_eq!(keycode_from_name("KEY_ENTER"), Some(28));
        assert_eq!(keycode_from_name("BTN_LEFT"), Some(0x110));
        assert_eq!(keycode_from_name("KEY_BOGUS"), None);
    }

    #[test]
    fn known_axes() {
        assert_eq!(axis_from_name("ABS_X"), Some(0));
        assert_eq!(axis_from_name("ABS_HAT0Y"), Some(0x11));
        assert_eq!(axis_from_name("ABS_NOPE"), None);
    }

    #[test]
    fn known_buttons() {
        assert_eq!(button_from_name("A"), Some(SCButton::A));
        assert_eq!(button_from_name("STICKPRESS"), Some(SCButton::STICKPRESS));
        assert_eq!(button_from_name("ZZZ"), None);
    }
}
