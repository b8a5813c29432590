// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{json, Value};
use tracing::warn;

enum Default_ {
    Str(&'static str),
    Int(i64),
    Bool(bool),
    Double(f64),
    StrList(&'static [&'static str]),
}

const DEFAULT_PROFILES: &[&str] = &[
    "Desktop",
    "XBox Controller",
    "XBox Controller with High Precision Camera",
];

/// Defaults are filled in (and written back to the file) the first time a
/// value is read. Paths are slash-separated object keys.
const DEFAULTS: &[(&str, Default_)] = &[
    ("autoswitch_osd", Default_::Bool(true)),
    ("enable_sniffing", Default_::Bool(false)),
    ("recent_max", Default_::Int(10)),
    ("recent_profiles", Default_::StrList(DEFAULT_PROFILES)),
    ("fix_xinput", Default_::Bool(true)),
    ("ignore_serials", Default_::Bool(false)),
    ("osd_style", Default_::Str("Reloaded.gtkstyle.css")),
    ("osd_color_theme", Default_::Str("Green.colors.json")),
    ("osd_colors/background", Default_::Str("#101010")),
    ("osd_colors/border", Default_::Str("#00FF00")),
    ("osd_colors/text", Default_::Str("#16BF24")),
    ("osd_colors/menuitem_border", Default_::Str("#001500")),
    ("osd_colors/menuitem_hilight", Default_::Str("#000070")),
    ("osd_colors/menuitem_hilight_text", Default_::Str("#16FF26")),
    ("osd_colors/menuitem_hilight_border", Default_::Str("#00FF00")),
    ("osd_colors/menuseparator", Default_::Str("#109010")),
    ("osk_colors/hilight", Default_::Str("#00688D")),
    ("osk_colors/pressed", Default_::Str("#1A9485")),
    ("osk_colors/button1", Default_::Str("#162082")),
    ("osk_colors/button1_border", Default_::Str("#262b5e")),
    ("osk_colors/button2", Default_::Str("#162d44")),
    ("osk_colors/button2_border", Default_::Str("#27323e")),
    ("osk_colors/text", Default_::Str("#ffffff")),
    ("windows_opacity", Default_::Double(0.95)),
    ("gui/enable_status_icon", Default_::Bool(false)),
    ("gui/minimize_to_status_icon", Default_::Bool(false)),
    ("gui/minimize_on_start", Default_::Bool(false)),
    ("gui/autokill_daemon", Default_::Bool(false)),
    ("gui/news/enabled", Default_::Bool(true)),
    ("output", Default_::Str("auto")),
];

fn default_value(path: &str) -> Option<Value> {
    let (_, d) = DEFAULTS.iter().find(|(p, _)| *p == path)?;
    Some(match d {
        Default_::Str(s) => json!(s),
        Default_::Int(i) => json!(i),
        Default_::Bool(b) => json!(b),
        Default_::Double(f) => json!(f),
        Default_::StrList(l) => json!(l),
    })
}

/// The daemon configuration, stored as JSON at `<config_dir>/config.c.json`.
///
/// Reads transparently fall back to (and persist) defaults, so a fresh
/// install ends up with a fully populated file after the first run.
pub struct Config {
    config_dir: PathBuf,
    path: Option<PathBuf>,
    root: Value,
}

impl Config {
    pub fn load(config_dir: &Path) -> anyhow::Result<Config> {
        std::fs::create_dir_all(config_dir)
            .context(format!("creating {}", config_dir.display()))?;

        let path = config_dir.join("config.c.json");
        let root = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .context(format!("reading {}", path.display()))?;
            serde_json::from_str(&content)
                .context(format!("parsing {}", path.display()))?
        } else {
            json!({})
        };

        if !root.is_object() {
            anyhow::bail!("{} is not a JSON object", path.display());
        }

        Ok(Config {
            config_dir: config_dir.to_owned(),
            path: Some(path),
            root,
        })
    }

    /// A config with no backing file. Used by tests and as a last resort
    /// when the config directory cannot be created.
    pub fn in_memory() -> Config {
        Config {
            config_dir: PathBuf::new(),
            path: None,
            root: json!({}),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config_dir.join("daemon.socket")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.config_dir.join("profiles")
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.config_dir.join("devices")
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut v = &self.root;
        for part in path.split('/') {
            v = v.as_object()?.get(part)?;
        }
        Some(v)
    }

    fn insert(&mut self, path: &str, value: Value) {
        let mut obj = &mut self.root;
        let mut parts = path.split('/').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                obj.as_object_mut()
                    .expect("config root is an object")
                    .insert(part.to_owned(), value);
                return;
            }

            let map = obj.as_object_mut().expect("config root is an object");
            if !map.get(part).map(Value::is_object).unwrap_or(false) {
                map.insert(part.to_owned(), json!({}));
            }
            obj = map.get_mut(part).unwrap();
        }
    }

    /// Fetches a value, filling in (and saving) the default if it's missing
    /// or has the wrong shape.
    fn fetch(&mut self, path: &str, matches: fn(&Value) -> bool) -> Value {
        match self.lookup(path) {
            Some(v) if matches(v) => v.clone(),
            _ => {
                let d = default_value(path).unwrap_or(Value::Null);
                if !d.is_null() {
                    self.insert(path, d.clone());
                    self.save();
                }
                d
            }
        }
    }

    pub fn get_str(&mut self, path: &str) -> String {
        self.fetch(path, Value::is_string)
            .as_str()
            .unwrap_or_default()
            .to_owned()
    }

    pub fn get_int(&mut self, path: &str) -> i64 {
        self.fetch(path, Value::is_i64).as_i64().unwrap_or_default()
    }

    pub fn get_bool(&mut self, path: &str) -> bool {
        self.fetch(path, Value::is_boolean)
            .as_bool()
            .unwrap_or_default()
    }

    pub fn get_double(&mut self, path: &str) -> f64 {
        self.fetch(path, Value::is_number)
            .as_f64()
            .unwrap_or_default()
    }

    pub fn get_strings(&mut self, path: &str) -> Vec<String> {
        self.fetch(path, Value::is_array)
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set(&mut self, path: &str, value: Value) {
        self.insert(path, value);
        self.save();
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let content = serde_json::to_string_pretty(&self.root).expect("config serializes");
        if let Err(e) = std::fs::write(path, content) {
            warn!("failed to write {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_fill_in() {
        let mut c = Config::in_memory();
        assert!(c.get_bool("autoswitch_osd"));
        assert!(!c.get_bool("enable_sniffing"));
        assert_eq!(c.get_int("recent_max"), 10);
        assert_eq!(c.get_str("output"), "auto");
        assert_eq!(c.get_double("windows_opacity"), 0.95);
        assert_eq!(c.get_str("osd_colors/background"), "#101010");
        assert_eq!(c.get_strings("recent_profiles")[0], "Desktop");
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut c = Config::in_memory();
        c.set("recent_max", json!(3));
        assert_eq!(c.get_int("recent_max"), 3);

        c.set("gui/news/enabled", json!(false));
        assert!(!c.get_bool("gui/news/enabled"));
    }

    #[test]
    fn wrong_type_falls_back_to_default() {
        let mut c = Config::in_memory();
        c.set("recent_max", json!("not a number"));
        assert_eq!(c.get_int("recent_max"), 10);
    }

    #[test]
    fn first_access_writes_file_back() {
        let dir = mktemp::Temp::new_dir().unwrap();
        let mut c = Config::load(dir.as_path()).unwrap();

        assert_eq!(c.get_int("recent_max"), 10);

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.as_path().join("config.c.json")).unwrap())
                .unwrap();
        assert_eq!(on_disk["recent_max"], json!(10));
    }

    #[test]
    fn existing_values_survive_reload() {
        let dir = mktemp::Temp::new_dir().unwrap();
        {
            let mut c = Config::load(dir.as_path()).unwrap();
            c.set("recent_max", json!(4));
        }

        let mut c = Config::load(dir.as_path()).unwrap();
        assert_eq!(c.get_int("recent_max"), 4);
    }
}
