// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The daemon context: the controller registry, mappers, clients, and the
//! cooperative mainloop that drives everything. All state is owned by the
//! mainloop thread; driver pumps, scheduled tasks and client commands all
//! execute in that same context, so nothing needs a lock.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use anyhow::Context as _;
use hashbrown::HashMap;
use slotmap::SlotMap;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::command;
use crate::config::Config;
use crate::controller::{Controller, ControllerInput, DriveStatus};
use crate::device_monitor::{self, DeviceMonitor};
use crate::drivers::{self, evdev::DeviceConfig, remotepad, sc};
use crate::errors::ErrorRegistry;
use crate::logger::LogSink;
use crate::mapper::{Mapper, MapperOutput, SpecialAction};
use crate::poller::{PollSource, Poller};
use crate::profile::{EmptyProfile, JsonProfile, Profile};
use crate::scheduler::{Scheduler, TaskOwner};
use crate::transport::Subsystem;
use crate::virtual_device::{DummyDevice, UinputDevice, VirtualDevice, VirtualDeviceKind};

slotmap::new_key_type! {
    pub struct ControllerKey;
    pub struct MapperKey;
    pub struct ClientKey;
}

/// How often connected hardware is re-enumerated, in addition to explicit
/// `Rescan.` requests.
const RESCAN_INTERVAL_MS: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialClient {
    Osd,
    Autoswitch,
}

pub struct ControllerEntry {
    pub controller: Box<dyn Controller>,
    pub mapper: Option<MapperKey>,
    pub path: Option<String>,
}

pub struct Daemon {
    pub cfg: Config,
    pub poller: Poller,
    pub scheduler: Scheduler,
    pub monitor: DeviceMonitor,
    pub errors: ErrorRegistry,

    pub controllers: SlotMap<ControllerKey, ControllerEntry>,
    pub mappers: SlotMap<MapperKey, Mapper>,
    pub clients: SlotMap<ClientKey, Client>,
    default_mapper: MapperKey,

    listener: Option<mio::net::UnixListener>,
    socket_path: Option<PathBuf>,

    // Driver state.
    pub remotepad: Option<remotepad::RemotePadDriver>,
    pub sc_dongles: Vec<sc::dongle::Dongle>,
    pub evdev_configs: HashMap<String, DeviceConfig>,
    pub used_auto_serials: u64,

    hidapi: Option<hidapi::HidApi>,
    hidapi_failed: bool,

    log: LogSink,
    osd_client: Option<ClientKey>,
    autoswitch_client: Option<ClientKey>,
    default_profile: Option<String>,

    pub exiting: bool,
    epoch: time::Instant,
    use_uinput: bool,
}

impl Daemon {
    pub fn new(cfg: Config, log: LogSink, default_profile: Option<String>) -> anyhow::Result<Daemon> {
        let mut daemon = Daemon::bare(cfg, log, true)?;
        daemon.default_profile = default_profile;

        // The control socket. Failing to bind it is fatal.
        let socket_path = daemon.cfg.socket_path();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).ok();
        }
        let mut listener = mio::net::UnixListener::bind(&socket_path)
            .with_context(|| {
                daemon
                    .errors
                    .add("failed to create control socket", true);
                format!("binding {}", socket_path.display())
            })?;
        daemon.poller.add(&mut listener, PollSource::ControlListener)?;
        daemon.listener = Some(listener);
        daemon.socket_path = Some(socket_path);

        drivers::init(&mut daemon);
        daemon.load_default_profile(None);
        daemon.rescan();
        daemon.schedule_rescan();

        Ok(daemon)
    }

    fn bare(cfg: Config, log: LogSink, use_uinput: bool) -> anyhow::Result<Daemon> {
        let mut daemon = Daemon {
            cfg,
            poller: Poller::new()?,
            scheduler: Scheduler::new(),
            monitor: DeviceMonitor::default(),
            errors: ErrorRegistry::default(),
            controllers: SlotMap::with_key(),
            mappers: SlotMap::with_key(),
            clients: SlotMap::with_key(),
            default_mapper: MapperKey::default(),
            listener: None,
            socket_path: None,
            remotepad: None,
            sc_dongles: Vec::new(),
            evdev_configs: HashMap::new(),
            used_auto_serials: 0,
            hidapi: None,
            hidapi_failed: false,
            log,
            osd_client: None,
            autoswitch_client: None,
            default_profile: None,
            exiting: false,
            epoch: time::Instant::now(),
            use_uinput,
        };

        // The default mapper exists from the start; it holds the profile
        // while no controller is connected, so a connecting controller
        // inherits the current state.
        let mapper = daemon.new_mapper()?;
        daemon.default_mapper = daemon.mappers.insert(mapper);
        Ok(daemon)
    }

    /// A daemon with no sockets, no drivers and dummy virtual devices.
    #[cfg(test)]
    pub(crate) fn stub() -> Daemon {
        Daemon::bare(Config::in_memory(), crate::logger::new_sink(), false)
            .expect("stub daemon")
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn default_mapper(&self) -> MapperKey {
        self.default_mapper
    }

    pub fn log_history(&self) -> Vec<String> {
        self.log.lock().unwrap().history()
    }

    /// Everything needed to interrupt `run` from a signal handler.
    pub fn stopper(&mut self) -> anyhow::Result<(Arc<AtomicBool>, Arc<mio::Waker>)> {
        let stop = Arc::new(AtomicBool::new(false));
        let waker = Arc::new(self.poller.waker()?);
        Ok((stop, waker))
    }

    fn new_mapper(&mut self) -> anyhow::Result<Mapper> {
        if !self.use_uinput {
            return Ok(Mapper::new(
                Box::new(DummyDevice::new(VirtualDeviceKind::Keyboard)),
                Box::new(DummyDevice::new(VirtualDeviceKind::Mouse)),
                Box::new(DummyDevice::new(VirtualDeviceKind::Gamepad)),
            ));
        }

        debug!("creating virtual devices");
        let mut create = |f: fn() -> anyhow::Result<UinputDevice>,
                          what: &str|
         -> anyhow::Result<Box<dyn VirtualDevice>> {
            match f() {
                Ok(dev) => {
                    debug!("{}: {}", what, dev.name());
                    Ok(Box::new(dev))
                }
                Err(e) => {
                    self.errors
                        .add(&format!("failed to create virtual {}: {:#}", what, e), true);
                    Err(e)
                }
            }
        };

        let keyboard = create(UinputDevice::keyboard, "keyboard")?;
        let mouse = create(UinputDevice::mouse, "mouse")?;
        let gamepad = create(UinputDevice::gamepad, "gamepad")?;
        Ok(Mapper::new(keyboard, mouse, gamepad))
    }

    /// Finds a mapper with no controller assigned, or creates a new one.
    fn grab_mapper(&mut self) -> anyhow::Result<MapperKey> {
        let free = self
            .mappers
            .iter()
            .find(|(_, m)| !m.has_controller())
            .map(|(k, _)| k);
        if let Some(key) = free {
            return Ok(key);
        }

        let mapper = self.new_mapper()?;
        let key = self.mappers.insert(mapper);
        self.load_default_profile(Some(key));
        Ok(key)
    }

    pub fn controller_of_mapper(&self, mkey: MapperKey) -> Option<ControllerKey> {
        self.controllers
            .iter()
            .find(|(_, e)| e.mapper == Some(mkey))
            .map(|(k, _)| k)
    }

    pub fn get_controller_by_id(&self, id: &str) -> Option<ControllerKey> {
        self.controllers
            .iter()
            .find(|(_, e)| e.controller.id() == id)
            .map(|(k, _)| k)
    }

    /// Registers a connected controller, claiming (or creating) a mapper
    /// for it. Fails on malformed or duplicate ids.
    pub fn add_controller(
        &mut self,
        controller: Box<dyn Controller>,
        path: Option<String>,
    ) -> Option<ControllerKey> {
        let id = controller.id();
        if id.is_empty() || id.contains(char::is_whitespace) {
            warn!("cannot add controller with id '{}'", id);
            return None;
        }
        if self.get_controller_by_id(&id).is_some() {
            warn!("cannot add controller with duplicate id '{}'", id);
            return None;
        }

        let mkey = match self.grab_mapper() {
            Ok(key) => key,
            Err(e) => {
                warn!("failed to create mapper: {:#}", e);
                return None;
            }
        };

        let flags = controller.flags();
        let gyro = controller.gyro_enabled();
        let description = controller.description();
        let key = self.controllers.insert(ControllerEntry {
            controller,
            mapper: Some(mkey),
            path,
        });
        self.mappers[mkey].attach_controller(&id, flags, gyro);
        if mkey == self.default_mapper {
            debug!("assigned the default mapper to {}", description);
        }

        info!("controller added: {}", description);
        self.send_controller_list_to_all();
        Some(key)
    }

    /// Disconnects a controller. The mapper slot stays allocated for the
    /// next device; anything still held down is released first.
    pub fn remove_controller(&mut self, key: ControllerKey) {
        let Some(entry) = self.controllers.remove(key) else {
            return;
        };

        if let Some(fd) = entry.controller.pollable_fd() {
            self.poller.remove_fd(fd);
        }
        if let Some(mkey) = entry.mapper {
            if let Some(m) = self.mappers.get_mut(mkey) {
                m.release_virtual_buttons();
                m.flush();
                m.detach_controller();
            }
            self.scheduler.cancel_owned(mkey);
        }
        if let Some(path) = &entry.path {
            self.monitor.device_removed(path);
        }

        info!("controller removed: {}", entry.controller.description());
        drop(entry);
        self.send_controller_list_to_all();
    }

    pub fn device_gone(&mut self, path: &str) {
        self.monitor.device_removed(path);
    }

    /// Runs one input frame through the controller's mapper and applies
    /// whatever side effects the profile actions produced.
    pub fn feed_frame(&mut self, key: ControllerKey, frame: &ControllerInput) {
        let Some(entry) = self.controllers.get(key) else {
            return;
        };
        let Some(mkey) = entry.mapper else {
            return;
        };
        let gyro = entry.controller.gyro_enabled();

        let Some(m) = self.mappers.get_mut(mkey) else {
            return;
        };
        m.gyro_enabled = gyro;
        m.input(frame);
        m.flush();
        let out = m.take_output();
        self.apply_mapper_output(Some(key), mkey, out);
    }

    fn apply_mapper_output(
        &mut self,
        ckey: Option<ControllerKey>,
        mkey: MapperKey,
        out: MapperOutput,
    ) {
        if out.cancel_tasks {
            self.scheduler.cancel_owned(mkey);
        }

        if let Some(key) = ckey {
            if let Some(entry) = self.controllers.get_mut(key) {
                for haptic in &out.haptics {
                    entry.controller.haptic_effect(haptic);
                }
                entry.controller.flush();
            }
        }

        for (client, line) in out.client_events {
            self.client_send(client, &line);
        }

        let now = self.now_ms();
        for (delay, callback) in out.schedules {
            self.scheduler
                .schedule(now, delay, TaskOwner::Mapper(mkey), callback);
        }

        for special in out.specials {
            self.handle_special(ckey, mkey, special);
        }
    }

    fn handle_special(
        &mut self,
        ckey: Option<ControllerKey>,
        mkey: MapperKey,
        special: SpecialAction,
    ) {
        match special {
            SpecialAction::Profile(name) => {
                let path = if name.contains('/') {
                    Some(PathBuf::from(&name))
                } else {
                    crate::profile::find_profile(&self.cfg.profiles_dir(), &name)
                };
                match path {
                    Some(path) => {
                        self.set_profile(mkey, &path);
                    }
                    None => warn!("profile '{}' not found", name),
                }
            }
            SpecialAction::Turnoff => {
                if let Some(key) = ckey {
                    self.turnoff_controller(key);
                }
            }
            SpecialAction::Menu(args) => match self.osd_client {
                Some(client) => {
                    let line = format!("OSD: menu {}\n", args);
                    self.client_send(client, &line);
                }
                None => warn!("OSD daemon not available, cannot display menu"),
            },
            SpecialAction::OsdKeyboard => match self.osd_client {
                Some(client) => self.client_send(client, "OSD: keyboard\n"),
                None => warn!("OSD daemon not available, cannot display keyboard"),
            },
            SpecialAction::Cemuhook(_) => {
                // Not handled; there is no motion provider server.
                debug!("unhandled special action: cemuhook feed");
            }
        }
    }

    pub fn turnoff_controller(&mut self, key: ControllerKey) {
        let Some(entry) = self.controllers.get_mut(key) else {
            return;
        };

        debug!("turning off {}", entry.controller.description());
        if !entry.controller.turnoff() {
            warn!(
                "asked to turn off {} but the controller doesn't support it",
                entry.controller.description()
            );
            return;
        }

        // Remote pads "turn off" by banning their address for a while; the
        // ban is lifted by a scheduled cleanup.
        if entry.controller.defunct() {
            self.remove_controller(key);
            let now = self.now_ms();
            self.scheduler.schedule(
                now,
                remotepad::BAN_MS,
                TaskOwner::Daemon,
                Box::new(remotepad::cleanup),
            );
        }
    }

    /// Loads and activates a profile on a mapper. While sources are locked,
    /// the profile inside the lock wrapper is replaced instead.
    pub fn set_profile(&mut self, mkey: MapperKey, path: &Path) -> bool {
        let profile = match JsonProfile::load(path) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to load profile ({:#}), ignoring request", e);
                return false;
            }
        };
        profile.compress();
        let profile: Rc<dyn Profile> = Rc::new(profile);

        let Some(m) = self.mappers.get_mut(mkey) else {
            return false;
        };
        let current = m.profile();
        if let Some(lp) = current.as_lock() {
            lp.set_original(profile);
        } else {
            m.set_profile(profile, true);
        }
        let filename = path.display().to_string();
        m.set_profile_filename(Some(filename.clone()));
        m.flush();
        let out = m.take_output();
        let ckey = self.controller_of_mapper(mkey);
        self.apply_mapper_output(ckey, mkey, out);

        info!("activated profile '{}'", filename);
        if mkey == self.default_mapper {
            self.send_to_all(&format!("Current profile: {}\n", filename));
        }
        true
    }

    fn load_default_profile(&mut self, mkey: Option<MapperKey>) {
        let mkey = mkey.unwrap_or(self.default_mapper);

        let name = match &self.default_profile {
            Some(name) => Some(name.clone()),
            None => self.cfg.get_strings("recent_profiles").first().cloned(),
        };
        if let Some(name) = name {
            let path = if name.contains('/') {
                Some(PathBuf::from(&name))
            } else {
                crate::profile::find_profile(&self.cfg.profiles_dir(), &name)
            };
            if let Some(path) = path {
                if self.set_profile(mkey, &path) {
                    return;
                }
            }
        }

        warn!("failed to load a profile; starting with no mappings");
        if let Some(m) = self.mappers.get_mut(mkey) {
            m.set_profile(Rc::new(EmptyProfile), true);
        }
    }

    pub fn reload_config(&mut self) {
        let dir = self.cfg.config_dir().to_owned();
        match Config::load(&dir) {
            Ok(cfg) => self.cfg = cfg,
            Err(e) => warn!("failed to re-read config: {:#}", e),
        }
    }

    pub fn hidapi(&mut self) -> Option<&hidapi::HidApi> {
        self.ensure_hidapi();
        self.hidapi.as_ref()
    }

    fn ensure_hidapi(&mut self) {
        if self.hidapi.is_some() || self.hidapi_failed {
            return;
        }
        match hidapi::HidApi::new() {
            Ok(api) => self.hidapi = Some(api),
            Err(e) => {
                self.hidapi_failed = true;
                self.errors
                    .add(&format!("failed to initialize hidapi: {}", e), false);
            }
        }
    }

    /// Enumerates devices on every subsystem some driver cares about and
    /// offers the new ones around.
    pub fn rescan(&mut self) {
        let enabled = self.monitor.enabled_subsystems();
        if enabled & Subsystem::Hidapi.bit() != 0 {
            self.ensure_hidapi();
        }

        let found = device_monitor::enumerate(enabled, self.hidapi.as_mut());
        for idata in found {
            let candidates = self.monitor.candidates(&idata);
            for driver in candidates {
                if drivers::handle_hotplug(self, driver, &idata) {
                    self.monitor.mark_handled(&idata.path);
                    break;
                }
            }
        }
    }

    fn schedule_rescan(&mut self) {
        let now = self.now_ms();
        self.scheduler.schedule(
            now,
            RESCAN_INTERVAL_MS,
            TaskOwner::Daemon,
            Box::new(|d: &mut Daemon| {
                d.rescan();
                d.schedule_rescan();
            }),
        );
    }

    ////// clients //////

    pub(crate) fn register_client(&mut self, stream: mio::net::UnixStream) -> ClientKey {
        let key = self
            .clients
            .insert(Client::new(stream, self.default_mapper));

        let client = &mut self.clients[key];
        match self.poller.add(&mut client.stream, PollSource::Client(key)) {
            Ok(token) => client.token = token,
            Err(e) => {
                warn!("failed to register client: {:#}", e);
                client.should_be_dropped = true;
            }
        }

        self.send_controller_list(key);
        if let Some(filename) = self.mappers[self.default_mapper]
            .profile_filename()
            .map(str::to_owned)
        {
            self.client_send(key, &format!("Current profile: {}\n", filename));
        }

        debug!("new client connected");
        key
    }

    fn accept_clients(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, _)) => {
                    self.register_client(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn client_readable(&mut self, key: ClientKey) {
        let Some(client) = self.clients.get_mut(key) else {
            return;
        };

        for line in client.read_lines() {
            command::on_client_command(self, key, &line);
            if self.clients.get(key).is_none() {
                break;
            }
        }
    }

    pub fn client_send(&mut self, key: ClientKey, msg: &str) {
        if let Some(client) = self.clients.get_mut(key) {
            client.send(msg);
        }
    }

    pub fn send_to_all(&mut self, msg: &str) {
        let keys: Vec<ClientKey> = self.clients.keys().collect();
        for key in keys {
            self.client_send(key, msg);
        }
    }

    pub fn set_special_client(&mut self, what: SpecialClient, client: ClientKey) {
        let slot = match what {
            SpecialClient::Osd => &mut self.osd_client,
            SpecialClient::Autoswitch => &mut self.autoswitch_client,
        };

        // Only one of each; a previous registration gets dropped.
        if let Some(old) = slot.replace(client) {
            if old != client {
                if let Some(c) = self.clients.get_mut(old) {
                    c.should_be_dropped = true;
                }
            }
        }
    }

    fn send_controller_list(&mut self, key: ClientKey) {
        let mut lines = String::new();
        for (_, entry) in &self.controllers {
            lines.push_str(&format!(
                "Controller: {} {} {} {}\n",
                entry.controller.id(),
                entry.controller.kind(),
                entry.controller.flags().bits(),
                entry.controller.description(),
            ));
        }
        lines.push_str(&format!("Controller Count: {}\n", self.controllers.len()));
        self.client_send(key, &lines);
    }

    fn send_controller_list_to_all(&mut self) {
        let keys: Vec<ClientKey> = self.clients.keys().collect();
        for key in keys {
            self.send_controller_list(key);
        }
    }

    fn reap_clients(&mut self) {
        // Retry any writes that blocked earlier.
        for (_, client) in self.clients.iter_mut() {
            client.flush_out();
        }

        let dead: Vec<ClientKey> = self
            .clients
            .iter()
            .filter(|(_, c)| c.should_be_dropped)
            .map(|(k, _)| k)
            .collect();

        for key in dead {
            // Anything the client had locked or observed is released.
            let mkeys: Vec<MapperKey> = self.mappers.keys().collect();
            for mkey in mkeys {
                crate::lock::unlock_on_mapper(&mut self.mappers[mkey], key);
            }

            if self.osd_client == Some(key) {
                self.osd_client = None;
            }
            if self.autoswitch_client == Some(key) {
                self.autoswitch_client = None;
            }

            if let Some(mut client) = self.clients.remove(key) {
                let token = client.token;
                self.poller.remove(&mut client.stream, token);
                debug!("client dropped");
            }
        }
    }

    ////// mainloop //////

    fn drive_controller(&mut self, key: ControllerKey) {
        let Some(entry) = self.controllers.get_mut(key) else {
            return;
        };

        let mut frames = Vec::new();
        let status = entry.controller.drive(&mut frames);
        for frame in &frames {
            self.feed_frame(key, frame);
        }
        if status == DriveStatus::Disconnected {
            self.remove_controller(key);
        }
    }

    fn pump_controllers(&mut self) {
        drivers::pump(self);

        let keys: Vec<ControllerKey> = self
            .controllers
            .iter()
            .filter(|(_, e)| e.controller.wants_pump())
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            self.drive_controller(key);
        }
    }

    fn pump_log(&mut self) {
        let fresh = self.log.lock().unwrap().take_fresh();
        if fresh.is_empty() {
            return;
        }

        let subscribers: Vec<ClientKey> = self
            .clients
            .iter()
            .filter(|(_, c)| c.wants_log)
            .map(|(k, _)| k)
            .collect();
        if subscribers.is_empty() {
            return;
        }

        for line in fresh {
            let msg = format!("Log: {}\n", line);
            for key in &subscribers {
                self.client_send(*key, &msg);
            }
        }
    }

    /// Flushes mappers dirtied outside the frame path (scheduled tasks,
    /// `Button:` commands).
    fn flush_mappers(&mut self) {
        let keys: Vec<MapperKey> = self.mappers.keys().collect();
        for mkey in keys {
            let m = &mut self.mappers[mkey];
            m.flush();
            let out = m.take_output();
            if !out.is_empty() {
                let ckey = self.controller_of_mapper(mkey);
                self.apply_mapper_output(ckey, mkey, out);
            }
        }
    }

    /// The endless cooperative cycle: wait for readiness (bounded by the
    /// scheduler's sleep budget), dispatch, pump the polled transports, run
    /// one due task, flush every mapper.
    pub fn run(&mut self, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
        let mut events = mio::Events::with_capacity(64);
        info!("ready");

        while !self.exiting {
            if stop.load(Ordering::Relaxed) {
                info!("interrupted");
                break;
            }

            let timeout = self.scheduler.sleep_time(self.now_ms());
            match self.poller.poll(&mut events, timeout) {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("poll failed"),
            }

            let ready: Vec<PollSource> = events
                .iter()
                .filter_map(|e| self.poller.lookup(e.token()))
                .collect();
            for source in ready {
                match source {
                    PollSource::ControlListener => self.accept_clients(),
                    PollSource::Client(key) => self.client_readable(key),
                    PollSource::RemotePad => remotepad::datagram_ready(self),
                    PollSource::EvdevController(key) => self.drive_controller(key),
                    PollSource::Waker => (),
                }
            }

            self.pump_controllers();
            self.pump_log();

            if let Some(task) = self.scheduler.pop_due(self.now_ms()) {
                (task.callback)(self);
            }

            self.flush_mappers();
            self.reap_clients();
        }

        debug!("exiting");
        if let Some(path) = &self.socket_path {
            std::fs::remove_file(path).ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::{ControllerFlags, SCButton};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::io::Read;

    struct FakeController {
        id: String,
        off: Rc<RefCell<bool>>,
    }

    impl FakeController {
        fn boxed(id: &str) -> (Box<dyn Controller>, Rc<RefCell<bool>>) {
            let off = Rc::new(RefCell::new(false));
            (
                Box::new(FakeController {
                    id: id.to_owned(),
                    off: off.clone(),
                }),
                off,
            )
        }
    }

    impl Controller for FakeController {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn kind(&self) -> &'static str {
            "fake"
        }

        fn description(&self) -> String {
            format!("<Fake {}>", self.id)
        }

        fn flags(&self) -> ControllerFlags {
            ControllerFlags::empty()
        }

        fn turnoff(&mut self) -> bool {
            *self.off.borrow_mut() = true;
            true
        }
    }

    #[test]
    fn duplicate_controller_ids_are_rejected() {
        let mut daemon = Daemon::stub();
        let (a, _) = FakeController::boxed("c1");
        let (b, _) = FakeController::boxed("c1");

        assert!(daemon.add_controller(a, None).is_some());
        assert!(daemon.add_controller(b, None).is_none());
        assert_eq!(daemon.controllers.len(), 1);
    }

    #[test]
    fn ids_with_whitespace_are_rejected() {
        let mut daemon = Daemon::stub();
        let (c, _) = FakeController::boxed("has space");
        assert!(daemon.add_controller(c, None).is_none());
    }

    #[test]
    fn first_controller_gets_the_default_mapper() {
        let mut daemon = Daemon::stub();
        let (c, _) = FakeController::boxed("c1");
        let key = daemon.add_controller(c, None).unwrap();

        assert_eq!(daemon.controllers[key].mapper, Some(daemon.default_mapper()));
    }

    #[test]
    fn mappers_are_recycled_after_removal() {
        let mut daemon = Daemon::stub();
        let (a, _) = FakeController::boxed("c1");
        let akey = daemon.add_controller(a, None).unwrap();
        let (b, _) = FakeController::boxed("c2");
        let bkey = daemon.add_controller(b, None).unwrap();

        // Two controllers, two mappers.
        assert_eq!(daemon.mappers.len(), 2);
        let b_mapper = daemon.controllers[bkey].mapper;

        daemon.remove_controller(akey);
        assert_eq!(daemon.mappers.len(), 2);

        // A third controller reuses the freed slot instead of allocating.
        let (c, _) = FakeController::boxed("c3");
        let ckey = daemon.add_controller(c, None).unwrap();
        assert_eq!(daemon.mappers.len(), 2);
        assert_ne!(daemon.controllers[ckey].mapper, b_mapper);
    }

    #[test]
    fn removal_releases_held_virtual_buttons() {
        let mut daemon = Daemon::stub();
        let (c, _) = FakeController::boxed("c1");
        let key = daemon.add_controller(c, None).unwrap();
        let mkey = daemon.controllers[key].mapper.unwrap();

        daemon.mappers[mkey].key_press(30, false);
        assert!(daemon.mappers[mkey].is_virtual_key_pressed(30));

        daemon.remove_controller(key);
        assert!(!daemon.mappers[mkey].is_virtual_key_pressed(30));
    }

    #[test]
    fn turnoff_reaches_the_controller() {
        let mut daemon = Daemon::stub();
        let (c, off) = FakeController::boxed("c1");
        let key = daemon.add_controller(c, None).unwrap();

        daemon.turnoff_controller(key);
        assert!(*off.borrow());
        // Not defunct, so still registered.
        assert!(daemon.controllers.get(key).is_some());
    }

    #[test_log::test]
    fn lock_roundtrip_over_the_socket() {
        let mut daemon = Daemon::stub();
        let (c, _) = FakeController::boxed("c1");
        let ckey = daemon.add_controller(c, None).unwrap();

        let (mut remote, local) = std::os::unix::net::UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        remote.set_nonblocking(true).unwrap();
        let client = daemon.register_client(mio::net::UnixStream::from_std(local));
        let _ = recv(&mut remote);

        command::on_client_command(&mut daemon, client, "Lock: A");
        assert_eq!(recv(&mut remote), "OK.\n");

        // A frame with A pressed goes to the client, not the keyboard.
        let mut frame = ControllerInput::default();
        frame.buttons = SCButton::A;
        daemon.feed_frame(ckey, &frame);
        daemon.feed_frame(ckey, &ControllerInput::default());
        assert_eq!(recv(&mut remote), "Event: c1 A 1\nEvent: c1 A 0\n");

        command::on_client_command(&mut daemon, client, "Unlock.");
        assert_eq!(recv(&mut remote), "OK.\n");

        // After unlocking, frames no longer produce events.
        daemon.feed_frame(ckey, &frame);
        assert_eq!(recv(&mut remote), "");
    }

    #[test]
    fn dropped_clients_release_their_locks() {
        let mut daemon = Daemon::stub();
        let (c, _) = FakeController::boxed("c1");
        daemon.add_controller(c, None).unwrap();

        let (remote, local) = std::os::unix::net::UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let client = daemon.register_client(mio::net::UnixStream::from_std(local));
        command::on_client_command(&mut daemon, client, "Lock: A B");

        let mkey = daemon.default_mapper();
        assert!(daemon.mappers[mkey].profile().as_lock().is_some());

        drop(remote);
        daemon.clients[client].should_be_dropped = true;
        daemon.reap_clients();

        assert!(daemon.clients.get(client).is_none());
        assert!(daemon.mappers[mkey].profile().as_lock().is_none());
    }

    fn recv(remote: &mut std::os::unix::net::UnixStream) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match remote.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("{}", e),
            }
        }
        String::from_utf8(out).unwrap()
    }
}
