// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The line-oriented control protocol. Each line is one command, optionally
//! preceded by a `#tag` token that gets echoed before the reply. Replies
//! are `OK.` or `Fail: <reason>`.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::daemon::{ClientKey, Daemon, SpecialClient};
use crate::lock;
use crate::profile::find_profile;

fn reply(daemon: &mut Daemon, client: ClientKey, text: &str) {
    let tag = daemon.clients.get_mut(client).and_then(|c| c.tag.take());
    match tag {
        Some(tag) => daemon.client_send(client, &format!("{} {}", tag, text)),
        None => daemon.client_send(client, text),
    }
}

fn send_ok(daemon: &mut Daemon, client: ClientKey) {
    reply(daemon, client, "OK.\n");
}

fn send_fail(daemon: &mut Daemon, client: ClientKey, why: &str) {
    reply(daemon, client, &format!("Fail: {}\n", why));
}

pub fn on_client_command(daemon: &mut Daemon, client: ClientKey, line: &str) {
    let mut rest = line.trim();

    let mut tag = None;
    if rest.starts_with('#') {
        match rest.split_once(char::is_whitespace) {
            Some((t, r)) => {
                tag = Some(t.to_owned());
                rest = r.trim_start();
            }
            None => {
                tag = Some(rest.to_owned());
                rest = "";
            }
        }
    }

    let Some(c) = daemon.clients.get_mut(client) else {
        return;
    };
    c.tag = tag;
    let mapper = c.mapper;

    let (command, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();

    match command {
        "Button:" => {
            // Presses or releases a key on the virtual devices directly.
            let mut it = args.split_whitespace();
            let keycode: u16 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let pressed = it.next().and_then(|s| s.parse::<i32>().ok()).unwrap_or(0) != 0;
            if keycode == 0 {
                return send_fail(daemon, client, "invalid keycode");
            }

            if let Some(m) = daemon.mappers.get_mut(mapper) {
                if pressed && !m.is_virtual_key_pressed(keycode) {
                    m.key_press(keycode, false);
                } else if !pressed && m.is_virtual_key_pressed(keycode) {
                    m.key_release(keycode);
                }
            }
            send_ok(daemon, client)
        }
        "Controller." => {
            // Back to the default mapper.
            let default = daemon.default_mapper();
            if let Some(c) = daemon.clients.get_mut(client) {
                c.mapper = default;
            }
            send_ok(daemon, client)
        }
        "Controller:" => {
            let found = daemon
                .controllers
                .iter()
                .find(|(_, e)| e.controller.id() == args)
                .and_then(|(_, e)| e.mapper);
            match found {
                Some(mkey) => {
                    if let Some(c) = daemon.clients.get_mut(client) {
                        c.mapper = mkey;
                    }
                    send_ok(daemon, client)
                }
                None => send_fail(daemon, client, "no such controller"),
            }
        }
        "Exit." => {
            info!("exit command received");
            send_ok(daemon, client);
            daemon.exiting = true;
        }
        "Lock:" => {
            let sources: Vec<&str> = args.split_whitespace().collect();
            let result = match daemon.mappers.get_mut(mapper) {
                Some(m) => lock::lock_on_mapper(m, client, &sources),
                None => return,
            };
            match result {
                Ok(()) => send_ok(daemon, client),
                Err(source) => {
                    warn!("client asked to lock '{}', which is unavailable", source);
                    send_fail(daemon, client, &format!("Cannot lock {}", source))
                }
            }
        }
        "Log." => {
            let history = daemon.log_history();
            for line in history {
                daemon.client_send(client, &format!("Log: {}\n", line));
            }
            if let Some(c) = daemon.clients.get_mut(client) {
                c.wants_log = true;
            }
            send_ok(daemon, client)
        }
        "Observe:" => {
            if !daemon.cfg.get_bool("enable_sniffing") {
                warn!("refused 'Observe' request: sniffing disabled");
                return send_fail(daemon, client, "Sniffing disabled.");
            }

            let sources: Vec<&str> = args.split_whitespace().collect();
            let result = match daemon.mappers.get_mut(mapper) {
                Some(m) => lock::observe_on_mapper(m, client, &sources),
                None => return,
            };
            match result {
                Ok(()) => send_ok(daemon, client),
                Err(source) => {
                    send_fail(daemon, client, &format!("Cannot observe {}", source))
                }
            }
        }
        "Profile:" => {
            // Anything without a slash is a profile name; anything else is
            // used as a path directly.
            let path = if args.contains('/') {
                PathBuf::from(args)
            } else {
                match find_profile(&daemon.cfg.profiles_dir(), args) {
                    Some(path) => path,
                    None => {
                        return send_fail(
                            daemon,
                            client,
                            &format!("Profile '{}' not found", args),
                        );
                    }
                }
            };

            info!("activating profile '{}'", path.display());
            if daemon.set_profile(mapper, &path) {
                send_ok(daemon, client)
            } else {
                send_fail(daemon, client, "Failed to activate profile")
            }
        }
        "Reconfigure." => {
            daemon.reload_config();
            send_ok(daemon, client);
            daemon.send_to_all("Reconfigured.\n");
            daemon.rescan();
        }
        "Register:" => match args {
            "osd" => {
                daemon.set_special_client(SpecialClient::Osd, client);
                info!("registered scc-osd-daemon");
                send_ok(daemon, client)
            }
            "autoswitch" => {
                daemon.set_special_client(SpecialClient::Autoswitch, client);
                info!("registered scc-autoswitch-daemon");
                send_ok(daemon, client)
            }
            _ => send_fail(daemon, client, "unknown type"),
        },
        "Rescan." => {
            info!("re-scanning available controllers");
            send_ok(daemon, client);
            daemon.rescan();
        }
        "Turnoff." => {
            send_ok(daemon, client);
            let owned = daemon.controller_of_mapper(mapper);
            match owned {
                Some(key) => daemon.turnoff_controller(key),
                None => {
                    // No controller bound to this client; ask all of them.
                    let keys: Vec<_> = daemon.controllers.keys().collect();
                    for key in keys {
                        daemon.turnoff_controller(key);
                    }
                }
            }
        }
        "Unlock." => {
            if let Some(m) = daemon.mappers.get_mut(mapper) {
                lock::unlock_on_mapper(m, client);
            }
            send_ok(daemon, client)
        }
        _ => {
            info!("unknown command: {}", command);
            send_fail(daemon, client, "Unknown command")
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Read;

    fn setup() -> (Daemon, ClientKey, std::os::unix::net::UnixStream) {
        let mut daemon = Daemon::stub();
        let (remote, local) = std::os::unix::net::UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        remote.set_nonblocking(true).unwrap();
        let key = daemon.register_client(mio::net::UnixStream::from_std(local));
        (daemon, key, remote)
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

    #[test]
    fn unknown_commands_fail_politely() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote); // discard the greeting

        on_client_command(&mut daemon, key, "Teleport.");
        assert_eq!(recv(&mut remote), "Fail: Unknown command\n");
    }

    #[test]
    fn tags_echo_before_the_reply() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "#x17 Rescan.");
        assert_eq!(recv(&mut remote), "#x17 OK.\n");

        // The tag does not leak into the next reply.
        on_client_command(&mut daemon, key, "Unlock.");
        assert_eq!(recv(&mut remote), "OK.\n");
    }

    #[test]
    fn lock_of_zero_sources_succeeds() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "Lock:");
        assert_eq!(recv(&mut remote), "OK.\n");
    }

    #[test]
    fn lock_of_unknown_source_fails() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "Lock: A FROB");
        assert_eq!(recv(&mut remote), "Fail: Cannot lock FROB\n");
    }

    #[test]
    fn button_presses_virtual_keys() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "Button: 30 1");
        assert_eq!(recv(&mut remote), "OK.\n");
        let mkey = daemon.default_mapper();
        assert!(daemon.mappers[mkey].is_virtual_key_pressed(30));

        on_client_command(&mut daemon, key, "Button: 30 0");
        assert_eq!(recv(&mut remote), "OK.\n");
        assert!(!daemon.mappers[mkey].is_virtual_key_pressed(30));
    }

    #[test]
    fn button_zero_is_invalid() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "Button: 0 1");
        assert_eq!(recv(&mut remote), "Fail: invalid keycode\n");
    }

    #[test]
    fn exit_acknowledges_then_stops() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "Exit.");
        assert_eq!(recv(&mut remote), "OK.\n");
        assert!(daemon.exiting);
    }

    #[test]
    fn missing_profiles_fail() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "Profile: No Such Profile");
        assert_eq!(
            recv(&mut remote),
            "Fail: Profile 'No Such Profile' not found\n"
        );
    }

    #[test]
    fn controller_binding_fails_without_controllers() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "Controller: sc123");
        assert_eq!(recv(&mut remote), "Fail: no such controller\n");

        on_client_command(&mut daemon, key, "Controller.");
        assert_eq!(recv(&mut remote), "OK.\n");
    }

    #[test]
    fn observe_needs_sniffing_enabled() {
        let (mut daemon, key, mut remote) = setup();
        recv(&mut remote);

        on_client_command(&mut daemon, key, "Observe: A");
        assert_eq!(recv(&mut remote), "Fail: Sniffing disabled.\n");

        daemon.cfg.set("enable_sniffing", serde_json::json!(true));
        on_client_command(&mut daemon, key, "Observe: A");
        assert_eq!(recv(&mut remote), "OK.\n");
    }

    #[test]
    fn greeting_lists_controllers_and_profile() {
        let (mut daemon, _key, mut remote) = setup();
        let greeting = recv(&mut remote);
        assert!(greeting.contains("Controller Count: 0\n"));

        // A second client connecting sees the same burst.
        let (remote2, local2) = std::os::unix::net::UnixStream::pair().unwrap();
        local2.set_nonblocking(true).unwrap();
        remote2.set_nonblocking(true).unwrap();
        let mut remote2 = remote2;
        daemon.register_client(mio::net::UnixStream::from_std(local2));
        assert!(recv(&mut remote2).contains("Controller Count: 0\n"));
    }
}
