//! wg(8) backed controller
//!
//! - `wg show <dev> dump` reads the device
//! - `wg setconf <dev> <file>` replaces the whole configuration
//! - `wg set <dev> peer <key> remove` deletes a peer
//! - `wg set <dev> peer <key> ...` touches individual peers

use super::{
    join_networks, render_config, DeviceConfig, DevicePeer, DevicePeerConfig, DeviceSnapshot,
    NetworkController,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use meshsync_common::{Error, Key, Result};
use std::io::Write;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Controller shelling out to the wg(8) tool
pub struct WgController {
    binary: String,
}

impl WgController {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        debug!(binary = %self.binary, ?args, "Running wg");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                Error::ControllerApply(format!("{} failed to start: {}", self.binary, e))
            })?;

        if !output.status.success() {
            return Err(Error::ControllerApply(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output)
    }

    async fn setconf(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        // NamedTempFile is created 0600, the rendered file holds the private key
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(render_config(config).as_bytes())?;
        file.flush()?;

        let args = vec![
            "setconf".to_string(),
            name.to_string(),
            file.path().to_string_lossy().into_owned(),
        ];
        self.run(&args).await?;
        Ok(())
    }

    async fn set(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        let mut args = vec!["set".to_string(), name.to_string()];

        if let Some(port) = config.listen_port {
            args.push("listen-port".to_string());
            args.push(port.to_string());
        }

        // Keep the key file alive until the command has run
        let mut key_file = None;
        if let Some(key) = &config.private_key {
            let mut file = tempfile::NamedTempFile::new()?;
            writeln!(file, "{}", key)?;
            file.flush()?;
            args.push("private-key".to_string());
            args.push(file.path().to_string_lossy().into_owned());
            key_file = Some(file);
        }

        for peer in &config.peers {
            args.push("peer".to_string());
            args.push(peer.public_key.to_string());

            if peer.remove {
                args.push("remove".to_string());
                continue;
            }
            if let Some(endpoint) = peer.endpoint {
                args.push("endpoint".to_string());
                args.push(endpoint.to_string());
            }
            args.push("persistent-keepalive".to_string());
            args.push(
                peer.persistent_keepalive
                    .map(|k| k.as_secs().to_string())
                    .unwrap_or_else(|| "off".to_string()),
            );
            // wg set always replaces the allowed-ips list
            args.push("allowed-ips".to_string());
            args.push(join_networks(&peer.allowed_ips, ","));
        }

        self.run(&args).await?;
        drop(key_file);
        Ok(())
    }
}

#[async_trait]
impl NetworkController for WgController {
    async fn device(&self, name: &str) -> Result<DeviceSnapshot> {
        let args = vec!["show".to_string(), name.to_string(), "dump".to_string()];
        let output = self.run(&args).await?;
        parse_dump(name, &String::from_utf8_lossy(&output.stdout))
    }

    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        if !config.replace_peers {
            return self.set(name, config).await;
        }
        if config.private_key.is_some() {
            return self.setconf(name, config).await;
        }

        // setconf without a PrivateKey line would wipe the interface key, so
        // delete the unlisted peers one by one instead
        let current = self.device(name).await?;
        let mut request = config.clone();
        request.replace_peers = false;
        for peer in current.peers {
            if !config.peers.iter().any(|p| p.public_key == peer.public_key) {
                request.peers.push(DevicePeerConfig::removal(peer.public_key));
            }
        }

        if request.peers.is_empty() && request.listen_port.is_none() {
            return Ok(());
        }
        self.set(name, &request).await
    }
}

/// Parse `wg show <dev> dump` output.
///
/// The first line describes the interface
/// (`private-key public-key listen-port fwmark`), every other line a peer
/// (`public-key preshared-key endpoint allowed-ips latest-handshake
/// transfer-rx transfer-tx persistent-keepalive`), tab separated.
pub fn parse_dump(name: &str, dump: &str) -> Result<DeviceSnapshot> {
    let mut lines = dump.lines().filter(|l| !l.trim().is_empty());

    let interface = lines
        .next()
        .ok_or_else(|| Error::ControllerApply(format!("empty dump for device {}", name)))?;
    let fields: Vec<&str> = interface.split('\t').collect();
    if fields.len() < 4 {
        return Err(malformed(name, interface));
    }

    let mut snapshot = DeviceSnapshot {
        name: name.to_string(),
        public_key: fields[1].parse::<Key>().ok(),
        listen_port: fields[2].parse().ok(),
        peers: Vec::new(),
    };

    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(malformed(name, line));
        }

        let public_key: Key = fields[0].parse().map_err(|_| malformed(name, line))?;
        let endpoint = fields[2].parse().ok();
        let allowed_ips = if fields[3] == "(none)" {
            Vec::new()
        } else {
            fields[3].split(',').filter_map(|n| n.trim().parse().ok()).collect()
        };
        let handshake: i64 = fields[4].parse().map_err(|_| malformed(name, line))?;
        let last_handshake = if handshake > 0 {
            Utc.timestamp_opt(handshake, 0).single()
        } else {
            None
        };
        let bytes_received = fields[5].parse().map_err(|_| malformed(name, line))?;
        let bytes_sent = fields[6].parse().map_err(|_| malformed(name, line))?;

        snapshot.peers.push(DevicePeer {
            public_key,
            endpoint,
            allowed_ips,
            last_handshake,
            bytes_sent,
            bytes_received,
        });
    }

    Ok(snapshot)
}

fn malformed(name: &str, line: &str) -> Error {
    Error::ControllerApply(format!("unexpected wg dump line for {}: {:?}", name, line))
}
