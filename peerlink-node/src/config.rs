//! Load config from file, environment and command line.

use serde::Deserialize;
use std::path::PathBuf;

/// Node configuration. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_RELAY_URL, PEERLINK_PEER_ID, PEERLINK_SECRET, PEERLINK_CALL,
/// PEERLINK_RELAY_LISTEN.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// WebSocket relay URL (default ws://127.0.0.1:8787).
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Peer identity; random when unset.
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Shared secret sealing relay payloads.
    #[serde(default)]
    pub secret: Option<String>,
    /// Peer to call on startup.
    #[serde(default)]
    pub call: Option<String>,
    /// Run the embedded relay on this address.
    #[serde(default)]
    pub relay_listen: Option<String>,
    /// Stack tunables, `[core]` table.
    #[serde(default)]
    pub core: peerlink_core::Config,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8787".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            peer_id: None,
            secret: None,
            call: None,
            relay_listen: None,
            core: peerlink_core::Config::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PEERLINK_RELAY_URL") {
        c.relay_url = s;
    }
    if let Some(s) = var("PEERLINK_PEER_ID") {
        c.peer_id = Some(s);
    }
    if let Some(s) = var("PEERLINK_SECRET") {
        c.secret = Some(s);
    }
    if let Some(s) = var("PEERLINK_CALL") {
        c.call = Some(s);
    }
    if let Some(s) = var("PEERLINK_RELAY_LISTEN") {
        c.relay_listen = Some(s);
    }
}

/// Apply `--flag value` overrides. Unknown flags are an error.
pub fn apply_args(c: &mut Config, args: &[String]) -> Result<(), String> {
    let mut it = args.iter();
    while let Some(flag) = it.next() {
        let mut value = || it.next().cloned().ok_or_else(|| format!("{} needs a value", flag));
        match flag.as_str() {
            "--relay" => c.relay_url = value()?,
            "--id" => c.peer_id = Some(value()?),
            "--secret" => c.secret = Some(value()?),
            "--call" => c.call = Some(value()?),
            "--serve-relay" => c.relay_listen = Some(value()?),
            other => return Err(format!("unknown argument {}", other)),
        }
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!("ignoring {}: {}", p.display(), e),
                Err(e) => tracing::warn!("cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}
