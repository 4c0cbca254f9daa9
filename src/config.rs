//! CLI arguments, environment configuration, and server defaults.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_OPEN_MINUTES: i64 = 15;
pub const DEFAULT_TEMP_DIR_NAME: &str = ".dropserve_tmp";
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 120;
pub const DEFAULT_PART_MAX_AGE_SECS: u64 = 600;
pub const DEFAULT_PORTAL_IDLE_MAX_SECS: u64 = 1800;
pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_PUBLIC_PORT: u16 = 8080;
pub const CLIENT_TOKEN_HEADER: &str = "x-client-token";

/// DropServe command line. Running without a subcommand opens a portal for
/// the current directory.
#[derive(Parser, Debug)]
#[command(name = "dropserve", version, about = "On-demand LAN file-drop portals")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a portal for the current directory and print its URL
    Open(OpenArgs),
    /// Run the HTTP server
    Serve(ServeArgs),
    /// Print the version
    Version,
}

#[derive(Args, Debug)]
pub struct OpenArgs {
    #[arg(
        short = 'm',
        long,
        default_value_t = DEFAULT_OPEN_MINUTES,
        help = "Minutes to keep the portal open"
    )]
    pub minutes: i64,
    #[arg(
        short = 'r',
        long,
        alias = "reuseable",
        help = "Allow multiple claims"
    )]
    pub reusable: bool,
    #[arg(
        long,
        default_value = "overwrite",
        help = "Default conflict policy: overwrite or autorename"
    )]
    pub policy: String,
    #[arg(long, help = "Override LAN host/IP for the printed link")]
    pub host: Option<String>,
    #[arg(long, help = "Override server port for the control call and printed link")]
    pub port: Option<u16>,
}

impl Default for OpenArgs {
    fn default() -> Self {
        Self {
            minutes: DEFAULT_OPEN_MINUTES,
            reusable: false,
            policy: "overwrite".to_string(),
            host: None,
            port: None,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, help = "Override server port")]
    pub port: Option<u16>,
}

/// Shared server settings handed to request handlers.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub temp_dir_name: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            temp_dir_name: temp_dir_name(),
        }
    }
}

/// Name of the per-destination temp directory.
pub fn temp_dir_name() -> String {
    env_trimmed("DROPSERVE_TMP_DIR_NAME").unwrap_or_else(|| DEFAULT_TEMP_DIR_NAME.to_string())
}

pub fn sweep_interval() -> Duration {
    duration_secs(
        env_trimmed("DROPSERVE_SWEEP_INTERVAL_SECONDS").as_deref(),
        DEFAULT_SWEEP_INTERVAL_SECS,
    )
}

pub fn part_max_age() -> Duration {
    duration_secs(
        env_trimmed("DROPSERVE_PART_MAX_AGE_SECONDS").as_deref(),
        DEFAULT_PART_MAX_AGE_SECS,
    )
}

pub fn portal_idle_max_age() -> Duration {
    duration_secs(
        env_trimmed("DROPSERVE_PORTAL_IDLE_MAX_SECONDS").as_deref(),
        DEFAULT_PORTAL_IDLE_MAX_SECS,
    )
}

/// Extra roots the sweeper scans besides live portal destinations. Defaults
/// to the server's working directory.
pub fn sweep_roots() -> Vec<PathBuf> {
    match std::env::var_os("DROPSERVE_SWEEP_ROOTS") {
        Some(raw) if !raw.is_empty() => std::env::split_paths(&raw)
            .filter(|path| !path.as_os_str().is_empty())
            .map(|path| std::path::absolute(&path).unwrap_or(path))
            .collect(),
        _ => std::env::current_dir().map(|cwd| vec![cwd]).unwrap_or_default(),
    }
}

/// Bind address for the HTTP server.
pub fn public_addr(port_override: Option<u16>) -> String {
    resolve_public_addr(
        port_override,
        env_trimmed("DROPSERVE_ADDR").as_deref(),
        env_trimmed("DROPSERVE_PUBLIC_ADDR").as_deref(),
        env_trimmed("DROPSERVE_PORT").as_deref(),
    )
}

fn resolve_public_addr(
    port_override: Option<u16>,
    addr: Option<&str>,
    public_addr: Option<&str>,
    port: Option<&str>,
) -> String {
    if let Some(port) = port_override {
        return format!("0.0.0.0:{port}");
    }
    if let Some(addr) = addr.or(public_addr) {
        return addr.to_string();
    }
    if let Some(port) = port {
        return format!("0.0.0.0:{port}");
    }
    DEFAULT_ADDR.to_string()
}

fn duration_secs(raw: Option<&str>, default_secs: u64) -> Duration {
    let secs = raw
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_falls_back_on_bad_values() {
        assert_eq!(duration_secs(None, 120), Duration::from_secs(120));
        assert_eq!(duration_secs(Some("0"), 120), Duration::from_secs(120));
        assert_eq!(duration_secs(Some("nope"), 120), Duration::from_secs(120));
        assert_eq!(duration_secs(Some("45"), 120), Duration::from_secs(45));
    }

    #[test]
    fn public_addr_resolution_order() {
        assert_eq!(
            resolve_public_addr(Some(9000), Some("10.0.0.1:80"), None, None),
            "0.0.0.0:9000"
        );
        assert_eq!(
            resolve_public_addr(None, Some("10.0.0.1:80"), Some("x"), None),
            "10.0.0.1:80"
        );
        assert_eq!(
            resolve_public_addr(None, None, Some("127.0.0.1:9090"), None),
            "127.0.0.1:9090"
        );
        assert_eq!(resolve_public_addr(None, None, None, Some("81")), "0.0.0.0:81");
        assert_eq!(resolve_public_addr(None, None, None, None), DEFAULT_ADDR);
    }
}
