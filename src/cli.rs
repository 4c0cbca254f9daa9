//! The `open` subcommand: create a portal for the current directory and
//! print its URLs.

use anyhow::{Context, bail};
use std::time::Duration;

use crate::config::{DEFAULT_PUBLIC_PORT, OpenArgs};
use crate::control::{CreatePortalRequest, CreatePortalResponse};
use crate::lanip;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

pub async fn run_open(args: OpenArgs) -> anyhow::Result<()> {
    let policy = args.policy.trim().to_lowercase();
    if policy != "overwrite" && policy != "autorename" {
        bail!("policy must be overwrite or autorename");
    }

    let dest_abs = canonical_cwd().context("resolve destination")?;
    let base_url = resolve_base_url(args.port);

    let request = CreatePortalRequest {
        dest_abs,
        open_minutes: args.minutes,
        reusable: args.reusable,
        autorename_on_conflict: policy == "autorename",
        default_policy: policy,
    };
    let response = create_portal(&base_url, &request).await?;

    let host = match args.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        Some(host) => host.to_string(),
        None => match lanip::detect_primary_ipv4() {
            Some(ip) => ip.to_string(),
            None => {
                eprintln!("warning: no non-loopback IPv4 address found; falling back to 127.0.0.1");
                "127.0.0.1".to_string()
            }
        },
    };

    let port = public_port(args.port);
    println!("{}", format_portal_url(&host, port, &response.portal_id));
    if host != "localhost" {
        println!("{}", format_portal_url("localhost", port, &response.portal_id));
    }

    Ok(())
}

fn canonical_cwd() -> anyhow::Result<String> {
    let cwd = std::env::current_dir()?;
    let resolved = cwd.canonicalize()?;
    Ok(resolved.to_string_lossy().into_owned())
}

async fn create_portal(
    base_url: &str,
    request: &CreatePortalRequest,
) -> anyhow::Result<CreatePortalResponse> {
    let endpoint = format!("{}/api/control/portals", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build http client")?;

    let response = client
        .post(&endpoint)
        .json(request)
        .send()
        .await
        .context("control api request failed")?;

    if !response.status().is_success() {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        let message = message.trim();
        if message.is_empty() {
            bail!("control api error: {status}");
        }
        bail!("control api error: {message}");
    }

    response
        .json::<CreatePortalResponse>()
        .await
        .context("decode response")
}

/// Resolves the ControlAPI base URL from the port override and environment.
fn resolve_base_url(port_override: Option<u16>) -> String {
    if let Some(port) = port_override {
        return format!("http://127.0.0.1:{port}");
    }
    let raw = ["DROPSERVE_URL", "DROPSERVE_ADDR", "DROPSERVE_PUBLIC_ADDR", "DROPSERVE_CONTROL_URL"]
        .iter()
        .find_map(|name| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        });
    normalize_base_url(raw.as_deref().unwrap_or(""))
}

/// Turns an address-ish value into a usable base URL. A `0.0.0.0` host is a
/// bind address, not a dialable one; it becomes `127.0.0.1`.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_BASE_URL.to_string();
    }

    if let Some(rest) = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
    {
        let scheme = if trimmed.starts_with("https://") { "https" } else { "http" };
        let rest = rest.trim_end_matches('/');
        return format!("{scheme}://{}", rewrite_unspecified_host(rest));
    }

    let trimmed = trimmed.trim_end_matches('/');
    format!("http://{}", rewrite_unspecified_host(trimmed))
}

fn rewrite_unspecified_host(host_port: &str) -> String {
    match host_port.split_once(':') {
        Some(("0.0.0.0", port)) => format!("127.0.0.1:{port}"),
        None if host_port == "0.0.0.0" => "127.0.0.1".to_string(),
        _ => host_port.to_string(),
    }
}

/// Port used in the printed portal link.
fn public_port(port_override: Option<u16>) -> u16 {
    if let Some(port) = port_override {
        return port;
    }
    if let Ok(port) = std::env::var("DROPSERVE_PORT")
        && let Ok(port) = port.trim().parse::<u16>()
    {
        return port;
    }

    let addr = ["DROPSERVE_ADDR", "DROPSERVE_PUBLIC_ADDR"].iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    });
    match addr {
        Some(addr) => port_of(&addr).unwrap_or(DEFAULT_PUBLIC_PORT),
        None => DEFAULT_PUBLIC_PORT,
    }
}

fn port_of(addr: &str) -> Option<u16> {
    let without_scheme = addr
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(addr);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    let (_, port) = host_port.rsplit_once(':')?;
    port.parse::<u16>().ok()
}

fn format_portal_url(host: &str, port: u16, portal_id: &str) -> String {
    if port == 80 {
        format!("http://{host}/p/{portal_id}")
    } else {
        format!("http://{host}:{port}/p/{portal_id}")
    }
}
