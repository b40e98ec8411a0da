use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

/// Opens a URL in the user's browser. Failures are reported, never fatal.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Hands the URL to the desktop's default handler and does not wait for it.
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        let (program, args) = opener_command(url);
        Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to launch {program} for {url}"))?;
        Ok(())
    }
}

/// Address of the web app served by the primary
pub fn browser_url(host: &str, port: u16) -> String {
    let host = match host {
        "0.0.0.0" | "::" | "[::]" => "localhost".to_string(),
        h if h.contains(':') && !h.starts_with('[') => format!("[{h}]"),
        h => h.to_string(),
    };
    format!("http://{host}:{port}/index.html")
}

#[cfg(target_os = "macos")]
fn opener_command(url: &str) -> (&'static str, Vec<String>) {
    ("open", vec![url.to_string()])
}

#[cfg(windows)]
fn opener_command(url: &str) -> (&'static str, Vec<String>) {
    // The empty argument is the window title `start` expects first.
    (
        "cmd",
        vec![
            "/C".to_string(),
            "start".to_string(),
            String::new(),
            url.to_string(),
        ],
    )
}

#[cfg(not(any(target_os = "macos", windows)))]
fn opener_command(url: &str) -> (&'static str, Vec<String>) {
    ("xdg-open", vec![url.to_string()])
}
