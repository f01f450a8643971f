//! CLI-only subcommand implementations: `check`.
//!
//! `check` does not start the daemon; it verifies the host environment
//! the way `serve` will find it.

use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::Result;

use crate::config::Config;

pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `vmgate check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_state_dir(config),
        check_port(config),
        check_trust_config(config),
    ];

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    if all_pass {
        println!("All checks passed. Start the daemon with: vmgate serve");
        Ok(())
    } else {
        anyhow::bail!("one or more checks failed");
    }
}

fn check_state_dir(config: &Config) -> Check {
    let dir = &config.server.state_dir;
    if let Err(e) = std::fs::create_dir_all(dir) {
        return Check::fail(
            "state directory",
            format!("{}: {}", dir.display(), e),
            format!("create {} and make it writable for this user", dir.display()),
        );
    }
    let probe = dir.join(".check");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Check::pass("state directory", dir.display().to_string())
        }
        Err(e) => Check::fail(
            "state directory",
            format!("{} is not writable: {}", dir.display(), e),
            format!("make {} writable for this user", dir.display()),
        ),
    }
}

fn check_port(config: &Config) -> Check {
    let addr = (config.server.bind_addr, config.server.port);
    match TcpListener::bind(addr) {
        Ok(_) => Check::pass("listen port", format!("{}:{} is free", addr.0, addr.1)),
        Err(e) => Check::fail(
            "listen port",
            format!("{}:{} unavailable: {}", addr.0, addr.1, e),
            "stop the process holding the port (possibly another vmgate instance)",
        ),
    }
}

fn check_trust_config(config: &Config) -> Check {
    if config.trust.authorized_url.starts_with("https://") {
        Check::pass("trust store", config.trust.authorized_url.clone())
    } else {
        Check::fail(
            "trust store",
            format!("authorized_url is not https: {}", config.trust.authorized_url),
            "point trust.authorized_url at an https endpoint",
        )
    }
}
