//! sshharness - run a log server and its test client on a remote host
//!
//! Usage:
//!   sshharness
//!   sshharness --host 10.0.0.5 --user ci --auth key --key ~/.ssh/ci_ed25519
//!   sshharness --config harness.toml --json

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use sshharness::config::{AuthMethod, HarnessConfig};
use sshharness::harness::{Harness, JoinProgress};
use sshharness::paths;
use sshharness::report;
use sshharness::session::RemoteSession;

#[derive(Default)]
struct Args {
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    auth: Option<AuthMethod>,
    key: Option<PathBuf>,
    password: Option<String>,
    safe_mode: bool,
    json: bool,
    verbose: bool,
}

impl Args {
    /// Command line flags win over file and environment settings
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(host) = &self.host {
            config.connection.host = host.clone();
        }
        if let Some(port) = self.port {
            config.connection.port = port;
        }
        if let Some(user) = &self.user {
            config.connection.user = user.clone();
        }
        if let Some(key) = &self.key {
            config.connection.key_path = key.clone();
            config.connection.auth = AuthMethod::Key;
        }
        if let Some(password) = &self.password {
            config.connection.password = Some(password.clone());
            config.connection.auth = AuthMethod::Password;
        }
        if let Some(auth) = self.auth {
            config.connection.auth = auth;
        }
        if self.safe_mode {
            config.safe_mode = true;
        }
    }
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                args.config = Some(
                    iter.next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires value"))?
                        .into(),
                );
            }
            "--host" | "-H" => {
                args.host = Some(iter.next().ok_or_else(|| anyhow::anyhow!("--host requires value"))?);
            }
            "--port" | "-p" => {
                args.port = Some(
                    iter.next()
                        .ok_or_else(|| anyhow::anyhow!("--port requires value"))?
                        .parse()
                        .context("--port must be a port number")?,
                );
            }
            "--user" | "-u" => {
                args.user = Some(iter.next().ok_or_else(|| anyhow::anyhow!("--user requires value"))?);
            }
            "--auth" | "-a" => {
                let value = iter.next().ok_or_else(|| anyhow::anyhow!("--auth requires value"))?;
                args.auth = Some(
                    AuthMethod::parse(&value)
                        .ok_or_else(|| anyhow::anyhow!("unknown auth method: {}", value))?,
                );
            }
            "--key" | "-k" => {
                args.key = Some(
                    iter.next()
                        .ok_or_else(|| anyhow::anyhow!("--key requires value"))?
                        .into(),
                );
            }
            "--password" => {
                args.password =
                    Some(iter.next().ok_or_else(|| anyhow::anyhow!("--password requires value"))?);
            }
            "--safe-mode" => {
                args.safe_mode = true;
            }
            "--json" | "-j" => {
                args.json = true;
            }
            "--verbose" | "-v" => {
                args.verbose = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {}", other);
                print_help();
                std::process::exit(2);
            }
        }
    }

    Ok(args)
}

fn print_help() {
    eprintln!(
        r#"sshharness - run a log server and its test client over SSH

USAGE:
    sshharness [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Config file [default: {config}]
    -H, --host <HOST>      Remote host [default: 127.0.0.1]
    -p, --port <PORT>      SSH port [default: 22]
    -u, --user <NAME>      Username [default: current user]
    -a, --auth <METHOD>    agent, key, password or none [default: agent]
    -k, --key <PATH>       Private key (implies --auth key)
        --password <PW>    Password (implies --auth password)
        --safe-mode        Quote command arguments, refuse shell syntax
    -j, --json             Print the final report as JSON
    -v, --verbose          Log remote output as it arrives
    -h, --help             Print help

ENVIRONMENT:
    SSHHARNESS_CONFIG, SSHHARNESS_HOST, SSHHARNESS_PORT,
    SSHHARNESS_USER, SSHHARNESS_PASSWORD, RUST_LOG

Without a config file, runs ./build/log_server and, once it has been up
for a second, ./build/log_test_client (paths relative to the current
directory, executed on the remote host).
"#,
        config = paths::config_path().display(),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("sshharness={}", level).parse()?),
        )
        .init();

    let config_path = args.config.clone().unwrap_or_else(paths::config_path);
    let mut config = HarnessConfig::load(&config_path).context("failed to load config")?;
    config.apply_env().context("bad environment override")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let cwd = paths::working_dir()?;

    info!(
        addr = %config.connection.addr(),
        user = %config.connection.user,
        "connecting"
    );
    let mut session = RemoteSession::connect(&config.connection)
        .await
        .context("failed to open remote session")?;
    if !config.safe_mode {
        session.disable_safe_mode();
    }
    let session = Arc::new(session);

    let harness = Harness::new(session.clone(), &config, cwd)?;
    let cancel = harness.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling remote tasks");
            cancel.cancel();
        }
    });

    let set = harness.launch().await;

    // With --json, stdout carries only the report
    let progress = |text: &str| {
        if args.json {
            eprint!("{}", text);
        } else {
            print!("{}", text);
        }
    };

    progress("\n");
    progress(&report::render_statuses(&set));
    progress("\n");
    progress(&report::render_liveness(&set));
    progress("\n");

    let outcome = set
        .join_each(|step| match step {
            JoinProgress::Joining(name) => progress(&format!("joining task {}\n", name)),
            JoinProgress::Done(_) => progress("... done\n"),
        })
        .await;

    if args.json {
        println!("{}", report::to_json(&outcome)?);
    } else {
        print!("{}", report::render_outputs(&outcome));
    }

    if let Err(e) = session.close().await {
        warn!("failed to close session cleanly: {}", e);
    }

    if !outcome.success() {
        for task in outcome.failed() {
            warn!(task = %task.name, status = %task.status, "task did not succeed");
        }
        std::process::exit(1);
    }

    Ok(())
}
