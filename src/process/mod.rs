//! siad process supervision.
//!
//! Spawns the daemon with flags derived from its config, mirrors its
//! output into `sia-output.log`, waits for the API to answer and for the
//! daemon's own "full setup" marker, and tears the process down gracefully
//! with a bounded escalation to SIGKILL.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::client::SiadClient;
use crate::config::SiadConfig;
use crate::types::SiadApi;

/// Name of the combined stdout/stderr log inside the ant's data dir.
pub const OUTPUT_LOG_NAME: &str = "sia-output.log";

/// Line the daemon prints once every module finished loading.
const FULL_SETUP_MARKER: &str = "Finished full setup";

/// The API password reaches the daemon through the environment, never argv.
const API_PASSWORD_ENV: &str = "SIA_API_PASSWORD";

/// Budget for the API port to start answering.
const API_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Budget for the full-setup marker once the API answers.
const FULL_SETUP_TIMEOUT: Duration = Duration::from_secs(20);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Budget for process exit after a stop request before escalating.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// Budget for process exit after a forced kill.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of recent output lines retained for startup diagnostics.
const OUTPUT_TAIL_LINES: usize = 200;

/// Optional CLI flags detected from the daemon's help text. Older builds
/// predate the siamux listeners and reject the flags outright.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptionalFlags {
    pub siamux: bool,
    pub siamux_ws: bool,
}

pub(crate) fn parse_help_flags(help: &str) -> OptionalFlags {
    OptionalFlags {
        siamux: help.contains("--siamux-addr"),
        siamux_ws: help.contains("--siamux-addr-ws"),
    }
}

/// Assemble the daemon argument list for one config.
pub(crate) fn build_args(config: &SiadConfig, flags: OptionalFlags) -> Vec<String> {
    let mut args = vec![
        format!("--modules={}", config.modules),
        "--no-bootstrap".to_string(),
        format!("--sia-directory={}", config.data_dir.display()),
        format!("--api-addr={}", config.api_addr),
        format!("--rpc-addr={}", config.rpc_addr),
        format!("--host-addr={}", config.host_addr),
    ];
    if flags.siamux && !config.siamux_addr.is_empty() {
        args.push(format!("--siamux-addr={}", config.siamux_addr));
    }
    if flags.siamux_ws && !config.siamux_ws_addr.is_empty() {
        args.push(format!("--siamux-addr-ws={}", config.siamux_ws_addr));
    }
    if config.api_password.is_none() {
        args.push("--authenticate-api=false".to_string());
    }
    args
}

/// Pull a version token like `1.5.6` or `v1.5.6-dev` out of `siad version`
/// output.
pub(crate) fn parse_version_output(output: &str) -> Option<String> {
    let re = Regex::new(r"v?(\d+\.\d+\.\d+[0-9A-Za-z.\-]*)").ok()?;
    re.captures(output).map(|c| c[1].to_string())
}

/// A running siad instance.
pub struct DaemonProcess {
    child: Child,
    config: SiadConfig,
    /// Rolling tail of daemon output, kept for failure diagnostics.
    output_tail: Arc<Mutex<VecDeque<String>>>,
}

impl DaemonProcess {
    /// Spawn a daemon and block until it is fully ready.
    ///
    /// Readiness means the API answers a version request and the daemon has
    /// logged its full-setup marker. A process that exits first, or misses
    /// either readiness budget, is killed and reported as a hard error.
    pub async fn start(config: &SiadConfig) -> Result<DaemonProcess> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory {}", config.data_dir.display())
        })?;

        if let Some(flavor) = &config.expected_version_flavor {
            check_version(config, flavor).await?;
        }

        let help = read_help_text(&config.siad_path).await?;
        let flags = parse_help_flags(&help);
        let args = build_args(config, flags);
        debug!(siad = %config.siad_path.display(), ?args, "spawning daemon");

        let mut command = Command::new(&config.siad_path);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &config.api_password {
            command.env(API_PASSWORD_ENV, password);
        }

        let mut child = command.spawn().with_context(|| {
            format!("failed to spawn daemon {}", config.siad_path.display())
        })?;

        let log_path = config.data_dir.join(OUTPUT_LOG_NAME);
        let output_tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let (marker_tx, marker_rx) = watch::channel(false);
        let marker_tx = Arc::new(marker_tx);

        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, log_path.clone(), Arc::clone(&output_tail), Arc::clone(&marker_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, log_path.clone(), Arc::clone(&output_tail), marker_tx);
        }

        let mut process = DaemonProcess {
            child,
            config: config.clone(),
            output_tail,
        };

        if let Err(err) = process.wait_until_ready(marker_rx).await {
            let _ = process.child.start_kill();
            let _ = timeout(KILL_TIMEOUT, process.child.wait()).await;
            return Err(err);
        }

        info!(api = %config.api_addr, "daemon ready");
        Ok(process)
    }

    async fn wait_until_ready(&mut self, marker_rx: watch::Receiver<bool>) -> Result<()> {
        let client = SiadClient::new(&self.config.api_addr, self.config.api_password.clone())?;

        // Phase one: the API port answers.
        let deadline = Instant::now() + API_READY_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait().context("failed to poll daemon")? {
                bail!(
                    "daemon exited before becoming ready ({}):\n{}",
                    status,
                    self.tail_for_error()
                );
            }
            if client.daemon_version().await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                bail!(
                    "daemon API {} did not answer within {:?}:\n{}",
                    self.config.api_addr,
                    API_READY_TIMEOUT,
                    self.tail_for_error()
                );
            }
            sleep(READY_POLL_INTERVAL).await;
        }

        // Phase two: the daemon reports its startup sequence finished.
        let deadline = Instant::now() + FULL_SETUP_TIMEOUT;
        loop {
            if *marker_rx.borrow() {
                return Ok(());
            }
            if let Some(status) = self.child.try_wait().context("failed to poll daemon")? {
                bail!(
                    "daemon exited during startup ({}):\n{}",
                    status,
                    self.tail_for_error()
                );
            }
            if Instant::now() >= deadline {
                bail!(
                    "daemon did not log {:?} within {:?}:\n{}",
                    FULL_SETUP_MARKER,
                    FULL_SETUP_TIMEOUT,
                    self.tail_for_error()
                );
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    fn tail_for_error(&self) -> String {
        let tail = self.output_tail.lock().unwrap();
        tail.iter()
            .rev()
            .take(15)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// True once the child has exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Stop the daemon: graceful stop RPC first, forced kill on RPC
    /// failure, and a bounded wait for exit either way. Safe to call on a
    /// process that already exited.
    pub async fn stop(&mut self, api: &dyn SiadApi) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        if let Err(err) = api.daemon_stop().await {
            warn!(error = %err, "graceful stop failed, killing daemon");
            let _ = self.child.start_kill();
        }

        match timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await {
            Ok(status) => {
                status.context("failed to reap daemon")?;
                Ok(())
            }
            Err(_) => {
                warn!("daemon ignored stop for {:?}, killing", SHUTDOWN_TIMEOUT);
                let _ = self.child.start_kill();
                timeout(KILL_TIMEOUT, self.child.wait())
                    .await
                    .context("daemon survived SIGKILL")?
                    .context("failed to reap daemon")?;
                Ok(())
            }
        }
    }
}

async fn check_version(config: &SiadConfig, flavor: &str) -> Result<()> {
    let output = Command::new(&config.siad_path)
        .arg("version")
        .output()
        .await
        .with_context(|| format!("failed to run {} version", config.siad_path.display()))?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned()
        + &String::from_utf8_lossy(&output.stderr);
    let version = parse_version_output(&text).unwrap_or_else(|| "unknown".to_string());
    if !text.contains(flavor) {
        bail!(
            "daemon {} reports version {} without expected build flavor {:?}",
            config.siad_path.display(),
            version,
            flavor
        );
    }
    debug!(%version, "daemon version check passed");
    Ok(())
}

async fn read_help_text(siad_path: &Path) -> Result<String> {
    let output = Command::new(siad_path)
        .arg("-h")
        .output()
        .await
        .with_context(|| format!("failed to run {} -h", siad_path.display()))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned()
        + &String::from_utf8_lossy(&output.stderr))
}

/// Mirror one output pipe into the log file and the in-memory tail,
/// flagging the full-setup marker when it appears.
fn pump_output(
    reader: impl AsyncRead + Unpin + Send + 'static,
    log_path: PathBuf,
    tail: Arc<Mutex<VecDeque<String>>>,
    marker_tx: Arc<watch::Sender<bool>>,
) {
    tokio::spawn(async move {
        let mut log = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => Some(f),
            Err(err) => {
                warn!(path = %log_path.display(), error = %err, "cannot open daemon log");
                None
            }
        };

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(log) = log.as_mut() {
                let _ = log.write_all(line.as_bytes()).await;
                let _ = log.write_all(b"\n").await;
            }
            if line.contains(FULL_SETUP_MARKER) {
                marker_tx.send_replace(true);
            }
            let mut tail = tail.lock().unwrap();
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SiadConfig {
        SiadConfig {
            siad_path: PathBuf::from("/usr/bin/siad"),
            data_dir: PathBuf::from("/tmp/ant0"),
            api_addr: "127.0.0.1:9980".to_string(),
            rpc_addr: "127.0.0.1:9981".to_string(),
            host_addr: "127.0.0.1:9982".to_string(),
            siamux_addr: "127.0.0.1:9983".to_string(),
            siamux_ws_addr: "127.0.0.1:9984".to_string(),
            api_password: None,
            modules: "cgthmrw".to_string(),
            expected_version_flavor: None,
        }
    }

    #[test]
    fn test_parse_help_flags() {
        let help = "Flags:\n  --api-addr string\n  --siamux-addr string\n  --siamux-addr-ws string\n";
        assert_eq!(
            parse_help_flags(help),
            OptionalFlags {
                siamux: true,
                siamux_ws: true
            }
        );
        assert_eq!(parse_help_flags("--api-addr only"), OptionalFlags::default());
    }

    #[test]
    fn test_build_args_without_password_disables_auth() {
        let args = build_args(&test_config(), OptionalFlags::default());
        assert!(args.contains(&"--modules=cgthmrw".to_string()));
        assert!(args.contains(&"--no-bootstrap".to_string()));
        assert!(args.contains(&"--authenticate-api=false".to_string()));
        // Not detected in help, so the flags must stay off the command line.
        assert!(!args.iter().any(|a| a.starts_with("--siamux-addr")));
    }

    #[test]
    fn test_build_args_password_not_in_argv() {
        let mut config = test_config();
        config.api_password = Some("hunter2".to_string());
        let args = build_args(&config, OptionalFlags::default());
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert!(!args.contains(&"--authenticate-api=false".to_string()));
    }

    #[test]
    fn test_build_args_gates_siamux_on_help() {
        let args = build_args(
            &test_config(),
            OptionalFlags {
                siamux: true,
                siamux_ws: false,
            },
        );
        assert!(args.contains(&"--siamux-addr=127.0.0.1:9983".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--siamux-addr-ws")));
    }

    #[test]
    fn test_parse_version_output() {
        assert_eq!(
            parse_version_output("Sia Daemon v1.5.6-dev\n").as_deref(),
            Some("1.5.6-dev")
        );
        assert_eq!(
            parse_version_output("version 1.4.0").as_deref(),
            Some("1.4.0")
        );
        assert_eq!(parse_version_output("no version here"), None);
    }
}
