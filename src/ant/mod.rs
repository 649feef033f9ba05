//! One orchestrated daemon instance.
//!
//! An `Ant` couples a supervised siad process, its job runner, and its
//! identity (addresses, config, seen-block history) into one unit that can
//! be started, stopped, and live-upgraded to a new daemon binary without
//! losing its wallet.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::barrier::SyncBarrier;
use crate::client::SiadClient;
use crate::config::AntConfig;
use crate::jobs::{JobRunner, JobSpec};
use crate::process::DaemonProcess;
use crate::threadgroup::ThreadGroup;
use crate::types::{BlockId, Currency, SiadApi};

/// Settle time granted to a freshly swapped daemon before jobs restart.
const UPGRADE_WARMUP: Duration = Duration::from_secs(15);

/// Distinguished condition for waits interrupted by a deliberate
/// shutdown, so callers can tell it apart from real failures.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("ant was stopped")]
pub struct AntStopped;

pub struct Ant {
    pub name: String,
    pub api_addr: String,
    pub rpc_addr: String,
    pub host_addr: String,
    config: Mutex<AntConfig>,
    client: Arc<dyn SiadApi>,
    daemon: tokio::sync::Mutex<Option<DaemonProcess>>,
    runner: tokio::sync::Mutex<Option<Arc<JobRunner>>>,
    /// Block history as observed by the farm's consensus polling. Written
    /// only from that single poller; entries are never overwritten.
    seen_blocks: Mutex<HashMap<u64, BlockId>>,
    /// Interrupts ant-level waits (upgrade warm-up) on shutdown.
    tg: ThreadGroup,
}

impl Ant {
    /// Start the daemon, initialize the wallet, and launch every
    /// configured job. A failure anywhere tears the partially started
    /// daemon back down before the error is returned.
    pub async fn new(config: AntConfig, synced: SyncBarrier) -> Result<Arc<Ant>> {
        std::fs::create_dir_all(&config.siad.data_dir).with_context(|| {
            format!(
                "failed to create data directory {}",
                config.siad.data_dir.display()
            )
        })?;

        let client: Arc<dyn SiadApi> = Arc::new(SiadClient::new(
            &config.siad.api_addr,
            config.siad.api_password.clone(),
        )?);

        let mut daemon = DaemonProcess::start(&config.siad)
            .await
            .with_context(|| format!("failed to start daemon for ant {:?}", config.name))?;

        match Self::finish_start(&config, &client, &synced).await {
            Ok(runner) => {
                let ant = Arc::new(Ant {
                    name: config.name.clone(),
                    api_addr: config.siad.api_addr.clone(),
                    rpc_addr: config.siad.rpc_addr.clone(),
                    host_addr: config.siad.host_addr.clone(),
                    config: Mutex::new(config),
                    client,
                    daemon: tokio::sync::Mutex::new(Some(daemon)),
                    runner: tokio::sync::Mutex::new(Some(runner)),
                    seen_blocks: Mutex::new(HashMap::new()),
                    tg: ThreadGroup::new(),
                });
                info!(ant = %ant.name, api = %ant.api_addr, "ant started");
                Ok(ant)
            }
            Err(err) => {
                // No orphaned subprocesses: the daemon dies with the error.
                if let Err(stop_err) = daemon.stop(client.as_ref()).await {
                    warn!(error = %stop_err, "failed to stop daemon during rollback");
                }
                Err(err)
            }
        }
    }

    async fn finish_start(
        config: &AntConfig,
        client: &Arc<dyn SiadApi>,
        synced: &SyncBarrier,
    ) -> Result<Arc<JobRunner>> {
        let runner = JobRunner::new(
            Arc::clone(client),
            synced.clone(),
            config.initial_wallet_seed.as_deref(),
            config.siad.data_dir.clone(),
        )
        .await
        .with_context(|| format!("failed to build job runner for ant {:?}", config.name))?;

        for job in config.jobs.clone() {
            JobRunner::start_job(&runner, job);
        }
        if config.desired_currency > 0 {
            JobRunner::start_balance_maintainer(
                &runner,
                Currency::from_siacoins(config.desired_currency),
            );
        }
        Ok(runner)
    }

    pub fn config(&self) -> AntConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn has_renter_type_job(&self) -> bool {
        self.config.lock().unwrap().has_renter_type_job()
    }

    pub fn client(&self) -> Arc<dyn SiadApi> {
        Arc::clone(&self.client)
    }

    /// The live job runner, if the ant is running.
    pub async fn job_runner(&self) -> Option<Arc<JobRunner>> {
        self.runner.lock().await.clone()
    }

    /// Launch one more job on the running ant.
    pub async fn start_job(&self, spec: JobSpec) -> Result<()> {
        let runner = self.runner.lock().await;
        match runner.as_ref() {
            Some(runner) => {
                JobRunner::start_job(runner, spec);
                Ok(())
            }
            None => bail!("ant {:?} has no active job runner", self.name),
        }
    }

    pub async fn block_height(&self) -> Result<u64> {
        Ok(self.client.consensus().await?.height)
    }

    pub async fn wallet_address(&self) -> Result<String> {
        self.client.wallet_address().await
    }

    /// The wallet seed currently held by the job runner.
    pub async fn wallet_seed(&self) -> Option<String> {
        self.runner
            .lock()
            .await
            .as_ref()
            .map(|r| r.seed().to_string())
    }

    /// Record one polled block into the seen-block history. Heights are
    /// write-once; a conflicting id for a known height is ignored, the
    /// history is read-only once written.
    pub(crate) fn record_seen_block(&self, height: u64, id: &BlockId) {
        let mut seen = self.seen_blocks.lock().unwrap();
        seen.entry(height).or_insert_with(|| id.clone());
    }

    pub(crate) fn seen_block(&self, height: u64) -> Option<BlockId> {
        self.seen_blocks.lock().unwrap().get(&height).cloned()
    }

    pub(crate) fn seen_snapshot(&self) -> HashMap<u64, BlockId> {
        self.seen_blocks.lock().unwrap().clone()
    }

    /// Stop jobs first, then the daemon. Idempotent: a second close (or a
    /// close racing a daemon that already exited) succeeds.
    pub async fn close(&self) -> Result<()> {
        self.tg.stop().await;

        if let Some(runner) = self.runner.lock().await.take() {
            runner.stop().await;
        }
        if let Some(mut daemon) = self.daemon.lock().await.take() {
            daemon
                .stop(self.client.as_ref())
                .await
                .with_context(|| format!("failed to stop daemon for ant {:?}", self.name))?;
        }
        info!(ant = %self.name, "ant closed");
        Ok(())
    }

    /// Swap the daemon binary in place: stop everything, restart on the
    /// new binary, rebuild the job runner around the existing wallet seed,
    /// and relaunch the configured jobs. On any failure the ant is left
    /// fully stopped with no dangling process.
    pub async fn update_siad(&self, new_binary: PathBuf) -> Result<()> {
        let Some(old_runner) = self.runner.lock().await.take() else {
            bail!("ant {:?} has no active job runner to upgrade", self.name);
        };
        old_runner.stop().await;

        if let Some(mut daemon) = self.daemon.lock().await.take() {
            daemon
                .stop(self.client.as_ref())
                .await
                .context("failed to stop old daemon")?;
        }

        let siad_config = {
            let mut config = self.config.lock().unwrap();
            config.siad.siad_path = new_binary;
            config.siad.clone()
        };

        let mut daemon = DaemonProcess::start(&siad_config)
            .await
            .with_context(|| format!("failed to start upgraded daemon for ant {:?}", self.name))?;

        // Give the swapped daemon a moment to settle before jobs hammer
        // it, but never hold up a shutdown for it.
        let interrupted = tokio::select! {
            _ = sleep(UPGRADE_WARMUP) => false,
            _ = self.tg.stopped() => true,
        };
        if interrupted {
            let _ = daemon.stop(self.client.as_ref()).await;
            return Err(AntStopped.into());
        }

        let runner = match JobRunner::recreate(&old_runner, Arc::clone(&self.client)).await {
            Ok(runner) => runner,
            Err(err) => {
                let _ = daemon.stop(self.client.as_ref()).await;
                return Err(err.context("failed to rebuild job runner after upgrade"));
            }
        };

        let config = self.config();
        if config.has_renter_type_job() {
            // Local farms put many hosts behind one IP; old daemons would
            // refuse their contracts otherwise.
            if let Err(err) = self.client.renter_set_ip_violation_check(false).await {
                warn!(error = %err, "failed to disable IP violation check");
            }
        }

        for job in config.jobs.clone() {
            JobRunner::start_job(&runner, job);
        }
        if config.desired_currency > 0 {
            JobRunner::start_balance_maintainer(
                &runner,
                Currency::from_siacoins(config.desired_currency),
            );
        }

        *self.daemon.lock().await = Some(daemon);
        *self.runner.lock().await = Some(runner);
        info!(ant = %self.name, binary = %siad_config.siad_path.display(), "ant upgraded");
        Ok(())
    }
}

#[cfg(test)]
impl Ant {
    /// An ant with no daemon or jobs, answering entirely through the
    /// injected client. Used by farm-level tests.
    pub(crate) fn disconnected(name: &str, client: Arc<dyn SiadApi>) -> Arc<Ant> {
        use crate::config::SiadConfig;
        let config = AntConfig {
            name: name.to_string(),
            jobs: Vec::new(),
            desired_currency: 0,
            initial_wallet_seed: None,
            siad: SiadConfig {
                siad_path: PathBuf::from("siad"),
                data_dir: PathBuf::from("/tmp"),
                api_addr: "127.0.0.1:9980".to_string(),
                rpc_addr: "127.0.0.1:9981".to_string(),
                host_addr: "127.0.0.1:9982".to_string(),
                siamux_addr: String::new(),
                siamux_ws_addr: String::new(),
                api_password: None,
                modules: "cgthmrw".to_string(),
                expected_version_flavor: None,
            },
        };
        Arc::new(Ant {
            name: config.name.clone(),
            api_addr: config.siad.api_addr.clone(),
            rpc_addr: config.siad.rpc_addr.clone(),
            host_addr: config.siad.host_addr.clone(),
            config: Mutex::new(config),
            client,
            daemon: tokio::sync::Mutex::new(None),
            runner: tokio::sync::Mutex::new(None),
            seen_blocks: Mutex::new(HashMap::new()),
            tg: ThreadGroup::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiadConfig;

    fn bare_ant() -> Ant {
        let siad = SiadConfig {
            siad_path: PathBuf::from("siad"),
            data_dir: PathBuf::from("/tmp/ant-test"),
            api_addr: "127.0.0.1:9980".to_string(),
            rpc_addr: "127.0.0.1:9981".to_string(),
            host_addr: "127.0.0.1:9982".to_string(),
            siamux_addr: String::new(),
            siamux_ws_addr: String::new(),
            api_password: None,
            modules: "cgthmrw".to_string(),
            expected_version_flavor: None,
        };
        let config = AntConfig {
            name: "test-ant".to_string(),
            jobs: vec![JobSpec::Renter {
                mode: crate::jobs::RenterMode::Active,
            }],
            desired_currency: 0,
            initial_wallet_seed: None,
            siad: siad.clone(),
        };
        Ant {
            name: config.name.clone(),
            api_addr: siad.api_addr.clone(),
            rpc_addr: siad.rpc_addr.clone(),
            host_addr: siad.host_addr.clone(),
            config: Mutex::new(config),
            client: Arc::new(SiadClient::new(&siad.api_addr, None).unwrap()),
            daemon: tokio::sync::Mutex::new(None),
            runner: tokio::sync::Mutex::new(None),
            seen_blocks: Mutex::new(HashMap::new()),
            tg: ThreadGroup::new(),
        }
    }

    #[test]
    fn test_seen_blocks_never_overwritten() {
        let ant = bare_ant();
        ant.record_seen_block(5, &"aaaa".to_string());
        ant.record_seen_block(5, &"bbbb".to_string());
        assert_eq!(ant.seen_block(5).as_deref(), Some("aaaa"));
    }

    #[tokio::test]
    async fn test_start_job_without_runner_fails() {
        let ant = bare_ant();
        let err = ant.start_job(JobSpec::Generic).await.unwrap_err();
        assert!(err.to_string().contains("no active job runner"));
    }

    #[test]
    fn test_has_renter_type_job() {
        let ant = bare_ant();
        assert!(ant.has_renter_type_job());
    }

    #[tokio::test]
    async fn test_close_without_daemon_is_idempotent() {
        let ant = bare_ant();
        ant.close().await.unwrap();
        ant.close().await.unwrap();
    }
}
