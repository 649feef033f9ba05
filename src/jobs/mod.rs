//! Per-ant job supervision.
//!
//! The `JobRunner` owns one ant's RPC client, its wallet seed, and the
//! thread group its background jobs register with. Jobs are declared as a
//! closed `JobSpec` sum type so required arguments are type-checked when a
//! config is decoded, not when a task is launched.

pub mod gateway;
pub mod host;
pub mod mining;
pub mod renter;
pub mod spender;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::barrier::SyncBarrier;
use crate::threadgroup::ThreadGroup;
use crate::types::{Currency, SiadApi};

/// How often jobs re-poll after a failed RPC call.
pub(crate) const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Poll interval of the balance maintainer.
const BALANCE_MAINTAIN_INTERVAL: Duration = Duration::from_secs(20);

// ─── Job specifications ──────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenterMode {
    /// Stop after the wallet is funded.
    Funded,
    /// Additionally set an allowance and wait for upload readiness.
    UploadReady,
    /// Full behavior: uploader, downloader, and deleter run continuously.
    Active,
}

/// One named background behavior an ant can run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobSpec {
    Generic,
    Gateway,
    BlockMining,
    Host,
    Renter { mode: RenterMode },
    BigSpender,
    LittleSupplier { destination: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobSpecError {
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("job {job:?} requires a {argument} argument")]
    MissingArgument {
        job: &'static str,
        argument: &'static str,
    },
}

impl JobSpec {
    /// The config-file name of this job.
    pub fn name(&self) -> &'static str {
        match self {
            JobSpec::Generic => "generic",
            JobSpec::Gateway => "gateway",
            JobSpec::BlockMining => "blockmining",
            JobSpec::Host => "host",
            JobSpec::Renter {
                mode: RenterMode::Funded,
            } => "renterfunded",
            JobSpec::Renter {
                mode: RenterMode::UploadReady,
            } => "renterready",
            JobSpec::Renter {
                mode: RenterMode::Active,
            } => "renter",
            JobSpec::BigSpender => "bigspender",
            JobSpec::LittleSupplier { .. } => "littlesupplier",
        }
    }

    /// Decode a job name plus its optional destination argument.
    pub fn parse(name: &str, destination: Option<&str>) -> Result<JobSpec, JobSpecError> {
        match name.to_lowercase().as_str() {
            "generic" => Ok(JobSpec::Generic),
            "gateway" => Ok(JobSpec::Gateway),
            "blockmining" => Ok(JobSpec::BlockMining),
            "host" => Ok(JobSpec::Host),
            "renterfunded" => Ok(JobSpec::Renter {
                mode: RenterMode::Funded,
            }),
            "renterready" => Ok(JobSpec::Renter {
                mode: RenterMode::UploadReady,
            }),
            "renter" => Ok(JobSpec::Renter {
                mode: RenterMode::Active,
            }),
            "bigspender" => Ok(JobSpec::BigSpender),
            "littlesupplier" => match destination {
                Some(destination) => Ok(JobSpec::LittleSupplier {
                    destination: destination.to_string(),
                }),
                None => Err(JobSpecError::MissingArgument {
                    job: "littlesupplier",
                    argument: "destination",
                }),
            },
            other => Err(JobSpecError::UnknownJob(other.to_string())),
        }
    }
}

/// Config form of a job: either a bare name string, or a tagged object for
/// jobs that carry arguments.
#[derive(Deserialize)]
#[serde(untagged)]
enum JobSpecRepr {
    Name(String),
    Tagged(TaggedJob),
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaggedJob {
    LittleSupplier { destination: String },
}

impl TryFrom<JobSpecRepr> for JobSpec {
    type Error = JobSpecError;

    fn try_from(repr: JobSpecRepr) -> Result<JobSpec, JobSpecError> {
        match repr {
            JobSpecRepr::Name(name) => JobSpec::parse(&name, None),
            JobSpecRepr::Tagged(TaggedJob::LittleSupplier { destination }) => {
                Ok(JobSpec::LittleSupplier { destination })
            }
        }
    }
}

impl<'de> Deserialize<'de> for JobSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<JobSpec, D::Error> {
        let repr = JobSpecRepr::deserialize(deserializer)?;
        JobSpec::try_from(repr).map_err(serde::de::Error::custom)
    }
}

impl Serialize for JobSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JobSpec::LittleSupplier { destination } => {
                use serde::ser::SerializeMap;
                #[derive(Serialize)]
                struct Dest<'a> {
                    destination: &'a str,
                }
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("littlesupplier", &Dest { destination })?;
                map.end()
            }
            other => serializer.serialize_str(other.name()),
        }
    }
}

// ─── Job runner ──────────────────────────────────────────────────

/// Outcome of a wait that races the fleet sync barrier against shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    Stopped,
}

/// Per-ant supervisor for background jobs.
///
/// Exactly one runner is live per ant; an upgrade replaces it wholesale
/// via `recreate`, which carries the wallet seed over so the wallet
/// identity survives the binary swap.
pub struct JobRunner {
    client: Arc<dyn SiadApi>,
    seed: String,
    tg: ThreadGroup,
    synced: SyncBarrier,
    data_dir: PathBuf,
}

impl JobRunner {
    /// Build a runner for a freshly started daemon, initializing its
    /// wallet. With `initial_seed` set the wallet is restored from that
    /// seed instead of generating a new one.
    pub async fn new(
        client: Arc<dyn SiadApi>,
        synced: SyncBarrier,
        initial_seed: Option<&str>,
        data_dir: PathBuf,
    ) -> Result<Arc<JobRunner>> {
        let seed = match initial_seed {
            Some(seed) => {
                client
                    .wallet_init_seed(seed)
                    .await
                    .context("failed to init wallet from seed")?;
                seed.to_string()
            }
            None => client
                .wallet_init()
                .await
                .context("failed to init wallet")?,
        };
        client
            .wallet_unlock(&seed)
            .await
            .context("failed to unlock wallet")?;

        Ok(Arc::new(JobRunner {
            client,
            seed,
            tg: ThreadGroup::new(),
            synced,
            data_dir,
        }))
    }

    /// Rebuild a runner after a daemon binary swap. The previous runner's
    /// seed unlocks the existing wallet; no new wallet is created.
    pub async fn recreate(old: &JobRunner, client: Arc<dyn SiadApi>) -> Result<Arc<JobRunner>> {
        client
            .wallet_unlock(&old.seed)
            .await
            .context("failed to unlock wallet after upgrade")?;
        Ok(Arc::new(JobRunner {
            client,
            seed: old.seed.clone(),
            tg: ThreadGroup::new(),
            synced: old.synced.clone(),
            data_dir: old.data_dir.clone(),
        }))
    }

    pub fn client(&self) -> &Arc<dyn SiadApi> {
        &self.client
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub fn thread_group(&self) -> &ThreadGroup {
        &self.tg
    }

    pub(crate) fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Cancel and join every job this runner launched.
    pub async fn stop(&self) {
        self.tg.stop().await;
    }

    /// Block until the fleet sync barrier releases or this runner is
    /// stopped, whichever comes first.
    pub async fn wait_for_sync(&self) -> SyncOutcome {
        tokio::select! {
            _ = self.synced.wait() => SyncOutcome::Synced,
            _ = self.tg.stopped() => SyncOutcome::Stopped,
        }
    }

    /// Sleep that returns early (with `Stopped`) on shutdown.
    pub(crate) async fn interruptible_sleep(&self, duration: Duration) -> SyncOutcome {
        tokio::select! {
            _ = sleep(duration) => SyncOutcome::Synced,
            _ = self.tg.stopped() => SyncOutcome::Stopped,
        }
    }

    /// Wait until the confirmed balance reaches `min`. Past `warn_after`
    /// the wait logs an error but keeps retrying; only shutdown ends it
    /// early. Returns false if the runner was stopped.
    pub(crate) async fn wait_for_balance(&self, min: Currency, warn_after: Duration) -> bool {
        let start = Instant::now();
        let mut warned = false;
        loop {
            match self.client.wallet().await {
                Ok(wallet) if wallet.confirmed_siacoin_balance >= min => return true,
                Ok(_) => {}
                Err(err) => debug!(error = %err, "balance poll failed"),
            }
            if !warned && start.elapsed() > warn_after {
                error!(
                    "balance has not reached {} after {:?}, still waiting",
                    min, warn_after
                );
                warned = true;
            }
            if self.interruptible_sleep(ERROR_BACKOFF).await == SyncOutcome::Stopped {
                return false;
            }
        }
    }

    /// Launch one job on this runner. Registration with the thread group
    /// happens inside the spawned task; a runner that is already stopping
    /// silently drops the job.
    pub fn start_job(runner: &Arc<JobRunner>, spec: JobSpec) {
        info!(job = spec.name(), "starting job");
        let jr = Arc::clone(runner);
        match spec {
            JobSpec::Generic => {
                tokio::spawn(generic_job(jr));
            }
            JobSpec::Gateway => {
                tokio::spawn(gateway::gateway_connectability(jr));
            }
            JobSpec::BlockMining => {
                tokio::spawn(mining::block_mining(jr));
            }
            JobSpec::Host => {
                tokio::spawn(host::job_host(jr));
            }
            JobSpec::Renter { mode } => {
                tokio::spawn(renter::renter(jr, mode));
            }
            JobSpec::BigSpender => {
                tokio::spawn(spender::big_spender(jr));
            }
            JobSpec::LittleSupplier { destination } => {
                tokio::spawn(spender::little_supplier(jr, destination));
            }
        }
    }

    /// Launch the balance maintainer, which mines only while the confirmed
    /// balance sits below `target`.
    pub fn start_balance_maintainer(runner: &Arc<JobRunner>, target: Currency) {
        info!(%target, "starting balance maintainer");
        let jr = Arc::clone(runner);
        tokio::spawn(balance_maintainer(jr, target));
    }
}

/// No-op baseline job: waits for the fleet to sync, then idles out.
async fn generic_job(jr: Arc<JobRunner>) {
    let Ok(_guard) = jr.tg.add() else { return };
    if jr.wait_for_sync().await == SyncOutcome::Stopped {
        return;
    }
    debug!("generic job saw fleet sync");
}

/// Toggle the miner so the confirmed balance hovers at `target`.
async fn balance_maintainer(jr: Arc<JobRunner>, target: Currency) {
    let Ok(_guard) = jr.tg.add() else { return };
    if jr.wait_for_sync().await == SyncOutcome::Stopped {
        return;
    }

    let mut mining = false;
    loop {
        match jr.client.wallet().await {
            Ok(wallet) => {
                let balance = wallet.confirmed_siacoin_balance;
                if balance < target && !mining {
                    match jr.client.miner_start().await {
                        Ok(()) => {
                            debug!(%balance, %target, "balance below target, mining");
                            mining = true;
                        }
                        Err(err) => error!(error = %err, "failed to start miner"),
                    }
                } else if balance >= target && mining {
                    match jr.client.miner_stop().await {
                        Ok(()) => {
                            debug!(%balance, %target, "balance at target, idling");
                            mining = false;
                        }
                        Err(err) => error!(error = %err, "failed to stop miner"),
                    }
                }
            }
            Err(err) => error!(error = %err, "balance maintainer wallet poll failed"),
        }

        if jr.interruptible_sleep(BALANCE_MAINTAIN_INTERVAL).await == SyncOutcome::Stopped {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSiad;

    #[test]
    fn test_parse_unknown_job() {
        assert_eq!(
            JobSpec::parse("thisjobdoesnotexist", None),
            Err(JobSpecError::UnknownJob("thisjobdoesnotexist".to_string()))
        );
    }

    #[test]
    fn test_parse_littlesupplier_requires_destination() {
        assert_eq!(
            JobSpec::parse("littlesupplier", None),
            Err(JobSpecError::MissingArgument {
                job: "littlesupplier",
                argument: "destination",
            })
        );
        assert_eq!(
            JobSpec::parse("littlesupplier", Some("addr")),
            Ok(JobSpec::LittleSupplier {
                destination: "addr".to_string()
            })
        );
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(JobSpec::parse("BlockMining", None), Ok(JobSpec::BlockMining));
    }

    #[test]
    fn test_job_list_decodes_from_config_json() {
        let jobs: Vec<JobSpec> = serde_json::from_str(
            r#"["generic", "host", {"littlesupplier": {"destination": "abcd"}}]"#,
        )
        .unwrap();
        assert_eq!(
            jobs,
            vec![
                JobSpec::Generic,
                JobSpec::Host,
                JobSpec::LittleSupplier {
                    destination: "abcd".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_job_spec_serialize_round_trip() {
        let jobs = vec![
            JobSpec::Renter {
                mode: RenterMode::Active,
            },
            JobSpec::LittleSupplier {
                destination: "xyz".to_string(),
            },
        ];
        let json = serde_json::to_string(&jobs).unwrap();
        let back: Vec<JobSpec> = serde_json::from_str(&json).unwrap();
        assert_eq!(jobs, back);
    }

    #[test]
    fn test_bad_job_name_in_json_fails() {
        let result: Result<Vec<JobSpec>, _> = serde_json::from_str(r#"["nope"]"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_new_runner_initializes_wallet() {
        let mock = Arc::new(MockSiad::new());
        let jr = JobRunner::new(
            mock.clone(),
            SyncBarrier::released(),
            None,
            PathBuf::from("/tmp"),
        )
        .await
        .unwrap();
        assert_eq!(jr.seed(), MockSiad::GENERATED_SEED);
        assert_eq!(mock.wallet_init_calls(), 1);
        assert!(mock.wallet_is_unlocked());
    }

    #[tokio::test]
    async fn test_new_runner_with_initial_seed() {
        let mock = Arc::new(MockSiad::new());
        let jr = JobRunner::new(
            mock.clone(),
            SyncBarrier::released(),
            Some("carried seed"),
            PathBuf::from("/tmp"),
        )
        .await
        .unwrap();
        assert_eq!(jr.seed(), "carried seed");
        assert_eq!(mock.wallet_init_calls(), 0);
    }

    #[tokio::test]
    async fn test_recreate_preserves_seed_without_reinit() {
        let mock = Arc::new(MockSiad::new());
        let jr = JobRunner::new(
            mock.clone(),
            SyncBarrier::released(),
            None,
            PathBuf::from("/tmp"),
        )
        .await
        .unwrap();

        let mock2 = Arc::new(MockSiad::new());
        let jr2 = JobRunner::recreate(&jr, mock2.clone()).await.unwrap();
        assert_eq!(jr2.seed(), jr.seed());
        // The upgrade path must unlock, never re-initialize.
        assert_eq!(mock2.wallet_init_calls(), 0);
        assert!(mock2.wallet_is_unlocked());
    }

    #[tokio::test]
    async fn test_wait_for_sync_races_stop() {
        let mock = Arc::new(MockSiad::new());
        let jr = JobRunner::new(
            mock,
            SyncBarrier::new(),
            None,
            PathBuf::from("/tmp"),
        )
        .await
        .unwrap();

        let waiter = Arc::clone(&jr);
        let handle = tokio::spawn(async move { waiter.wait_for_sync().await });
        jr.stop().await;
        assert_eq!(handle.await.unwrap(), SyncOutcome::Stopped);
    }
}
