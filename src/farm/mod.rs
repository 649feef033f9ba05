//! Antfarm orchestration.
//!
//! Owns the fleet: starts every configured ant (auto-assigning ports and
//! data directories), bootstraps gateway connectivity, watches the fleet
//! converge onto one consensus group, serves the registry endpoint for
//! federation, and tears everything down concurrently on close.

mod consensus;
mod server;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::ant::{Ant, AntStopped};
use crate::barrier::SyncBarrier;
use crate::config::{self, AntConfig, AntfarmConfig};
use crate::threadgroup::ThreadGroup;
use crate::types::BlockId;
use server::RegistryServer;

/// How often convergence is re-checked while waiting for sync.
const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default budget for the fleet to converge during farm construction.
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const FEDERATION_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Serializable ant descriptor exposed on the registry endpoint and
/// consumed when federating. Carries addresses and config only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AntInfo {
    #[serde(rename = "APIAddr")]
    pub api_addr: String,
    #[serde(rename = "RPCAddr")]
    pub rpc_addr: String,
    #[serde(rename = "Config")]
    pub config: AntConfig,
}

impl AntInfo {
    pub(crate) fn describe(ant: &Ant) -> AntInfo {
        AntInfo {
            api_addr: ant.api_addr.clone(),
            rpc_addr: ant.rpc_addr.clone(),
            config: ant.config(),
        }
    }
}

pub struct AntFarm {
    ants: Vec<Arc<Ant>>,
    /// Ants registered by federated antfarms; connected but not managed.
    external_ants: Mutex<Vec<AntInfo>>,
    synced: SyncBarrier,
    tg: ThreadGroup,
    server: tokio::sync::Mutex<Option<RegistryServer>>,
}

impl AntFarm {
    /// Build the farm: reset the data directory, start every ant, wire up
    /// gateways and federation, optionally block for convergence, then
    /// expose the registry. Any failure closes whatever already started.
    pub async fn new(mut config: AntfarmConfig) -> Result<AntFarm> {
        config.validate()?;

        let farm_dir = config::resolve_path(&config.data_dir);
        if farm_dir.exists() {
            std::fs::remove_dir_all(&farm_dir)
                .with_context(|| format!("failed to clear {}", farm_dir.display()))?;
        }
        std::fs::create_dir_all(&farm_dir)
            .with_context(|| format!("failed to create {}", farm_dir.display()))?;

        let synced = if config.wait_for_sync {
            SyncBarrier::new()
        } else {
            SyncBarrier::released()
        };

        for ant_config in &mut config.ants {
            apply_defaults(ant_config, &farm_dir)?;
        }

        let mut ants: Vec<Arc<Ant>> = Vec::new();
        for ant_config in config.ants.clone() {
            match Ant::new(ant_config, synced.clone()).await {
                Ok(ant) => ants.push(ant),
                Err(err) => {
                    if let Err(close_err) = close_all(&ants).await {
                        warn!(error = %close_err, "cleanup after failed ant start");
                    }
                    return Err(err);
                }
            }
        }
        info!(count = ants.len(), "all ants started");

        let farm = AntFarm {
            ants,
            external_ants: Mutex::new(Vec::new()),
            synced,
            tg: ThreadGroup::new(),
            server: tokio::sync::Mutex::new(None),
        };

        if let Err(err) = farm.finish_setup(&config).await {
            if let Err(close_err) = farm.close().await {
                warn!(error = %close_err, "cleanup after failed farm setup");
            }
            return Err(err);
        }
        Ok(farm)
    }

    async fn finish_setup(&self, config: &AntfarmConfig) -> Result<()> {
        if config.auto_connect {
            self.bootstrap_gateways().await?;
        }
        for addr in &config.external_farms {
            self.connect_external_antfarm(addr)
                .await
                .with_context(|| format!("failed to federate with antfarm {}", addr))?;
        }
        if config.wait_for_sync {
            self.wait_for_ants_to_sync(DEFAULT_SYNC_TIMEOUT).await?;
        }

        let server = RegistryServer::serve(&config.listen_address, self.ants.clone()).await?;
        *self.server.lock().await = Some(server);
        Ok(())
    }

    pub fn ants(&self) -> &[Arc<Ant>] {
        &self.ants
    }

    pub fn external_ants(&self) -> Vec<AntInfo> {
        self.external_ants.lock().unwrap().clone()
    }

    /// Connect every ant's gateway to the first ant.
    async fn bootstrap_gateways(&self) -> Result<()> {
        let Some(first) = self.ants.first() else {
            return Ok(());
        };
        for ant in &self.ants[1..] {
            ant.client()
                .gateway_connect(&first.rpc_addr)
                .await
                .with_context(|| {
                    format!("failed to connect ant {:?} to {}", ant.name, first.rpc_addr)
                })?;
        }
        info!(bootstrap = %first.rpc_addr, "gateway bootstrap complete");
        Ok(())
    }

    /// Fetch a peer antfarm's registry, remember its ants, and connect all
    /// known ants together.
    pub async fn connect_external_antfarm(&self, addr: &str) -> Result<()> {
        let url = format!("http://{}/ants", addr);
        let http = reqwest::Client::builder()
            .timeout(FEDERATION_REQUEST_TIMEOUT)
            .build()
            .context("failed to build federation client")?;
        let remote: Vec<AntInfo> = http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} rejected", url))?
            .json()
            .await
            .with_context(|| format!("GET {} returned malformed JSON", url))?;
        info!(peer = %addr, ants = remote.len(), "federated with external antfarm");

        let known_addrs: Vec<String> = {
            let mut external = self.external_ants.lock().unwrap();
            external.extend(remote);
            self.ants
                .iter()
                .map(|a| a.rpc_addr.clone())
                .chain(external.iter().map(|a| a.rpc_addr.clone()))
                .collect()
        };

        for ant in &self.ants {
            for peer in &known_addrs {
                if *peer == ant.rpc_addr {
                    continue;
                }
                // Re-connecting an existing peer is rejected by the
                // daemon; that is not a failure here.
                if let Err(err) = ant.client().gateway_connect(peer).await {
                    debug!(ant = %ant.name, %peer, error = %err, "gateway connect skipped");
                }
            }
        }
        Ok(())
    }

    /// Poll every ant's tip, extend its seen-block history, and partition
    /// the fleet by shared recent history.
    pub async fn consensus_groups(&self) -> Result<Vec<Vec<Arc<Ant>>>> {
        let mut tips: Vec<(u64, HashMap<u64, BlockId>)> = Vec::with_capacity(self.ants.len());
        for ant in &self.ants {
            let info = ant
                .client()
                .consensus()
                .await
                .with_context(|| format!("consensus poll failed for ant {:?}", ant.name))?;
            ant.record_seen_block(info.height, &info.current_block);
            tips.push((info.height, ant.seen_snapshot()));
        }

        let groups = consensus::partition_by_history(&tips);
        Ok(groups
            .into_iter()
            .map(|group| {
                group
                    .into_iter()
                    .map(|i| Arc::clone(&self.ants[i]))
                    .collect()
            })
            .collect())
    }

    /// Block until the fleet forms exactly one consensus group, releasing
    /// the sync barrier on success. Fails once `timeout` elapses, or with
    /// the distinguished stopped condition if the farm shuts down first.
    pub async fn wait_for_ants_to_sync(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.consensus_groups().await {
                Ok(groups) if groups.len() == 1 => {
                    info!("all ants synced");
                    self.synced.release();
                    return Ok(());
                }
                Ok(groups) => debug!(groups = groups.len(), "fleet not converged"),
                Err(err) => debug!(error = %err, "consensus poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                bail!("ants did not converge to one consensus group within {:?}", timeout);
            }
            let wait = SYNC_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.tg.stopped() => return Err(AntStopped.into()),
            }
        }
    }

    /// Stop the registry, then close every ant concurrently; each daemon
    /// shutdown may block up to the supervisor's timeout, so they must not
    /// serialize.
    pub async fn close(&self) -> Result<()> {
        self.tg.stop().await;
        if let Some(server) = self.server.lock().await.take() {
            server.shutdown().await;
        }
        close_all(&self.ants).await
    }
}

fn apply_defaults(ant_config: &mut AntConfig, farm_dir: &std::path::Path) -> Result<()> {
    let siad = &mut ant_config.siad;
    if siad.data_dir.as_os_str().is_empty() {
        siad.data_dir = farm_dir.join(&ant_config.name);
    }
    for addr in [
        &mut siad.api_addr,
        &mut siad.rpc_addr,
        &mut siad.host_addr,
        &mut siad.siamux_addr,
        &mut siad.siamux_ws_addr,
    ] {
        if addr.is_empty() {
            *addr = free_listen_addr()?;
        }
    }
    Ok(())
}

/// Grab a free localhost port from the OS.
fn free_listen_addr() -> Result<String> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").context("failed to probe for a free port")?;
    Ok(listener
        .local_addr()
        .context("failed to read probed port")?
        .to_string())
}

/// Close ants in parallel and join them all, collecting every failure.
async fn close_all(ants: &[Arc<Ant>]) -> Result<()> {
    let handles: Vec<_> = ants
        .iter()
        .map(|ant| {
            let ant = Arc::clone(ant);
            tokio::spawn(async move {
                let name = ant.name.clone();
                (name, ant.close().await)
            })
        })
        .collect();

    let mut failures: Vec<String> = Vec::new();
    for handle in handles {
        match handle.await {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(err))) => failures.push(format!("{}: {:#}", name, err)),
            Err(err) => failures.push(format!("close task panicked: {}", err)),
        }
    }
    if !failures.is_empty() {
        bail!("failed to close ants: {}", failures.join("; "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSiad;

    fn test_farm(ants: Vec<Arc<Ant>>) -> AntFarm {
        AntFarm {
            ants,
            external_ants: Mutex::new(Vec::new()),
            synced: SyncBarrier::new(),
            tg: ThreadGroup::new(),
            server: tokio::sync::Mutex::new(None),
        }
    }

    #[test]
    fn test_ant_info_exposes_only_descriptor_fields() {
        let mock = Arc::new(MockSiad::new());
        let ant = Ant::disconnected("a", mock);
        let value = serde_json::to_value(AntInfo::describe(&ant)).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["APIAddr", "Config", "RPCAddr"]);
    }

    #[tokio::test]
    async fn test_identical_ants_form_one_group() {
        let mock_a = Arc::new(MockSiad::new());
        let mock_b = Arc::new(MockSiad::new());
        mock_a.set_consensus(7, "b7");
        mock_b.set_consensus(7, "b7");
        let farm = test_farm(vec![
            Ant::disconnected("a", mock_a),
            Ant::disconnected("b", mock_b),
        ]);

        let groups = farm.consensus_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[tokio::test]
    async fn test_diverged_ants_form_two_groups() {
        let mock_a = Arc::new(MockSiad::new());
        let mock_b = Arc::new(MockSiad::new());
        mock_a.set_consensus(7, "b7");
        mock_b.set_consensus(7, "x7");
        let farm = test_farm(vec![
            Ant::disconnected("a", mock_a),
            Ant::disconnected("b", mock_b),
        ]);

        let groups = farm.consensus_groups().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].name, "a");
        assert_eq!(groups[1][0].name, "b");
    }

    #[tokio::test]
    async fn test_wait_for_sync_times_out_with_diverged_fleet() {
        let mock_a = Arc::new(MockSiad::new());
        let mock_b = Arc::new(MockSiad::new());
        mock_a.set_consensus(7, "b7");
        mock_b.set_consensus(7, "x7");
        let farm = test_farm(vec![
            Ant::disconnected("a", mock_a),
            Ant::disconnected("b", mock_b),
        ]);

        let timeout = Duration::from_millis(100);
        let err = farm.wait_for_ants_to_sync(timeout).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("did not converge"));
        assert!(message.contains(&format!("{:?}", timeout)));
        assert!(!farm.synced.is_released());
    }

    #[tokio::test]
    async fn test_wait_for_sync_releases_barrier() {
        let mock = Arc::new(MockSiad::new());
        mock.set_consensus(3, "b3");
        let farm = test_farm(vec![Ant::disconnected("only", mock)]);

        farm.wait_for_ants_to_sync(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(farm.synced.is_released());
    }

    #[test]
    fn test_free_listen_addr_is_bindable() {
        let addr = free_listen_addr().unwrap();
        assert!(addr.starts_with("127.0.0.1:"));
    }
}
