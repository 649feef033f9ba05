//! Host job.
//!
//! Funds the wallet, provisions a storage folder, enables contract
//! acceptance, then keeps the host announced: broadcast the announcement,
//! wait for it to confirm on chain, and afterwards re-verify on every poll
//! that the announcement has not been reorged away and that storage
//! revenue is not shrinking.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use super::{JobRunner, SyncOutcome, ERROR_BACKOFF};
use crate::types::{Block, Currency};

/// Balance needed for collateral headroom before hosting starts.
const MIN_HOST_BALANCE: u64 = 25_000;

/// Past this, the initial-balance wait complains but keeps waiting.
const BALANCE_WARN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Size of the storage folder offered to renters.
const STORAGE_FOLDER_SIZE: u64 = 1 << 30;

const HOST_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Blocks allowed for an announcement transaction to confirm before the
/// broadcast is retried.
const ANNOUNCE_CONFIRM_BLOCKS: u64 = 20;

/// Wire form of a decoded announcement entry.
const ANNOUNCEMENT_PREFIX: &str = "HostAnnouncement:";

/// Announcement and revenue bookkeeping, one mutex for the whole record
/// so readers never see a torn announced/height pair.
#[derive(Clone, Copy, Debug, Default)]
struct HostState {
    announced: bool,
    announce_height: u64,
    last_revenue: Currency,
}

pub(crate) fn announcement_in(block: &Block, net_address: &str) -> bool {
    let wanted = format!("{}{}", ANNOUNCEMENT_PREFIX, net_address);
    block
        .transactions
        .iter()
        .any(|txn| txn.arbitrary_data.iter().any(|entry| entry == &wanted))
}

pub async fn job_host(jr: Arc<JobRunner>) {
    let Ok(_guard) = jr.thread_group().add() else {
        return;
    };
    if jr.wait_for_sync().await == SyncOutcome::Stopped {
        return;
    }

    if !jr
        .wait_for_balance(Currency::from_siacoins(MIN_HOST_BALANCE), BALANCE_WARN_TIMEOUT)
        .await
    {
        return;
    }

    if let Err(err) = provision_storage(&jr).await {
        error!(error = %err, "host storage setup failed");
        return;
    }

    let state = Mutex::new(HostState::default());
    loop {
        let announced = state.lock().unwrap().announced;
        if !announced {
            match announce_and_confirm(&jr).await {
                Ok(Some(height)) => {
                    let mut st = state.lock().unwrap();
                    st.announced = true;
                    st.announce_height = height;
                    info!(height, "host announcement confirmed");
                }
                Ok(None) => return, // stopped
                Err(err) => error!(error = %err, "host announcement failed"),
            }
        } else {
            let announce_height = state.lock().unwrap().announce_height;
            match verify_announcement(&jr, announce_height).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        height = announce_height,
                        "host announcement no longer on chain, re-announcing"
                    );
                    state.lock().unwrap().announced = false;
                }
                Err(err) => debug!(error = %err, "announcement re-check failed"),
            }

            match jr.client().host().await {
                Ok(host) => {
                    let revenue = host.financial_metrics.storage_revenue;
                    let mut st = state.lock().unwrap();
                    if revenue < st.last_revenue {
                        // Non-fatal: revenue should only ever grow.
                        error!(
                            %revenue,
                            previous = %st.last_revenue,
                            "host storage revenue decreased"
                        );
                    }
                    st.last_revenue = revenue;
                }
                Err(err) => debug!(error = %err, "host metrics poll failed"),
            }
        }

        if jr.interruptible_sleep(HOST_POLL_INTERVAL).await == SyncOutcome::Stopped {
            return;
        }
    }
}

/// Create the storage folder (idempotent) and enable contract acceptance.
async fn provision_storage(jr: &JobRunner) -> Result<()> {
    let folder = jr.data_dir().join("host-storage");
    std::fs::create_dir_all(&folder)
        .with_context(|| format!("failed to create {}", folder.display()))?;

    if let Err(err) = jr
        .client()
        .host_add_storage_folder(&folder, STORAGE_FOLDER_SIZE)
        .await
    {
        // The folder survives daemon restarts; a rejection because it is
        // already registered is fine.
        debug!(error = %err, "add storage folder rejected");
    }

    loop {
        match jr.client().host_accept_contracts().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                error!(error = %err, "failed to enable contract acceptance");
                if jr.interruptible_sleep(ERROR_BACKOFF).await == SyncOutcome::Stopped {
                    bail!("stopped before contract acceptance was enabled");
                }
            }
        }
    }
}

/// Broadcast an announcement and wait for it to appear on chain. Returns
/// the confirmation height, or None if the runner stopped mid-wait.
async fn announce_and_confirm(jr: &JobRunner) -> Result<Option<u64>> {
    let client = jr.client();
    let net_address = client.host().await?.external_settings.net_address;
    let submit_height = client.consensus().await?.height;

    client.host_announce().await.context("announce rejected")?;
    info!(%net_address, "host announcement broadcast");

    let give_up_height = submit_height + ANNOUNCE_CONFIRM_BLOCKS;
    let mut next_height = submit_height;
    loop {
        match client.consensus().await {
            Ok(info) => {
                while next_height <= info.height {
                    match client.block_at(next_height).await {
                        Ok(block) => {
                            if announcement_in(&block, &net_address) {
                                return Ok(Some(next_height));
                            }
                            next_height += 1;
                        }
                        Err(err) => {
                            debug!(height = next_height, error = %err, "block fetch failed");
                            break;
                        }
                    }
                }
                if next_height > give_up_height {
                    bail!(
                        "announcement not confirmed within {} blocks of height {}",
                        ANNOUNCE_CONFIRM_BLOCKS,
                        submit_height
                    );
                }
            }
            Err(err) => debug!(error = %err, "height poll failed"),
        }

        if jr.interruptible_sleep(HOST_POLL_INTERVAL).await == SyncOutcome::Stopped {
            return Ok(None);
        }
    }
}

/// True if the confirmed announcement is still present at its recorded
/// height.
async fn verify_announcement(jr: &JobRunner, height: u64) -> Result<bool> {
    let client = jr.client();
    let net_address = client.host().await?.external_settings.net_address;
    let block = client.block_at(height).await?;
    Ok(announcement_in(&block, &net_address))
}
