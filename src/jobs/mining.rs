//! Block mining job.
//!
//! Keeps simulated block production roughly paced: the miner runs until a
//! new block lands, rests for half the target block interval, then
//! resumes. A slow side-check verifies the wallet actually accrues mining
//! rewards and complains (without aborting) when it does not.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

use super::{JobRunner, SyncOutcome, ERROR_BACKOFF};
use crate::types::Currency;

/// Target interval between blocks on a dev-build network.
const BLOCK_FREQUENCY: Duration = Duration::from_secs(12);

/// Consensus height poll cadence while the miner runs.
const HEIGHT_POLL_INTERVAL: Duration = Duration::from_millis(400);

/// How often the wallet is checked for a balance increase.
const BALANCE_CHECK_INTERVAL: Duration = Duration::from_secs(100);

pub async fn block_mining(jr: Arc<JobRunner>) {
    let Ok(_guard) = jr.thread_group().add() else {
        return;
    };
    if jr.wait_for_sync().await == SyncOutcome::Stopped {
        return;
    }

    let client = jr.client();
    if let Err(err) = client.miner_start().await {
        error!(error = %err, "failed to start miner");
    }

    let mut last_height: Option<u64> = None;
    let mut last_balance = Currency::ZERO;
    let mut last_balance_check = Instant::now();

    loop {
        match client.consensus().await {
            Ok(info) => {
                if last_height.is_some_and(|h| info.height > h) {
                    debug!(height = info.height, "mined a block, pausing miner");
                    if let Err(err) = client.miner_stop().await {
                        error!(error = %err, "failed to pause miner");
                    }
                    if jr.interruptible_sleep(BLOCK_FREQUENCY / 2).await == SyncOutcome::Stopped {
                        return;
                    }
                    if let Err(err) = client.miner_start().await {
                        error!(error = %err, "failed to resume miner");
                    }
                }
                last_height = Some(info.height);
            }
            Err(err) => {
                debug!(error = %err, "height poll failed");
                if jr.interruptible_sleep(ERROR_BACKOFF).await == SyncOutcome::Stopped {
                    return;
                }
            }
        }

        if last_balance_check.elapsed() >= BALANCE_CHECK_INTERVAL {
            match client.wallet().await {
                Ok(wallet) => {
                    let balance = wallet.confirmed_siacoin_balance;
                    if balance <= last_balance {
                        // Non-fatal: flaky contention can starve a miner
                        // for a while.
                        error!(
                            %balance,
                            previous = %last_balance,
                            "mining wallet balance has not increased"
                        );
                    }
                    last_balance = balance;
                }
                Err(err) => error!(error = %err, "mining balance check failed"),
            }
            last_balance_check = Instant::now();
        }

        if jr.interruptible_sleep(HEIGHT_POLL_INTERVAL).await == SyncOutcome::Stopped {
            return;
        }
    }
}
