//! Transaction-load jobs.
//!
//! Both spenders check the confirmed balance on a fixed cadence and, once
//! it clears a threshold, push a fixed-size payment out: the big spender
//! burns to a void address, the little supplier feeds a caller-supplied
//! address.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::{JobRunner, SyncOutcome};
use crate::types::Currency;

/// An address no wallet controls; payments to it only generate load.
const VOID_ADDRESS: &str =
    "000000000000000000000000000000000000000000000000000000000000000000000000000e3ae01";

const SPEND_INTERVAL: Duration = Duration::from_secs(25);

/// Big spender: keep a fat balance, burn in large chunks.
const BIG_SPEND_THRESHOLD: u64 = 5_000;
const BIG_SPEND_AMOUNT: u64 = 1_000;

/// Little supplier: drip small payments to the target.
const LITTLE_SUPPLY_THRESHOLD: u64 = 100;
const LITTLE_SUPPLY_AMOUNT: u64 = 10;

pub async fn big_spender(jr: Arc<JobRunner>) {
    spend_loop(
        jr,
        VOID_ADDRESS.to_string(),
        Currency::from_siacoins(BIG_SPEND_AMOUNT),
        Currency::from_siacoins(BIG_SPEND_THRESHOLD),
    )
    .await
}

pub async fn little_supplier(jr: Arc<JobRunner>, destination: String) {
    spend_loop(
        jr,
        destination,
        Currency::from_siacoins(LITTLE_SUPPLY_AMOUNT),
        Currency::from_siacoins(LITTLE_SUPPLY_THRESHOLD),
    )
    .await
}

async fn spend_loop(jr: Arc<JobRunner>, destination: String, amount: Currency, threshold: Currency) {
    let Ok(_guard) = jr.thread_group().add() else {
        return;
    };
    if jr.wait_for_sync().await == SyncOutcome::Stopped {
        return;
    }

    loop {
        match jr.client().wallet().await {
            Ok(wallet) if wallet.confirmed_siacoin_balance >= threshold => {
                match jr.client().wallet_send_siacoins(amount, &destination).await {
                    Ok(()) => info!(%amount, %destination, "sent siacoins"),
                    Err(err) => error!(error = %err, "failed to send siacoins"),
                }
            }
            Ok(wallet) => debug!(
                balance = %wallet.confirmed_siacoin_balance,
                %threshold,
                "balance below spend threshold"
            ),
            Err(err) => debug!(error = %err, "spender wallet poll failed"),
        }

        if jr.interruptible_sleep(SPEND_INTERVAL).await == SyncOutcome::Stopped {
            return;
        }
    }
}
