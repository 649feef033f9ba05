//! Gateway connectability check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use super::{JobRunner, SyncOutcome};

const PEER_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum peer count a healthy ant should hold in a farm of any size.
const MIN_PEERS: usize = 2;

pub async fn gateway_connectability(jr: Arc<JobRunner>) {
    let Ok(_guard) = jr.thread_group().add() else {
        return;
    };
    if jr.wait_for_sync().await == SyncOutcome::Stopped {
        return;
    }

    loop {
        match jr.client().gateway().await {
            Ok(info) => {
                if info.peers.len() < MIN_PEERS {
                    error!(
                        peers = info.peers.len(),
                        "gateway has fewer than {} peers", MIN_PEERS
                    );
                }
            }
            Err(err) => debug!(error = %err, "gateway poll failed"),
        }

        if jr.interruptible_sleep(PEER_CHECK_INTERVAL).await == SyncOutcome::Stopped {
            return;
        }
    }
}
