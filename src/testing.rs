//! In-memory `SiadApi` implementation for tests.
//!
//! Answers every call from a mutable state table and records the calls
//! the tests assert on. Individual calls can be switched to fail to
//! exercise error paths.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::types::{
    Allowance, Block, BlockId, ConsensusInfo, Currency, DownloadInfo, FileInfo, GatewayInfo,
    HostInfo, Peer, SiadApi, WalletInfo,
};

#[derive(Default)]
struct MockState {
    wallet_init_calls: usize,
    unlocked: bool,
    balance: Currency,
    height: u64,
    block_id: BlockId,
    blocks: HashMap<u64, Block>,
    files: Vec<FileInfo>,
    downloads: Vec<DownloadInfo>,
    deleted: Vec<String>,
    fail_renter_delete: bool,
    sent: Vec<(Currency, String)>,
    miner_running: bool,
    upload_ready: bool,
    contract_count: usize,
    peers: Vec<Peer>,
    connected: Vec<String>,
    announce_calls: usize,
    host: HostInfo,
}

pub(crate) struct MockSiad {
    state: Mutex<MockState>,
}

impl MockSiad {
    pub(crate) const GENERATED_SEED: &'static str =
        "mock seed words generated by a fresh wallet init";

    pub(crate) fn new() -> MockSiad {
        MockSiad {
            state: Mutex::new(MockState {
                block_id: "mockblock".to_string(),
                ..MockState::default()
            }),
        }
    }

    pub(crate) fn wallet_init_calls(&self) -> usize {
        self.state.lock().unwrap().wallet_init_calls
    }

    pub(crate) fn wallet_is_unlocked(&self) -> bool {
        self.state.lock().unwrap().unlocked
    }

    pub(crate) fn deleted_paths(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub(crate) fn fail_renter_delete(&self) {
        self.state.lock().unwrap().fail_renter_delete = true;
    }

    pub(crate) fn set_balance(&self, balance: Currency) {
        self.state.lock().unwrap().balance = balance;
    }

    pub(crate) fn set_consensus(&self, height: u64, block_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.height = height;
        state.block_id = block_id.to_string();
    }

    pub(crate) fn connected_peers(&self) -> Vec<String> {
        self.state.lock().unwrap().connected.clone()
    }

    pub(crate) fn sent_payments(&self) -> Vec<(Currency, String)> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl SiadApi for MockSiad {
    async fn daemon_version(&self) -> Result<String> {
        Ok("1.5.6-mock".to_string())
    }

    async fn daemon_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn consensus(&self) -> Result<ConsensusInfo> {
        let state = self.state.lock().unwrap();
        Ok(ConsensusInfo {
            synced: true,
            height: state.height,
            current_block: state.block_id.clone(),
        })
    }

    async fn block_at(&self, height: u64) -> Result<Block> {
        let state = self.state.lock().unwrap();
        match state.blocks.get(&height) {
            Some(block) => Ok(block.clone()),
            None => Ok(Block {
                height,
                id: format!("mockblock-{}", height),
                transactions: Vec::new(),
            }),
        }
    }

    async fn wallet(&self) -> Result<WalletInfo> {
        let state = self.state.lock().unwrap();
        Ok(WalletInfo {
            unlocked: state.unlocked,
            confirmed_siacoin_balance: state.balance,
            ..WalletInfo::default()
        })
    }

    async fn wallet_init(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.wallet_init_calls += 1;
        Ok(Self::GENERATED_SEED.to_string())
    }

    async fn wallet_init_seed(&self, _seed: &str) -> Result<()> {
        Ok(())
    }

    async fn wallet_unlock(&self, _seed: &str) -> Result<()> {
        self.state.lock().unwrap().unlocked = true;
        Ok(())
    }

    async fn wallet_address(&self) -> Result<String> {
        Ok("mockaddress".to_string())
    }

    async fn wallet_primary_seed(&self) -> Result<String> {
        Ok(Self::GENERATED_SEED.to_string())
    }

    async fn wallet_send_siacoins(&self, amount: Currency, destination: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .sent
            .push((amount, destination.to_string()));
        Ok(())
    }

    async fn miner_start(&self) -> Result<()> {
        self.state.lock().unwrap().miner_running = true;
        Ok(())
    }

    async fn miner_stop(&self) -> Result<()> {
        self.state.lock().unwrap().miner_running = false;
        Ok(())
    }

    async fn gateway(&self) -> Result<GatewayInfo> {
        let state = self.state.lock().unwrap();
        Ok(GatewayInfo {
            net_address: "127.0.0.1:9981".to_string(),
            peers: state.peers.clone(),
        })
    }

    async fn gateway_connect(&self, addr: &str) -> Result<()> {
        self.state.lock().unwrap().connected.push(addr.to_string());
        Ok(())
    }

    async fn host(&self) -> Result<HostInfo> {
        Ok(self.state.lock().unwrap().host.clone())
    }

    async fn host_accept_contracts(&self) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .host
            .internal_settings
            .accepting_contracts = true;
        Ok(())
    }

    async fn host_announce(&self) -> Result<()> {
        self.state.lock().unwrap().announce_calls += 1;
        Ok(())
    }

    async fn host_add_storage_folder(&self, _path: &Path, _size: u64) -> Result<()> {
        Ok(())
    }

    async fn renter_set_allowance(&self, _allowance: &Allowance) -> Result<()> {
        Ok(())
    }

    async fn renter_upload_ready(&self, _data_pieces: u64, _parity_pieces: u64) -> Result<bool> {
        Ok(self.state.lock().unwrap().upload_ready)
    }

    async fn renter_files(&self) -> Result<Vec<FileInfo>> {
        Ok(self.state.lock().unwrap().files.clone())
    }

    async fn renter_upload(&self, _source: &Path, sia_path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.files.push(FileInfo {
            sia_path: sia_path.to_string(),
            available: true,
            upload_progress: 100.0,
            ..FileInfo::default()
        });
        Ok(())
    }

    async fn renter_download(&self, sia_path: &str, destination: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.downloads.push(DownloadInfo {
            sia_path: sia_path.to_string(),
            destination: destination.display().to_string(),
            completed: true,
            ..DownloadInfo::default()
        });
        Ok(())
    }

    async fn renter_downloads(&self) -> Result<Vec<DownloadInfo>> {
        Ok(self.state.lock().unwrap().downloads.clone())
    }

    async fn renter_delete(&self, sia_path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_renter_delete {
            bail!("mock renter delete failure");
        }
        state.deleted.push(sia_path.to_string());
        state.files.retain(|f| f.sia_path != sia_path);
        Ok(())
    }

    async fn renter_contract_count(&self) -> Result<usize> {
        Ok(self.state.lock().unwrap().contract_count)
    }

    async fn renter_set_ip_violation_check(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}
