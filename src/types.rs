//! Shared type definitions.
//!
//! Currency arithmetic, the wire types returned by the siad HTTP API, and
//! the `SiadApi` trait that the job runner and the farm consume. Keeping
//! the trait here lets tests drive job logic against an in-memory daemon.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ─── Currency ────────────────────────────────────────────────────

/// Hastings per siacoin (10^24).
pub const HASTINGS_PER_SIACOIN: u128 = 1_000_000_000_000_000_000_000_000;

/// A siacoin amount in hastings.
///
/// The daemon reports balances as decimal integers too large for u64, so
/// amounts are carried as u128 and serialized as decimal strings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Currency(pub u128);

impl Currency {
    pub const ZERO: Currency = Currency(0);

    /// Whole-siacoin constructor.
    pub const fn from_siacoins(sc: u64) -> Currency {
        Currency(sc as u128 * HASTINGS_PER_SIACOIN)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(&self, other: Currency) -> Currency {
        Currency(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= HASTINGS_PER_SIACOIN {
            let whole = self.0 / HASTINGS_PER_SIACOIN;
            let frac = (self.0 % HASTINGS_PER_SIACOIN) / (HASTINGS_PER_SIACOIN / 1000);
            write!(f, "{}.{:03} SC", whole, frac)
        } else {
            write!(f, "{} H", self.0)
        }
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct CurrencyVisitor;

        impl serde::de::Visitor<'_> for CurrencyVisitor {
            type Value = Currency;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a hastings amount as a decimal string or integer")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Currency, E> {
                v.parse::<u128>()
                    .map(Currency)
                    .map_err(|_| E::custom(format!("invalid currency value: {}", v)))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Currency, E> {
                Ok(Currency(v as u128))
            }

            fn visit_u128<E: serde::de::Error>(self, v: u128) -> std::result::Result<Currency, E> {
                Ok(Currency(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<Currency, E> {
                u128::try_from(v)
                    .map(Currency)
                    .map_err(|_| E::custom("negative currency value"))
            }

            // Parsers without big-integer support surface oversized
            // amounts as floats; magnitude is what matters here.
            fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<Currency, E> {
                if v.is_finite() && v >= 0.0 {
                    Ok(Currency(v as u128))
                } else {
                    Err(E::custom(format!("invalid currency value: {}", v)))
                }
            }
        }

        deserializer.deserialize_any(CurrencyVisitor)
    }
}

// ─── Daemon wire types ───────────────────────────────────────────

/// Block identifiers are opaque hex strings on the wire.
pub type BlockId = String;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusInfo {
    pub synced: bool,
    pub height: u64,
    #[serde(rename = "currentblock")]
    pub current_block: BlockId,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub id: BlockId,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// Only the fields the orchestrator inspects. Arbitrary-data entries are
/// reported in decoded form, host announcements as
/// `HostAnnouncement:<netaddress>`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "arbitrarydata", default)]
    pub arbitrary_data: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WalletInfo {
    pub unlocked: bool,
    #[serde(rename = "confirmedsiacoinbalance")]
    pub confirmed_siacoin_balance: Currency,
    #[serde(rename = "unconfirmedincomingsiacoins", default)]
    pub unconfirmed_incoming_siacoins: Currency,
    #[serde(rename = "unconfirmedoutgoingsiacoins", default)]
    pub unconfirmed_outgoing_siacoins: Currency,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "netaddress")]
    pub net_address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayInfo {
    #[serde(rename = "netaddress")]
    pub net_address: String,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(rename = "internalsettings")]
    pub internal_settings: HostInternalSettings,
    #[serde(rename = "externalsettings")]
    pub external_settings: HostExternalSettings,
    #[serde(rename = "financialmetrics")]
    pub financial_metrics: HostFinancialMetrics,
}

/// Settings the daemon derives itself, most importantly the net address
/// it announces.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostExternalSettings {
    #[serde(rename = "netaddress")]
    pub net_address: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostInternalSettings {
    #[serde(rename = "acceptingcontracts")]
    pub accepting_contracts: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostFinancialMetrics {
    #[serde(rename = "storagerevenue")]
    pub storage_revenue: Currency,
}

/// Renter allowance parameters, posted when preparing a renter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Allowance {
    pub funds: Currency,
    /// Contract length in blocks.
    pub period: u64,
    pub hosts: u64,
    #[serde(rename = "renewwindow")]
    pub renew_window: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "siapath")]
    pub sia_path: String,
    pub available: bool,
    #[serde(rename = "filesize", default)]
    pub file_size: u64,
    #[serde(rename = "uploadprogress", default)]
    pub upload_progress: f64,
    #[serde(default)]
    pub redundancy: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DownloadInfo {
    #[serde(rename = "siapath")]
    pub sia_path: String,
    pub destination: String,
    #[serde(rename = "filesize", default)]
    pub file_size: u64,
    #[serde(default)]
    pub received: u64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub error: String,
}

// ─── Daemon API trait ────────────────────────────────────────────

/// The slice of the siad HTTP API the orchestrator drives.
///
/// `client::SiadClient` implements this over HTTP; tests substitute an
/// in-memory fake. Every method is a single blocking round-trip and safe
/// to poll; callers treat errors as retryable within their own budgets.
#[async_trait]
pub trait SiadApi: Send + Sync {
    async fn daemon_version(&self) -> Result<String>;
    async fn daemon_stop(&self) -> Result<()>;

    async fn consensus(&self) -> Result<ConsensusInfo>;
    async fn block_at(&self, height: u64) -> Result<Block>;

    async fn wallet(&self) -> Result<WalletInfo>;
    /// Initialize a fresh wallet and return its primary seed.
    async fn wallet_init(&self) -> Result<String>;
    /// Initialize a wallet from a known seed.
    async fn wallet_init_seed(&self, seed: &str) -> Result<()>;
    async fn wallet_unlock(&self, seed: &str) -> Result<()>;
    async fn wallet_address(&self) -> Result<String>;
    async fn wallet_primary_seed(&self) -> Result<String>;
    async fn wallet_send_siacoins(&self, amount: Currency, destination: &str) -> Result<()>;

    async fn miner_start(&self) -> Result<()>;
    async fn miner_stop(&self) -> Result<()>;

    async fn gateway(&self) -> Result<GatewayInfo>;
    async fn gateway_connect(&self, addr: &str) -> Result<()>;

    async fn host(&self) -> Result<HostInfo>;
    async fn host_accept_contracts(&self) -> Result<()>;
    async fn host_announce(&self) -> Result<()>;
    async fn host_add_storage_folder(&self, path: &Path, size: u64) -> Result<()>;

    async fn renter_set_allowance(&self, allowance: &Allowance) -> Result<()>;
    async fn renter_upload_ready(&self, data_pieces: u64, parity_pieces: u64) -> Result<bool>;
    async fn renter_files(&self) -> Result<Vec<FileInfo>>;
    async fn renter_upload(&self, source: &Path, sia_path: &str) -> Result<()>;
    async fn renter_download(&self, sia_path: &str, destination: &Path) -> Result<()>;
    async fn renter_downloads(&self) -> Result<Vec<DownloadInfo>>;
    async fn renter_delete(&self, sia_path: &str) -> Result<()>;
    async fn renter_contract_count(&self) -> Result<usize>;
    async fn renter_set_ip_violation_check(&self, enabled: bool) -> Result<()>;
}
