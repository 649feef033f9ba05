//! HTTP client for the siad API.
//!
//! A thin wrapper over reqwest that speaks the daemon's JSON dialect:
//! form-encoded parameters in, lowercase-keyed JSON out, errors reported
//! as `{"message": "..."}` bodies with a non-2xx status.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::types::{
    Allowance, Block, ConsensusInfo, Currency, DownloadInfo, FileInfo, GatewayInfo, HostInfo,
    SiadApi, WalletInfo,
};

/// The daemon rejects requests without this user agent.
const SIA_AGENT: &str = "Sia-Agent";

/// Budget for a single API round-trip. Wallet init on a slow disk is the
/// long pole.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SiadClient {
    base_url: String,
    api_password: Option<String>,
    http: Client,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Deserialize)]
struct WalletInitResponse {
    #[serde(rename = "primaryseed")]
    primary_seed: String,
}

#[derive(Deserialize)]
struct SeedsResponse {
    #[serde(rename = "primaryseed")]
    primary_seed: String,
}

#[derive(Deserialize)]
struct AddressResponse {
    address: String,
}

#[derive(Deserialize)]
struct UploadReadyResponse {
    ready: bool,
}

#[derive(Deserialize)]
struct FilesResponse {
    files: Option<Vec<FileInfo>>,
}

#[derive(Deserialize)]
struct DownloadsResponse {
    downloads: Option<Vec<DownloadInfo>>,
}

#[derive(Deserialize)]
struct ContractsResponse {
    #[serde(rename = "activecontracts")]
    active_contracts: Option<Vec<serde_json::Value>>,
}

/// Encode a siapath for use as a URL path segment.
pub(crate) fn encode_sia_path(sia_path: &str) -> String {
    urlencoding::encode(sia_path).into_owned()
}

impl SiadClient {
    /// Create a client bound to one daemon's API address, e.g.
    /// `127.0.0.1:9980`.
    pub fn new(api_addr: &str, api_password: Option<String>) -> Result<SiadClient> {
        let http = Client::builder()
            .user_agent(SIA_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(SiadClient {
            base_url: format!("http://{}", api_addr),
            api_password,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(password) = &self.api_password {
            builder = builder.basic_auth("", Some(password));
        }
        builder
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response, path: &str) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            anyhow::bail!("siad API {} returned {}: {}", path, status, message);
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("siad API {} returned malformed JSON", path))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        Self::parse(resp, path).await
    }

    async fn call(&self, method: reqwest::Method, path: &str, form: &[(&str, String)]) -> Result<()> {
        let mut builder = self.request(method, path);
        if !form.is_empty() {
            builder = builder.form(form);
        }
        let resp = builder
            .send()
            .await
            .with_context(|| format!("request to {} failed", path))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            anyhow::bail!("siad API {} returned {}: {}", path, status, message);
        }
        Ok(())
    }

    async fn post_form<T: DeserializeOwned>(&self, path: &str, form: &[(&str, String)]) -> Result<T> {
        let mut builder = self.request(reqwest::Method::POST, path);
        if !form.is_empty() {
            builder = builder.form(form);
        }
        let resp = builder
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;
        Self::parse(resp, path).await
    }
}

#[async_trait]
impl SiadApi for SiadClient {
    async fn daemon_version(&self) -> Result<String> {
        let resp: VersionResponse = self.get_json("/daemon/version").await?;
        Ok(resp.version)
    }

    async fn daemon_stop(&self) -> Result<()> {
        self.call(reqwest::Method::GET, "/daemon/stop", &[]).await
    }

    async fn consensus(&self) -> Result<ConsensusInfo> {
        self.get_json("/consensus").await
    }

    async fn block_at(&self, height: u64) -> Result<Block> {
        self.get_json(&format!("/consensus/blocks?height={}", height))
            .await
    }

    async fn wallet(&self) -> Result<WalletInfo> {
        self.get_json("/wallet").await
    }

    async fn wallet_init(&self) -> Result<String> {
        let resp: WalletInitResponse = self.post_form("/wallet/init", &[]).await?;
        Ok(resp.primary_seed)
    }

    async fn wallet_init_seed(&self, seed: &str) -> Result<()> {
        self.call(
            reqwest::Method::POST,
            "/wallet/init/seed",
            &[("seed", seed.to_string())],
        )
        .await
    }

    async fn wallet_unlock(&self, seed: &str) -> Result<()> {
        self.call(
            reqwest::Method::POST,
            "/wallet/unlock",
            &[("encryptionpassword", seed.to_string())],
        )
        .await
    }

    async fn wallet_address(&self) -> Result<String> {
        let resp: AddressResponse = self.get_json("/wallet/address").await?;
        Ok(resp.address)
    }

    async fn wallet_primary_seed(&self) -> Result<String> {
        let resp: SeedsResponse = self.get_json("/wallet/seeds").await?;
        Ok(resp.primary_seed)
    }

    async fn wallet_send_siacoins(&self, amount: Currency, destination: &str) -> Result<()> {
        self.call(
            reqwest::Method::POST,
            "/wallet/siacoins",
            &[
                ("amount", amount.0.to_string()),
                ("destination", destination.to_string()),
            ],
        )
        .await
    }

    async fn miner_start(&self) -> Result<()> {
        self.call(reqwest::Method::GET, "/miner/start", &[]).await
    }

    async fn miner_stop(&self) -> Result<()> {
        self.call(reqwest::Method::GET, "/miner/stop", &[]).await
    }

    async fn gateway(&self) -> Result<GatewayInfo> {
        self.get_json("/gateway").await
    }

    async fn gateway_connect(&self, addr: &str) -> Result<()> {
        let path = format!("/gateway/connect/{}", urlencoding::encode(addr));
        self.call(reqwest::Method::POST, &path, &[]).await
    }

    async fn host(&self) -> Result<HostInfo> {
        self.get_json("/host").await
    }

    async fn host_accept_contracts(&self) -> Result<()> {
        self.call(
            reqwest::Method::POST,
            "/host",
            &[("acceptingcontracts", "true".to_string())],
        )
        .await
    }

    async fn host_announce(&self) -> Result<()> {
        self.call(reqwest::Method::POST, "/host/announce", &[]).await
    }

    async fn host_add_storage_folder(&self, path: &Path, size: u64) -> Result<()> {
        self.call(
            reqwest::Method::POST,
            "/host/storage/folders/add",
            &[
                ("path", path.display().to_string()),
                ("size", size.to_string()),
            ],
        )
        .await
    }

    async fn renter_set_allowance(&self, allowance: &Allowance) -> Result<()> {
        self.call(
            reqwest::Method::POST,
            "/renter",
            &[
                ("funds", allowance.funds.0.to_string()),
                ("period", allowance.period.to_string()),
                ("hosts", allowance.hosts.to_string()),
                ("renewwindow", allowance.renew_window.to_string()),
            ],
        )
        .await
    }

    async fn renter_upload_ready(&self, data_pieces: u64, parity_pieces: u64) -> Result<bool> {
        let path = format!(
            "/renter/uploadready?datapieces={}&paritypieces={}",
            data_pieces, parity_pieces
        );
        let resp: UploadReadyResponse = self.get_json(&path).await?;
        Ok(resp.ready)
    }

    async fn renter_files(&self) -> Result<Vec<FileInfo>> {
        let resp: FilesResponse = self.get_json("/renter/files").await?;
        Ok(resp.files.unwrap_or_default())
    }

    async fn renter_upload(&self, source: &Path, sia_path: &str) -> Result<()> {
        let path = format!("/renter/upload/{}", encode_sia_path(sia_path));
        self.call(
            reqwest::Method::POST,
            &path,
            &[("source", source.display().to_string())],
        )
        .await
    }

    async fn renter_download(&self, sia_path: &str, destination: &Path) -> Result<()> {
        let path = format!(
            "/renter/download/{}?destination={}&async=true",
            encode_sia_path(sia_path),
            urlencoding::encode(&destination.display().to_string())
        );
        self.call(reqwest::Method::GET, &path, &[]).await
    }

    async fn renter_downloads(&self) -> Result<Vec<DownloadInfo>> {
        let resp: DownloadsResponse = self.get_json("/renter/downloads").await?;
        Ok(resp.downloads.unwrap_or_default())
    }

    async fn renter_delete(&self, sia_path: &str) -> Result<()> {
        let path = format!("/renter/delete/{}", encode_sia_path(sia_path));
        self.call(reqwest::Method::POST, &path, &[]).await
    }

    async fn renter_contract_count(&self) -> Result<usize> {
        let resp: ContractsResponse = self.get_json("/renter/contracts").await?;
        Ok(resp.active_contracts.map(|c| c.len()).unwrap_or(0))
    }

    async fn renter_set_ip_violation_check(&self, enabled: bool) -> Result<()> {
        self.call(
            reqwest::Method::POST,
            "/renter",
            &[("checkforipviolation", enabled.to_string())],
        )
        .await
    }
}
