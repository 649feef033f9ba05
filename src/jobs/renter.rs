//! Renter job.
//!
//! Prepares a renter in up to three phases (funded wallet, allowance set
//! and upload-ready, full background churn) and then exercises the storage
//! network: an uploader pushes random files and tracks their checksums, a
//! downloader pulls random tracked files back, and a deleter keeps the
//! tracked set bounded once it crosses a threshold.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::{Rng, RngCore};
use sha3::{Digest, Sha3_256};
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{JobRunner, RenterMode, SyncOutcome, ERROR_BACKOFF};
use crate::types::{Allowance, Currency};

/// Wallet balance required before the renter forms contracts.
const MIN_RENTER_BALANCE: u64 = 25_000;
const BALANCE_WARN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Allowance posted once the wallet is funded.
const ALLOWANCE_FUNDS: Currency = Currency::from_siacoins(20_000);
const ALLOWANCE_PERIOD: u64 = 200;
const ALLOWANCE_HOSTS: u64 = 5;
const ALLOWANCE_RENEW_WINDOW: u64 = 50;
const ALLOWANCE_WARN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Redundancy scheme polled on the upload-ready endpoint.
const DATA_PIECES: u64 = 1;
const PARITY_PIECES: u64 = 1;
const UPLOAD_READY_WARN_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const UPLOAD_READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Size of each generated upload.
const UPLOAD_FILE_SIZE: u64 = 2 * 1024 * 1024;
const UPLOAD_INTERVAL: Duration = Duration::from_secs(60);
const UPLOAD_PROGRESS_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const UPLOAD_PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(15);

const DOWNLOAD_INTERVAL: Duration = Duration::from_secs(45);
/// Budget for a scheduled download to show up in the queue at all.
const DOWNLOAD_APPEAR_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const DOWNLOAD_COMPLETE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Consecutive equal size readings before an on-disk file counts as
/// flushed.
const SIZE_STABLE_READS: u32 = 3;

/// Tracked-file count at which the deleter starts working.
pub(crate) const DELETE_THRESHOLD: usize = 30;
const DELETE_INTERVAL: Duration = Duration::from_secs(30);

/// One uploaded file the renter still tracks.
#[derive(Clone, Debug)]
pub struct RenterFile {
    pub sia_path: String,
    pub source_path: PathBuf,
    /// SHA3-256 of the content, computed while the file was generated.
    pub checksum: String,
}

/// Renter state scoped to one ant: the tracked upload list and the
/// counter naming new uploads. All list mutation happens under the mutex.
pub struct RenterJob {
    jr: Arc<JobRunner>,
    files: Mutex<Vec<RenterFile>>,
    upload_counter: AtomicU64,
    /// Distinguishes siapaths across job restarts on the same daemon, so
    /// a relaunched uploader never collides with files it no longer
    /// tracks.
    run_id: String,
}

impl RenterJob {
    pub fn new(jr: Arc<JobRunner>) -> RenterJob {
        let run_id = hex::encode(rand::thread_rng().gen::<[u8; 4]>());
        RenterJob {
            jr,
            files: Mutex::new(Vec::new()),
            upload_counter: AtomicU64::new(0),
            run_id,
        }
    }

    pub fn tracked_file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn files_snapshot(&self) -> Vec<RenterFile> {
        self.files.lock().unwrap().clone()
    }

    /// Post the allowance, retrying past a warning timeout. Returns false
    /// only when the runner stops first.
    pub async fn set_allowance_with_retry(&self) -> bool {
        let allowance = Allowance {
            funds: ALLOWANCE_FUNDS,
            period: ALLOWANCE_PERIOD,
            hosts: ALLOWANCE_HOSTS,
            renew_window: ALLOWANCE_RENEW_WINDOW,
        };
        let start = Instant::now();
        let mut warned = false;
        loop {
            match self.jr.client().renter_set_allowance(&allowance).await {
                Ok(()) => {
                    info!(funds = %allowance.funds, "renter allowance set");
                    return true;
                }
                Err(err) => {
                    if !warned && start.elapsed() > ALLOWANCE_WARN_TIMEOUT {
                        error!(error = %err, "allowance still not set, retrying");
                        warned = true;
                    } else {
                        debug!(error = %err, "allowance not accepted yet");
                    }
                }
            }
            if self.jr.interruptible_sleep(ERROR_BACKOFF).await == SyncOutcome::Stopped {
                return false;
            }
        }
    }

    /// Poll the upload-ready endpoint until the renter has enough
    /// contracts for the configured redundancy.
    pub async fn wait_upload_ready(&self) -> bool {
        let start = Instant::now();
        let mut warned = false;
        loop {
            match self
                .jr
                .client()
                .renter_upload_ready(DATA_PIECES, PARITY_PIECES)
                .await
            {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => debug!(error = %err, "upload-ready poll failed"),
            }
            if !warned && start.elapsed() > UPLOAD_READY_WARN_TIMEOUT {
                error!("renter still not upload-ready, waiting");
                warned = true;
            }
            if self.jr.interruptible_sleep(UPLOAD_READY_POLL_INTERVAL).await == SyncOutcome::Stopped
            {
                return false;
            }
        }
    }

    /// Generate a random file, upload it, and block until the daemon
    /// reports full upload progress. The file joins the tracked list only
    /// on success.
    pub async fn upload_random_file(&self) -> Result<RenterFile> {
        let n = self.upload_counter.fetch_add(1, Ordering::SeqCst);
        let dir = self.jr.data_dir().join("renter-uploads");
        let name = format!("file-{}.dat", n);
        let (source_path, checksum) =
            tokio::task::spawn_blocking(move || generate_random_file(&dir, &name, UPLOAD_FILE_SIZE))
                .await
                .context("upload generation task died")??;

        let sia_path = format!("antfarm/{}-file-{}", self.run_id, n);
        self.jr
            .client()
            .renter_upload(&source_path, &sia_path)
            .await
            .with_context(|| format!("upload of {} rejected", sia_path))?;

        let deadline = Instant::now() + UPLOAD_PROGRESS_TIMEOUT;
        let mut last_progress = -1.0f64;
        loop {
            match self.jr.client().renter_files().await {
                Ok(files) => {
                    if let Some(info) = files.iter().find(|f| f.sia_path == sia_path) {
                        if info.available || info.upload_progress >= 100.0 {
                            break;
                        }
                        if info.upload_progress == last_progress {
                            self.log_stall_diagnostics(&sia_path).await;
                        }
                        last_progress = info.upload_progress;
                    }
                }
                Err(err) => debug!(error = %err, "file list poll failed"),
            }
            if Instant::now() >= deadline {
                bail!(
                    "upload of {} stuck at {:.1}% after {:?}",
                    sia_path,
                    last_progress.max(0.0),
                    UPLOAD_PROGRESS_TIMEOUT
                );
            }
            if self.jr.interruptible_sleep(UPLOAD_PROGRESS_POLL_INTERVAL).await
                == SyncOutcome::Stopped
            {
                bail!("runner stopped while upload of {} was in flight", sia_path);
            }
        }

        let file = RenterFile {
            sia_path,
            source_path,
            checksum,
        };
        self.files.lock().unwrap().push(file.clone());
        Ok(file)
    }

    async fn log_stall_diagnostics(&self, sia_path: &str) {
        let contracts = self.jr.client().renter_contract_count().await.unwrap_or(0);
        let hosts = match self.jr.client().gateway().await {
            Ok(info) => info.peers.len(),
            Err(_) => 0,
        };
        info!(
            %sia_path,
            contracts,
            peers = hosts,
            "upload progress stalled"
        );
    }

    /// Schedule a download and block through the two queue phases, then
    /// wait for the on-disk size to stop changing before declaring it
    /// done.
    pub async fn download_file(&self, file: &RenterFile) -> Result<PathBuf> {
        let dir = self.jr.data_dir().join("renter-downloads");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let suffix: u32 = { rand::thread_rng().gen() };
        let name = file.sia_path.replace('/', "_");
        let destination = dir.join(format!("{}-{:08x}", name, suffix));

        self.jr
            .client()
            .renter_download(&file.sia_path, &destination)
            .await
            .with_context(|| format!("download of {} rejected", file.sia_path))?;

        let dest_str = destination.display().to_string();

        // Phase one: the entry shows up in the download queue.
        let deadline = Instant::now() + DOWNLOAD_APPEAR_TIMEOUT;
        loop {
            match self.jr.client().renter_downloads().await {
                Ok(downloads) => {
                    if downloads.iter().any(|d| d.destination == dest_str) {
                        break;
                    }
                }
                Err(err) => debug!(error = %err, "download queue poll failed"),
            }
            if Instant::now() >= deadline {
                bail!(
                    "download of {} never appeared in the queue within {:?}",
                    file.sia_path,
                    DOWNLOAD_APPEAR_TIMEOUT
                );
            }
            if self.jr.interruptible_sleep(DOWNLOAD_POLL_INTERVAL).await == SyncOutcome::Stopped {
                bail!("runner stopped while waiting for download to queue");
            }
        }

        // Phase two: the queue entry completes without error.
        let deadline = Instant::now() + DOWNLOAD_COMPLETE_TIMEOUT;
        loop {
            match self.jr.client().renter_downloads().await {
                Ok(downloads) => {
                    if let Some(entry) = downloads.iter().find(|d| d.destination == dest_str) {
                        if !entry.error.is_empty() {
                            bail!("download of {} failed: {}", file.sia_path, entry.error);
                        }
                        if entry.completed {
                            break;
                        }
                    }
                }
                Err(err) => debug!(error = %err, "download queue poll failed"),
            }
            if Instant::now() >= deadline {
                bail!(
                    "download of {} did not complete within {:?}",
                    file.sia_path,
                    DOWNLOAD_COMPLETE_TIMEOUT
                );
            }
            if self.jr.interruptible_sleep(DOWNLOAD_POLL_INTERVAL).await == SyncOutcome::Stopped {
                bail!("runner stopped while download was in flight");
            }
        }

        // The daemon reports completion before its writes necessarily hit
        // disk; wait for the size to hold still.
        let mut last_size = u64::MAX;
        let mut stable = 0u32;
        while stable < SIZE_STABLE_READS {
            let size = tokio::fs::metadata(&destination)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            if size == last_size && size > 0 {
                stable += 1;
            } else {
                stable = 0;
            }
            last_size = size;
            if self.jr.interruptible_sleep(DOWNLOAD_POLL_INTERVAL).await == SyncOutcome::Stopped {
                bail!("runner stopped while download was flushing");
            }
        }

        Ok(destination)
    }

    /// Download `file` and compare its content hash against the one
    /// recorded at upload time.
    pub async fn verify_file(&self, file: &RenterFile) -> Result<()> {
        let destination = self.download_file(file).await?;
        let to_hash = destination.clone();
        let checksum = tokio::task::spawn_blocking(move || hash_file(&to_hash))
            .await
            .context("hash task died")??;
        if checksum != file.checksum {
            bail!(
                "content mismatch for {}: uploaded {} downloaded {}",
                file.sia_path,
                file.checksum,
                checksum
            );
        }
        Ok(())
    }

    /// Download a random tracked file that the daemon reports available.
    pub async fn download_random_file(&self) -> Result<()> {
        let available = self.jr.client().renter_files().await?;
        let candidate = {
            let files = self.files.lock().unwrap();
            let candidates: Vec<RenterFile> = files
                .iter()
                .filter(|f| {
                    available
                        .iter()
                        .any(|a| a.sia_path == f.sia_path && a.available)
                })
                .cloned()
                .collect();
            if candidates.is_empty() {
                None
            } else {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[idx].clone())
            }
        };

        match candidate {
            Some(file) => {
                let destination = self.download_file(&file).await?;
                debug!(sia_path = %file.sia_path, dest = %destination.display(), "downloaded");
                // Downloads only exercise the network; the copy is not
                // kept.
                let _ = tokio::fs::remove_file(&destination).await;
                Ok(())
            }
            None => {
                debug!("no available files to download yet");
                Ok(())
            }
        }
    }

    /// Delete one random tracked file, remotely and locally, but only
    /// once the tracked set has reached the deletion threshold. Below the
    /// threshold this is a guaranteed no-op.
    pub async fn delete_random(&self) -> Result<Option<String>> {
        let candidate = {
            let files = self.files.lock().unwrap();
            if files.len() < DELETE_THRESHOLD {
                return Ok(None);
            }
            let idx = rand::thread_rng().gen_range(0..files.len());
            files[idx].clone()
        };

        self.jr
            .client()
            .renter_delete(&candidate.sia_path)
            .await
            .with_context(|| format!("remote delete of {} failed", candidate.sia_path))?;

        {
            let mut files = self.files.lock().unwrap();
            files.retain(|f| f.sia_path != candidate.sia_path);
        }
        if let Err(err) = std::fs::remove_file(&candidate.source_path) {
            debug!(error = %err, "source file already gone");
        }
        info!(sia_path = %candidate.sia_path, "deleted tracked file");
        Ok(Some(candidate.sia_path))
    }
}

/// Entry point for all three renter modes.
pub async fn renter(jr: Arc<JobRunner>, mode: RenterMode) {
    let Ok(_guard) = jr.thread_group().add() else {
        return;
    };
    if jr.wait_for_sync().await == SyncOutcome::Stopped {
        return;
    }

    if !jr
        .wait_for_balance(
            Currency::from_siacoins(MIN_RENTER_BALANCE),
            BALANCE_WARN_TIMEOUT,
        )
        .await
    {
        return;
    }
    if mode == RenterMode::Funded {
        info!("renter wallet funded");
        return;
    }

    let rj = Arc::new(RenterJob::new(Arc::clone(&jr)));
    if !rj.set_allowance_with_retry().await {
        return;
    }
    if !rj.wait_upload_ready().await {
        return;
    }
    if mode == RenterMode::UploadReady {
        info!("renter is upload ready");
        return;
    }

    info!("renter starting upload/download/delete churn");
    tokio::spawn(upload_loop(Arc::clone(&rj)));
    tokio::spawn(download_loop(Arc::clone(&rj)));
    tokio::spawn(delete_loop(rj));
}

async fn upload_loop(rj: Arc<RenterJob>) {
    let Ok(_guard) = rj.jr.thread_group().add() else {
        return;
    };
    loop {
        match rj.upload_random_file().await {
            Ok(file) => info!(sia_path = %file.sia_path, "uploaded file"),
            Err(err) => error!(error = %err, "upload failed"),
        }
        if rj.jr.interruptible_sleep(UPLOAD_INTERVAL).await == SyncOutcome::Stopped {
            return;
        }
    }
}

async fn download_loop(rj: Arc<RenterJob>) {
    let Ok(_guard) = rj.jr.thread_group().add() else {
        return;
    };
    loop {
        if let Err(err) = rj.download_random_file().await {
            error!(error = %err, "download failed");
        }
        if rj.jr.interruptible_sleep(DOWNLOAD_INTERVAL).await == SyncOutcome::Stopped {
            return;
        }
    }
}

async fn delete_loop(rj: Arc<RenterJob>) {
    let Ok(_guard) = rj.jr.thread_group().add() else {
        return;
    };
    loop {
        if let Err(err) = rj.delete_random().await {
            error!(error = %err, "delete failed");
        }
        if rj.jr.interruptible_sleep(DELETE_INTERVAL).await == SyncOutcome::Stopped {
            return;
        }
    }
}

/// Write `size` random bytes to `dir/name`, returning the path and the
/// SHA3-256 hex digest computed while writing.
pub(crate) fn generate_random_file(dir: &Path, name: &str, size: u64) -> Result<(PathBuf, String)> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    let mut hasher = Sha3_256::new();
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    while remaining > 0 {
        let n = buf.len().min(remaining as usize);
        rng.fill_bytes(&mut buf[..n]);
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .with_context(|| format!("failed to write {}", path.display()))?;
        remaining -= n as u64;
    }
    file.flush()?;
    Ok((path, hex::encode(hasher.finalize())))
}

/// SHA3-256 hex digest of a file's content.
pub(crate) fn hash_file(path: &Path) -> Result<String> {
    use std::io::Read;
    let mut file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha3_256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::SyncBarrier;
    use crate::testing::MockSiad;

    async fn test_renter_job(mock: Arc<MockSiad>) -> RenterJob {
        let jr = JobRunner::new(
            mock,
            SyncBarrier::released(),
            None,
            std::env::temp_dir(),
        )
        .await
        .unwrap();
        RenterJob::new(jr)
    }

    fn dummy_file(i: usize) -> RenterFile {
        RenterFile {
            sia_path: format!("antfarm/file-{}", i),
            source_path: PathBuf::from(format!("/nonexistent/file-{}", i)),
            checksum: String::new(),
        }
    }

    #[test]
    fn test_generated_file_hash_matches_recompute() {
        let dir = tempfile::tempdir().unwrap();
        let (path, checksum) = generate_random_file(dir.path(), "a.dat", 100_000).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100_000);
        assert_eq!(hash_file(&path).unwrap(), checksum);
    }

    #[test]
    fn test_different_files_have_different_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let (_, a) = generate_random_file(dir.path(), "a.dat", 4096).unwrap();
        let (_, b) = generate_random_file(dir.path(), "b.dat", 4096).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_delete_random_below_threshold_is_noop() {
        let mock = Arc::new(MockSiad::new());
        let rj = test_renter_job(Arc::clone(&mock)).await;
        for i in 0..DELETE_THRESHOLD - 1 {
            rj.files.lock().unwrap().push(dummy_file(i));
        }

        assert!(rj.delete_random().await.unwrap().is_none());
        assert_eq!(rj.tracked_file_count(), DELETE_THRESHOLD - 1);
        assert!(mock.deleted_paths().is_empty());
    }

    #[tokio::test]
    async fn test_delete_random_at_threshold_removes_exactly_one() {
        let mock = Arc::new(MockSiad::new());
        let rj = test_renter_job(Arc::clone(&mock)).await;
        for i in 0..DELETE_THRESHOLD {
            rj.files.lock().unwrap().push(dummy_file(i));
        }

        let deleted = rj.delete_random().await.unwrap().unwrap();
        assert_eq!(rj.tracked_file_count(), DELETE_THRESHOLD - 1);
        assert_eq!(mock.deleted_paths(), vec![deleted.clone()]);
        assert!(rj
            .files_snapshot()
            .iter()
            .all(|f| f.sia_path != deleted));
    }

    #[tokio::test]
    async fn test_delete_random_keeps_list_on_remote_failure() {
        let mock = Arc::new(MockSiad::new());
        mock.fail_renter_delete();
        let rj = test_renter_job(Arc::clone(&mock)).await;
        for i in 0..DELETE_THRESHOLD {
            rj.files.lock().unwrap().push(dummy_file(i));
        }

        assert!(rj.delete_random().await.is_err());
        // The tracked list only shrinks after the daemon confirms.
        assert_eq!(rj.tracked_file_count(), DELETE_THRESHOLD);
    }
}
