//! Version-upgrade test driver.
//!
//! Walks an ant through an ordered list of daemon binaries using the
//! ant's live-upgrade operation, and checks functional continuity after
//! every step: the renter must come back upload-ready, accept a fresh
//! upload, and return every file uploaded under any earlier binary with
//! its content intact.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::ant::Ant;
use crate::jobs::renter::{RenterFile, RenterJob};

/// Upgrade a renter ant through `versions`, verifying all accumulated
/// uploads after each step.
pub async fn run_renter_upgrade_test(ant: &Ant, versions: &[PathBuf]) -> Result<()> {
    if versions.is_empty() {
        bail!("no versions to upgrade through");
    }

    let mut uploaded: Vec<RenterFile> = Vec::new();
    for version in versions {
        info!(binary = %version.display(), "upgrading renter ant");
        ant.update_siad(version.clone())
            .await
            .with_context(|| format!("upgrade to {} failed", version.display()))?;

        let renter = renter_handle(ant).await?;
        if !renter.wait_upload_ready().await {
            bail!("ant was stopped while waiting for upload readiness");
        }

        let file = renter
            .upload_random_file()
            .await
            .with_context(|| format!("upload after upgrade to {} failed", version.display()))?;
        uploaded.push(file);

        verify_all(&renter, &uploaded, version).await?;
        info!(
            binary = %version.display(),
            files = uploaded.len(),
            "upgrade step verified"
        );
    }
    Ok(())
}

/// Upgrade a set of host ants through `versions` while a renter ant stays
/// on its binary; after each step the renter must still store and return
/// data through the upgraded hosts.
pub async fn run_host_upgrade_test(
    renter_ant: &Ant,
    hosts: &[Arc<Ant>],
    versions: &[PathBuf],
) -> Result<()> {
    if versions.is_empty() {
        bail!("no versions to upgrade through");
    }

    let mut uploaded: Vec<RenterFile> = Vec::new();
    for version in versions {
        for host in hosts {
            info!(ant = %host.name, binary = %version.display(), "upgrading host ant");
            host.update_siad(version.clone())
                .await
                .with_context(|| format!("upgrade of host {:?} failed", host.name))?;
        }

        let renter = renter_handle(renter_ant).await?;
        if !renter.wait_upload_ready().await {
            bail!("renter ant was stopped while waiting for upload readiness");
        }

        let file = renter
            .upload_random_file()
            .await
            .with_context(|| format!("upload after host upgrade to {} failed", version.display()))?;
        uploaded.push(file);

        verify_all(&renter, &uploaded, version).await?;
    }
    Ok(())
}

async fn renter_handle(ant: &Ant) -> Result<RenterJob> {
    let runner = ant
        .job_runner()
        .await
        .with_context(|| format!("ant {:?} has no job runner", ant.name))?;
    Ok(RenterJob::new(runner))
}

async fn verify_all(renter: &RenterJob, uploaded: &[RenterFile], version: &PathBuf) -> Result<()> {
    for file in uploaded {
        renter.verify_file(file).await.with_context(|| {
            format!(
                "file {} corrupted after upgrade to {}",
                file.sia_path,
                version.display()
            )
        })?;
    }
    Ok(())
}
