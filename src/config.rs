//! Farm configuration.
//!
//! Loads and validates the JSON document describing an antfarm: listen
//! address, data directory, per-ant configs, connectivity flags, and the
//! addresses of external farms to federate with.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::jobs::JobSpec;

/// Default modules the daemon is started with: consensus, gateway,
/// transaction pool, host, miner, renter, wallet.
pub const DEFAULT_SIAD_MODULES: &str = "cgthmrw";

/// Default farm data directory when the config leaves it unset.
pub const DEFAULT_DATA_DIR: &str = "./antfarm-data";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntfarmConfig {
    /// Address the registry HTTP listener binds to.
    pub listen_address: String,
    /// Farm data directory; each ant gets a subdirectory.
    #[serde(default)]
    pub data_dir: String,
    pub ants: Vec<AntConfig>,
    /// Connect every ant's gateway to the first ant after startup.
    #[serde(default)]
    pub auto_connect: bool,
    /// Block until all ants agree on recent block history.
    #[serde(default)]
    pub wait_for_sync: bool,
    /// Registry addresses of external antfarms to federate with.
    #[serde(default)]
    pub external_farms: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntConfig {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    /// Target confirmed balance in siacoins; nonzero launches the balance
    /// maintainer. Mutually exclusive with a mining job.
    #[serde(default)]
    pub desired_currency: u64,
    /// Seed to initialize the wallet from instead of generating one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_wallet_seed: Option<String>,
    pub siad: SiadConfig,
}

/// Everything needed to spawn one siad process. Addresses left empty are
/// auto-assigned by the farm before the ant starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiadConfig {
    pub siad_path: PathBuf,
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub api_addr: String,
    #[serde(default)]
    pub rpc_addr: String,
    #[serde(default)]
    pub host_addr: String,
    #[serde(default)]
    pub siamux_addr: String,
    #[serde(default)]
    pub siamux_ws_addr: String,
    /// API password; supplied to the daemon via environment variable only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_password: Option<String>,
    #[serde(default)]
    pub modules: String,
    /// When set, `siad version` output must contain this substring or the
    /// ant refuses to start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version_flavor: Option<String>,
}

impl AntConfig {
    pub fn has_mining_job(&self) -> bool {
        self.jobs.iter().any(|j| matches!(j, JobSpec::BlockMining))
    }

    /// True if any configured job name contains "renter".
    pub fn has_renter_type_job(&self) -> bool {
        self.jobs
            .iter()
            .any(|j| j.name().to_lowercase().contains("renter"))
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn resolve_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load an antfarm config from a JSON file, merging defaults for unset
/// fields.
pub fn load_config(path: &Path) -> Result<AntfarmConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: AntfarmConfig = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    if config.data_dir.is_empty() {
        config.data_dir = DEFAULT_DATA_DIR.to_string();
    }
    for ant in &mut config.ants {
        if ant.siad.modules.is_empty() {
            ant.siad.modules = DEFAULT_SIAD_MODULES.to_string();
        }
    }

    config.validate()?;
    Ok(config)
}

impl AntfarmConfig {
    /// Reject configs that cannot produce a working farm: duplicate ant
    /// names, or an ant that both mines and maintains a balance target.
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.is_empty() {
            bail!("config: listen address must be set");
        }
        for (i, ant) in self.ants.iter().enumerate() {
            if ant.name.is_empty() {
                bail!("config: ant #{} has no name", i);
            }
            if self.ants[..i].iter().any(|other| other.name == ant.name) {
                bail!("config: duplicate ant name {:?}", ant.name);
            }
            // A mining ant grows its balance without bound, so a desired
            // currency target could never hold.
            if ant.has_mining_job() && ant.desired_currency > 0 {
                bail!(
                    "config: ant {:?} cannot combine a mining job with desiredCurrency",
                    ant.name
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_config(ants: &str) -> String {
        format!(
            r#"{{
                "listenAddress": "127.0.0.1:9900",
                "ants": {}
            }}"#,
            ants
        )
    }

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_config_merges_defaults() {
        let f = write_temp(&minimal_config(
            r#"[{"name": "miner", "jobs": ["blockmining"], "siad": {"siadPath": "siad"}}]"#,
        ));
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.data_dir, DEFAULT_DATA_DIR);
        assert_eq!(config.ants[0].siad.modules, DEFAULT_SIAD_MODULES);
        assert!(!config.auto_connect);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let f = write_temp(&minimal_config(
            r#"[
                {"name": "a", "siad": {"siadPath": "siad"}},
                {"name": "a", "siad": {"siadPath": "siad"}}
            ]"#,
        ));
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate ant name"));
    }

    #[test]
    fn test_mining_with_desired_currency_rejected() {
        let f = write_temp(&minimal_config(
            r#"[{
                "name": "miner",
                "jobs": ["blockmining"],
                "desiredCurrency": 1000,
                "siad": {"siadPath": "siad"}
            }]"#,
        ));
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("desiredCurrency"));
    }

    #[test]
    fn test_config_round_trip() {
        let f = write_temp(&minimal_config(
            r#"[{
                "name": "renter",
                "jobs": ["renter", {"littlesupplier": {"destination": "abc"}}],
                "siad": {"siadPath": "/usr/bin/siad"}
            }]"#,
        ));
        let config = load_config(f.path()).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: AntfarmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ants[0].jobs.len(), 2);
        assert!(back.ants[0].has_renter_type_job());
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/abs/path"), PathBuf::from("/abs/path"));
        let resolved = resolve_path("~/farm");
        assert!(!resolved.to_string_lossy().starts_with('~'));
        assert!(resolved.ends_with("farm"));
    }
}
