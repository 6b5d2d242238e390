use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use heft_core::ServiceConfig;

pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub backup_state_path: PathBuf,
    pub replica_dir: PathBuf,
}

impl Config {
    /// Resolve the data directory, creating it if needed. `data_dir` and
    /// `replica_dir` override the platform defaults.
    pub fn load(data_dir: Option<&Path>, replica_dir: Option<&Path>) -> Result<Self> {
        let data_dir = if let Some(dir) = data_dir {
            dir.to_path_buf()
        } else {
            let proj_dirs =
                ProjectDirs::from("", "", "heft").context("Could not determine home directory")?;
            proj_dirs.data_dir().to_path_buf()
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Self::in_dir(data_dir, replica_dir))
    }

    fn in_dir(data_dir: PathBuf, replica_dir: Option<&Path>) -> Self {
        let service = ServiceConfig::in_dir(&data_dir);
        let replica_dir = replica_dir.map_or_else(|| data_dir.join("replica"), Path::to_path_buf);
        Config {
            db_path: service.db_path,
            backup_state_path: service.backup_state_path,
            replica_dir,
            data_dir,
        }
    }

    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            db_path: self.db_path.clone(),
            backup_state_path: self.backup_state_path.clone(),
            backup_file_stem: "heft".to_string(),
        }
    }

    /// The default replica lives under the data dir, so create it on demand.
    /// An explicit `--replica-dir` must already exist.
    pub fn ensure_default_replica_dir(&self) -> Result<()> {
        if self.replica_dir.starts_with(&self.data_dir) {
            std::fs::create_dir_all(&self.replica_dir).with_context(|| {
                format!("Failed to create replica directory: {}", self.replica_dir.display())
            })?;
        }
        Ok(())
    }
}
