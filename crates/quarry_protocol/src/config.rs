//! Configuration for the Quarry core.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File store locations and layout knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Mutable per-upload staging trees
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,

    /// Immutable packed archives of published uploads
    #[serde(default = "default_public_root")]
    pub public_root: PathBuf,

    /// Scratch space for extraction and bundle assembly
    #[serde(default = "default_tmp_root")]
    pub tmp_root: PathBuf,

    /// Shard upload directories by the first N characters of the upload id
    #[serde(default)]
    pub prefix_size: usize,

    /// Appended to packed archive filenames so multiple archive schema
    /// versions can coexist
    #[serde(default)]
    pub archive_version_suffix: Option<String>,
}

fn default_staging_root() -> PathBuf {
    PathBuf::from(".quarry/staging")
}

fn default_public_root() -> PathBuf {
    PathBuf::from(".quarry/public")
}

fn default_tmp_root() -> PathBuf {
    PathBuf::from(".quarry/tmp")
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            staging_root: default_staging_root(),
            public_root: default_public_root(),
            tmp_root: default_tmp_root(),
            prefix_size: 0,
            archive_version_suffix: None,
        }
    }
}

/// Processing limits and matcher behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Per-user cap on unpublished uploads (admins are exempt)
    #[serde(default = "default_upload_limit")]
    pub upload_limit: usize,

    /// Bytes read from a candidate mainfile for the content probe
    #[serde(default = "default_parser_matching_size")]
    pub parser_matching_size: usize,

    /// Per-directory cap on aux files kept per mainfile
    #[serde(default = "default_auxfile_cutoff")]
    pub auxfile_cutoff: usize,

    /// Force ISO-8859-1 decoding when UTF-8 fails
    #[serde(default)]
    pub force_raw_file_decoding: bool,

    /// Worker threads in the processing pool
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_upload_limit() -> usize {
    10
}

fn default_parser_matching_size() -> usize {
    16 * 1024
}

fn default_auxfile_cutoff() -> usize {
    100
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            upload_limit: default_upload_limit(),
            parser_matching_size: default_parser_matching_size(),
            auxfile_cutoff: default_auxfile_cutoff(),
            force_raw_file_decoding: false,
            workers: default_workers(),
        }
    }
}

/// Policy for reprocessing already-processed uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessConfig {
    #[serde(default = "default_true")]
    pub reparse_if_parser_unchanged: bool,

    #[serde(default = "default_true")]
    pub reparse_if_parser_changed: bool,

    /// Delete published entries whose mainfile no longer matches
    #[serde(default)]
    pub delete_unmatched_published_entries: bool,

    /// Create entries for newly matched mainfiles of published uploads
    #[serde(default = "default_true")]
    pub add_newfound_entries_to_published: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self {
            reparse_if_parser_unchanged: true,
            reparse_if_parser_changed: true,
            delete_unmatched_published_entries: false,
            add_newfound_entries_to_published: true,
        }
    }
}

/// Gate for importing upload bundles from other deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleImportConfig {
    /// Minimum source version a bundle must have been exported with
    #[serde(default = "default_required_version")]
    pub required_quarry_version: String,

    #[serde(default = "default_true")]
    pub allow_bundles_from_oasis: bool,

    #[serde(default)]
    pub allow_unpublished_bundles_from_oasis: bool,

    /// Roll back everything created when an import fails
    #[serde(default = "default_true")]
    pub delete_upload_on_fail: bool,

    /// Keep the source deployment's timestamps on import
    #[serde(default = "default_true")]
    pub keep_original_timestamps: bool,
}

fn default_required_version() -> String {
    "0.1.0".to_string()
}

impl Default for BundleImportConfig {
    fn default() -> Self {
        Self {
            required_quarry_version: default_required_version(),
            allow_bundles_from_oasis: true,
            allow_unpublished_bundles_from_oasis: false,
            delete_upload_on_fail: true,
            keep_original_timestamps: true,
        }
    }
}

/// Main configuration for the Quarry core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuarryConfig {
    #[serde(default)]
    pub fs: FsConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub reprocess: ReprocessConfig,

    #[serde(default)]
    pub bundle_import: BundleImportConfig,

    /// Identifier of this deployment, recorded into exported bundles
    #[serde(default = "default_deployment_id")]
    pub deployment_id: String,

    /// Base URL of the central deployment for external publishing
    #[serde(default)]
    pub central_deployment_url: Option<String>,
}

fn default_deployment_id() -> String {
    "quarry-local".to_string()
}

impl QuarryConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, crate::QuarryError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::QuarryError::BadRequest(format!("invalid config: {e}")))
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), crate::QuarryError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::QuarryError::BadRequest(format!("invalid config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Configuration rooted in a single directory, used by tests and the CLI.
    pub fn rooted(root: &Path) -> Self {
        Self {
            fs: FsConfig {
                staging_root: root.join("staging"),
                public_root: root.join("public"),
                tmp_root: root.join("tmp"),
                ..FsConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QuarryConfig::default();
        assert_eq!(config.process.parser_matching_size, 16 * 1024);
        assert_eq!(config.process.auxfile_cutoff, 100);
        assert_eq!(config.fs.prefix_size, 0);
        assert!(config.reprocess.reparse_if_parser_unchanged);
        assert!(!config.reprocess.delete_unmatched_published_entries);
        assert!(config.bundle_import.delete_upload_on_fail);
    }

    #[test]
    fn test_toml_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("quarry.toml");

        let mut config = QuarryConfig::rooted(temp.path());
        config.process.workers = 2;
        config.fs.prefix_size = 2;
        config.save(&path).unwrap();

        let loaded = QuarryConfig::load(&path).unwrap();
        assert_eq!(loaded.process.workers, 2);
        assert_eq!(loaded.fs.prefix_size, 2);
        assert_eq!(loaded.fs.staging_root, temp.path().join("staging"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("quarry.toml");
        std::fs::write(&path, "[process]\nworkers = 1\n").unwrap();

        let config = QuarryConfig::load(&path).unwrap();
        assert_eq!(config.process.workers, 1);
        assert_eq!(config.process.upload_limit, 10);
    }
}
