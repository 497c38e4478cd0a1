//! Filesystem layout of a build.
//!
//! Every path is derived from the configuration alone, so two invocations
//! with the same versions agree on where downloads are cached and where the
//! installer lands.

use std::path::{Path, PathBuf};

use crate::config::{InstallerConfig, SourceConfig, SourceKind};

const LOCK_FILENAME: &str = ".dockerd-msi.lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    pub build_dir: PathBuf,
    /// Download cache, one `<source>-<version>.<ext>` file per source.
    pub downloads_dir: PathBuf,
    /// Assembled payload tree that gets packaged.
    pub payload_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Final installer artifact.
    pub artifact_path: PathBuf,
    /// Rendered installer source kept next to the artifact.
    pub rendered_source_path: PathBuf,
    pub runs_dir: PathBuf,
    pub lock_path: PathBuf,
}

impl BuildLayout {
    pub fn for_config(config: &InstallerConfig) -> Self {
        let build_dir = config.build_dir.clone();
        let output_dir = build_dir.join("out");
        let artifact_stem = format!("{}-{}", config.name, config.package_version());
        Self {
            downloads_dir: build_dir.join("downloads"),
            payload_dir: build_dir.join(format!("{}-{}", config.name, config.version)),
            artifact_path: output_dir.join(format!("{artifact_stem}.msi")),
            rendered_source_path: output_dir.join(format!("{artifact_stem}.wxs")),
            runs_dir: build_dir.join("runs"),
            lock_path: build_dir.join(LOCK_FILENAME),
            output_dir,
            build_dir,
        }
    }

    /// Cache file of one source.
    pub fn cache_path(&self, source: &SourceConfig) -> PathBuf {
        self.downloads_dir.join(format!(
            "{}-{}.{}",
            source.name,
            source.version,
            cache_extension(source)
        ))
    }
}

fn cache_extension(source: &SourceConfig) -> &str {
    match source.kind {
        SourceKind::Zip => "zip",
        SourceKind::TarGz => "tar.gz",
        SourceKind::Binary => source
            .file_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin"),
    }
}
