//! Repackages the upstream Docker for Windows static binaries as an MSI.
//!
//! A build runs three stages in order against a bundle of pinned upstream
//! downloads (the Docker static archive plus optional companion tools):
//!
//! - **Fetch** - download each source once into the build cache
//! - **Extract** - unpack or copy every source into one fresh payload tree
//! - **Compose** - render the WiX installer source and package the MSI,
//!   registering `dockerd.exe` as an auto-start Windows service
//!
//! # Architecture
//!
//! ```text
//! installer.toml ──> config ──> layout (every build path)
//!                                  │
//! pipeline ── lock + run manifest ─┤
//!     ├── fetch    (Transport: reqwest)      downloads/<source>-<v>.<ext>
//!     ├── extract  (zip / tar.gz / binary)   docker-<v>/...
//!     └── compose  (template + harvest,      out/docker-<v><suffix>.wxs
//!                   Packager: wix build)     out/docker-<v><suffix>.msi
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use dockerd_msi::compose::wix::WixToolset;
//! use dockerd_msi::fetch::{Fetcher, HttpTransport};
//! use dockerd_msi::{interrupt, DefaultStages, InstallerConfig, Pipeline};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = InstallerConfig::load(Path::new("installer.toml"))?;
//! let cancel = interrupt::process_flag();
//! let stages = DefaultStages::new(
//!     Fetcher::new(HttpTransport::new()?, cancel.clone()),
//!     WixToolset::locate()?,
//! );
//! let report = Pipeline::new(&config, stages, cancel).produce_installer()?;
//! println!("{}", report.artifact.display());
//! # Ok(())
//! # }
//! ```

pub mod compose;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod interrupt;
pub mod layout;
pub mod pipeline;
pub mod preflight;
pub mod runs;

pub use compose::{compose_installer, render_installer_source, PackageJob, Packager};
pub use config::{InstallerConfig, SourceConfig, SourceKind, DEFAULT_CONFIG_FILENAME};
pub use layout::BuildLayout;
pub use pipeline::{BuildReport, DefaultStages, Pipeline, PipelineState, Stage, Stages};
