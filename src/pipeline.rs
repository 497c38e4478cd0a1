//! Fetch, extract, compose.
//!
//! [`Pipeline::produce_installer`] runs the three stages strictly in order
//! under an exclusive lock on the build directory. A stage starts only after
//! the previous one succeeded, and the first failure ends the run. Each run
//! is recorded in a run manifest.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use log::{info, warn};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::compose::{compose_installer, Packager};
use crate::config::InstallerConfig;
use crate::extract::assemble_payload;
use crate::fetch::{ArchiveRef, Fetcher, Transport};
use crate::interrupt::{is_cancelled, CancelFlag};
use crate::layout::BuildLayout;
use crate::runs::{self, RunMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Extract,
    Compose,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Compose => "compose",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Fetching,
    Extracting,
    Composing,
    Done,
    Failed(Stage),
}

impl Stage {
    fn running_state(self) -> PipelineState {
        match self {
            Self::Fetch => PipelineState::Fetching,
            Self::Extract => PipelineState::Extracting,
            Self::Compose => PipelineState::Composing,
        }
    }
}

/// The three stage actions. The pipeline owns ordering; implementations
/// only do the work.
pub trait Stages {
    fn fetch(&mut self, config: &InstallerConfig, layout: &BuildLayout) -> Result<()>;
    fn extract(&mut self, config: &InstallerConfig, layout: &BuildLayout) -> Result<()>;
    fn compose(&mut self, config: &InstallerConfig, layout: &BuildLayout) -> Result<PathBuf>;
}

/// Stages backed by a [`Fetcher`], the payload assembler and a [`Packager`].
pub struct DefaultStages<T, P> {
    fetcher: Fetcher<T>,
    packager: P,
}

impl<T: Transport, P: Packager> DefaultStages<T, P> {
    pub fn new(fetcher: Fetcher<T>, packager: P) -> Self {
        Self { fetcher, packager }
    }

    pub fn fetcher(&self) -> &Fetcher<T> {
        &self.fetcher
    }
}

impl<T: Transport, P: Packager> Stages for DefaultStages<T, P> {
    fn fetch(&mut self, config: &InstallerConfig, layout: &BuildLayout) -> Result<()> {
        for source in &config.sources {
            self.fetcher
                .ensure(&ArchiveRef::for_source(source, layout))
                .with_context(|| format!("fetching source '{}' {}", source.name, source.version))?;
        }
        Ok(())
    }

    fn extract(&mut self, config: &InstallerConfig, layout: &BuildLayout) -> Result<()> {
        assemble_payload(&config.sources, layout, self.fetcher.cancel_flag())?;
        Ok(())
    }

    fn compose(&mut self, config: &InstallerConfig, layout: &BuildLayout) -> Result<PathBuf> {
        compose_installer(&self.packager, config, layout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub run_id: String,
    pub artifact: PathBuf,
}

pub struct Pipeline<'a, S> {
    config: &'a InstallerConfig,
    layout: BuildLayout,
    stages: S,
    cancel: CancelFlag,
    state: PipelineState,
}

impl<'a, S: Stages> Pipeline<'a, S> {
    pub fn new(config: &'a InstallerConfig, stages: S, cancel: CancelFlag) -> Self {
        Self {
            config,
            layout: BuildLayout::for_config(config),
            stages,
            cancel,
            state: PipelineState::NotStarted,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    pub fn stages(&self) -> &S {
        &self.stages
    }

    /// Run fetch, extract and compose, and return the installer path.
    ///
    /// On failure the error names the stage, the state records it, and no
    /// installer is left at the artifact path.
    pub fn produce_installer(&mut self) -> Result<BuildReport> {
        let layout = self.layout.clone();
        fs::create_dir_all(&layout.build_dir).with_context(|| {
            format!("creating build directory '{}'", layout.build_dir.display())
        })?;
        let _lock = BuildLock::acquire(&layout.lock_path)?;

        if layout.artifact_path.exists() {
            fs::remove_file(&layout.artifact_path).with_context(|| {
                format!(
                    "removing previous installer '{}'",
                    layout.artifact_path.display()
                )
            })?;
        }

        let (run_id, run_dir) = runs::allocate_run_dir(&layout.runs_dir)?;
        let metadata = RunMetadata::building(
            &run_id,
            &self.config.version,
            &self.config.package_version(),
        )?;
        runs::write_run_metadata(&run_dir, &metadata)?;
        info!(
            "[build:{}] run {} started for {} {}",
            self.config.name,
            run_id,
            self.config.name,
            self.config.version
        );

        match self.run_stages() {
            Ok(artifact) => {
                runs::write_run_metadata(&run_dir, &metadata.succeeded(&artifact)?)?;
                let removed = runs::prune_old_runs(&layout.runs_dir, self.config.run_retention)?;
                if removed > 0 {
                    info!("[build:{}] pruned {} old runs", self.config.name, removed);
                }
                info!(
                    "[build:{}] run {} produced {}",
                    self.config.name,
                    run_id,
                    artifact.display()
                );
                Ok(BuildReport { run_id, artifact })
            }
            Err(err) => {
                let recorded = metadata
                    .failed(&err)
                    .and_then(|failed| runs::write_run_metadata(&run_dir, &failed));
                if let Err(meta_err) = recorded {
                    warn!(
                        "[build:{}] failed to persist run metadata: {meta_err:#}",
                        self.config.name
                    );
                }
                Err(err)
            }
        }
    }

    fn run_stages(&mut self) -> Result<PathBuf> {
        self.step(Stage::Fetch, |stages, config, layout| {
            stages.fetch(config, layout)
        })?;
        self.step(Stage::Extract, |stages, config, layout| {
            stages.extract(config, layout)
        })?;
        let artifact = self.step(Stage::Compose, |stages, config, layout| {
            stages.compose(config, layout)
        })?;
        self.state = PipelineState::Done;
        Ok(artifact)
    }

    fn step<R>(
        &mut self,
        stage: Stage,
        run: impl FnOnce(&mut S, &InstallerConfig, &BuildLayout) -> Result<R>,
    ) -> Result<R> {
        if is_cancelled(&self.cancel) {
            self.state = PipelineState::Failed(stage);
            bail!("interrupted before the {stage} stage");
        }
        self.state = stage.running_state();
        info!("[build:{stage}] starting");
        match run(&mut self.stages, self.config, &self.layout) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.state = PipelineState::Failed(stage);
                Err(err.context(format!("{stage} stage failed")))
            }
        }
    }
}

/// Exclusive lock on a build directory, released on drop. The lock file
/// itself stays in place.
#[derive(Debug)]
pub struct BuildLock {
    file: File,
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory '{}'", parent.display()))?;
        }
        // Lock files are reused and never unlinked. A waiter may already
        // have this inode open, and a new file at the same path would be a
        // second, independent lock.
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("creating lock file '{}'", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "build directory is locked by another process: {}",
                path.display()
            );
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("failed to release build lock '{}': {}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tests::{fixture, CopyPackager};
    use crate::config::SourceKind;
    use crate::extract::tests::{docker_zip_bytes, extra_source, tar_gz_bytes};
    use crate::fetch::tests::{RoutingTransport, StubTransport};
    use crate::runs::{load_runs_metadata, RunStatus};
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn flag() -> CancelFlag {
        Arc::new(AtomicBool::new(false))
    }

    /// Records stage calls; optionally fails one of them.
    #[derive(Default)]
    struct RecordingStages {
        calls: Vec<Stage>,
        fail_at: Option<Stage>,
    }

    impl RecordingStages {
        fn record(&mut self, stage: Stage) -> Result<()> {
            self.calls.push(stage);
            if self.fail_at == Some(stage) {
                bail!("{stage} exploded");
            }
            Ok(())
        }
    }

    impl Stages for RecordingStages {
        fn fetch(&mut self, _: &InstallerConfig, _: &BuildLayout) -> Result<()> {
            self.record(Stage::Fetch)
        }

        fn extract(&mut self, _: &InstallerConfig, _: &BuildLayout) -> Result<()> {
            self.record(Stage::Extract)
        }

        fn compose(&mut self, _: &InstallerConfig, layout: &BuildLayout) -> Result<PathBuf> {
            self.record(Stage::Compose)?;
            fs::create_dir_all(&layout.output_dir)?;
            fs::write(&layout.artifact_path, b"msi")?;
            Ok(layout.artifact_path.clone())
        }
    }

    struct NotFoundTransport;

    impl Transport for NotFoundTransport {
        fn open(&self, url: &str) -> Result<Box<dyn Read + Send>> {
            bail!("download of '{}' failed with HTTP status 404 Not Found", url)
        }
    }

    fn msi_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.ends_with(".msi"))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn default_stages(body: Vec<u8>) -> DefaultStages<StubTransport, CopyPackager> {
        DefaultStages::new(
            Fetcher::new(StubTransport::new(body), flag()),
            CopyPackager::default(),
        )
    }

    #[test]
    fn stages_run_in_order() {
        let tmp = TempDir::new().unwrap();
        let (config, _) = fixture(tmp.path());
        let mut pipeline = Pipeline::new(&config, RecordingStages::default(), flag());
        assert_eq!(pipeline.state(), PipelineState::NotStarted);

        let report = pipeline.produce_installer().unwrap();
        assert_eq!(
            pipeline.stages().calls,
            vec![Stage::Fetch, Stage::Extract, Stage::Compose]
        );
        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(report.artifact, pipeline.layout().artifact_path);

        let runs = load_runs_metadata(&pipeline.layout().runs_dir).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, report.run_id);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert!(BuildLock::acquire(&pipeline.layout().lock_path).is_ok());
    }

    #[test]
    fn failed_stage_stops_the_run() {
        let tmp = TempDir::new().unwrap();
        let (config, _) = fixture(tmp.path());
        let stages = RecordingStages {
            fail_at: Some(Stage::Extract),
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(&config, stages, flag());

        let err = pipeline.produce_installer().unwrap_err();
        assert_eq!(err.to_string(), "extract stage failed");
        assert!(format!("{err:#}").contains("extract exploded"));
        assert_eq!(pipeline.stages().calls, vec![Stage::Fetch, Stage::Extract]);
        assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Extract));
        assert!(!pipeline.layout().artifact_path.exists());

        let runs = load_runs_metadata(&pipeline.layout().runs_dir).unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].error.as_deref().unwrap().contains("extract exploded"));
    }

    #[test]
    fn produces_exactly_one_installer() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        let mut pipeline = Pipeline::new(&config, default_stages(docker_zip_bytes()), flag());

        let report = pipeline.produce_installer().unwrap();
        assert_eq!(report.artifact, layout.artifact_path);
        assert_eq!(msi_files(&layout.output_dir), vec!["docker-20.10.7.1.msi"]);
        assert!(layout.cache_path(&config.sources[0]).is_file());
        assert!(layout.payload_dir.join("dockerd.exe").is_file());
        assert_eq!(pipeline.stages().fetcher().transport().calls(), 1);

        let source = fs::read_to_string(&layout.rendered_source_path).unwrap();
        assert!(source.contains("Manufacturer=\"Acme\""));
        assert!(source.contains("Version=\"20.10.7.1\""));
    }

    #[test]
    fn rerun_reuses_the_cached_archive() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        let mut pipeline = Pipeline::new(&config, default_stages(docker_zip_bytes()), flag());

        pipeline.produce_installer().unwrap();
        pipeline.produce_installer().unwrap();
        assert_eq!(pipeline.stages().fetcher().transport().calls(), 1);
        assert_eq!(msi_files(&layout.output_dir).len(), 1);
        assert_eq!(load_runs_metadata(&layout.runs_dir).unwrap().len(), 2);
    }

    #[test]
    fn failed_download_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        fs::create_dir_all(&layout.output_dir).unwrap();
        fs::write(&layout.artifact_path, b"from an earlier run").unwrap();
        let stages = DefaultStages::new(
            Fetcher::new(NotFoundTransport, flag()),
            CopyPackager::default(),
        );
        let mut pipeline = Pipeline::new(&config, stages, flag());

        let err = pipeline.produce_installer().unwrap_err();
        assert_eq!(err.to_string(), "fetch stage failed");
        assert!(format!("{err:#}").contains("404"));
        assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Fetch));
        assert!(!layout.cache_path(&config.sources[0]).exists());
        assert!(!layout.payload_dir.exists());
        assert!(!layout.artifact_path.exists());
    }

    #[test]
    fn archive_without_payload_folder_fails_extract() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        let zip_path = tmp.path().join("flat.zip");
        crate::extract::tests::write_zip(&zip_path, &[("dockerd.exe", "MZ".as_bytes())]);
        let mut pipeline = Pipeline::new(
            &config,
            default_stages(fs::read(&zip_path).unwrap()),
            flag(),
        );

        let err = pipeline.produce_installer().unwrap_err();
        assert_eq!(err.to_string(), "extract stage failed");
        assert!(format!("{err:#}").contains("no 'docker' folder"));
        assert!(!layout.artifact_path.exists());
    }

    #[test]
    fn installer_source_is_reproducible() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let mut outputs = Vec::new();
        for tmp in [&first, &second] {
            let (config, layout) = fixture(tmp.path());
            let mut pipeline =
                Pipeline::new(&config, default_stages(docker_zip_bytes()), flag());
            pipeline.produce_installer().unwrap();
            outputs.push((
                fs::read(&layout.rendered_source_path).unwrap(),
                fs::read(&layout.artifact_path).unwrap(),
            ));
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn held_lock_refuses_a_second_build() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        let _held = BuildLock::acquire(&layout.lock_path).unwrap();
        let mut pipeline = Pipeline::new(&config, RecordingStages::default(), flag());

        let err = pipeline.produce_installer().unwrap_err();
        assert!(err.to_string().contains("locked by another process"));
        assert!(pipeline.stages().calls.is_empty());
        assert_eq!(pipeline.state(), PipelineState::NotStarted);
    }

    #[test]
    fn interrupted_run_starts_no_stage() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        let cancel = flag();
        cancel.store(true, Ordering::SeqCst);
        let mut pipeline = Pipeline::new(&config, RecordingStages::default(), cancel);

        let err = pipeline.produce_installer().unwrap_err();
        assert!(err.to_string().contains("interrupted"));
        assert!(pipeline.stages().calls.is_empty());
        assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Fetch));
        assert!(!layout.artifact_path.exists());
    }

    #[test]
    fn released_lock_keeps_its_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build").join(".lock");
        let first = BuildLock::acquire(&path).unwrap();
        let waiter = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        drop(first);

        assert!(path.is_file());
        FileExt::try_lock_exclusive(&waiter).unwrap();
        let err = BuildLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("locked by another process"));
    }

    #[test]
    fn bundle_sources_are_fetched_and_packaged_together() {
        let tmp = TempDir::new().unwrap();
        let (mut config, layout) = fixture(tmp.path());
        let mut buildx = extra_source("buildx", SourceKind::Binary);
        buildx.file_name = Some("docker-buildx.exe".to_string());
        let mut containerd = extra_source("containerd", SourceKind::TarGz);
        containerd.strip = Some(PathBuf::from("bin"));
        containerd.into = Some(PathBuf::from("containerd"));
        config.sources.extend([buildx, containerd]);

        let transport = RoutingTransport::new(vec![
            ("docker-20.10.7.zip", docker_zip_bytes()),
            ("buildx-1.0.0", b"MZ-buildx".to_vec()),
            (
                "containerd-1.0.0",
                tar_gz_bytes(&[("bin/containerd.exe", "MZ-containerd".as_bytes())]),
            ),
        ]);
        let stages = DefaultStages::new(Fetcher::new(transport, flag()), CopyPackager::default());
        let mut pipeline = Pipeline::new(&config, stages, flag());

        pipeline.produce_installer().unwrap();
        pipeline.produce_installer().unwrap();
        assert_eq!(
            pipeline.stages().fetcher().transport().requested(),
            vec![
                "https://example.test/docker-20.10.7.zip",
                "https://example.test/buildx-1.0.0",
                "https://example.test/containerd-1.0.0",
            ]
        );
        assert!(layout.payload_dir.join("docker-buildx.exe").is_file());
        assert!(layout.payload_dir.join("containerd/containerd.exe").is_file());

        let source = fs::read_to_string(&layout.rendered_source_path).unwrap();
        assert!(source.contains("Source=\"docker-buildx.exe\""), "{source}");
        assert!(source.contains("<Directory Id=\"dir_"), "{source}");
        assert!(source.contains("Name=\"containerd\""), "{source}");
        assert!(source.contains("containerd.exe"), "{source}");
        assert!(source.contains("<ServiceInstall "));
    }

    #[test]
    fn missing_bundle_member_fails_fetch() {
        let tmp = TempDir::new().unwrap();
        let (mut config, layout) = fixture(tmp.path());
        config.sources.push(extra_source("compose", SourceKind::Binary));
        let transport = RoutingTransport::new(vec![("docker-20.10.7.zip", docker_zip_bytes())]);
        let stages = DefaultStages::new(Fetcher::new(transport, flag()), CopyPackager::default());
        let mut pipeline = Pipeline::new(&config, stages, flag());

        let err = pipeline.produce_installer().unwrap_err();
        assert_eq!(err.to_string(), "fetch stage failed");
        assert!(format!("{err:#}").contains("source 'compose'"), "{err:#}");
        assert!(layout.cache_path(&config.sources[0]).is_file());
        assert!(!layout.payload_dir.exists());
        assert!(!layout.artifact_path.exists());
    }
}
