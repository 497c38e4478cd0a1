//! Build run manifests.
//!
//! Every `build` gets a directory `<build_dir>/runs/<run_id>/` holding a
//! `run-manifest.json`. The manifest is written as `building` before the
//! stages start and rewritten as `success` or `failed` when they finish.
//! Run ids are fixed-width base62 encodings of the creation time, so the
//! directory names sort in creation order.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_WIDTH: usize = 16;
const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
static RUN_ID_SEQUENCE: AtomicU16 = AtomicU16::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Building,
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Building => "building",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub status: RunStatus,
    pub version: String,
    pub package_version: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    /// Set once the installer exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    /// Error chain of a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunMetadata {
    pub fn building(run_id: &str, version: &str, package_version: &str) -> Result<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            status: RunStatus::Building,
            version: version.to_string(),
            package_version: package_version.to_string(),
            created_at_utc: now_utc_compact()?,
            finished_at_utc: None,
            artifact_path: None,
            error: None,
        })
    }

    pub fn succeeded(mut self, artifact: &Path) -> Result<Self> {
        self.status = RunStatus::Success;
        self.finished_at_utc = Some(now_utc_compact()?);
        self.artifact_path = Some(artifact.display().to_string());
        Ok(self)
    }

    pub fn failed(mut self, error: &anyhow::Error) -> Result<Self> {
        self.status = RunStatus::Failed;
        self.finished_at_utc = Some(now_utc_compact()?);
        self.error = Some(format!("{error:#}"));
        Ok(self)
    }
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

/// Create a fresh run directory under `runs_dir`.
pub fn allocate_run_dir(runs_dir: &Path) -> Result<(String, PathBuf)> {
    fs::create_dir_all(runs_dir)
        .with_context(|| format!("creating runs directory '{}'", runs_dir.display()))?;
    let run_id = generate_run_id()?;
    let run_dir = runs_dir.join(&run_id);
    fs::create_dir(&run_dir)
        .with_context(|| format!("creating run directory '{}'", run_dir.display()))?;
    Ok((run_id, run_dir))
}

pub fn write_run_metadata(run_dir: &Path, metadata: &RunMetadata) -> Result<()> {
    let path = manifest_path(run_dir);
    let payload = serde_json::to_vec_pretty(metadata).context("serializing run metadata")?;
    write_atomic(&path, &payload)
        .with_context(|| format!("writing run metadata '{}'", path.display()))
}

/// Replace `path` with `bytes` through a named temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".write-")
        .tempfile_in(parent)
        .with_context(|| format!("creating temp file in '{}'", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("writing temp file for '{}'", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replacing '{}'", path.display()))?;
    Ok(())
}

/// All readable run manifests, newest run first.
///
/// Run directories without a manifest (an allocation that crashed before
/// the first write) are skipped.
pub fn load_runs_metadata(runs_dir: &Path) -> Result<Vec<RunMetadata>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let listing = fs::read_dir(runs_dir)
        .with_context(|| format!("reading runs directory '{}'", runs_dir.display()))?;
    let mut manifests = Vec::new();
    for entry in listing {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", runs_dir.display()))?;
        let path = manifest_path(&entry.path());
        if path.is_file() {
            manifests.push(path);
        }
    }

    let mut runs = manifests
        .iter()
        .map(|path| {
            let bytes = fs::read(path)
                .with_context(|| format!("reading run metadata '{}'", path.display()))?;
            serde_json::from_slice::<RunMetadata>(&bytes)
                .with_context(|| format!("parsing run metadata '{}'", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
    Ok(runs)
}

/// The newest run that produced an installer.
pub fn latest_successful_run(runs_dir: &Path) -> Result<Option<RunMetadata>> {
    Ok(load_runs_metadata(runs_dir)?
        .into_iter()
        .find(|run| run.status == RunStatus::Success))
}

/// Keep the newest `keep` runs and delete the rest.
pub fn prune_old_runs(runs_dir: &Path, keep: usize) -> Result<usize> {
    let expired: Vec<_> = load_runs_metadata(runs_dir)?
        .into_iter()
        .skip(keep)
        .map(|run| runs_dir.join(run.run_id))
        .collect();
    for path in &expired {
        fs::remove_dir_all(path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
    }
    Ok(expired.len())
}

/// A fixed-width base62 id whose byte order follows creation order.
///
/// Layout of the encoded value: nanoseconds since the epoch in the high bits,
/// then 16 bits of pid and a 16-bit in-process sequence number.
pub fn generate_run_id() -> Result<String> {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let nanos = u128::try_from(nanos).context("system clock before 1970 while generating run id")?;
    let pid = u128::from(std::process::id() & 0xFFFF);
    let seq = u128::from(RUN_ID_SEQUENCE.fetch_add(1, Ordering::Relaxed));
    let value = nanos
        .checked_shl(32)
        .filter(|shifted| shifted >> 32 == nanos)
        .context("run id overflow")?
        | pid << 16
        | seq;

    let mut digits = [b'0'; RUN_ID_WIDTH];
    let mut rest = value;
    for slot in digits.iter_mut().rev() {
        *slot = BASE62[(rest % 62) as usize];
        rest /= 62;
    }
    if rest != 0 {
        bail!("run id overflow: {value} does not fit in {RUN_ID_WIDTH} base62 digits");
    }
    Ok(digits.iter().map(|&b| b as char).collect())
}

pub fn now_utc_compact() -> Result<String> {
    let now = OffsetDateTime::now_utc();
    Ok(format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(runs_dir: &Path, created: &str, status: RunStatus) -> String {
        let (run_id, run_dir) = allocate_run_dir(runs_dir).unwrap();
        let mut meta = RunMetadata::building(&run_id, "20.10.7", "20.10.7.1").unwrap();
        meta.created_at_utc = created.to_string();
        meta.status = status;
        write_run_metadata(&run_dir, &meta).unwrap();
        run_id
    }

    #[test]
    fn run_ids_sort_in_creation_order() {
        let ids: Vec<String> = (0..64).map(|_| generate_run_id().unwrap()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert!(ids
            .iter()
            .all(|id| id.len() == RUN_ID_WIDTH && id.chars().all(|c| c.is_ascii_alphanumeric())));
    }

    #[test]
    fn manifest_without_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        allocate_run_dir(tmp.path()).unwrap();
        let kept = record(tmp.path(), "20260101T000000Z", RunStatus::Success);
        fs::write(tmp.path().join("stray.txt"), "x").unwrap();

        let runs = load_runs_metadata(tmp.path()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, kept);
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("out.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out.json")]);
    }

    #[test]
    fn manifest_round_trips_status() {
        let tmp = TempDir::new().unwrap();
        let (run_id, run_dir) = allocate_run_dir(tmp.path()).unwrap();
        let meta = RunMetadata::building(&run_id, "20.10.7", "20.10.7.1").unwrap();
        write_run_metadata(&run_dir, &meta).unwrap();

        let raw = fs::read_to_string(manifest_path(&run_dir)).unwrap();
        assert!(raw.contains("\"status\": \"building\""), "{raw}");
        assert!(!raw.contains("artifact_path"));

        let done = meta
            .succeeded(Path::new("build/out/docker-20.10.7.1.msi"))
            .unwrap();
        write_run_metadata(&run_dir, &done).unwrap();
        let runs = load_runs_metadata(tmp.path()).unwrap();
        assert_eq!(runs, vec![done]);
    }

    #[test]
    fn latest_success_skips_failed_runs() {
        let tmp = TempDir::new().unwrap();
        let ok = record(tmp.path(), "20260101T000000Z", RunStatus::Success);
        record(tmp.path(), "20260102T000000Z", RunStatus::Failed);

        let latest = latest_successful_run(tmp.path()).unwrap().unwrap();
        assert_eq!(latest.run_id, ok);
    }

    #[test]
    fn prune_keeps_newest_runs() {
        let tmp = TempDir::new().unwrap();
        record(tmp.path(), "20260101T000000Z", RunStatus::Success);
        record(tmp.path(), "20260102T000000Z", RunStatus::Failed);
        let newest = record(tmp.path(), "20260103T000000Z", RunStatus::Success);

        assert_eq!(prune_old_runs(tmp.path(), 1).unwrap(), 2);
        let runs = load_runs_metadata(tmp.path()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, newest);
    }

    #[test]
    fn missing_runs_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_runs_metadata(&tmp.path().join("runs")).unwrap().is_empty());
        assert!(latest_successful_run(&tmp.path().join("runs")).unwrap().is_none());
    }
}
