//! Payload assembly.
//!
//! Every cached download is unpacked (or copied, for single binaries) into a
//! staging directory next to the payload directory. Archives contribute the
//! contents of their `strip` folder, each source lands in its `into`
//! subfolder, and two sources may not provide the same file. The finished
//! tree then replaces the payload directory. A failed or interrupted
//! assembly leaves the previous tree (or nothing) in place, never a
//! half-written one.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{SourceConfig, SourceKind};
use crate::interrupt::{is_cancelled, CancelFlag};
use crate::layout::BuildLayout;

/// Summary of an assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub root: PathBuf,
    pub files: usize,
    pub sources: usize,
}

/// Build the payload directory from the cached downloads of `sources`.
pub fn assemble_payload(
    sources: &[SourceConfig],
    layout: &BuildLayout,
    cancel: &CancelFlag,
) -> Result<Assembled> {
    let dest_dir = &layout.payload_dir;
    let parent = dest_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("creating payload parent '{}'", parent.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".payload-")
        .tempdir_in(parent)
        .with_context(|| format!("creating payload staging dir in '{}'", parent.display()))?;
    let tree = staging.path().join("payload");
    fs::create_dir(&tree).with_context(|| format!("creating '{}'", tree.display()))?;

    let mut files = 0;
    for source in sources {
        if is_cancelled(cancel) {
            bail!("payload assembly interrupted before source '{}'", source.name);
        }
        let added = add_source(source, &layout.cache_path(source), &tree, staging.path(), cancel)
            .with_context(|| format!("adding source '{}' to the payload", source.name))?;
        debug!("[extract] source {} contributed {} files", source.name, added);
        files += added;
    }

    replace_dir(&tree, dest_dir, staging.path())?;
    info!(
        "[extract] assembled {} files from {} sources into {}",
        files,
        sources.len(),
        dest_dir.display()
    );
    Ok(Assembled {
        root: dest_dir.clone(),
        files,
        sources: sources.len(),
    })
}

fn add_source(
    source: &SourceConfig,
    cached: &Path,
    tree: &Path,
    staging: &Path,
    cancel: &CancelFlag,
) -> Result<usize> {
    if !cached.is_file() {
        bail!("download not found: {}", cached.display());
    }
    let target = match &source.into {
        Some(sub) => tree.join(sub),
        None => tree.to_path_buf(),
    };
    fs::create_dir_all(&target).with_context(|| format!("creating '{}'", target.display()))?;

    if source.kind == SourceKind::Binary {
        let name = source
            .file_name
            .as_deref()
            .ok_or_else(|| anyhow!("binary source '{}' has no file name", source.name))?;
        install_binary(cached, &target.join(name), tree)?;
        return Ok(1);
    }

    let unpacked = staging.join(format!("unpack-{}", source.name));
    fs::create_dir(&unpacked).with_context(|| format!("creating '{}'", unpacked.display()))?;
    match source.kind {
        SourceKind::TarGz => untar_gz(cached, &unpacked, cancel),
        _ => unzip(cached, &unpacked, cancel),
    }
    .with_context(|| format!("unpacking '{}'", cached.display()))?;

    let taken = match &source.strip {
        Some(folder) => {
            let taken = unpacked.join(folder);
            if !taken.is_dir() {
                bail!(
                    "archive '{}' has no '{}' folder at its root",
                    cached.display(),
                    folder.display()
                );
            }
            taken
        }
        None => unpacked,
    };
    merge_tree(&taken, &target, tree)
}

fn install_binary(cached: &Path, dest: &Path, tree: &Path) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        bail!(conflict(dest, tree));
    }
    fs::copy(cached, dest)
        .with_context(|| format!("copying '{}' to '{}'", cached.display(), dest.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("setting mode on '{}'", dest.display()))?;
    }
    Ok(())
}

/// Move everything below `from` into `to`, refusing to overwrite a file.
fn merge_tree(from: &Path, to: &Path, tree: &Path) -> Result<usize> {
    let entries = WalkDir::new(from)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("walking '{}'", from.display()))?;

    let mut files = 0;
    for entry in entries {
        let relative = entry
            .path()
            .strip_prefix(from)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let dest = to.join(relative);
        let existing = fs::symlink_metadata(&dest).ok();
        if entry.file_type().is_dir() {
            match existing {
                Some(meta) if meta.is_dir() => {}
                Some(_) => bail!(conflict(&dest, tree)),
                None => fs::create_dir(&dest)
                    .with_context(|| format!("creating '{}'", dest.display()))?,
            }
            continue;
        }
        if existing.is_some() {
            bail!(conflict(&dest, tree));
        }
        fs::rename(entry.path(), &dest).with_context(|| {
            format!("moving '{}' to '{}'", entry.path().display(), dest.display())
        })?;
        files += 1;
    }
    Ok(files)
}

fn conflict(dest: &Path, tree: &Path) -> String {
    let shown = dest.strip_prefix(tree).unwrap_or(dest);
    format!("'{}' is provided by more than one source", shown.display())
}

/// Move `new` to `target`. A previous `target` is parked inside `scratch`
/// first and moved back if the swap fails.
fn replace_dir(new: &Path, target: &Path, scratch: &Path) -> Result<()> {
    let parked = scratch.join("previous");
    let had_previous = fs::symlink_metadata(target).is_ok();
    if had_previous {
        fs::rename(target, &parked).with_context(|| {
            format!("moving previous payload '{}' aside", target.display())
        })?;
    }
    if let Err(err) = fs::rename(new, target) {
        if had_previous {
            if let Err(restore) = fs::rename(&parked, target) {
                warn!(
                    "[extract] could not restore previous payload '{}': {}",
                    target.display(),
                    restore
                );
            }
        }
        return Err(err).with_context(|| {
            format!("moving assembled payload '{}' to '{}'", new.display(), target.display())
        });
    }
    Ok(())
}

fn unzip(archive: &Path, dest_dir: &Path, cancel: &CancelFlag) -> Result<usize> {
    let file =
        File::open(archive).with_context(|| format!("opening '{}'", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("reading zip central directory")?;

    let mut files = 0;
    for i in 0..zip.len() {
        if is_cancelled(cancel) {
            bail!("unpacking interrupted after {} files", files);
        }
        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("reading zip entry #{}", i))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| anyhow!("zip entry '{}' escapes the output directory", entry.name()))?;
        let out_path = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("creating '{}'", out_path.display()))?;
            continue;
        }

        if let Some(p) = out_path.parent() {
            fs::create_dir_all(p).with_context(|| format!("creating '{}'", p.display()))?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("creating '{}'", out_path.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("writing '{}'", out_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))
                    .with_context(|| format!("setting mode on '{}'", out_path.display()))?;
            }
        }
        files += 1;
    }
    Ok(files)
}

fn untar_gz(archive: &Path, dest_dir: &Path, cancel: &CancelFlag) -> Result<usize> {
    let file =
        File::open(archive).with_context(|| format!("opening '{}'", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    let mut files = 0;
    for entry in tar.entries().context("reading tar entries")? {
        if is_cancelled(cancel) {
            bail!("unpacking interrupted after {} files", files);
        }
        let mut entry = entry.context("reading tar entry")?;
        let path = entry.path().context("decoding tar entry path")?.into_owned();
        if !is_enclosed(&path) {
            bail!("tar entry '{}' escapes the output directory", path.display());
        }
        let is_file = entry.header().entry_type().is_file();
        // `unpack_in` refuses anything that would land outside `dest_dir`.
        if !entry
            .unpack_in(dest_dir)
            .with_context(|| format!("unpacking '{}'", path.display()))?
        {
            bail!("tar entry '{}' escapes the output directory", path.display());
        }
        if is_file {
            files += 1;
        }
    }
    Ok(files)
}

fn is_enclosed(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
