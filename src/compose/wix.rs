//! WiX Toolset packager.
//!
//! Wraps the `wix build` command line (WiX v4 and later). File sources in the
//! rendered markup are relative; the payload and license directories are
//! passed as bind paths.

use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{PackageJob, Packager};

pub const WIX_PROGRAM: &str = "wix";
pub const DEFAULT_EXTENSIONS: &[&str] = &["WixToolset.UI.wixext"];

#[derive(Debug, Clone)]
pub struct WixToolset {
    program: PathBuf,
    extensions: Vec<String>,
}

impl WixToolset {
    /// Resolve `wix` on PATH.
    pub fn locate() -> Result<Self> {
        let program = which::which(WIX_PROGRAM).with_context(|| {
            format!(
                "'{}' not found on PATH (install: dotnet tool install --global wix)",
                WIX_PROGRAM
            )
        })?;
        Ok(Self::new(program))
    }

    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Arguments for one build, without the program name.
    pub fn build_args(&self, job: &PackageJob<'_>) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-nologo".to_string(),
            "-arch".to_string(),
            "x64".to_string(),
            "-pdbtype".to_string(),
            "none".to_string(),
        ];
        for ext in &self.extensions {
            args.push("-ext".to_string());
            args.push(ext.clone());
        }
        for culture in job.cultures {
            args.push("-culture".to_string());
            args.push(culture.clone());
        }
        for bind in job.bind_paths {
            args.push("-bindpath".to_string());
            args.push(bind.display().to_string());
        }
        args.push("-out".to_string());
        args.push(job.output.display().to_string());
        args.push(job.source.display().to_string());
        args
    }
}

impl Packager for WixToolset {
    fn package(&self, job: &PackageJob<'_>) -> Result<()> {
        let args = self.build_args(job);
        debug!("[compose] {} {}", self.program.display(), args.join(" "));
        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(working_dir(job.source))
            .output()
            .with_context(|| format!("running '{}'", self.program.display()))?;

        if output.status.success() {
            info!("[compose] wix produced {}", job.output.display());
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "wix build failed for '{}' (status {}): {}\n{}",
            job.source.display(),
            output.status,
            stdout.trim(),
            stderr.trim()
        )
    }
}

fn working_dir(source: &Path) -> &Path {
    source
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}
