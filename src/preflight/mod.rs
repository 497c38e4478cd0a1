//! Preflight checks for installer builds.
//!
//! Validates that the host has the packaging tools and that the static
//! installer inputs exist before anything is downloaded.
//!
//! # Example
//!
//! ```rust
//! use dockerd_msi::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("wix") {
//!     println!("WiX Toolset not installed");
//! }
//!
//! let tools = &[("wix", "dotnet tool install --global wix")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::config::InstallerConfig;

/// Check if a command exists on PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools needed to compose an installer.
///
/// Each tuple is (command_name, install_hint).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("wix", "dotnet tool install --global wix")];

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with its install hint.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, hint)| format!("  {} (install: {})", tool, hint))
        .collect::<Vec<_>>();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Check that the template and license named by the config exist.
pub fn check_inputs(config: &InstallerConfig) -> Result<()> {
    let inputs = [
        ("installer template", &config.template),
        ("license file", &config.metadata.license_file),
    ];
    let missing = inputs
        .iter()
        .filter(|(_, path)| !path.is_file())
        .map(|(what, path)| format!("  {} ({})", what, path.display()))
        .collect::<Vec<_>>();

    if !missing.is_empty() {
        bail!("Missing installer inputs:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Run every check and report all failures at once.
pub fn check_host(config: &InstallerConfig) -> Result<()> {
    let failures = [check_required_tools(REQUIRED_TOOLS), check_inputs(config)]
        .into_iter()
        .filter_map(|result| result.err())
        .map(|err| err.to_string())
        .collect::<Vec<_>>();

    if !failures.is_empty() {
        bail!("{}", failures.join("\n"));
    }
    Ok(())
}
