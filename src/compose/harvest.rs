//! Turns the extracted payload tree into WiX directory/component markup.
//!
//! Entries are visited in sorted order and every Id and GUID is derived from
//! SHA-256 over the relative path, so the same tree always renders the same
//! markup regardless of where it sits on disk.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;
use walkdir::WalkDir;

use super::template::xml_escape;

const INDENT: &str = "  ";

/// Service registration attached to the component holding the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub executable: String,
    pub name: String,
    pub display_name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harvest {
    /// `Directory`/`Component`/`File` elements for the install folder.
    pub directories: String,
    /// `ComponentRef` elements for the feature.
    pub component_refs: String,
    pub files: usize,
}

pub fn harvest(
    payload_dir: &Path,
    guid_seed: &str,
    service: &ServiceRegistration,
) -> Result<Harvest> {
    if !payload_dir.is_dir() {
        bail!("payload directory not found: {}", payload_dir.display());
    }

    let mut directories = String::new();
    let mut component_refs = String::new();
    let mut open_dirs = 0usize;
    let mut files = 0usize;
    let mut service_attached = false;

    for entry in WalkDir::new(payload_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry
            .with_context(|| format!("walking payload directory '{}'", payload_dir.display()))?;
        let depth = entry.depth();
        while open_dirs >= depth {
            open_dirs -= 1;
            writeln!(directories, "{}</Directory>", INDENT.repeat(open_dirs))?;
        }

        let relative = entry
            .path()
            .strip_prefix(payload_dir)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let relative = windows_path(relative)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let indent = INDENT.repeat(depth - 1);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            writeln!(
                directories,
                "{indent}<Directory Id=\"{}\" Name=\"{}\">",
                element_id("dir", &relative),
                xml_escape(&name)
            )?;
            open_dirs += 1;
            continue;
        }
        if !file_type.is_file() {
            bail!(
                "payload entry '{}' is neither a file nor a directory",
                entry.path().display()
            );
        }

        let component_id = element_id("cmp", &relative);
        writeln!(
            directories,
            "{indent}<Component Id=\"{}\" Guid=\"{}\">",
            component_id,
            stable_guid(guid_seed, &format!("component:{relative}"))
        )?;
        writeln!(
            directories,
            "{indent}{INDENT}<File Id=\"{}\" Source=\"{}\" KeyPath=\"yes\" />",
            element_id("fil", &relative),
            xml_escape(&relative)
        )?;
        if depth == 1 && name == service.executable {
            write_service_elements(&mut directories, &format!("{indent}{INDENT}"), service)?;
            service_attached = true;
        }
        writeln!(directories, "{indent}</Component>")?;
        writeln!(component_refs, "<ComponentRef Id=\"{}\" />", component_id)?;
        files += 1;
    }
    while open_dirs > 0 {
        open_dirs -= 1;
        writeln!(directories, "{}</Directory>", INDENT.repeat(open_dirs))?;
    }

    if !service_attached {
        bail!(
            "service executable '{}' not found at the root of '{}'",
            service.executable,
            payload_dir.display()
        );
    }

    Ok(Harvest {
        directories: directories.trim_end().to_string(),
        component_refs: component_refs.trim_end().to_string(),
        files,
    })
}

fn write_service_elements(
    out: &mut String,
    indent: &str,
    service: &ServiceRegistration,
) -> Result<()> {
    let name = xml_escape(&service.name);
    writeln!(
        out,
        "{indent}<ServiceInstall Id=\"ServiceInstall\" Name=\"{name}\" DisplayName=\"{}\" \
         Type=\"ownProcess\" Start=\"auto\" ErrorControl=\"normal\" Arguments=\"{}\" Vital=\"yes\" />",
        xml_escape(&service.display_name),
        xml_escape(&service.arguments)
    )?;
    writeln!(
        out,
        "{indent}<ServiceControl Id=\"ServiceControl\" Name=\"{name}\" Start=\"install\" \
         Stop=\"both\" Remove=\"uninstall\" Wait=\"yes\" />"
    )?;
    Ok(())
}

/// GUID in registry format derived from `seed` and `key`.
pub fn stable_guid(seed: &str, key: &str) -> String {
    let digest = Sha256::digest(format!("{seed}\n{key}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // RFC 4122 version and variant bits, name-based.
    bytes[6] = (bytes[6] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<String>();
    format!(
        "{{{}-{}-{}-{}-{}}}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn element_id(prefix: &str, relative: &str) -> String {
    let digest = Sha256::digest(relative.as_bytes());
    let hex = format!("{:x}", digest);
    format!("{prefix}_{}", &hex[..24])
}

fn windows_path(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            anyhow::anyhow!("payload path '{}' is not valid UTF-8", relative.display())
        })?;
        parts.push(part);
    }
    Ok(parts.join("\\"))
}
