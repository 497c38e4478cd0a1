//! Installer configuration.
//!
//! The configuration is a TOML file (`installer.toml` by default) that pins
//! the upstream version, the bundle of downloads that make up the payload
//! and the static installer metadata. It is parsed into raw `*Toml` structs
//! and then validated into an immutable [`InstallerConfig`] that the pipeline
//! stages borrow.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file looked up in the current directory when none is given.
pub const DEFAULT_CONFIG_FILENAME: &str = "installer.toml";

const VERSION_PARAM: &str = "{version}";
const DISPLAY_NAME_PARAM: &str = "{display_name}";
const DEFAULT_BUILD_DIR: &str = "build";
const DEFAULT_TEMPLATE: &str = "packaging/installer.wxs";
const DEFAULT_RUN_RETENTION: usize = 5;

/// Validated, immutable build configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerConfig {
    /// Short artifact name, used for the archive and installer file names.
    pub name: String,
    /// Upstream version identifier, e.g. `20.10.7`.
    pub version: String,
    /// Installer build suffix appended to the version, e.g. `.1`.
    pub build_suffix: String,
    /// Downloads merged into the payload, in configuration order.
    pub sources: Vec<SourceConfig>,
    pub metadata: InstallerMetadata,
    /// Installer-definition template (WiX source with placeholders).
    pub template: PathBuf,
    /// Root of all build outputs: downloads, extracted tree, artifacts, runs.
    pub build_dir: PathBuf,
    /// Number of run manifests kept after a successful build.
    pub run_retention: usize,
}

/// One pinned upstream download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Unique label, also the cache file stem.
    pub name: String,
    /// Version substituted into the URL; defaults to the package version.
    pub version: String,
    /// URL pattern containing `{version}`.
    pub url_template: String,
    /// Expected lowercase hex SHA-256 of the download, if pinned.
    pub sha256: Option<String>,
    pub kind: SourceKind,
    /// Folder inside the archive whose contents are taken. `None` takes the
    /// whole archive.
    pub strip: Option<PathBuf>,
    /// Payload subfolder the source lands in. `None` is the payload root.
    pub into: Option<PathBuf>,
    /// Installed name of a `binary` source.
    pub file_name: Option<String>,
}

impl SourceConfig {
    pub fn url(&self) -> String {
        self.url_template.replace(VERSION_PARAM, &self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    TarGz,
    /// A single executable copied into the payload as-is.
    #[serde(rename = "binary")]
    Binary,
}

impl SourceKind {
    fn infer(url: &str) -> Option<Self> {
        let name = last_url_segment(url).to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".exe") {
            Some(Self::Binary)
        } else {
            None
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
            Self::Binary => "binary",
        })
    }
}

/// Static installer metadata handed to the composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerMetadata {
    pub product_name: String,
    pub vendor: String,
    pub license_file: PathBuf,
    pub display_name: String,
    pub service: ServiceSpec,
    /// Installer cultures, e.g. `en-US`.
    pub languages: Vec<String>,
}

/// Windows service registration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// File name of the service executable inside the extracted tree.
    pub executable: String,
    /// Start-argument template, parameterized by `{display_name}`.
    pub start_arguments: String,
}

impl ServiceSpec {
    /// Expand the start-argument template for the given display name.
    pub fn render_start_arguments(&self, display_name: &str) -> String {
        self.start_arguments.replace(DISPLAY_NAME_PARAM, display_name)
    }
}

impl InstallerConfig {
    /// Load and validate a config file. Relative paths inside the file
    /// resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading installer config '{}'", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&raw, base_dir, path)
    }

    /// Parse config text. `origin` is only used in error messages.
    pub fn from_toml_str(raw: &str, base_dir: &Path, origin: &Path) -> Result<Self> {
        let parsed: InstallerToml = toml::from_str(raw)
            .with_context(|| format!("parsing installer config '{}'", origin.display()))?;
        parsed.into_config(base_dir, origin)
    }

    /// Version stamped into the installer: version plus build suffix.
    pub fn package_version(&self) -> String {
        format!("{}{}", self.version, self.build_suffix)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|source| source.name == name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallerToml {
    package: PackageToml,
    #[serde(default)]
    source: Vec<SourceToml>,
    service: ServiceToml,
    build: Option<BuildToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageToml {
    name: Option<String>,
    version: String,
    build_suffix: Option<String>,
    product_name: Option<String>,
    vendor: String,
    display_name: String,
    license_file: String,
    languages: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceToml {
    name: Option<String>,
    version: Option<String>,
    url: String,
    sha256: Option<String>,
    kind: Option<SourceKind>,
    strip: Option<String>,
    into: Option<String>,
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceToml {
    executable: String,
    start_arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    dir: Option<String>,
    template: Option<String>,
    run_retention: Option<usize>,
}

impl InstallerToml {
    fn into_config(self, base_dir: &Path, origin: &Path) -> Result<InstallerConfig> {
        let invalid = |msg: String| -> anyhow::Error {
            anyhow::anyhow!("invalid installer config '{}': {}", origin.display(), msg)
        };

        let package = self.package;
        let name = package
            .name
            .as_deref()
            .unwrap_or("docker")
            .trim()
            .to_string();
        if !is_file_segment(&name) {
            return Err(invalid(format!("package.name '{}' must be a plain file name", name)));
        }

        let version = package.version.trim().to_string();
        if version.is_empty() || !version.chars().all(is_version_char) {
            return Err(invalid(format!(
                "package.version '{}' must be non-empty and contain only [0-9A-Za-z.+-]",
                version
            )));
        }
        let build_suffix = package.build_suffix.unwrap_or_default().trim().to_string();
        let package_version = format!("{version}{build_suffix}");
        validate_msi_version(&package_version)
            .map_err(|err| invalid(format!("{err:#}")))?;

        let vendor = required(&package.vendor, "package.vendor").map_err(invalid)?;
        let display_name =
            required(&package.display_name, "package.display_name").map_err(invalid)?;
        let product_name = match package.product_name {
            Some(value) => required(&value, "package.product_name").map_err(invalid)?,
            None => display_name.clone(),
        };
        let license_file = resolve_config_path(
            base_dir,
            &required(&package.license_file, "package.license_file").map_err(invalid)?,
        );

        let mut languages = package
            .languages
            .unwrap_or_else(|| vec!["en-US".to_string()])
            .into_iter()
            .map(|lang| lang.trim().to_string())
            .filter(|lang| !lang.is_empty())
            .collect::<Vec<_>>();
        let mut seen = HashSet::new();
        languages.retain(|lang| seen.insert(lang.clone()));
        if languages.is_empty() {
            return Err(invalid("package.languages must name at least one culture".to_string()));
        }
        if let Some(bad) = languages.iter().find(|lang| !is_culture(lang)) {
            return Err(invalid(format!(
                "package.languages entry '{}' is not a culture code like 'en-US'",
                bad
            )));
        }

        if self.source.is_empty() {
            return Err(invalid("at least one [[source]] entry is required".to_string()));
        }
        let mut sources = Vec::with_capacity(self.source.len());
        let mut names = HashSet::new();
        for raw in self.source {
            let source = raw.into_source(&name, &version).map_err(invalid)?;
            if !names.insert(source.name.clone()) {
                return Err(invalid(format!(
                    "source name '{}' is used more than once",
                    source.name
                )));
            }
            sources.push(source);
        }

        let executable =
            required(&self.service.executable, "service.executable").map_err(invalid)?;
        if !is_file_segment(&executable) {
            return Err(invalid(format!(
                "service.executable '{}' must be a file name, not a path",
                executable
            )));
        }
        let start_arguments = self
            .service
            .start_arguments
            .unwrap_or_default()
            .trim()
            .to_string();

        let build = self.build.unwrap_or(BuildToml {
            dir: None,
            template: None,
            run_retention: None,
        });
        let build_dir =
            resolve_config_path(base_dir, build.dir.as_deref().unwrap_or(DEFAULT_BUILD_DIR));
        let template = resolve_config_path(
            base_dir,
            build.template.as_deref().unwrap_or(DEFAULT_TEMPLATE),
        );
        let run_retention = build.run_retention.unwrap_or(DEFAULT_RUN_RETENTION);
        if run_retention == 0 {
            return Err(invalid("build.run_retention must be at least 1".to_string()));
        }

        Ok(InstallerConfig {
            name,
            version,
            build_suffix,
            sources,
            metadata: InstallerMetadata {
                product_name,
                vendor,
                license_file,
                display_name,
                service: ServiceSpec {
                    executable,
                    start_arguments,
                },
                languages,
            },
            template,
            build_dir,
            run_retention,
        })
    }
}

impl SourceToml {
    fn into_source(
        self,
        package_name: &str,
        package_version: &str,
    ) -> std::result::Result<SourceConfig, String> {
        let name = self.name.as_deref().unwrap_or(package_name).trim().to_string();
        if !is_file_segment(&name) {
            return Err(format!("source name '{}' must be a plain file name", name));
        }
        let field = |key: &str| format!("source '{name}' {key}");

        let version = match self.version {
            Some(value) => required(&value, &field("version"))?,
            None => package_version.to_string(),
        };
        if !version.chars().all(is_version_char) {
            return Err(format!(
                "{} '{}' must contain only [0-9A-Za-z.+-]",
                field("version"),
                version
            ));
        }

        let url_template = self.url.trim().to_string();
        if !url_template.contains(VERSION_PARAM) {
            return Err(format!(
                "{} '{}' must contain the {} parameter",
                field("url"),
                url_template,
                VERSION_PARAM
            ));
        }
        if !(url_template.starts_with("https://") || url_template.starts_with("http://")) {
            return Err(format!("{} '{}' must be an http(s) URL", field("url"), url_template));
        }

        let sha256 = match self.sha256 {
            Some(value) => {
                let value = value.trim().to_ascii_lowercase();
                if !is_hex_64(&value) {
                    return Err(format!(
                        "{} '{}' is not a 64-character hex digest",
                        field("sha256"),
                        value
                    ));
                }
                Some(value)
            }
            None => None,
        };

        let kind = match self.kind.or_else(|| SourceKind::infer(&url_template)) {
            Some(kind) => kind,
            None => {
                return Err(format!(
                    "{} cannot be inferred from '{}'; set it to zip, tar.gz or binary",
                    field("kind"),
                    url_template
                ))
            }
        };

        let strip = self
            .strip
            .map(|value| relative_path(&value, &field("strip")))
            .transpose()?;
        let into = self
            .into
            .map(|value| relative_path(&value, &field("into")))
            .transpose()?;

        let file_name = match kind {
            SourceKind::Binary => {
                if strip.is_some() {
                    return Err(format!("{} only applies to archives", field("strip")));
                }
                let url = url_template.replace(VERSION_PARAM, &version);
                let file_name = match self.file_name {
                    Some(value) => value.trim().to_string(),
                    None => last_url_segment(&url).to_string(),
                };
                if !is_file_segment(&file_name) {
                    return Err(format!(
                        "{} '{}' must be a plain file name",
                        field("file_name"),
                        file_name
                    ));
                }
                Some(file_name)
            }
            SourceKind::Zip | SourceKind::TarGz => {
                if self.file_name.is_some() {
                    return Err(format!("{} only applies to binary sources", field("file_name")));
                }
                None
            }
        };

        Ok(SourceConfig {
            name,
            version,
            url_template,
            sha256,
            kind,
            strip,
            into,
            file_name,
        })
    }
}

pub(crate) fn resolve_config_path(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path.trim());
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

pub(crate) fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn required(value: &str, field: &str) -> std::result::Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// A `/`-separated path that stays below the directory it is joined to.
fn relative_path(value: &str, field: &str) -> std::result::Result<PathBuf, String> {
    let trimmed = value.trim().trim_matches('/');
    let segments = trimmed.split('/').collect::<Vec<_>>();
    if trimmed.is_empty() || !segments.iter().all(|segment| is_file_segment(segment)) {
        return Err(format!(
            "{field} '{value}' must be a relative path without '.' or '..' segments"
        ));
    }
    Ok(segments.iter().collect())
}

fn last_url_segment(url: &str) -> &str {
    url.split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+')
}

fn is_file_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains('/')
        && !value.contains('\\')
}

fn is_culture(value: &str) -> bool {
    let mut parts = value.split('-');
    let lang = parts.next().unwrap_or_default();
    let region = parts.next();
    parts.next().is_none()
        && (2..=3).contains(&lang.len())
        && lang.chars().all(|c| c.is_ascii_lowercase())
        && region.map_or(true, |r| {
            r.len() == 2 && r.chars().all(|c| c.is_ascii_uppercase())
        })
}

/// MSI `ProductVersion` is `major.minor.build[.revision]`, all numeric,
/// with major and minor below 256 and build below 65536.
fn validate_msi_version(version: &str) -> Result<()> {
    let parts = version.split('.').collect::<Vec<_>>();
    if !(3..=4).contains(&parts.len()) {
        bail!(
            "package version '{}' must have three or four dot-separated fields",
            version
        );
    }
    let limits = [255u32, 255, 65535, 65535];
    for (part, limit) in parts.iter().zip(limits) {
        let value: u32 = part.parse().with_context(|| {
            format!("package version '{}' has non-numeric field '{}'", version, part)
        })?;
        if value > limit {
            bail!(
                "package version '{}' field '{}' exceeds MSI limit {}",
                version,
                part,
                limit
            );
        }
    }
    Ok(())
}
