//! Installer composer.
//!
//! Renders the installer-definition template against the extracted payload
//! and the configured metadata, then hands the rendered source to a
//! [`Packager`] (normally [`wix::WixToolset`]). The installer is packaged
//! under a temporary name in the output directory and renamed into place,
//! so the artifact path only ever holds a complete installer.

pub mod harvest;
pub mod template;
pub mod wix;

use anyhow::{bail, Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::InstallerConfig;
use crate::layout::BuildLayout;
use crate::runs::write_atomic;
use harvest::{harvest, stable_guid, ServiceRegistration};
use template::TemplateValues;

/// Everything a packager needs for one installer build.
#[derive(Debug, Clone, Copy)]
pub struct PackageJob<'a> {
    /// Rendered installer source.
    pub source: &'a Path,
    /// Where the installer must be written.
    pub output: &'a Path,
    /// Directories relative `Source` attributes resolve against.
    pub bind_paths: &'a [PathBuf],
    pub cultures: &'a [String],
}

/// Turns a rendered installer source into an installer file.
pub trait Packager {
    fn package(&self, job: &PackageJob<'_>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedInstaller {
    pub source: String,
    pub upgrade_code: String,
    pub files: usize,
}

/// Upgrade code shared by every version of the product.
pub fn upgrade_code(config: &InstallerConfig) -> String {
    stable_guid(
        "upgrade",
        &format!("{}\n{}", config.metadata.vendor, config.name),
    )
}

/// Render the installer source for the payload at `payload_dir`.
///
/// The result depends only on the payload's relative layout and the
/// configuration, never on absolute paths or the clock.
pub fn render_installer_source(
    config: &InstallerConfig,
    payload_dir: &Path,
) -> Result<RenderedInstaller> {
    let meta = &config.metadata;
    let template_text = fs::read_to_string(&config.template)
        .with_context(|| format!("reading installer template '{}'", config.template.display()))?;
    let license_name = license_file_name(&meta.license_file)?;

    let upgrade_code = upgrade_code(config);
    let service = ServiceRegistration {
        executable: meta.service.executable.clone(),
        name: meta.display_name.clone(),
        display_name: meta.display_name.clone(),
        arguments: meta.service.render_start_arguments(&meta.display_name),
    };
    let harvested = harvest(payload_dir, &upgrade_code, &service)?;

    let values = TemplateValues::new()
        .text("PRODUCT_NAME", &meta.product_name)
        .text("VENDOR", &meta.vendor)
        .text("VERSION", &config.package_version())
        .text("UPGRADE_CODE", &upgrade_code)
        .text("LICENSE_FILE", license_name)
        .text("LANGUAGES", &meta.languages.join(","))
        .text("SERVICE_NAME", &service.name)
        .markup("FILES", harvested.directories)
        .markup("COMPONENT_REFS", harvested.component_refs);
    let source = template::render(&template_text, &values)
        .with_context(|| format!("rendering installer template '{}'", config.template.display()))?;

    Ok(RenderedInstaller {
        source,
        upgrade_code,
        files: harvested.files,
    })
}

/// Render the installer source and write it next to the artifact.
pub fn write_installer_source(config: &InstallerConfig, layout: &BuildLayout) -> Result<PathBuf> {
    let rendered = render_installer_source(config, &layout.payload_dir)?;
    write_atomic(&layout.rendered_source_path, rendered.source.as_bytes()).with_context(|| {
        format!(
            "writing installer source '{}'",
            layout.rendered_source_path.display()
        )
    })?;
    info!(
        "[compose] rendered {} ({} files)",
        layout.rendered_source_path.display(),
        rendered.files
    );
    Ok(layout.rendered_source_path.clone())
}

/// Compose the installer artifact from the extracted payload.
pub fn compose_installer(
    packager: &dyn Packager,
    config: &InstallerConfig,
    layout: &BuildLayout,
) -> Result<PathBuf> {
    let license = &config.metadata.license_file;
    if !license.is_file() {
        bail!("license file not found: {}", license.display());
    }
    let source = write_installer_source(config, layout)?;

    let mut bind_paths = vec![layout.payload_dir.clone()];
    if let Some(license_dir) = license.parent().filter(|p| !p.as_os_str().is_empty()) {
        bind_paths.push(license_dir.to_path_buf());
    }

    let partial = tempfile::Builder::new()
        .prefix(".compose-")
        .suffix(".msi")
        .tempfile_in(&layout.output_dir)
        .with_context(|| {
            format!(
                "creating temporary installer in '{}'",
                layout.output_dir.display()
            )
        })?
        .into_temp_path();

    packager.package(&PackageJob {
        source: &source,
        output: &partial,
        bind_paths: &bind_paths,
        cultures: &config.metadata.languages,
    })?;

    let size = fs::metadata(&partial)
        .with_context(|| format!("inspecting packaged installer '{}'", partial.display()))?
        .len();
    if size == 0 {
        bail!("packager produced an empty installer for '{}'", source.display());
    }
    partial.persist(&layout.artifact_path).with_context(|| {
        format!(
            "moving installer into place at '{}'",
            layout.artifact_path.display()
        )
    })?;

    info!(
        "[compose] installer at {} ({} bytes)",
        layout.artifact_path.display(),
        size
    );
    Ok(layout.artifact_path.clone())
}

fn license_file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("license file '{}' has no usable file name", path.display()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use std::cell::RefCell;
    use tempfile::TempDir;

    pub(crate) const TEMPLATE: &str = r#"<Wix xmlns="http://wixtoolset.org/schemas/v4/wxs">
  <Package Name="{{PRODUCT_NAME}}" Manufacturer="{{VENDOR}}" Version="{{VERSION}}" UpgradeCode="{{UPGRADE_CODE}}" Language="{{LANGUAGES}}">
    <WixVariable Id="WixUILicenseRtf" Value="{{LICENSE_FILE}}" />
    <StandardDirectory Id="ProgramFiles64Folder">
      <Directory Id="INSTALLFOLDER" Name="{{SERVICE_NAME}}">
{{FILES}}
      </Directory>
    </StandardDirectory>
    <Feature Id="Main">
{{COMPONENT_REFS}}
    </Feature>
  </Package>
</Wix>
"#;

    /// Copies the rendered source to the output and records each job.
    #[derive(Default)]
    pub(crate) struct CopyPackager {
        pub(crate) jobs: RefCell<Vec<(PathBuf, Vec<PathBuf>, Vec<String>)>>,
    }

    impl Packager for CopyPackager {
        fn package(&self, job: &PackageJob<'_>) -> Result<()> {
            fs::copy(job.source, job.output)?;
            self.jobs.borrow_mut().push((
                job.source.to_path_buf(),
                job.bind_paths.to_vec(),
                job.cultures.to_vec(),
            ));
            Ok(())
        }
    }

    struct FailingPackager;

    impl Packager for FailingPackager {
        fn package(&self, job: &PackageJob<'_>) -> Result<()> {
            fs::write(job.output, b"partial")?;
            bail!("wix build failed: WIX0001")
        }
    }

    /// Config rooted at `root` with the template, license and payload in place.
    pub(crate) fn fixture(root: &Path) -> (InstallerConfig, BuildLayout) {
        fs::create_dir_all(root.join("packaging")).unwrap();
        fs::write(root.join("packaging/installer.wxs"), TEMPLATE).unwrap();
        fs::write(root.join("packaging/LICENSE.rtf"), b"{\\rtf1 license}").unwrap();
        let config = InstallerConfig::from_toml_str(SAMPLE, root, Path::new("installer.toml"))
            .unwrap();
        let layout = BuildLayout::for_config(&config);
        (config, layout)
    }

    fn payload(layout: &BuildLayout) {
        let dir = &layout.payload_dir;
        fs::create_dir_all(dir.join("licenses")).unwrap();
        fs::write(dir.join("dockerd.exe"), b"MZ-dockerd").unwrap();
        fs::write(dir.join("docker.exe"), b"MZ-docker").unwrap();
        fs::write(dir.join("licenses/LICENSE"), b"Apache-2.0").unwrap();
        fs::create_dir_all(&layout.output_dir).unwrap();
    }

    #[test]
    fn rendered_source_carries_metadata() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        payload(&layout);

        let rendered = render_installer_source(&config, &layout.payload_dir).unwrap();
        assert_eq!(rendered.files, 3);
        let source = rendered.source;
        assert!(source.contains("Manufacturer=\"Acme\""), "{source}");
        assert!(source.contains("Version=\"20.10.7.1\""));
        assert!(source.contains("Language=\"en-US\""));
        assert!(source.contains("Value=\"LICENSE.rtf\""));
        assert!(source.contains(&format!("UpgradeCode=\"{}\"", rendered.upgrade_code)));
        assert!(source.contains(
            "Arguments=\"--run-service --service-name Docker Engine --host npipe:////./pipe/docker_engine\""
        ));
        assert!(!source.contains(&tmp.path().display().to_string()));
        assert!(!source.contains("{{"));
    }

    #[test]
    fn compose_moves_installer_into_place() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        payload(&layout);
        let packager = CopyPackager::default();

        let artifact = compose_installer(&packager, &config, &layout).unwrap();
        assert_eq!(artifact, layout.artifact_path);
        assert_eq!(
            fs::read(&artifact).unwrap(),
            fs::read(&layout.rendered_source_path).unwrap()
        );

        let jobs = packager.jobs.borrow();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].1,
            vec![layout.payload_dir.clone(), tmp.path().join("packaging")]
        );
        assert_eq!(jobs[0].2, vec!["en-US".to_string()]);

        let leftovers = fs::read_dir(&layout.output_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".compose-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn failed_packaging_leaves_no_artifact() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        payload(&layout);

        let err = compose_installer(&FailingPackager, &config, &layout).unwrap_err();
        assert!(format!("{err:#}").contains("WIX0001"));
        assert!(!layout.artifact_path.exists());
        let entries = fs::read_dir(&layout.output_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert!(entries.iter().all(|name| name.ends_with(".wxs")), "{entries:?}");
    }

    #[test]
    fn missing_payload_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        fs::create_dir_all(&layout.output_dir).unwrap();

        let err = compose_installer(&CopyPackager::default(), &config, &layout).unwrap_err();
        assert!(format!("{err:#}").contains("payload directory not found"));
        assert!(!layout.artifact_path.exists());
    }

    #[test]
    fn missing_license_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let (config, layout) = fixture(tmp.path());
        payload(&layout);
        fs::remove_file(tmp.path().join("packaging/LICENSE.rtf")).unwrap();

        let err = compose_installer(&CopyPackager::default(), &config, &layout).unwrap_err();
        assert!(err.to_string().contains("license file not found"));
    }

    #[test]
    fn shipped_template_renders() {
        let tmp = TempDir::new().unwrap();
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        let config = InstallerConfig::load(&root.join("installer.toml")).unwrap();
        let payload_dir = tmp.path().join("docker");
        fs::create_dir_all(&payload_dir).unwrap();
        fs::write(payload_dir.join("dockerd.exe"), b"MZ").unwrap();

        let rendered = render_installer_source(&config, &payload_dir).unwrap();
        assert!(rendered.source.contains("Version=\"20.10.7.1\""));
        assert!(rendered.source.contains("<ServiceInstall "));
        assert!(rendered.source.contains("<ComponentRef Id=\"cmp_"));
    }
}
