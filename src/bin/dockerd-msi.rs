use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use dockerd_msi::compose::wix::WixToolset;
use dockerd_msi::compose::write_installer_source;
use dockerd_msi::extract::assemble_payload;
use dockerd_msi::fetch::{ArchiveRef, FetchOutcome, Fetcher, HttpTransport};
use dockerd_msi::pipeline::BuildLock;
use dockerd_msi::{interrupt, preflight, runs};
use dockerd_msi::{BuildLayout, DefaultStages, InstallerConfig, Pipeline, DEFAULT_CONFIG_FILENAME};

fn usage() -> &'static str {
    "Usage:\n  dockerd-msi build [config]\n  dockerd-msi fetch [config]\n  dockerd-msi extract [config]\n  dockerd-msi render [config]\n  dockerd-msi preflight [config]\n  dockerd-msi runs [config]\n\n[config] defaults to ./installer.toml"
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    interrupt::install_handlers()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, config_path) = match args.as_slice() {
        [command] => (command.as_str(), PathBuf::from(DEFAULT_CONFIG_FILENAME)),
        [command, config] => (command.as_str(), PathBuf::from(config)),
        _ => bail!(usage()),
    };

    match command {
        "build" => build(&config_path),
        "fetch" => fetch(&config_path),
        "extract" => extract(&config_path),
        "render" => render(&config_path),
        "preflight" => run_preflight(&config_path),
        "runs" => list_runs(&config_path),
        "help" | "-h" | "--help" => {
            println!("{}", usage());
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn load(config_path: &Path) -> Result<(InstallerConfig, BuildLayout)> {
    let config = InstallerConfig::load(config_path)?;
    let layout = BuildLayout::for_config(&config);
    Ok((config, layout))
}

fn build(config_path: &Path) -> Result<()> {
    let (config, _) = load(config_path)?;
    preflight::check_host(&config).context("preflight checks failed")?;

    let cancel = interrupt::process_flag();
    let stages = DefaultStages::new(
        Fetcher::new(HttpTransport::new()?, cancel.clone()),
        WixToolset::locate()?,
    );
    let mut pipeline = Pipeline::new(&config, stages, cancel);
    let report = pipeline
        .produce_installer()
        .with_context(|| format!("building installer for {} {}", config.name, config.version))?;
    println!(
        "[build:{}] run {} passed; installer at {}",
        config.name,
        report.run_id,
        report.artifact.display()
    );
    Ok(())
}

fn fetch(config_path: &Path) -> Result<()> {
    let (config, layout) = load(config_path)?;
    let _lock = BuildLock::acquire(&layout.lock_path)?;
    fetch_sources(&config, &layout)
}

fn extract(config_path: &Path) -> Result<()> {
    let (config, layout) = load(config_path)?;
    let _lock = BuildLock::acquire(&layout.lock_path)?;
    fetch_sources(&config, &layout)?;
    extract_payload(&config, &layout)
}

/// Fetch, extract and write the installer source without packaging it.
fn render(config_path: &Path) -> Result<()> {
    let (config, layout) = load(config_path)?;
    let _lock = BuildLock::acquire(&layout.lock_path)?;
    fetch_sources(&config, &layout)?;
    extract_payload(&config, &layout)?;
    let source = write_installer_source(&config, &layout)?;
    println!("[render:{}] installer source at {}", config.name, source.display());
    Ok(())
}

fn fetch_sources(config: &InstallerConfig, layout: &BuildLayout) -> Result<()> {
    let fetcher = Fetcher::new(HttpTransport::new()?, interrupt::process_flag());
    for source in &config.sources {
        let download = ArchiveRef::for_source(source, layout);
        let outcome = fetcher
            .ensure(&download)
            .with_context(|| format!("fetching source '{}' {}", source.name, source.version))?;
        let verb = match outcome {
            FetchOutcome::AlreadyPresent => "already present at",
            FetchOutcome::Downloaded => "downloaded to",
        };
        println!("[fetch:{}] {} {}", source.name, verb, download.dest.display());
    }
    Ok(())
}

fn extract_payload(config: &InstallerConfig, layout: &BuildLayout) -> Result<()> {
    let assembled = assemble_payload(&config.sources, layout, &interrupt::process_flag())
        .with_context(|| format!("assembling payload for {} {}", config.name, config.version))?;
    println!(
        "[extract:{}] {} files from {} sources in {}",
        config.name,
        assembled.files,
        assembled.sources,
        assembled.root.display()
    );
    Ok(())
}

fn run_preflight(config_path: &Path) -> Result<()> {
    let (config, _) = load(config_path)?;
    preflight::check_host(&config)?;
    println!("[preflight:{}] host ready", config.name);
    Ok(())
}

fn list_runs(config_path: &Path) -> Result<()> {
    let (_, layout) = load(config_path)?;
    let all = runs::load_runs_metadata(&layout.runs_dir)?;
    if all.is_empty() {
        println!("no runs recorded in {}", layout.runs_dir.display());
        return Ok(());
    }
    if let Some(good) = runs::latest_successful_run(&layout.runs_dir)? {
        println!(
            "last good installer: {} (run {})",
            good.artifact_path.as_deref().unwrap_or("-"),
            good.run_id
        );
    }
    for run in all {
        println!(
            "{}  {:<8}  {}  {}  {}",
            run.run_id,
            run.status,
            run.package_version,
            run.finished_at_utc.as_deref().unwrap_or(&run.created_at_utc),
            run.artifact_path
                .as_deref()
                .or(run.error.as_deref())
                .unwrap_or("-")
        );
    }
    Ok(())
}
