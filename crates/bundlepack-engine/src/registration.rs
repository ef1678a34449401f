use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use bundlepack_core::{ActionState, ExecuteOutcome, LaunchAction, ResumeMode};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::EngineContext;
use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists};
use crate::layout::EngineLayout;
use crate::process::describe_command;

/// Inventory entry for an installed bundle, stored as `key=value` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub bundle_id: String,
    pub name: Option<String>,
    pub version: Version,
    pub upgrade_code: Option<String>,
    pub per_machine: bool,
    pub resume_mode: ResumeMode,
    pub engine_path: PathBuf,
    pub manifest_path: PathBuf,
    pub installed_at_unix: u64,
}

/// Persisted reason the last run stopped, plus what it was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeState {
    pub mode: ResumeMode,
    pub action: LaunchAction,
}

/// Another installed bundle sharing this bundle's upgrade code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedBundle {
    pub bundle_id: String,
    pub version: Version,
    pub per_machine: bool,
    pub engine_path: PathBuf,
    pub manifest_path: PathBuf,
}

pub fn write_record(layout: &EngineLayout, record: &RegistrationRecord) -> Result<PathBuf> {
    let mut payload = String::new();
    payload.push_str(&format!("bundle_id={}\n", record.bundle_id));
    if let Some(name) = &record.name {
        payload.push_str(&format!("name={name}\n"));
    }
    payload.push_str(&format!("version={}\n", record.version));
    if let Some(upgrade_code) = &record.upgrade_code {
        payload.push_str(&format!("upgrade_code={upgrade_code}\n"));
    }
    payload.push_str(&format!("per_machine={}\n", record.per_machine));
    payload.push_str(&format!("resume_mode={}\n", record.resume_mode.as_str()));
    payload.push_str(&format!("engine_path={}\n", record.engine_path.display()));
    payload.push_str(&format!("manifest_path={}\n", record.manifest_path.display()));
    payload.push_str(&format!(
        "installed_at_unix={}\n",
        record.installed_at_unix
    ));

    let path = layout.registration_path(&record.bundle_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, payload.as_bytes())
        .with_context(|| format!("failed to write registration: {}", path.display()))?;
    Ok(path)
}

pub fn read_record(layout: &EngineLayout, bundle_id: &str) -> Result<Option<RegistrationRecord>> {
    let path = layout.registration_path(bundle_id);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read registration: {}", path.display()))?;
    parse_record(&raw)
        .with_context(|| format!("failed to parse registration: {}", path.display()))
        .map(Some)
}

pub fn read_records(layout: &EngineLayout) -> Result<Vec<RegistrationRecord>> {
    let dir = layout.registration_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read registration directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|value| value.to_str()) != Some("registration") {
            continue;
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read registration: {}", path.display()))?;
        let record = parse_record(&raw)
            .with_context(|| format!("failed to parse registration: {}", path.display()))?;
        records.push(record);
    }

    records.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
    Ok(records)
}

pub(crate) fn parse_record(raw: &str) -> Result<RegistrationRecord> {
    let mut bundle_id = None;
    let mut name = None;
    let mut version = None;
    let mut upgrade_code = None;
    let mut per_machine = None;
    let mut resume_mode = None;
    let mut engine_path = None;
    let mut manifest_path = None;
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "bundle_id" => bundle_id = Some(v.to_string()),
            "name" => name = Some(v.to_string()),
            "version" => {
                version = Some(Version::parse(v).with_context(|| format!("invalid version: {v}"))?)
            }
            "upgrade_code" => upgrade_code = Some(v.to_string()),
            "per_machine" => {
                per_machine = Some(v.parse::<bool>().context("per_machine must be a bool")?)
            }
            "resume_mode" => resume_mode = Some(ResumeMode::parse(v)?),
            "engine_path" => engine_path = Some(PathBuf::from(v)),
            "manifest_path" => manifest_path = Some(PathBuf::from(v)),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(RegistrationRecord {
        bundle_id: bundle_id.context("missing bundle_id")?,
        name,
        version: version.context("missing version")?,
        upgrade_code,
        per_machine: per_machine.unwrap_or(false),
        resume_mode: resume_mode.unwrap_or_default(),
        engine_path: engine_path.context("missing engine_path")?,
        manifest_path: manifest_path.context("missing manifest_path")?,
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
    })
}

pub fn write_resume_state(layout: &EngineLayout, bundle_id: &str, state: ResumeState) -> Result<()> {
    let path = layout.resume_state_path(bundle_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload = format!(
        "resume_mode={}\naction={}\n",
        state.mode.as_str(),
        state.action.as_str()
    );
    fs::write(&path, payload)
        .with_context(|| format!("failed to write resume state: {}", path.display()))?;
    debug!(path = %path.display(), mode = state.mode.as_str(), "wrote resume state");
    Ok(())
}

pub fn read_resume_state(layout: &EngineLayout, bundle_id: &str) -> Result<Option<ResumeState>> {
    let path = layout.resume_state_path(bundle_id);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read resume state: {}", path.display()))?;
    let mut mode = None;
    let mut action = None;
    for line in raw.lines().map(str::trim) {
        match line.split_once('=') {
            Some(("resume_mode", v)) => mode = Some(ResumeMode::parse(v)?),
            Some(("action", v)) => action = Some(LaunchAction::parse(v)?),
            _ => {}
        }
    }
    Ok(Some(ResumeState {
        mode: mode.with_context(|| format!("missing resume_mode in {}", path.display()))?,
        action: action.unwrap_or_default(),
    }))
}

pub fn remove_resume_state(layout: &EngineLayout, bundle_id: &str) -> Result<()> {
    let path = layout.resume_state_path(bundle_id);
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to remove resume state: {}", path.display()))
}

pub fn save_variables(layout: &EngineLayout, bundle_id: &str, bytes: &[u8]) -> Result<()> {
    let path = layout.variables_path(bundle_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, bytes)
        .with_context(|| format!("failed to write persisted variables: {}", path.display()))
}

pub fn load_variables(layout: &EngineLayout, bundle_id: &str) -> Result<Option<Vec<u8>>> {
    let path = layout.variables_path(bundle_id);
    if !path.exists() {
        return Ok(None);
    }
    fs::read(&path)
        .with_context(|| format!("failed to read persisted variables: {}", path.display()))
        .map(Some)
}

/// Opens a registration session in the bundle's own scope: caches the engine
/// and manifest so the bundle can later be repaired or removed, and records
/// the bundle with an active resume mode.
pub fn begin_session(ctx: &EngineContext, action: LaunchAction) -> Result<RegistrationRecord> {
    let layout = ctx.registration_layout();
    layout.ensure_base_dirs()?;
    let bundle = &ctx.manifest.bundle;

    let cache_dir = layout.bundle_cache_dir(&bundle.id);
    fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create {}", cache_dir.display()))?;
    let engine_path = cache_file(&ctx.engine_path, &cache_dir)?;
    let manifest_path = cache_file(&ctx.manifest_path, &cache_dir)?;

    let installed_at_unix = match read_record(layout, &bundle.id)? {
        Some(existing) => existing.installed_at_unix,
        None => now_unix()?,
    };
    let record = RegistrationRecord {
        bundle_id: bundle.id.clone(),
        name: bundle.name.clone(),
        version: bundle.version.clone(),
        upgrade_code: bundle.upgrade_code.clone(),
        per_machine: bundle.per_machine,
        resume_mode: ResumeMode::Active,
        engine_path,
        manifest_path,
        installed_at_unix,
    };
    write_record(layout, &record)?;
    write_resume_state(
        layout,
        &bundle.id,
        ResumeState {
            mode: ResumeMode::Active,
            action,
        },
    )?;
    info!(bundle = %bundle.id, scope = %layout.root().display(), "registration session started");
    Ok(record)
}

/// Records why the session is pausing (suspend, restart) or that it
/// completed with the bundle kept installed (`Arp`).
pub fn resume_session(ctx: &EngineContext, mode: ResumeMode, action: LaunchAction) -> Result<()> {
    let layout = ctx.registration_layout();
    let bundle_id = ctx.bundle_id();
    if let Some(mut record) = read_record(layout, bundle_id)? {
        record.resume_mode = mode;
        write_record(layout, &record)?;
    }
    if mode.is_resumable() {
        write_resume_state(layout, bundle_id, ResumeState { mode, action })?;
    } else {
        remove_resume_state(layout, bundle_id)?;
    }
    debug!(bundle = bundle_id, mode = mode.as_str(), "registration resume mode updated");
    Ok(())
}

/// Closes the session. A kept registration stays in the inventory with
/// `Arp` resume mode; otherwise every trace of the bundle is removed.
pub fn end_session(ctx: &EngineContext, keep: bool) -> Result<()> {
    let layout = ctx.registration_layout();
    let bundle_id = ctx.bundle_id();
    if keep {
        resume_session(ctx, ResumeMode::Arp, LaunchAction::Install)?;
        info!(bundle = bundle_id, "registration kept");
        return Ok(());
    }

    remove_file_if_exists(&layout.registration_path(bundle_id))
        .context("failed to remove registration")?;
    remove_resume_state(layout, bundle_id)?;
    remove_file_if_exists(&layout.variables_path(bundle_id))
        .context("failed to remove persisted variables")?;
    remove_dir_if_exists(&layout.bundle_cache_dir(bundle_id))
        .context("failed to remove cached engine")?;
    info!(bundle = bundle_id, "registration removed");
    Ok(())
}

/// Installed bundles in either scope sharing this bundle's upgrade code.
pub fn list_related(ctx: &EngineContext) -> Result<Vec<RelatedBundle>> {
    let Some(upgrade_code) = ctx.manifest.bundle.upgrade_code.as_deref() else {
        return Ok(Vec::new());
    };

    let mut related = Vec::new();
    for layout in [&ctx.user_layout, &ctx.machine_layout] {
        for record in read_records(layout)? {
            if record.bundle_id == ctx.bundle_id()
                || record.upgrade_code.as_deref() != Some(upgrade_code)
            {
                continue;
            }
            related.push(RelatedBundle {
                bundle_id: record.bundle_id,
                version: record.version,
                per_machine: record.per_machine,
                engine_path: record.engine_path,
                manifest_path: record.manifest_path,
            });
        }
    }
    related.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
    related.dedup_by(|a, b| a.bundle_id == b.bundle_id);
    Ok(related)
}

/// Runs a related bundle's cached engine unattended.
pub fn execute_related_bundle(
    ctx: &EngineContext,
    related: &RelatedBundle,
    action: ActionState,
) -> Result<ExecuteOutcome> {
    let switch = match action {
        ActionState::None => return Ok(ExecuteOutcome::Success),
        ActionState::Install => "--install",
        ActionState::Repair => "--repair",
        ActionState::Uninstall => "--uninstall",
    };
    let mut command = Command::new(&related.engine_path);
    command
        .arg(&related.manifest_path)
        .arg(switch)
        .arg("--quiet")
        .arg("--norestart");
    info!(
        related = %related.bundle_id,
        command = %describe_command(&command),
        "executing related bundle"
    );
    let output = ctx.runner.run(&mut command)?;
    Ok(match output.code {
        0 => ExecuteOutcome::Success,
        3010 => ExecuteOutcome::RebootRequired,
        1641 => ExecuteOutcome::RebootForced,
        code => ExecuteOutcome::Error(code),
    })
}

fn cache_file(source: &Path, dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| anyhow!("path has no file name: {}", source.display()))?;
    let destination = dir.join(name);
    if destination != source {
        fs::copy(source, &destination).with_context(|| {
            format!("failed to cache {} to {}", source.display(), destination.display())
        })?;
    }
    Ok(destination)
}

fn now_unix() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?
        .as_secs())
}
