use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bundlepack_core::{BundleManifest, DisplayMode, LaunchAction, RestartPolicy};
use bundlepack_engine::{
    run_elevated, BootstrapperApplication, Engine, EngineConfig, EngineContext, EngineOptions,
    ProcessLauncher, RESULT_FATAL,
};
use clap::{ArgGroup, Parser};
use tracing::{error, info};

mod console;
mod logging;
mod render;

use console::ConsoleApplication;
use logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "bundlepack")]
#[command(about = "Installs, repairs, and removes multi-package bundles", long_about = None)]
#[command(group(ArgGroup::new("action").multiple(false)))]
#[command(group(ArgGroup::new("display").multiple(false)))]
#[command(group(ArgGroup::new("restart").multiple(false)))]
struct Cli {
    /// Bundle manifest to run.
    manifest: PathBuf,
    #[arg(long, group = "action")]
    install: bool,
    #[arg(long, group = "action")]
    repair: bool,
    #[arg(long, group = "action")]
    uninstall: bool,
    #[arg(long, group = "action")]
    modify: bool,
    /// Copy the bundle and all payloads into DIR without installing.
    #[arg(long, group = "action", value_name = "DIR", num_args = 0..=1)]
    layout: Option<Option<PathBuf>>,
    #[arg(long, group = "display")]
    quiet: bool,
    #[arg(long, group = "display")]
    passive: bool,
    #[arg(long, group = "display")]
    full: bool,
    #[arg(long, group = "restart")]
    norestart: bool,
    #[arg(long, group = "restart")]
    forcerestart: bool,
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(
        long,
        hide = true,
        num_args = 3,
        value_names = ["ADDR", "SECRET", "PARENT_PID"]
    )]
    elevated: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ElevatedArgs {
    address: String,
    secret: String,
    parent_pid: u32,
}

impl Cli {
    fn launch_action(&self) -> LaunchAction {
        if self.repair {
            LaunchAction::Repair
        } else if self.uninstall {
            LaunchAction::Uninstall
        } else if self.modify {
            LaunchAction::Modify
        } else if self.layout.is_some() {
            LaunchAction::Layout
        } else {
            LaunchAction::Install
        }
    }

    fn display_mode(&self) -> DisplayMode {
        if self.quiet {
            DisplayMode::None
        } else if self.passive {
            DisplayMode::Passive
        } else {
            DisplayMode::Full
        }
    }

    fn restart_policy(&self) -> RestartPolicy {
        if self.norestart {
            RestartPolicy::Never
        } else if self.forcerestart {
            RestartPolicy::Automatic
        } else {
            RestartPolicy::Prompt
        }
    }

    /// `--layout` without a directory lays out into the working directory.
    fn layout_directory(&self) -> Result<Option<PathBuf>> {
        match &self.layout {
            None => Ok(None),
            Some(Some(dir)) => Ok(Some(dir.clone())),
            Some(None) => std::env::current_dir()
                .map(Some)
                .context("failed to resolve current directory for layout"),
        }
    }

    fn engine_options(&self) -> Result<EngineOptions> {
        Ok(EngineOptions {
            action: self.launch_action(),
            display: self.display_mode(),
            restart: self.restart_policy(),
            layout_directory: self.layout_directory()?,
        })
    }

    fn elevated_args(&self) -> Result<Option<ElevatedArgs>> {
        let Some(values) = &self.elevated else {
            return Ok(None);
        };
        let [address, secret, parent_pid] = values.as_slice() else {
            return Err(anyhow!("--elevated takes ADDR SECRET PARENT_PID"));
        };
        let parent_pid = parent_pid
            .parse::<u32>()
            .with_context(|| format!("invalid parent pid '{parent_pid}'"))?;
        Ok(Some(ElevatedArgs {
            address: address.clone(),
            secret: secret.clone(),
            parent_pid,
        }))
    }

    /// Switches the elevated peer must see to build the same context.
    fn forwarded_args(&self) -> Vec<PathBuf> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push(PathBuf::from("--config"));
            args.push(config.clone());
        }
        if let Some(log) = &self.log {
            args.push(PathBuf::from("--log"));
            args.push(log.clone());
        }
        args
    }
}

fn main() {
    let cli = Cli::parse();
    let elevated = cli.elevated.is_some();
    if let Err(err) = init_logging(cli.log.as_deref(), elevated) {
        eprintln!("warning: {err:#}");
    }

    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "bundlepack failed");
            eprintln!("error: {err:#}");
            RESULT_FATAL
        }
    };
    std::process::exit(code as i32);
}

fn run(cli: &Cli) -> Result<u32> {
    let ctx = load_context(cli)?;

    if let Some(args) = cli.elevated_args()? {
        run_elevated(ctx, &args.address, &args.secret, args.parent_pid)?;
        return Ok(0);
    }

    let options = cli.engine_options()?;
    let app = ConsoleApplication::new(options.action, options.display);
    run_bundle(ctx, options, &app)
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}

fn load_manifest(path: &Path) -> Result<(BundleManifest, PathBuf)> {
    let manifest_path = path
        .canonicalize()
        .with_context(|| format!("bundle manifest not found: {}", path.display()))?;
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read bundle manifest: {}", manifest_path.display()))?;
    let manifest = BundleManifest::from_toml_str(&raw)
        .with_context(|| format!("invalid bundle manifest: {}", manifest_path.display()))?;
    Ok((manifest, manifest_path))
}

fn load_context(cli: &Cli) -> Result<EngineContext> {
    let config = load_config(cli.config.as_deref())?;
    let (manifest, manifest_path) = load_manifest(&cli.manifest)?;
    let engine_path = std::env::current_exe().context("failed to resolve engine image path")?;

    let launcher = ProcessLauncher::new(
        engine_path.clone(),
        manifest_path.clone(),
        config.elevation_command.clone(),
    )
    .with_args(cli.forwarded_args());

    let ctx = EngineContext::new(manifest, config, &manifest_path, &engine_path)?
        .with_launcher(Arc::new(launcher));
    Ok(ctx)
}

fn run_bundle(
    ctx: EngineContext,
    options: EngineOptions,
    app: &dyn BootstrapperApplication,
) -> Result<u32> {
    info!(
        bundle = ctx.bundle_id(),
        action = options.action.as_str(),
        "starting bundle"
    );
    let mut engine = Engine::new(ctx, options)?;
    let outcome = engine.run(app)?;
    info!(exit_code = outcome.exit_code, "bundle finished");
    Ok(outcome.exit_code)
}
