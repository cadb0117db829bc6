// shader-inspect: compile, reflect and validate shaders without a GPU
//
// Loads every file through a ShaderRegistry backed by the disk and a
// HeadlessDevice, prints the reflected interface of each unit and, with
// --pipeline, assembles them into one pipeline to check the stage
// combination and the merged layout. --watch keeps polling and reports
// every reload until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use prism_common::DiskFileSystem;
use prism_renderer::{
    ComputePipelineBuilder, GpuDevice, HeadlessDevice, PipelineBuilder, PipelineError,
    ShaderConfig, ShaderError, ShaderRegistry, ShaderStage, ShaderUnit, SharedShader,
};
use thiserror::Error;

const USAGE: &str = "usage: shader-inspect [--root DIR]... [--json] [--pipeline] [--watch] FILE...";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
enum ToolError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, PartialEq)]
struct Options {
    roots: Vec<PathBuf>,
    json: bool,
    pipeline: bool,
    watch: bool,
    files: Vec<PathBuf>,
}

impl Options {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, ToolError> {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--root" => {
                    let dir = args
                        .next()
                        .ok_or_else(|| ToolError::Usage("--root needs a directory".to_string()))?;
                    options.roots.push(PathBuf::from(dir));
                }
                "--json" => options.json = true,
                "--pipeline" => options.pipeline = true,
                "--watch" => options.watch = true,
                flag if flag.starts_with("--") => {
                    return Err(ToolError::Usage(format!("unknown option {flag}")));
                }
                file => options.files.push(PathBuf::from(file)),
            }
        }

        if options.files.is_empty() {
            return Err(ToolError::Usage("no shader files given".to_string()));
        }
        Ok(options)
    }

    fn config(&self) -> ShaderConfig {
        let mut config = ShaderConfig::default();
        if !self.roots.is_empty() {
            config.search_paths = self.roots.clone();
        }
        config.validated()
    }
}

/// Print one unit. Returns whether it compiled.
fn report(unit: &ShaderUnit, json: bool) -> Result<bool, ToolError> {
    if json {
        println!("{}", serde_json::to_string_pretty(&unit.analysis())?);
    } else {
        print!("{}", unit.layout_report());
    }
    if !unit.is_valid() {
        log::warn!("{} did not compile", unit.path().display());
    }
    Ok(unit.is_valid())
}

fn validate_pipeline(device: &Arc<dyn GpuDevice>, units: &[SharedShader]) -> Result<(), PipelineError> {
    if let [single] = units {
        if single.read().stage() == ShaderStage::Compute {
            ComputePipelineBuilder::new(Arc::clone(device), single)?.build()?;
            println!("compute pipeline OK");
            return Ok(());
        }
    }

    let mut builder = PipelineBuilder::new(Arc::clone(device));
    for unit in units {
        builder.add_shader(unit)?;
    }
    let pipeline = builder.build()?;
    if let Some(pipeline_type) = pipeline.pipeline_type() {
        println!(
            "{pipeline_type} pipeline OK, {} descriptor sets",
            pipeline.set_layouts().len()
        );
    }
    Ok(())
}

fn check_pipeline(device: &Arc<dyn GpuDevice>, units: &[SharedShader]) -> bool {
    match validate_pipeline(device, units) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Pipeline check failed: {e}");
            false
        }
    }
}

fn watch(registry: &mut ShaderRegistry, units: &[SharedShader], options: &Options) -> Result<(), ToolError> {
    log::info!("Watching {} shaders, press Ctrl-C to stop", units.len());
    loop {
        std::thread::sleep(POLL_INTERVAL);

        let summary = registry.update();
        for (path, e) in &summary.failed {
            log::error!("{}: {e}", path.display());
        }
        if summary.reloaded.is_empty() {
            continue;
        }

        for unit in units {
            let unit = unit.read();
            if summary.reloaded.iter().any(|p| p.as_path() == unit.path()) {
                report(&unit, options.json)?;
            }
        }
        if options.pipeline {
            check_pipeline(registry.device(), units);
        }
    }
}

fn run(options: &Options) -> Result<bool, ToolError> {
    let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
    let mut registry = ShaderRegistry::new(options.config(), device, Arc::new(DiskFileSystem));

    let mut units = Vec::with_capacity(options.files.len());
    for file in &options.files {
        units.push(registry.load(file)?);
    }

    let mut ok = true;
    for unit in &units {
        ok &= report(&unit.read(), options.json)?;
    }
    if options.pipeline {
        ok &= check_pipeline(registry.device(), &units);
    }

    if options.watch {
        watch(&mut registry, &units, options)?;
    }
    Ok(ok)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = match Options::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    match run(&options) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
