use anyhow::{Context, Result, bail};
use opsin_vision::core_modules::utils::image_helper::{
    ColorMode, ImageDirectorySink, ImageDirectorySource, save_tensor,
};
use opsin_vision::parallel_pipeline::BatchPool;
use opsin_vision::pipeline::{AfterimagePipeline, StopHandle, Termination};
use opsin_vision::{ConeRodExcitation, ExcitationAdapter, PassThrough, SimulationConfig};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str =
    "Usage: sequence_tester [--stills] [--gray] <input_dir> <output_dir> [config.json|spectral] [alpha_blend]";

struct Args {
    stills: bool,
    gray: bool,
    input_dir: PathBuf,
    output_dir: PathBuf,
    config: Option<String>,
    alpha_blend: Option<f32>,
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|a| a == flag) {
        Some(i) => {
            args.remove(i);
            true
        }
        None => false,
    }
}

fn parse_args() -> Result<Option<Args>> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let stills = take_flag(&mut args, "--stills");
    let gray = take_flag(&mut args, "--gray");
    if args.len() < 2 {
        println!("{USAGE}");
        return Ok(None);
    }
    let alpha_blend = args
        .get(3)
        .map(|raw| raw.parse::<f32>().with_context(|| format!("invalid alpha_blend {raw:?}")))
        .transpose()?;
    Ok(Some(Args {
        stills,
        gray,
        input_dir: PathBuf::from(&args[0]),
        output_dir: PathBuf::from(&args[1]),
        config: args.get(2).cloned(),
        alpha_blend,
    }))
}

/// Resolves the config argument into a configuration, its excitation adapter
/// and the colour mode frames should be decoded in.
fn load_config(args: &Args) -> Result<(SimulationConfig, Arc<dyn ExcitationAdapter>, ColorMode)> {
    let mode = if args.gray { ColorMode::Luma } else { ColorMode::Rgb };
    match args.config.as_deref() {
        None => Ok((SimulationConfig::default(), pass_through(), mode)),
        Some("spectral") => {
            if args.gray {
                bail!("the spectral preset needs colour frames");
            }
            let adapter: Arc<dyn ExcitationAdapter> = Arc::new(ConeRodExcitation);
            Ok((SimulationConfig::spectral(), adapter, mode))
        }
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?;
            let config = SimulationConfig::from_json(&json)
                .with_context(|| format!("parsing config file {path}"))?;
            Ok((config, pass_through(), mode))
        }
    }
}

fn pass_through() -> Arc<dyn ExcitationAdapter> {
    Arc::new(PassThrough)
}

/// Requests a stop on the first Ctrl-C.
fn install_interrupt(stop: &StopHandle) {
    let stop = stop.clone();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build();
        watch_interrupt(runtime, &stop);
    });
}

/// Blocks until Ctrl-C. Returns false when no runtime could be built to listen on.
fn watch_interrupt(runtime: std::io::Result<tokio::runtime::Runtime>, stop: &StopHandle) -> bool {
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!(error = %err, "Ctrl-C handling unavailable, the run can only end on its own");
            return false;
        }
    };
    runtime.block_on(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current frame");
            stop.request_stop();
        }
    });
    true
}

fn run_sequence(
    args: &Args,
    config: SimulationConfig,
    adapter: Arc<dyn ExcitationAdapter>,
    mode: ColorMode,
) -> Result<()> {
    let source = ImageDirectorySource::open(&args.input_dir, mode)
        .with_context(|| format!("listing {}", args.input_dir.display()))?;
    info!(frames = source.paths().len(), input = %args.input_dir.display(), "found input frames");

    let mut sink = ImageDirectorySink::new(&args.output_dir)?;
    if let Some(alpha_blend) = args.alpha_blend {
        sink = sink.with_blended(alpha_blend)?;
    }

    let stop = StopHandle::new();
    install_interrupt(&stop);

    let pipeline = AfterimagePipeline::with_adapter(config, adapter)?;
    let report = pipeline.run(source, &mut sink, &stop);

    for skipped in &report.skipped {
        warn!(path = %skipped.path.display(), "frame was skipped");
    }
    match report.termination {
        Termination::Exhausted => info!(emitted = report.emitted, "sequence complete"),
        Termination::Cancelled => info!(emitted = report.emitted, "sequence cancelled"),
        Termination::Failed(err) => {
            error!(emitted = report.emitted, "sequence failed");
            return Err(err).context("sequence simulation failed");
        }
    }
    Ok(())
}

fn run_stills(
    args: &Args,
    config: SimulationConfig,
    adapter: Arc<dyn ExcitationAdapter>,
    mode: ColorMode,
) -> Result<()> {
    let mut frames = Vec::new();
    for item in ImageDirectorySource::open(&args.input_dir, mode)? {
        match item {
            Ok(frame) => frames.push(frame),
            Err(err) => warn!(error = %err, "skipping unreadable still"),
        }
    }
    info!(stills = frames.len(), "simulating stills in parallel");

    let out_dir = args.output_dir.join("stills");
    std::fs::create_dir_all(&out_dir)?;

    let workers = worker_count(env::var("OPSIN_WORKERS").ok().as_deref())?;
    info!(workers, "starting batch pool");

    let runtime = tokio::runtime::Runtime::new()?;
    let results = runtime.block_on(async {
        let pool = BatchPool::with_adapter(config, adapter, workers)?;
        anyhow::Ok(pool.process_batch(frames).await)
    })?;

    let mut failed = 0;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(output) => save_still(&out_dir, index, &output.afterimage)?,
            Err(err) => {
                failed += 1;
                error!(index, error = %err, "still failed");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} stills failed");
    }
    Ok(())
}

fn save_still(dir: &Path, index: usize, afterimage: &opsin_vision::Tensor) -> Result<()> {
    let path = dir.join(format!("frame_{index:04}.png"));
    save_tensor(&path, afterimage).with_context(|| format!("writing {}", path.display()))
}

/// Worker count from an `OPSIN_WORKERS` override, one per logical CPU otherwise.
fn worker_count(raw: Option<&str>) -> Result<usize> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid OPSIN_WORKERS {raw:?}")),
        None => Ok(num_cpus::get()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };
    let (config, adapter, mode) = load_config(&args)?;
    info!(adapter = adapter.name(), stills = args.stills, "starting");

    if args.stills {
        run_stills(&args, config, adapter, mode)
    } else {
        run_sequence(&args, config, adapter, mode)
    }
}
