// THEORY:
// The daemon binary. It turns a configuration file into a running `SentryService`:
//
// 1.  Parse arguments and load the layered settings. Any problem here is fatal and
//     is reported before a device is touched.
// 2.  Install logging (stderr, or an append-only file).
// 3.  `--dry-run` stops here after printing the effective configuration.
// 4.  Locate ffmpeg, start capture, and run the service on a multi-threaded runtime
//     until SIGINT/SIGTERM (or the end of the capture stream).

mod cli;
mod ffmpeg_capture;
mod ffmpeg_encoder;
mod logging;
mod settings;

use anyhow::{Context, Result};
use motion_sentry::core_modules::hooks::ShellRunner;
use motion_sentry::{PipelineStats, SentryConfig, SentryService};
use std::env;
use std::sync::Arc;
use tokio::sync::watch;

use crate::cli::{CliArgs, Invocation};
use crate::ffmpeg_capture::FfmpegCapture;
use crate::ffmpeg_encoder::FfmpegEncoderFactory;

fn main() -> Result<()> {
    // --- 1. Argument Parsing & Settings ---
    let args = match cli::parse(env::args().skip(1)) {
        Ok(Invocation::Run(args)) => args,
        Ok(Invocation::Help) => {
            println!("{}", cli::USAGE);
            return Ok(());
        }
        Err(err) => {
            eprintln!("{err}\n{}", cli::USAGE);
            std::process::exit(2);
        }
    };
    let config = settings::load(&args.config)?;

    // --- 2. Logging ---
    logging::init(&config.log.level, args.log_output.as_deref())?;
    tracing::info!(path = %args.config.display(), "configuration loaded");

    // --- 3. Dry Run ---
    if args.dry_run {
        println!("{config:#?}");
        println!("Dry run: configuration is valid, not starting capture.");
        return Ok(());
    }

    // --- 4. Runtime ---
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;
    let stats = runtime.block_on(run(config, &args))?;

    tracing::info!(
        frames = stats.frames_processed,
        events = stats.events_started,
        recordings = stats.recordings_finalized,
        recording_failures = stats.recording_failures,
        detector_faults = stats.detector_faults,
        capture_gaps = stats.capture_gaps,
        "motion sentry stopped"
    );
    Ok(())
}

async fn run(config: SentryConfig, args: &CliArgs) -> Result<PipelineStats> {
    let ffmpeg = which::which("ffmpeg").context("ffmpeg was not found in PATH")?;
    tracing::debug!(ffmpeg = %ffmpeg.display(), config = %args.config.display(), "external tools located");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => tracing::warn!(signal, "received signal, shutting down"),
            Err(err) => tracing::error!(error = %err, "signal handling failed, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let source = FfmpegCapture::spawn(&ffmpeg, &config.camera).context("failed to start capture")?;
    let service = SentryService::new(
        config,
        Arc::new(FfmpegEncoderFactory::new(ffmpeg)),
        Arc::new(ShellRunner),
    )?;
    service.run(source, shutdown_rx).await.map_err(|err| {
        tracing::error!(fault = %err.kind(), error = %err, "motion sentry failed");
        err.into()
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = hangup.recv() => Ok("SIGHUP"),
        _ = quit.recv() => Ok("SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}
