use anyhow::Result;
use chrono::Utc;
use defaceit::cli::Args;
use defaceit::pipeline::orchestrator::{PipelineController, SourceOpener};
use defaceit::progress::spawn_renderer;
use defaceit::run_context::RunReport;
use defaceit::video::open_source;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    let mut job = args.to_job();
    job.device = job.device.resolve();
    let detectors = args.build_detectors(job.device)?;

    let opener: SourceOpener = {
        let backend = args.backend;
        let input = job.input.clone();
        let ffmpeg = job.ffmpeg.clone();
        Box::new(move || open_source(backend, &input, &ffmpeg))
    };

    let (controller, events) =
        PipelineController::new(job.clone(), opener, detectors, args.pipeline_options());
    let state = controller.state();
    let renderer = spawn_renderer(events)?;

    let cancel = controller.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let started_at = Utc::now();
    let outcome = controller.run().await;
    let _ = renderer.join();
    tracing::debug!("Final progress: {}", state.to_progress_json());

    if let Some(path) = &args.report {
        let report = RunReport {
            run_id: state.run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            state: outcome.state,
            exit_code: outcome.exit_code,
            frames: outcome.frames,
            error: outcome.error.clone(),
            job,
        };
        match report.write(path) {
            Ok(()) => tracing::info!("Run report written to {}", path.display()),
            Err(e) => tracing::warn!("Failed to write run report {}: {:#}", path.display(), e),
        }
    }

    std::process::exit(outcome.exit_code);
}
