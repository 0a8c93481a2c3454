use crate::commands::validate::report_error;
use crate::output;
use crate::signal;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use gantry_engine::utils::resolve_config_path;
use gantry_engine::{
    progress_channel, ConfigError, EngineSettings, ExecutionEvent, InstanceStatus, JobStatus, LogLevel,
    PipelineExecutor, PipelineLoader, ReportFormat, StepStatus, SummaryReporter,
};

/// Run the job graph locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the config file (default: discovered gantry.yml)
    #[arg(long, short = 'f', value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Run only these jobs and what they need (repeatable)
    #[arg(long, short = 'j', value_name = "JOB")]
    pub job: Vec<String>,

    /// Maximum number of instances running at once
    #[arg(long, short = 'c', value_name = "N")]
    pub concurrency: Option<usize>,

    /// Print the execution plan without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Report format: terminal, junit, json
    #[arg(long, default_value = "terminal", value_name = "FORMAT")]
    pub format: ReportFormat,

    /// Write the report to a file instead of stdout
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Engine settings file (default: <config dir>/gantry/settings.yaml)
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Do not stream step output
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

/// Returns the process exit code
pub async fn execute(args: RunArgs) -> Result<i32> {
    let mut settings = match EngineSettings::load(args.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => return Ok(report_error(e)),
    };
    if let Some(concurrency) = args.concurrency {
        if concurrency == 0 {
            return Ok(report_error(ConfigError::invalid_value(
                "--concurrency must be at least 1",
            )));
        }
        settings.concurrency = concurrency;
    }

    let path = match resolve_config_path(args.file.as_deref()) {
        Ok(path) => path,
        Err(e) => return Ok(report_error(e)),
    };

    output::status("Loading", &format!("{}", path.display()));
    let graph = match PipelineLoader::from_file(&path) {
        Ok(graph) => graph,
        Err(e) => return Ok(report_error(e)),
    };

    let executor = match PipelineExecutor::from_graph(&graph).and_then(|e| e.select_jobs(&args.job)) {
        Ok(executor) => executor.with_settings(settings),
        Err(e) => return Ok(report_error(e)),
    };

    if args.dry_run {
        println!("{}", executor.plan());
        return Ok(0);
    }

    let (tx, rx) = progress_channel();
    let executor = executor.with_progress(tx);

    let cancel = CancellationToken::new();
    signal::install(cancel.clone());

    let run_token = cancel.clone();
    let handle = tokio::spawn(async move { executor.execute(&run_token).await });

    let mut events = UnboundedReceiverStream::new(rx);
    while let Some(event) = events.next().await {
        print_event(&event, args.quiet);
    }

    let verdict = handle.await.wrap_err("run task failed")?;

    match (&args.report, args.format) {
        (Some(report_path), format) => {
            let report = SummaryReporter::report(&verdict, format)?;
            std::fs::write(report_path, report)
                .wrap_err_with(|| format!("failed to write report to {}", report_path.display()))?;
            print!("{}", SummaryReporter::to_terminal(&verdict));
            output::info(&format!("Report written to {}", report_path.display()));
        }
        (None, ReportFormat::Terminal) => print!("{}", SummaryReporter::to_terminal(&verdict)),
        (None, format) => println!("{}", SummaryReporter::report(&verdict, format)?),
    }

    match verdict.ensure_pass() {
        Ok(()) => Ok(0),
        Err(e) => {
            tracing::debug!(error = %e, "run did not pass");
            Ok(e.exit_code())
        }
    }
}

fn print_event(event: &ExecutionEvent, quiet: bool) {
    match event {
        ExecutionEvent::RunStarted {
            run_name,
            total_jobs,
            total_instances,
        } => {
            output::header(&format!(
                "Run '{}' ({} jobs, {} instances)",
                run_name, total_jobs, total_instances
            ));
        }

        ExecutionEvent::RunCompleted {
            success,
            cancelled,
            duration,
            ..
        } => {
            if *success {
                output::success(&format!("Run passed in {:.2}s", duration.as_secs_f64()));
            } else if *cancelled {
                output::failure(&format!("Run cancelled after {:.2}s", duration.as_secs_f64()));
            } else {
                output::failure(&format!("Run failed after {:.2}s", duration.as_secs_f64()));
            }
        }

        ExecutionEvent::JobReady { .. } => {}

        ExecutionEvent::JobSkipped { job_id, reason } => {
            output::warning(&format!("Job '{}' skipped: {}", job_id, reason));
        }

        ExecutionEvent::JobCompleted {
            job_id,
            status,
            duration,
        } => {
            let line = format!("  Job '{}' {:?} ({:.2}s)", job_id, status, duration.as_secs_f64());
            if *status == JobStatus::Succeeded {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::InstanceStarted {
            instance_id,
            total_steps,
            ..
        } => output::job_header(instance_id, *total_steps),

        ExecutionEvent::InstanceCompleted {
            instance_id,
            status,
            reason,
            ..
        } => {
            if *status == InstanceStatus::Failed {
                let reason = reason.as_deref().unwrap_or("failed");
                output::dim_failure(&format!("  {}: {}", instance_id, reason));
            }
        }

        ExecutionEvent::SidecarReady {
            instance_id,
            service,
            image,
        } => output::info(&format!("{}: service '{}' ready ({})", instance_id, service, image)),

        ExecutionEvent::SidecarStopped { .. } => {}

        ExecutionEvent::StepStarted {
            instance_id,
            step_name,
            step_index,
        } => {
            if !quiet {
                output::status("Step", &format!("{} [{}] {}", instance_id, step_index + 1, step_name));
            }
        }

        ExecutionEvent::StepOutput {
            instance_id,
            output,
            is_error,
            ..
        } => {
            if quiet {
                return;
            }
            for line in output.lines() {
                if *is_error {
                    output::step_error(instance_id, line);
                } else {
                    output::step_output(instance_id, line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            instance_id,
            step_name,
            status,
            duration,
            exit_code,
            ..
        } => {
            if *status == StepStatus::Failed {
                output::dim_failure(&format!(
                    "  {} '{}' failed ({:.2}s, exit code {:?})",
                    instance_id,
                    step_name,
                    duration.as_secs_f64(),
                    exit_code
                ));
            }
        }

        ExecutionEvent::StepSkipped { .. } => {}

        ExecutionEvent::Log {
            level,
            message,
            job_id,
        } => {
            let message = match job_id {
                Some(job) => format!("{}: {}", job, message),
                None => message.clone(),
            };
            match level {
                LogLevel::Info => output::info(&message),
                LogLevel::Warning => output::warning(&message),
                LogLevel::Error => output::error(&message),
            }
        }
    }
}
