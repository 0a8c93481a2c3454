use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use gantry_engine::utils::resolve_config_path;
use gantry_engine::{EngineError, PipelineExecutor, PipelineLoader};

/// Validate a config file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the config file (default: discovered gantry.yml)
    #[arg(long, short = 'f', value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Print the execution plan as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: ValidateArgs) -> Result<i32> {
    let path = match resolve_config_path(args.file.as_deref()) {
        Ok(path) => path,
        Err(e) => return Ok(report_error(e)),
    };

    output::status("Validating", &format!("{}", path.display()));

    let graph = match PipelineLoader::from_file(&path) {
        Ok(graph) => graph,
        Err(e) => return Ok(report_error(e)),
    };
    output::check("Config is valid");

    let executor = match PipelineExecutor::from_graph(&graph) {
        Ok(executor) => executor,
        Err(e) => return Ok(report_error(e)),
    };
    output::check("Dependency graph is acyclic");

    let plan = executor.plan();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", plan);
    }

    output::success(&format!(
        "{} job(s), {} instance(s)",
        plan.job_count(),
        plan.instance_count()
    ));
    Ok(0)
}

/// Print an error raised before anything ran; returns the exit code
pub fn report_error(error: impl Into<EngineError>) -> i32 {
    let error = error.into();
    output::error(&error.to_string());
    error.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_engine::{ConfigError, GraphError};

    #[test]
    fn test_errors_before_a_run_exit_with_2() {
        assert_eq!(report_error(ConfigError::invalid_value("bad")), 2);
        assert_eq!(
            report_error(GraphError::Cycle {
                jobs: vec!["a".into(), "b".into()],
            }),
            2
        );
    }
}
