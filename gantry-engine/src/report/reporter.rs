// Summary Reporter
// Renders a verdict as terminal text, JUnit XML, or JSON

use super::aggregator::{FailureDetail, Verdict};
use crate::pipeline::models::{InstanceStatus, JobStatus};

use std::fmt;

/// Lines of captured output shown per failure in terminal reports
const OUTPUT_TAIL_LINES: usize = 20;

/// Output format for run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Human-readable terminal output
    #[default]
    Terminal,
    /// JUnit XML format (for CI systems)
    JUnit,
    /// Machine-readable JSON
    Json,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Terminal => write!(f, "terminal"),
            ReportFormat::JUnit => write!(f, "junit"),
            ReportFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "terminal" | "text" | "console" => Ok(ReportFormat::Terminal),
            "junit" | "junit-xml" | "xml" => Ok(ReportFormat::JUnit),
            "json" => Ok(ReportFormat::Json),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: terminal, junit, json",
                s
            )),
        }
    }
}

/// Renders verdicts
pub struct SummaryReporter;

impl SummaryReporter {
    pub fn report(verdict: &Verdict, format: ReportFormat) -> Result<String, serde_json::Error> {
        match format {
            ReportFormat::Terminal => Ok(Self::to_terminal(verdict)),
            ReportFormat::JUnit => Ok(Self::to_junit_xml(verdict)),
            ReportFormat::Json => Self::to_json(verdict),
        }
    }

    pub fn to_json(verdict: &Verdict) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(verdict)
    }

    /// One testsuite per job, one testcase per instance
    pub fn to_junit_xml(verdict: &Verdict) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

        let total: usize = verdict.jobs.iter().map(|j| j.instances.len().max(1)).sum();
        let failed: usize = verdict
            .jobs
            .iter()
            .flat_map(|j| &j.instances)
            .filter(|i| i.status == InstanceStatus::Failed)
            .count();

        xml.push_str(&format!(
            "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"0\" time=\"{:.3}\">\n",
            xml_escape(&verdict.run_name),
            total,
            failed,
            verdict.duration.as_secs_f64()
        ));

        for job in &verdict.jobs {
            let job_failed = job
                .instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Failed)
                .count();

            xml.push_str(&format!(
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"0\" time=\"{:.3}\">\n",
                xml_escape(&job.job_id),
                job.instances.len().max(1),
                job_failed,
                job.duration.as_secs_f64()
            ));

            // A job skipped before expansion still gets one case
            if job.instances.is_empty() {
                xml.push_str(&format!(
                    "    <testcase name=\"{}\" classname=\"{}\" time=\"0.000\">\n",
                    xml_escape(&job.job_id),
                    xml_escape(&job.job_id)
                ));
                xml.push_str(&format!(
                    "      <skipped message=\"{}\" />\n",
                    xml_escape(job.skip_reason.as_deref().unwrap_or("skipped"))
                ));
                xml.push_str("    </testcase>\n");
            }

            for instance in &job.instances {
                xml.push_str(&format!(
                    "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\"",
                    xml_escape(&instance.instance_id),
                    xml_escape(&job.job_id),
                    instance.duration.as_secs_f64()
                ));

                match instance.status {
                    InstanceStatus::Succeeded => xml.push_str(" />\n"),
                    InstanceStatus::Failed => {
                        xml.push_str(">\n");
                        let message = instance.reason.as_deref().unwrap_or("instance failed");
                        xml.push_str(&format!("      <failure message=\"{}\">\n", xml_escape(message)));
                        for failure in failures_for(verdict, &instance.instance_id) {
                            if !failure.stderr.is_empty() {
                                xml.push_str(&xml_escape(&tail(&failure.stderr, OUTPUT_TAIL_LINES)));
                                xml.push('\n');
                            }
                        }
                        xml.push_str("      </failure>\n");
                        xml.push_str("    </testcase>\n");
                    }
                    _ => {
                        xml.push_str(">\n");
                        xml.push_str(&format!(
                            "      <skipped message=\"{}\" />\n",
                            xml_escape(instance.reason.as_deref().unwrap_or("skipped"))
                        ));
                        xml.push_str("    </testcase>\n");
                    }
                }
            }

            xml.push_str("  </testsuite>\n");
        }

        xml.push_str("</testsuites>\n");
        xml
    }

    /// Generate human-readable terminal output
    pub fn to_terminal(verdict: &Verdict) -> String {
        let mut out = String::new();

        out.push_str(&format!("\nRun: {}\n", verdict.run_name));
        out.push_str(&"=".repeat(60));
        out.push('\n');

        for job in &verdict.jobs {
            let (symbol, label) = match job.status {
                JobStatus::Succeeded => ("+", "PASS"),
                JobStatus::Failed => ("x", "FAIL"),
                _ => ("-", "SKIP"),
            };
            out.push_str(&format!(
                "  [{}] {} ({:.2}s) {}\n",
                symbol,
                label,
                job.duration.as_secs_f64(),
                job.job_id
            ));

            if job.instances.len() > 1 {
                for instance in &job.instances {
                    let mark = match instance.status {
                        InstanceStatus::Succeeded => "+",
                        InstanceStatus::Failed => "x",
                        _ => "-",
                    };
                    out.push_str(&format!("       [{}] {}\n", mark, instance.instance_id));
                }
            }

            if let Some(reason) = &job.skip_reason {
                out.push_str(&format!("       skipped: {}\n", reason));
            }
        }

        if !verdict.failures.is_empty() {
            out.push_str(&"-".repeat(60));
            out.push('\n');
            out.push_str("Failures:\n");
            for failure in &verdict.failures {
                out.push_str(&format!("  {}: {}\n", failure.instance_id, failure.reason));
                let output = if failure.stderr.trim().is_empty() {
                    &failure.stdout
                } else {
                    &failure.stderr
                };
                for line in tail(output, OUTPUT_TAIL_LINES).lines() {
                    out.push_str(&format!("       | {}\n", line));
                }
            }
        }

        out.push_str(&"-".repeat(60));
        out.push('\n');

        let total = verdict.jobs.len();
        let failed = verdict.count(JobStatus::Failed);
        let skipped = verdict.count(JobStatus::Skipped);
        let status_line = if verdict.passed() {
            format!(
                "  PASS: all {} jobs succeeded ({:.2}s)",
                total,
                verdict.duration.as_secs_f64()
            )
        } else if verdict.cancelled {
            format!(
                "  CANCELLED: {} failed, {} skipped of {} jobs ({:.2}s)",
                failed,
                skipped,
                total,
                verdict.duration.as_secs_f64()
            )
        } else {
            format!(
                "  FAIL: {} failed, {} skipped of {} jobs ({:.2}s)",
                failed,
                skipped,
                total,
                verdict.duration.as_secs_f64()
            )
        };
        out.push_str(&status_line);
        out.push_str("\n\n");
        out
    }
}

fn failures_for<'a>(verdict: &'a Verdict, instance_id: &'a str) -> impl Iterator<Item = &'a FailureDetail> {
    verdict
        .failures
        .iter()
        .filter(move |f| f.instance_id == instance_id)
}

/// Last `lines` lines of `text`
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Escape special XML characters
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::aggregator::{Outcome, SkipDetail};
    use crate::pipeline::models::{InstanceResult, JobResult};
    use std::time::Duration;

    fn instance(id: &str, job: &str, status: InstanceStatus, reason: Option<&str>) -> InstanceResult {
        let mut result = InstanceResult::pending(id, job, Vec::new());
        result.status = status;
        result.reason = reason.map(str::to_string);
        result.duration = Duration::from_millis(250);
        result
    }

    fn verdict() -> Verdict {
        Verdict {
            run_name: "ci".to_string(),
            outcome: Outcome::Fail,
            cancelled: false,
            duration: Duration::from_secs(2),
            jobs: vec![
                JobResult {
                    job_id: "lint".to_string(),
                    status: JobStatus::Failed,
                    instances: vec![instance(
                        "lint",
                        "lint",
                        InstanceStatus::Failed,
                        Some("step 'flake8' exited with code 1"),
                    )],
                    skip_reason: None,
                    duration: Duration::from_secs(1),
                },
                JobResult {
                    job_id: "test".to_string(),
                    status: JobStatus::Skipped,
                    instances: Vec::new(),
                    skip_reason: Some("dependency 'lint' failed".to_string()),
                    duration: Duration::ZERO,
                },
                JobResult {
                    job_id: "docs".to_string(),
                    status: JobStatus::Succeeded,
                    instances: vec![
                        instance("docs (fmt=html)", "docs", InstanceStatus::Succeeded, None),
                        instance("docs (fmt=pdf)", "docs", InstanceStatus::Succeeded, None),
                    ],
                    skip_reason: None,
                    duration: Duration::from_secs(1),
                },
            ],
            failures: vec![FailureDetail {
                job_id: "lint".to_string(),
                instance_id: "lint".to_string(),
                step: Some("flake8".to_string()),
                reason: "step 'flake8' exited with code 1".to_string(),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "app.py:3: E501 <line too long>".to_string(),
            }],
            skipped: vec![SkipDetail {
                job_id: "test".to_string(),
                reason: "dependency 'lint' failed".to_string(),
            }],
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("junit-xml".parse::<ReportFormat>().unwrap(), ReportFormat::JUnit);
        assert_eq!("TEXT".parse::<ReportFormat>().unwrap(), ReportFormat::Terminal);
        assert_eq!("json".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert!("yaml".parse::<ReportFormat>().is_err());
        assert_eq!(ReportFormat::JUnit.to_string(), "junit");
    }

    #[test]
    fn test_terminal_report() {
        let out = SummaryReporter::to_terminal(&verdict());

        assert!(out.contains("Run: ci"));
        assert!(out.contains("[x] FAIL"));
        assert!(out.contains("[-] SKIP"));
        assert!(out.contains("skipped: dependency 'lint' failed"));
        assert!(out.contains("[+] docs (fmt=pdf)"));
        assert!(out.contains("lint: step 'flake8' exited with code 1"));
        assert!(out.contains("| app.py:3: E501"));
        assert!(out.contains("FAIL: 1 failed, 1 skipped of 3 jobs"));
    }

    #[test]
    fn test_junit_report() {
        let xml = SummaryReporter::to_junit_xml(&verdict());

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<testsuites name=\"ci\" tests=\"4\" failures=\"1\""));
        assert!(xml.contains("<testsuite name=\"lint\""));
        assert!(xml.contains("<failure message=\"step &apos;flake8&apos; exited with code 1\">"));
        assert!(xml.contains("E501 &lt;line too long&gt;"));
        assert!(xml.contains("<skipped message=\"dependency &apos;lint&apos; failed\" />"));
        assert!(xml.contains("<testcase name=\"docs (fmt=html)\" classname=\"docs\""));
    }

    #[test]
    fn test_json_report() {
        let json = SummaryReporter::report(&verdict(), ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["outcome"], "fail");
        assert_eq!(value["failures"][0]["step"], "flake8");
        assert_eq!(value["jobs"][1]["status"], "skipped");
    }

    #[test]
    fn test_tail() {
        let text = (1..=30).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let last = tail(&text, 3);
        assert_eq!(last, "28\n29\n30");
        assert_eq!(tail("", 3), "");
    }
}
