use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Serialize;

use super::report::StepReport;
use super::{Node, Role};
use crate::engine::ContainerEngine;
use crate::error::WallsimError;

/// Files to ship into a node and the commands to run there afterwards.
#[derive(Debug, Clone)]
pub struct BootstrapJob {
    pub role: Role,
    pub source_dir: PathBuf,
    pub commands: Vec<String>,
    pub upload_path: String,
    pub workdir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    pub exit_code: i64,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub role: Role,
    pub uploaded: bool,
    pub outcomes: Vec<CommandOutcome>,
    pub failures: StepReport,
}

/// Pack the content of `dir` below a top level directory named `prefix`.
pub fn pack_directory(dir: &Path, prefix: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder
        .append_dir_all(prefix, dir)
        .with_context(|| format!("Failed to archive {dir:?}"))?;
    builder.into_inner().context("Failed to finish archive")
}

pub struct BootstrapRunner<'a> {
    engine: &'a dyn ContainerEngine,
}

impl<'a> BootstrapRunner<'a> {
    pub fn new(engine: &'a dyn ContainerEngine) -> Self {
        Self { engine }
    }

    /// Upload the job's directory, then run each command in order. A failed
    /// upload aborts the job. A failed command is recorded and the next one runs.
    pub async fn run(&self, node: &Node, job: &BootstrapJob) -> Result<BootstrapReport, WallsimError> {
        let mut report = BootstrapReport {
            role: job.role,
            uploaded: false,
            outcomes: vec![],
            failures: StepReport::default(),
        };

        if job.source_dir.is_dir() {
            let prefix = Path::new(&job.workdir)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| crate::config::START_SCRIPT_DIR.to_owned());
            let source_dir = job.source_dir.clone();
            let archive = tokio::task::spawn_blocking(move || pack_directory(&source_dir, &prefix))
                .await
                .context("Archive task panicked")
                .and_then(|r| r)
                .map_err(|source| WallsimError::BootstrapUploadFailed {
                    role: job.role,
                    source,
                })?;

            tracing::debug!(bytes = archive.len(), path = %job.upload_path, "Uploading start script archive");
            self.engine
                .upload_archive(&node.id, &job.upload_path, archive)
                .await
                .map_err(|source| WallsimError::BootstrapUploadFailed {
                    role: job.role,
                    source,
                })?;
            report.uploaded = true;
        } else {
            tracing::debug!(dir = ?job.source_dir, "No start script directory, skipping upload");
        }

        let workdir = report.uploaded.then_some(job.workdir.as_str());
        for command in &job.commands {
            tracing::info!(%command, "Running start script command");
            match self.engine.exec_shell(&node.id, command, workdir).await {
                Ok(output) => {
                    if !output.success() {
                        report.failures.record(
                            command.clone(),
                            WallsimError::BootstrapCommandFailed {
                                role: job.role,
                                command: command.clone(),
                                exit_code: output.exit_code,
                            },
                        );
                    }
                    report.outcomes.push(CommandOutcome {
                        command: command.clone(),
                        exit_code: output.exit_code,
                        output: output.output,
                    });
                }
                Err(e) => report.failures.record(command.clone(), e),
            }
        }

        Ok(report)
    }
}
