use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::ToolchainConfig;
use crate::job::{JobRequest, JobResult};

use super::{Language, ProcessOutcome, ProcessRunner, SandboxPrefix};

/// Name of the binary produced by the native compile stage
const CPP_BINARY: &str = "main";
/// Entry point class of Java submissions
const JAVA_MAIN_CLASS: &str = "Main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    fn new<const N: usize>(program: &str, args: [&str; N]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

/// The stages of one language: an optional compile step, then the run step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub compile: Option<CommandLine>,
    pub run: CommandLine,
}

impl StagePlan {
    /// Every path is relative to the workspace, which is the working directory
    pub fn for_language(language: Language, toolchains: &ToolchainConfig) -> Self {
        let source = language.source_file();
        match language {
            Language::Cpp => Self {
                compile: Some(CommandLine::new(
                    &toolchains.cpp_compiler,
                    ["-O2", "-std=c++17", "-o", CPP_BINARY, source],
                )),
                run: CommandLine::new("./main", []),
            },
            Language::Java => Self {
                compile: Some(CommandLine::new(&toolchains.java_compiler, [source])),
                run: CommandLine::new(&toolchains.java_runtime, ["-cp", ".", JAVA_MAIN_CLASS]),
            },
            Language::Python => Self {
                compile: None,
                run: CommandLine::new(&toolchains.python, [source]),
            },
            Language::JavaScript => Self {
                compile: None,
                run: CommandLine::new(&toolchains.node, [source]),
            },
        }
    }
}

/// Runs the compile and run stages of a job inside its workspace
#[derive(Debug, Clone)]
pub struct Pipeline {
    runner: ProcessRunner,
    prefix: SandboxPrefix,
    toolchains: ToolchainConfig,
    stage_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        runner: ProcessRunner,
        prefix: SandboxPrefix,
        toolchains: ToolchainConfig,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            prefix,
            toolchains,
            stage_timeout,
        }
    }

    /// Writes the source and drives the stages.
    ///
    /// Errors are reserved for internal failures such as an unwritable
    /// workspace; everything the user program does ends up in the result.
    pub async fn execute(&self, request: &JobRequest, workspace: &Path) -> Result<JobResult> {
        let source_path = workspace.join(request.language.source_file());
        tokio::fs::write(&source_path, &request.source_code)
            .await
            .with_context(|| format!("Failed to write source to {}", source_path.display()))?;

        let plan = StagePlan::for_language(request.language, &self.toolchains);

        if let Some(compile) = &plan.compile {
            // Each stage gets a full timeout budget of its own
            let outcome = self.run_stage(compile, workspace, "").await;
            if let Some(failure) = compile_failure(&outcome) {
                return Ok(failure);
            }
        }

        let outcome = self
            .run_stage(&plan.run, workspace, &request.stdin_data)
            .await;
        Ok(run_result(outcome))
    }

    async fn run_stage(&self, stage: &CommandLine, workspace: &Path, stdin: &str) -> ProcessOutcome {
        let (program, args) = self.prefix.wrap(&stage.program, &stage.args, workspace);
        log::debug!("Running {program} {args:?} in {}", workspace.display());
        self.runner
            .run(&program, &args, workspace, self.stage_timeout, stdin)
            .await
    }
}

/// Maps a compile stage outcome to an error result, or `None` on success
fn compile_failure(outcome: &ProcessOutcome) -> Option<JobResult> {
    if outcome.timed_out {
        return Some(JobResult::CompileError {
            message: "Compilation timed out".to_string(),
        });
    }
    if outcome.success() {
        return None;
    }

    let message = if !outcome.stderr.is_empty() {
        outcome.stderr.clone()
    } else if !outcome.stdout.is_empty() {
        outcome.stdout.clone()
    } else {
        "Compilation error".to_string()
    };
    Some(JobResult::CompileError { message })
}

fn run_result(outcome: ProcessOutcome) -> JobResult {
    if outcome.timed_out {
        return JobResult::RunError {
            message: "Execution timed out".to_string(),
        };
    }
    if outcome.is_launch_failure() {
        return JobResult::RunError {
            message: outcome.stderr,
        };
    }

    JobResult::Completed {
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: outcome.exit_code,
    }
}
