use serde::Deserialize;
use uuid::Uuid;

use crate::sandbox::Language;
use crate::workspace::Workspace;

/// Message returned to callers for failures they cannot act on
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error";

/// A request as it arrives from the outside, before validation
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RunRequest {
    pub language: Option<String>,
    pub code: Option<String>,
    pub stdin: Option<String>,
}

/// A validated request for one of the supported languages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub language: Language,
    pub source_code: String,
    pub stdin_data: String,
}

impl TryFrom<RunRequest> for JobRequest {
    /// The rejection reason
    type Error = String;

    fn try_from(request: RunRequest) -> Result<Self, Self::Error> {
        let language = match request.language.as_deref().map(str::trim) {
            None | Some("") => return Err("Missing language".to_string()),
            Some(name) => name.parse::<Language>().map_err(|e| e.to_string())?,
        };
        let source_code = match request.code {
            Some(code) if !code.is_empty() => code,
            _ => return Err("Missing code".to_string()),
        };

        Ok(Self {
            language,
            source_code,
            stdin_data: request.stdin.unwrap_or_default(),
        })
    }
}

/// A request admitted to the queue, owning its workspace until it finishes
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub request: JobRequest,
    pub workspace: Workspace,
}

impl Job {
    pub fn new(request: JobRequest, workspace: Workspace) -> Self {
        Self {
            id: workspace.id(),
            request,
            workspace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The request never reached a pipeline
    Rejected { reason: String },
    CompileError { message: String },
    RunError { message: String },
    /// The program ran to an exit; a non-zero code is still a completion
    Completed {
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    },
    InternalError { message: String },
}

impl JobResult {
    pub fn internal() -> Self {
        Self::InternalError {
            message: INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "rejected",
            Self::CompileError { .. } => "compile error",
            Self::RunError { .. } => "run error",
            Self::Completed { .. } => "completed",
            Self::InternalError { .. } => "internal error",
        }
    }
}
