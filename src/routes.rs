use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use serde::Serialize;

use crate::engine::Engine;
use crate::job::{JobResult, RunRequest};
use crate::sandbox::Language;

/// How results are written on the wire
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseShape {
    /// Emit compile errors as `{"stderr": ...}`, the shape older clients expect
    pub legacy_compile_error: bool,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum RunResponse {
    Completed {
        stdout: String,
        stderr: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },
    Error {
        error: String,
    },
    /// Legacy compile error shape
    Stderr {
        stderr: String,
    },
}

impl RunResponse {
    pub fn from_result(result: JobResult, shape: ResponseShape) -> Self {
        match result {
            JobResult::Completed {
                stdout,
                stderr,
                exit_code,
            } => Self::Completed {
                stdout,
                stderr,
                exit_code,
            },
            JobResult::CompileError { message } if shape.legacy_compile_error => {
                Self::Stderr { stderr: message }
            }
            JobResult::CompileError { message }
            | JobResult::RunError { message }
            | JobResult::InternalError { message } => Self::Error { error: message },
            JobResult::Rejected { reason } => Self::Error { error: reason },
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        error: "Invalid request body",
    });
    InternalError::from_response(err, response).into()
}

#[post("/run")]
pub async fn post_run_handler(
    engine: web::Data<Engine>,
    shape: web::Data<ResponseShape>,
    body: web::Json<RunRequest>,
) -> impl Responder {
    let result = engine.submit(body.into_inner()).await;

    let mut response = match &result {
        JobResult::Rejected { .. } => HttpResponse::BadRequest(),
        JobResult::InternalError { .. } => HttpResponse::InternalServerError(),
        _ => HttpResponse::Ok(),
    };
    response.json(RunResponse::from_result(result, **shape))
}

#[get("/languages")]
pub async fn get_languages_handler() -> impl Responder {
    let names: Vec<&str> = Language::ALL.iter().map(|l| l.name()).collect();
    HttpResponse::Ok().json(names)
}
