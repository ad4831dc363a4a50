use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::jobs::error_codes::suggested_action;
use crate::jobs::model::{JobFailure, JobState};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitQuery {
    pub job_type: Option<String>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: Uuid,
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub job_id: Uuid,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub hint: String,
}

impl From<JobFailure> for ErrorDetail {
    fn from(f: JobFailure) -> Self {
        let hint = suggested_action(&f.code).to_string();
        Self {
            kind: f.kind,
            code: f.code,
            message: f.message,
            hint,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue: String,
    pub depth: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
