// src/jobs/error_codes.rs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    Panic,
    BadPayload,
    UnknownJobType,
    HandlerError,
    LeaseExpired,
    DependencyDown,
    Unknown,
}

impl ErrorCode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "PANIC" => Self::Panic,
            "BAD_PAYLOAD" => Self::BadPayload,
            "UNKNOWN_JOB_TYPE" => Self::UnknownJobType,
            "HANDLER_ERROR" => Self::HandlerError,
            "LEASE_EXPIRED" => Self::LeaseExpired,
            "DEPENDENCY_DOWN" => Self::DependencyDown,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Panic => "PANIC",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::UnknownJobType => "UNKNOWN_JOB_TYPE",
            Self::HandlerError => "HANDLER_ERROR",
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::DependencyDown => "DEPENDENCY_DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::parse(code) {
        ErrorCode::Timeout => {
            "Raise the handler timeout OR reduce the work per job. Check downstream latency."
        }
        ErrorCode::Panic => {
            "Investigate the crash. The panic message is in error.message; a deterministic panic will repeat on resubmit."
        }
        ErrorCode::BadPayload => {
            "Validate the payload shape against the job type. Fix the producer before resubmitting."
        }
        ErrorCode::UnknownJobType => {
            "No worker has a handler for this job type. Deploy a worker that registers it."
        }
        ErrorCode::HandlerError => {
            "The job body reported a failure. Inspect error.message and the worker logs."
        }
        ErrorCode::LeaseExpired => {
            "Workers kept losing the lease: they crashed or hung. Check worker health, raise lease time or heartbeat more often."
        }
        ErrorCode::DependencyDown => {
            "Resubmit later. Check dependency health and alerting."
        }
        ErrorCode::Unknown => {
            "Inspect error.message + worker logs. Add a mapping once understood."
        }
    }
}
