use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::check::ValidateError;
use super::transport::TransportError;
use crate::dialchain::DialError;
use crate::event::Fields;

/// Whether a probe could not reach its target or reached it and found it
/// unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Io,
    Validate,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Io => "io",
            ErrorType::Validate => "validate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Validate(#[from] ValidateError),
    #[error("invalid redirect location {location:?}: {message}")]
    Redirect { location: String, message: String },
}

impl ProbeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            ProbeError::Validate(_) => ErrorType::Validate,
            _ => ErrorType::Io,
        }
    }
}

/// The outcome of one probe, before it is turned into an event.
#[derive(Debug)]
pub struct ProbeResult {
    pub fields: Fields,
    pub duration: Duration,
    pub error: Option<ProbeError>,
}

impl ProbeResult {
    pub fn status(&self) -> Status {
        match self.error {
            None => Status::Up,
            Some(_) => Status::Down,
        }
    }

    /// Add `monitor.status`, `monitor.duration` and the `error.*` fields.
    pub fn into_fields(self) -> Fields {
        let status = self.status();
        let mut fields = self.fields;
        fields.put(
            "monitor.status",
            match status {
                Status::Up => "up",
                Status::Down => "down",
            },
        );
        fields.put_rtt("monitor.duration", self.duration);
        if let Some(err) = &self.error {
            fields.put("error.type", err.error_type().as_str());
            fields.put("error.message", super::report(err));
        }
        fields
    }
}
