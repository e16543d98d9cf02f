use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::IdError;

#[derive(Debug)]
pub enum ClinicError {
    NotFound(String),
    InvalidId(String),
    Validation(String),
    Conflict(String),
    AlreadyLinked { doctor_id: String, patient_ids: Vec<String> },
    Unauthorized(String),
    Upstream(String),
    Internal(String),
}

impl fmt::Display for ClinicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClinicError::NotFound(what) => write!(f, "not found: {what}"),
            ClinicError::InvalidId(msg) => write!(f, "{msg}"),
            ClinicError::Validation(msg) => write!(f, "invalid request: {msg}"),
            ClinicError::Conflict(msg) => write!(f, "conflict: {msg}"),
            ClinicError::AlreadyLinked {
                doctor_id,
                patient_ids,
            } => write!(
                f,
                "doctor {doctor_id} is already linked to {}",
                patient_ids.join(", ")
            ),
            ClinicError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            ClinicError::Upstream(msg) => write!(f, "upstream error: {msg}"),
            ClinicError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ClinicError {}

impl ClinicError {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ClinicError::NotFound(_) => Some("not_found"),
            ClinicError::InvalidId(_) => Some("invalid_id_format"),
            ClinicError::Validation(_) => Some("validation"),
            ClinicError::Conflict(_) => Some("conflict"),
            ClinicError::AlreadyLinked { .. } => Some("already_linked"),
            ClinicError::Unauthorized(_) => Some("unauthorized"),
            ClinicError::Upstream(_) => Some("upstream"),
            ClinicError::Internal(_) => None,
        }
    }
}

impl From<IdError> for ClinicError {
    fn from(err: IdError) -> Self {
        ClinicError::InvalidId(err.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<String>,
}

impl From<&ClinicError> for ErrorResponse {
    fn from(err: &ClinicError) -> Self {
        let duplicates = match err {
            ClinicError::AlreadyLinked { patient_ids, .. } => patient_ids.clone(),
            _ => Vec::new(),
        };
        ErrorResponse {
            error: err.to_string(),
            code: err.code().map(String::from),
            duplicates,
        }
    }
}

impl ErrorResponse {
    /// Rebuilds the error a daemon reported, keyed on its `code`.
    pub fn into_error(self) -> ClinicError {
        match self.code.as_deref() {
            Some("not_found") => ClinicError::NotFound(self.error),
            Some("invalid_id_format") => ClinicError::InvalidId(self.error),
            Some("validation") => ClinicError::Validation(self.error),
            Some("conflict") => ClinicError::Conflict(self.error),
            Some("already_linked") => ClinicError::AlreadyLinked {
                doctor_id: String::new(),
                patient_ids: self.duplicates,
            },
            Some("unauthorized") => ClinicError::Unauthorized(self.error),
            Some("upstream") => ClinicError::Upstream(self.error),
            _ => ClinicError::Internal(self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_error_maps_to_invalid_id() {
        let err: ClinicError = crate::id::next_id('P', Some("Pxyz")).unwrap_err().into();
        assert_eq!(err.code(), Some("invalid_id_format"));
        assert!(err.to_string().contains("Pxyz"));
    }

    #[test]
    fn already_linked_carries_duplicates() {
        let err = ClinicError::AlreadyLinked {
            doctor_id: "D001".into(),
            patient_ids: vec!["P001".into(), "P003".into()],
        };
        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.code.as_deref(), Some("already_linked"));
        assert_eq!(resp.duplicates, vec!["P001", "P003"]);

        let json = serde_json::to_string(&resp).unwrap();
        let back: ErrorResponse = serde_json::from_str(&json).unwrap();
        match back.into_error() {
            ClinicError::AlreadyLinked { patient_ids, .. } => {
                assert_eq!(patient_ids, vec!["P001", "P003"]);
            }
            other => panic!("expected AlreadyLinked, got {other:?}"),
        }
    }

    #[test]
    fn internal_has_no_code() {
        let resp = ErrorResponse::from(&ClinicError::Internal("boom".into()));
        assert!(resp.code.is_none());
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("code").is_none());
        assert!(json.get("duplicates").is_none());
    }
}
