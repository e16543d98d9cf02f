use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" | "m" => Ok(Gender::Male),
            "female" | "f" => Ok(Gender::Female),
            "other" => Ok(Gender::Other),
            other => Err(format!("unknown gender: {other}")),
        }
    }
}

/// Which viewer an attachment belongs to: PDF reports or CT/DICOM slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Pdf,
    Ct,
}

impl FileCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Pdf => "pdf",
            FileCategory::Ct => "ct",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<FileCategory> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/pdf" => Some(FileCategory::Pdf),
            "application/dicom" | "application/octet-stream" => Some(FileCategory::Ct),
            _ => None,
        }
    }
}

impl FromStr for FileCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(FileCategory::Pdf),
            "ct" => Ok(FileCategory::Ct),
            other => Err(format!("unknown file category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    pub name: String,
    pub gender: Gender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row of the patient list: identity plus a digest of their sleep studies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientSummary {
    pub id: String,
    pub name: String,
    pub gender: Gender,
    pub birth_date: Option<NaiveDate>,
    pub total_record_count: i64,
    pub latest_record_start: Option<DateTime<Utc>>,
    pub latest_ahi: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientDetail {
    #[serde(flatten)]
    pub patient: Patient,
    pub sleep_records: Vec<SleepRecord>,
    pub doctors: Vec<Doctor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorListEntry {
    #[serde(flatten)]
    pub doctor: Doctor,
    pub patients: Vec<PatientRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorDetail {
    #[serde(flatten)]
    pub doctor: Doctor,
    pub patients: Vec<Patient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepRecord {
    pub id: i64,
    pub patient_id: String,
    pub record_start: DateTime<Utc>,
    pub record_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ahi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub odi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_spo2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_spo2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_efficiency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_sleep_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepRecordDetail {
    #[serde(flatten)]
    pub record: SleepRecord,
    pub files: Vec<FileAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: i64,
    pub sleep_record_id: i64,
    pub filename: String,
    pub stored_name: String,
    pub content_type: String,
    pub category: FileCategory,
    pub size_bytes: i64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// Response to a multipart upload: every attachment created by the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    pub file_count: usize,
    pub files: Vec<FileAttachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub patients: i64,
    pub doctors: i64,
    pub sleep_records: i64,
    pub files: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePatientParams {
    pub name: String,
    pub gender: Gender,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub password: String,
    #[serde(default, alias = "confirmPassword")]
    pub confirm_password: String,
}

/// Partial patient update. An empty string clears an optional text field.
/// An empty or absent password leaves the stored hash unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePatientFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(
        default,
        alias = "confirmPassword",
        skip_serializing_if = "Option::is_none"
    )]
    pub confirm_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordCheck {
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordVerdict {
    pub is_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDoctorParams {
    pub name: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDoctorFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SleepMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ahi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_spo2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_spo2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_efficiency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_sleep_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSleepRecordParams {
    pub patient_id: String,
    pub record_start: DateTime<Utc>,
    pub record_end: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: SleepMetrics,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSleepRecordFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_end: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metrics: SleepMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Attachment row as produced by the upload store, before it has an id.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub sleep_record_id: i64,
    pub filename: String,
    pub stored_name: String,
    pub content_type: String,
    pub category: FileCategory,
    pub size_bytes: i64,
    pub sha256: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_from_content_type() {
        assert_eq!(
            FileCategory::from_content_type("application/pdf"),
            Some(FileCategory::Pdf)
        );
        assert_eq!(
            FileCategory::from_content_type("Application/DICOM"),
            Some(FileCategory::Ct)
        );
        assert_eq!(
            FileCategory::from_content_type("application/octet-stream; charset=binary"),
            Some(FileCategory::Ct)
        );
        assert_eq!(FileCategory::from_content_type("image/png"), None);
    }

    #[test]
    fn gender_parses_short_forms() {
        assert_eq!("f".parse::<Gender>().unwrap(), Gender::Female);
        assert_eq!("male".parse::<Gender>().unwrap(), Gender::Male);
        assert!("unknown".parse::<Gender>().is_err());
    }

    #[test]
    fn patient_params_accept_camel_case_confirmation() {
        let params: CreatePatientParams = serde_json::from_value(serde_json::json!({
            "name": "Lee",
            "gender": "female",
            "password": "pw",
            "confirmPassword": "pw"
        }))
        .unwrap();
        assert_eq!(params.confirm_password, "pw");

        let fields: UpdatePatientFields =
            serde_json::from_value(serde_json::json!({ "phone": "1" })).unwrap();
        assert!(fields.password.is_none());
        assert!(!serde_json::to_string(&fields).unwrap().contains("password"));
    }

    #[test]
    fn sleep_params_accept_flat_metrics() {
        let params: CreateSleepRecordParams = serde_json::from_value(serde_json::json!({
            "patient_id": "P001",
            "record_start": "2024-03-01T22:00:00Z",
            "record_end": "2024-03-02T06:00:00Z",
            "ahi": 12.5,
            "min_spo2": 84.0
        }))
        .unwrap();
        assert_eq!(params.metrics.ahi, Some(12.5));
        assert_eq!(params.metrics.min_spo2, Some(84.0));
        assert!(params.metrics.odi.is_none());
        assert!(params.notes.is_none());
    }
}
