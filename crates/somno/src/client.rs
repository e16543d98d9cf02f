use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::error::{ClinicError, ErrorResponse};
use crate::types::{
    CreateDoctorParams, CreatePatientParams, CreateSleepRecordParams, Doctor, DoctorDetail,
    DoctorListEntry, FileAttachment, FileCategory, PasswordCheck, PasswordVerdict, Patient,
    PatientDetail, PatientSummary, SleepRecord, SleepRecordDetail, StatusCounts,
    UpdateDoctorFields, UpdatePatientFields, UpdateSleepRecordFields, UploadBatch,
};

pub const DEFAULT_DAEMON_URL: &str = "http://localhost:7640";

/// A file to send in a multipart upload.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Blocking HTTP client for the `sn` daemon.
pub struct Client {
    http: HttpClient,
    base_url: String,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        let base_url =
            std::env::var("SN_DAEMON").unwrap_or_else(|_| DEFAULT_DAEMON_URL.to_string());
        Self::with_base_url(base_url)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Client {
            http: HttpClient::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn check_reachable(&self) -> Result<(), String> {
        match self.http.get(self.url("/status")).send() {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("daemon returned status {}", resp.status())),
            Err(e) => Err(format!("cannot reach daemon at {}: {}", self.base_url, e)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn parse_error(resp: Response) -> ClinicError {
        let status = resp.status();
        match resp.json::<ErrorResponse>() {
            Ok(err_resp) => err_resp.into_error(),
            Err(_) => ClinicError::Internal(format!("daemon returned {status}")),
        }
    }

    fn send(req: RequestBuilder) -> Result<Response, ClinicError> {
        let resp = req
            .send()
            .map_err(|e| ClinicError::Internal(e.to_string()))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(Self::parse_error(resp))
        }
    }

    fn send_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, ClinicError> {
        Self::send(req)?
            .json()
            .map_err(|e| ClinicError::Internal(e.to_string()))
    }

    pub fn status(&self) -> Result<StatusCounts, ClinicError> {
        Self::send_json(self.http.get(self.url("/status")))
    }

    // --- Patients ---

    pub fn create_patient(&self, params: &CreatePatientParams) -> Result<Patient, ClinicError> {
        Self::send_json(self.http.post(self.url("/patients")).json(params))
    }

    pub fn get_patient(&self, id: &str) -> Result<PatientDetail, ClinicError> {
        Self::send_json(self.http.get(self.url(&format!("/patients/{id}"))))
    }

    pub fn list_patients(&self) -> Result<Vec<PatientSummary>, ClinicError> {
        Self::send_json(self.http.get(self.url("/patients")))
    }

    pub fn update_patient(
        &self,
        id: &str,
        fields: &UpdatePatientFields,
    ) -> Result<Patient, ClinicError> {
        Self::send_json(
            self.http
                .patch(self.url(&format!("/patients/{id}")))
                .json(fields),
        )
    }

    pub fn delete_patient(&self, id: &str) -> Result<(), ClinicError> {
        Self::send(self.http.delete(self.url(&format!("/patients/{id}")))).map(|_| ())
    }

    pub fn verify_patient_password(&self, id: &str, password: &str) -> Result<bool, ClinicError> {
        let body = PasswordCheck {
            password: password.to_string(),
        };
        let verdict: PasswordVerdict = Self::send_json(
            self.http
                .post(self.url(&format!("/patients/{id}/verify-password")))
                .json(&body),
        )?;
        Ok(verdict.is_valid)
    }

    // --- Doctors ---

    pub fn create_doctor(&self, params: &CreateDoctorParams) -> Result<Doctor, ClinicError> {
        Self::send_json(self.http.post(self.url("/doctors")).json(params))
    }

    pub fn get_doctor(&self, id: &str) -> Result<DoctorDetail, ClinicError> {
        Self::send_json(self.http.get(self.url(&format!("/doctors/{id}"))))
    }

    pub fn list_doctors(&self) -> Result<Vec<DoctorListEntry>, ClinicError> {
        Self::send_json(self.http.get(self.url("/doctors")))
    }

    pub fn update_doctor(
        &self,
        id: &str,
        fields: &UpdateDoctorFields,
    ) -> Result<Doctor, ClinicError> {
        Self::send_json(
            self.http
                .patch(self.url(&format!("/doctors/{id}")))
                .json(fields),
        )
    }

    pub fn delete_doctor(&self, id: &str) -> Result<(), ClinicError> {
        Self::send(self.http.delete(self.url(&format!("/doctors/{id}")))).map(|_| ())
    }

    pub fn link_patients(
        &self,
        doctor_id: &str,
        patient_ids: &[String],
    ) -> Result<DoctorDetail, ClinicError> {
        let body = serde_json::json!({ "patient_ids": patient_ids });
        let result = Self::send_json(
            self.http
                .post(self.url(&format!("/doctors/{doctor_id}/patients")))
                .json(&body),
        );
        match result {
            Err(ClinicError::AlreadyLinked { patient_ids, .. }) => {
                Err(ClinicError::AlreadyLinked {
                    doctor_id: doctor_id.to_string(),
                    patient_ids,
                })
            }
            other => other,
        }
    }

    pub fn unlink_patient(&self, doctor_id: &str, patient_id: &str) -> Result<(), ClinicError> {
        Self::send(
            self.http
                .delete(self.url(&format!("/doctors/{doctor_id}/patients/{patient_id}"))),
        )
        .map(|_| ())
    }

    // --- Sleep records ---

    pub fn create_sleep_record(
        &self,
        params: &CreateSleepRecordParams,
    ) -> Result<SleepRecord, ClinicError> {
        Self::send_json(self.http.post(self.url("/sleep")).json(params))
    }

    pub fn get_sleep_record(&self, id: i64) -> Result<SleepRecordDetail, ClinicError> {
        Self::send_json(self.http.get(self.url(&format!("/sleep/{id}"))))
    }

    pub fn list_sleep_records(
        &self,
        patient_id: Option<&str>,
    ) -> Result<Vec<SleepRecord>, ClinicError> {
        let mut req = self.http.get(self.url("/sleep"));
        if let Some(p) = patient_id {
            req = req.query(&[("patient_id", p)]);
        }
        Self::send_json(req)
    }

    pub fn update_sleep_record(
        &self,
        id: i64,
        fields: &UpdateSleepRecordFields,
    ) -> Result<SleepRecord, ClinicError> {
        Self::send_json(self.http.patch(self.url(&format!("/sleep/{id}"))).json(fields))
    }

    pub fn delete_sleep_record(&self, id: i64) -> Result<(), ClinicError> {
        Self::send(self.http.delete(self.url(&format!("/sleep/{id}")))).map(|_| ())
    }

    // --- Files ---

    pub fn upload_file(
        &self,
        sleep_record_id: i64,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<FileAttachment, ClinicError> {
        Self::send_json(
            self.http
                .post(self.url(&format!("/sleep/{sleep_record_id}/files")))
                .query(&[("filename", filename)])
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes),
        )
    }

    /// Sends several files in one `multipart/form-data` request.
    pub fn upload_files(
        &self,
        sleep_record_id: i64,
        parts: Vec<UploadPart>,
    ) -> Result<UploadBatch, ClinicError> {
        let mut form = Form::new();
        for part in parts {
            let file = Part::bytes(part.bytes)
                .file_name(part.filename)
                .mime_str(&part.content_type)
                .map_err(|e| {
                    ClinicError::Validation(format!(
                        "invalid content type {:?}: {e}",
                        part.content_type
                    ))
                })?;
            form = form.part("files", file);
        }
        Self::send_json(
            self.http
                .post(self.url(&format!("/sleep/{sleep_record_id}/files")))
                .multipart(form),
        )
    }

    pub fn list_files(
        &self,
        sleep_record_id: i64,
        category: Option<FileCategory>,
    ) -> Result<Vec<FileAttachment>, ClinicError> {
        let mut req = self
            .http
            .get(self.url(&format!("/sleep/{sleep_record_id}/files")));
        if let Some(c) = category {
            req = req.query(&[("category", c.as_str())]);
        }
        Self::send_json(req)
    }

    pub fn download_file(&self, id: i64) -> Result<Vec<u8>, ClinicError> {
        let resp = Self::send(self.http.get(self.url(&format!("/files/{id}"))))?;
        resp.bytes()
            .map(|b| b.to_vec())
            .map_err(|e| ClinicError::Internal(e.to_string()))
    }

    // --- Translation ---

    pub fn translate(&self, text: &str) -> Result<String, ClinicError> {
        #[derive(serde::Deserialize)]
        struct Reply {
            translation: String,
        }
        let body = serde_json::json!({ "text": text });
        let reply: Reply = Self::send_json(self.http.post(self.url("/translate")).json(&body))?;
        Ok(reply.translation)
    }
}
