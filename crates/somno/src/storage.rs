//! On-disk storage for sleep study attachments.
//!
//! Uploads live under the data directory, one folder per patient, record and
//! category:
//!
//! ```text
//! uploads/
//! └── P001/
//!     └── 42/
//!         ├── pdf/1709330400000-report.pdf
//!         └── ct/1709330400123-slice_001.dcm
//! ```
//!
//! Every path is resolved through a [`PathBoundary`] rooted at `uploads/`, so
//! nothing a client sends can reach outside it. Stored names are prefixed
//! with the upload time in milliseconds so repeated uploads of the same
//! filename never overwrite each other.

use std::io;
use std::path::{Component, Path};

use chrono::Utc;
use sha2::{Digest, Sha256};
use strict_path::{PathBoundary, StrictPath, StrictPathError};

use crate::error::ClinicError;
use crate::types::{FileAttachment, FileCategory, NewAttachment};

pub const UPLOADS_DIR: &str = "uploads";
const MAX_NAME_LEN: usize = 120;

/// Marker for paths inside the uploads tree.
#[derive(Debug, Clone, Copy)]
pub struct UploadArea;

#[derive(Debug, Clone)]
pub struct Uploads {
    boundary: PathBoundary<UploadArea>,
}

impl Uploads {
    /// Opens (creating if needed) `<data_dir>/uploads`.
    pub fn open(data_dir: &Path) -> Result<Self, ClinicError> {
        let boundary = PathBoundary::try_new_create(data_dir.join(UPLOADS_DIR))
            .map_err(|e| ClinicError::Internal(format!("failed to open upload dir: {e}")))?;
        Ok(Uploads { boundary })
    }

    pub fn root(&self) -> &Path {
        self.boundary.as_ref()
    }

    fn patient_dir(&self, patient_id: &str) -> Result<StrictPath<UploadArea>, ClinicError> {
        let segment = single_segment(patient_id).ok_or_else(|| {
            ClinicError::Validation(format!("invalid patient id {patient_id:?}"))
        })?;
        self.boundary.strict_join(segment).map_err(boundary_error)
    }

    fn record_dir(
        &self,
        patient_id: &str,
        sleep_record_id: i64,
    ) -> Result<StrictPath<UploadArea>, ClinicError> {
        self.patient_dir(patient_id)?
            .strict_join(sleep_record_id.to_string())
            .map_err(boundary_error)
    }

    fn file_path(
        &self,
        patient_id: &str,
        sleep_record_id: i64,
        category: FileCategory,
        stored_name: &str,
    ) -> Result<StrictPath<UploadArea>, ClinicError> {
        let name = single_segment(stored_name).ok_or_else(|| {
            ClinicError::Validation(format!("invalid stored name {stored_name:?}"))
        })?;
        self.record_dir(patient_id, sleep_record_id)?
            .strict_join(category.as_str())
            .and_then(|dir| dir.strict_join(name))
            .map_err(boundary_error)
    }

    /// Writes `bytes` to disk and returns the row describing it.
    ///
    /// `patient_id` must already be a known patient id; it becomes a path
    /// component.
    pub fn save(
        &self,
        patient_id: &str,
        sleep_record_id: i64,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<NewAttachment, ClinicError> {
        let category = FileCategory::from_content_type(content_type).ok_or_else(|| {
            ClinicError::Validation(format!(
                "unsupported content type {content_type:?}; expected application/pdf or application/dicom"
            ))
        })?;
        if bytes.is_empty() {
            return Err(ClinicError::Validation("no file content".to_string()));
        }

        let original = filename.trim();
        let safe = sanitize_filename(original);
        let stored_name = format!("{}-{safe}", Utc::now().timestamp_millis());

        let dir = self
            .record_dir(patient_id, sleep_record_id)?
            .strict_join(category.as_str())
            .map_err(boundary_error)?;
        dir.create_dir_all()
            .map_err(|e| ClinicError::Internal(format!("failed to create upload dir: {e}")))?;
        let path = unique_path(&dir, &stored_name)?;
        path.write(bytes)
            .map_err(|e| ClinicError::Internal(format!("failed to write upload: {e}")))?;

        let stored_name = path
            .strictpath_file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(stored_name);

        Ok(NewAttachment {
            sleep_record_id,
            filename: if original.is_empty() {
                safe
            } else {
                original.to_string()
            },
            stored_name,
            content_type: content_type.to_string(),
            category,
            size_bytes: bytes.len() as i64,
            sha256: sha256_hex(bytes),
        })
    }

    pub fn read(&self, patient_id: &str, file: &FileAttachment) -> Result<Vec<u8>, ClinicError> {
        let path = self.file_path(
            patient_id,
            file.sleep_record_id,
            file.category,
            &file.stored_name,
        )?;
        path.read().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ClinicError::NotFound(format!("content of file {}", file.id))
            }
            _ => ClinicError::Internal(format!(
                "failed to read {}: {e}",
                path.strictpath_display()
            )),
        })
    }

    /// Deletes a file written by [`Uploads::save`] whose row never made it
    /// into the database.
    pub fn discard(&self, patient_id: &str, new: &NewAttachment) {
        let path = match self.file_path(
            patient_id,
            new.sleep_record_id,
            new.category,
            &new.stored_name,
        ) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("failed to discard {}: {e}", new.stored_name);
                return;
            }
        };
        if let Err(e) = path.remove_file() {
            tracing::warn!("failed to discard {}: {e}", path.strictpath_display());
        }
    }

    /// Removes a record's upload folder. Missing folders are fine.
    pub fn remove_record(&self, patient_id: &str, sleep_record_id: i64) -> Result<(), ClinicError> {
        remove_dir_if_present(&self.record_dir(patient_id, sleep_record_id)?)
    }

    pub fn remove_patient(&self, patient_id: &str) -> Result<(), ClinicError> {
        remove_dir_if_present(&self.patient_dir(patient_id)?)
    }
}

/// Accepts `s` only when it names exactly one ordinary path segment, so an
/// empty id or `.` can never resolve to the uploads root itself.
fn single_segment(s: &str) -> Option<&str> {
    let mut components = Path::new(s).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !s.contains(['/', '\\']) => Some(s),
        _ => None,
    }
}

fn boundary_error(e: StrictPathError) -> ClinicError {
    if matches!(e, StrictPathError::PathEscapesBoundary { .. }) {
        ClinicError::Validation(format!("path outside the upload area: {e}"))
    } else {
        ClinicError::Internal(format!("failed to resolve upload path: {e}"))
    }
}

fn remove_dir_if_present(dir: &StrictPath<UploadArea>) -> Result<(), ClinicError> {
    match dir.remove_dir_all() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClinicError::Internal(format!(
            "failed to remove {}: {e}",
            dir.strictpath_display()
        ))),
    }
}

fn unique_path(
    dir: &StrictPath<UploadArea>,
    name: &str,
) -> Result<StrictPath<UploadArea>, ClinicError> {
    let candidate = dir.strict_join(name).map_err(boundary_error)?;
    if !candidate.exists() {
        return Ok(candidate);
    }
    let mut n = 1;
    loop {
        let candidate = dir
            .strict_join(format!("{n}-{name}"))
            .map_err(boundary_error)?;
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Reduces a client supplied filename to `[A-Za-z0-9._-]`, keeping only the
/// final path segment. The result is only used for the on-disk name; the
/// original filename is kept in the attachment row.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let mut out: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    while out.starts_with('.') {
        out.remove(0);
    }
    if out.len() > MAX_NAME_LEN {
        out = out[out.len() - MAX_NAME_LEN..].to_string();
    }
    if out.is_empty() {
        out.push_str("upload");
    }
    out
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
