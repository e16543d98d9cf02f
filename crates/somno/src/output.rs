use serde::Serialize;

use crate::db::fmt_dt;
use crate::error::{ClinicError, ErrorResponse};
use crate::types::{
    Doctor, DoctorDetail, DoctorListEntry, FileAttachment, Patient, PatientDetail,
    PatientSummary, SleepRecord, SleepRecordDetail, StatusCounts, UploadBatch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Json,
    Human,
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("error: failed to encode output: {e}"),
    }
}

pub fn print_error(err: &ClinicError, mode: OutputMode) {
    match mode {
        OutputMode::Json => {
            let resp = ErrorResponse::from(err);
            match serde_json::to_string(&resp) {
                Ok(s) => eprintln!("{s}"),
                Err(_) => eprintln!("error: {err}"),
            }
        }
        OutputMode::Human => {
            eprintln!("error: {err}");
        }
    }
}

fn or_dash(v: Option<&str>) -> &str {
    v.unwrap_or("-")
}

fn metric(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.1}")).unwrap_or_else(|| "-".to_string())
}

fn patient_line(p: &Patient) -> String {
    let born = p
        .birth_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{}  {:<20} {:<6} born {born}", p.id, p.name, p.gender.as_str())
}

fn doctor_line(d: &Doctor) -> String {
    format!("{}  {:<20} {}", d.id, d.name, or_dash(d.department.as_deref()))
}

fn record_line(r: &SleepRecord) -> String {
    format!(
        "#{:<5} {}  {} .. {}  AHI {}  minSpO2 {}",
        r.id,
        r.patient_id,
        fmt_dt(r.record_start),
        fmt_dt(r.record_end),
        metric(r.ahi),
        metric(r.min_spo2),
    )
}

fn file_line(f: &FileAttachment) -> String {
    format!(
        "#{:<5} [{}] {}  {} bytes  {}",
        f.id,
        f.category.as_str(),
        f.filename,
        f.size_bytes,
        f.content_type
    )
}

pub fn print_patient(p: &Patient, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(p),
        OutputMode::Human => println!("{}", patient_line(p)),
    }
}

pub fn print_patient_detail(detail: &PatientDetail, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(detail),
        OutputMode::Human => {
            let p = &detail.patient;
            println!("{}", patient_line(p));
            println!(
                "  phone: {}  email: {}",
                or_dash(p.phone.as_deref()),
                or_dash(p.email.as_deref())
            );
            if let Some(addr) = &p.address {
                println!("  address: {addr}");
            }
            if let Some(notes) = &p.notes {
                println!("  notes: {notes}");
            }
            if !detail.doctors.is_empty() {
                println!("  doctors:");
                for d in &detail.doctors {
                    println!("    {}", doctor_line(d));
                }
            }
            if !detail.sleep_records.is_empty() {
                println!("  sleep records:");
                for r in &detail.sleep_records {
                    println!("    {}", record_line(r));
                }
            }
        }
    }
}

pub fn print_patient_list(list: &[PatientSummary], mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(list),
        OutputMode::Human => {
            if list.is_empty() {
                println!("(no patients)");
            }
            for p in list {
                let latest = p
                    .latest_record_start
                    .map(fmt_dt)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<20} {:<6} records {:<3} latest {latest}  AHI {}",
                    p.id,
                    p.name,
                    p.gender.as_str(),
                    p.total_record_count,
                    metric(p.latest_ahi)
                );
            }
        }
    }
}

pub fn print_doctor(d: &Doctor, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(d),
        OutputMode::Human => println!("{}", doctor_line(d)),
    }
}

pub fn print_doctor_detail(detail: &DoctorDetail, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(detail),
        OutputMode::Human => {
            println!("{}", doctor_line(&detail.doctor));
            if detail.patients.is_empty() {
                println!("  (no patients)");
            }
            for p in &detail.patients {
                println!("    {}", patient_line(p));
            }
        }
    }
}

pub fn print_doctor_list(list: &[DoctorListEntry], mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(list),
        OutputMode::Human => {
            if list.is_empty() {
                println!("(no doctors)");
            }
            for entry in list {
                let names: Vec<&str> = entry.patients.iter().map(|p| p.id.as_str()).collect();
                println!("{}  patients: {}", doctor_line(&entry.doctor), names.join(","));
            }
        }
    }
}

pub fn print_record(r: &SleepRecord, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(r),
        OutputMode::Human => println!("{}", record_line(r)),
    }
}

pub fn print_record_detail(detail: &SleepRecordDetail, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(detail),
        OutputMode::Human => {
            let r = &detail.record;
            println!("{}", record_line(r));
            println!(
                "  ODI {}  meanSpO2 {}  efficiency {}  sleep {} min",
                metric(r.odi),
                metric(r.mean_spo2),
                metric(r.sleep_efficiency),
                r.total_sleep_minutes
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            if let Some(notes) = &r.notes {
                println!("  notes: {notes}");
            }
            for f in &detail.files {
                println!("    {}", file_line(f));
            }
        }
    }
}

pub fn print_record_list(list: &[SleepRecord], mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(list),
        OutputMode::Human => {
            if list.is_empty() {
                println!("(no sleep records)");
            }
            for r in list {
                println!("{}", record_line(r));
            }
        }
    }
}

pub fn print_file(f: &FileAttachment, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(f),
        OutputMode::Human => println!("{}  sha256 {}", file_line(f), f.sha256),
    }
}

pub fn print_file_list(list: &[FileAttachment], mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(list),
        OutputMode::Human => {
            if list.is_empty() {
                println!("(no files)");
            }
            for f in list {
                println!("{}", file_line(f));
            }
        }
    }
}

pub fn print_upload_batch(batch: &UploadBatch, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(batch),
        OutputMode::Human => {
            println!("uploaded {} files", batch.file_count);
            for f in &batch.files {
                println!("{}", file_line(f));
            }
        }
    }
}

pub fn print_password_check(id: &str, is_valid: bool, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(&serde_json::json!({ "id": id, "is_valid": is_valid })),
        OutputMode::Human if is_valid => println!("password for {id} is valid"),
        OutputMode::Human => println!("password for {id} is NOT valid"),
    }
}

pub fn print_status(counts: &StatusCounts, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(counts),
        OutputMode::Human => println!(
            "patients: {}  doctors: {}  sleep records: {}  files: {}",
            counts.patients, counts.doctors, counts.sleep_records, counts.files
        ),
    }
}

pub fn print_translation(translation: &str, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(&serde_json::json!({ "translation": translation })),
        OutputMode::Human => println!("{translation}"),
    }
}

pub fn print_next_id(id: &str, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(&serde_json::json!({ "id": id })),
        OutputMode::Human => println!("{id}"),
    }
}

pub fn print_deleted(what: &str, id: &str, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(&serde_json::json!({ "status": "deleted", "kind": what, "id": id })),
        OutputMode::Human => println!("deleted {what} {id}"),
    }
}
