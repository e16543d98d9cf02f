use std::io::Write;
use std::path::PathBuf;
use std::process;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use somno::client::{Client, UploadPart};
use somno::daemon::{self, DaemonConfig};
use somno::db;
use somno::error::ClinicError;
use somno::id;
use somno::output::{self, OutputMode};
use somno::translate::{self, TranslatorConfig};
use somno::types::{
    CreateDoctorParams, CreatePatientParams, CreateSleepRecordParams, FileCategory, Gender,
    SleepMetrics, UpdateDoctorFields, UpdatePatientFields, UpdateSleepRecordFields,
};

#[derive(Parser)]
#[command(name = "sn", about = "Sleep clinic records: patients, doctors and sleep studies")]
struct Cli {
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the records daemon
    Daemon {
        #[arg(long, env = "SN_PORT", default_value_t = daemon::DEFAULT_PORT)]
        port: u16,
        #[arg(long, env = "SN_DATA_DIR", default_value = ".somno")]
        data_dir: PathBuf,
        #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
        gemini_api_key: Option<String>,
        #[arg(long, env = "GEMINI_BASE_URL", default_value = translate::DEFAULT_BASE_URL)]
        gemini_base_url: String,
        #[arg(long, env = "GEMINI_MODEL", default_value = translate::DEFAULT_MODEL)]
        gemini_model: String,
        /// bcrypt cost for patient passwords
        #[arg(
            long,
            env = "SN_PASSWORD_COST",
            default_value_t = db::DEFAULT_PASSWORD_COST,
            value_parser = clap::value_parser!(u32).range(4..=31)
        )]
        password_cost: u32,
        #[command(subcommand)]
        subcmd: Option<DaemonSubcommand>,
    },
    /// Print the id that follows `last` for a prefix
    NextId {
        prefix: char,
        last: Option<String>,
    },
    #[command(subcommand)]
    Patient(PatientCommand),
    #[command(subcommand)]
    Doctor(DoctorCommand),
    #[command(subcommand)]
    Sleep(SleepCommand),
    #[command(subcommand)]
    File(FileCommand),
    /// Translate Chinese text to English through the daemon
    Translate {
        text: String,
    },
    Status,
}

#[derive(Subcommand)]
enum DaemonSubcommand {
    Status,
}

#[derive(Subcommand)]
enum PatientCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(short = 'g', long)]
        gender: Gender,
        #[arg(long)]
        birth_date: Option<NaiveDate>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, env = "SN_PATIENT_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        confirm_password: String,
    },
    Show {
        id: String,
    },
    List,
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(short = 'g', long)]
        gender: Option<Gender>,
        #[arg(long)]
        birth_date: Option<NaiveDate>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, requires = "confirm_password")]
        password: Option<String>,
        #[arg(long, requires = "password")]
        confirm_password: Option<String>,
    },
    Delete {
        id: String,
    },
    /// Check a password against the one stored for a patient
    VerifyPassword {
        id: String,
        #[arg(long)]
        password: String,
    },
}

#[derive(Subcommand)]
enum DoctorCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    Show {
        id: String,
    },
    List,
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    Delete {
        id: String,
    },
    /// Assign patients to a doctor
    Link {
        doctor_id: String,
        #[arg(required = true)]
        patient_ids: Vec<String>,
    },
    Unlink {
        doctor_id: String,
        patient_id: String,
    },
}

#[derive(Args)]
struct MetricArgs {
    #[arg(long)]
    ahi: Option<f64>,
    #[arg(long)]
    odi: Option<f64>,
    #[arg(long)]
    min_spo2: Option<f64>,
    #[arg(long)]
    mean_spo2: Option<f64>,
    #[arg(long)]
    sleep_efficiency: Option<f64>,
    #[arg(long)]
    total_sleep_minutes: Option<i64>,
}

impl From<MetricArgs> for SleepMetrics {
    fn from(m: MetricArgs) -> Self {
        SleepMetrics {
            ahi: m.ahi,
            odi: m.odi,
            min_spo2: m.min_spo2,
            mean_spo2: m.mean_spo2,
            sleep_efficiency: m.sleep_efficiency,
            total_sleep_minutes: m.total_sleep_minutes,
        }
    }
}

#[derive(Subcommand)]
enum SleepCommand {
    Add {
        #[arg(short = 'p', long)]
        patient: String,
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
        #[command(flatten)]
        metrics: MetricArgs,
        #[arg(long)]
        notes: Option<String>,
    },
    Show {
        id: i64,
    },
    List {
        #[arg(short = 'p', long)]
        patient: Option<String>,
    },
    Update {
        id: i64,
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        #[command(flatten)]
        metrics: MetricArgs,
        #[arg(long)]
        notes: Option<String>,
    },
    Delete {
        id: i64,
    },
}

#[derive(Subcommand)]
enum FileCommand {
    /// Attach PDF reports or CT slices to a sleep record
    Upload {
        record_id: i64,
        /// One or more files; several are sent as one multipart request
        #[arg(required = true, num_args = 1..=daemon::MAX_FILES_PER_UPLOAD)]
        paths: Vec<PathBuf>,
        /// Overrides the type guessed from each file's extension
        #[arg(long)]
        content_type: Option<String>,
    },
    List {
        record_id: i64,
        #[arg(long)]
        category: Option<FileCategory>,
    },
    /// Download an attachment; writes to stdout unless --out is given
    Get {
        id: i64,
        #[arg(short = 'o', long)]
        out: Option<PathBuf>,
    },
}

fn fail(err: ClinicError, mode: OutputMode) -> ! {
    output::print_error(&err, mode);
    process::exit(1);
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("dcm") | Some("dicom") => "application/dicom",
        _ => "application/octet-stream",
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Daemon {
            port,
            data_dir,
            gemini_api_key,
            gemini_base_url,
            gemini_model,
            password_cost,
            subcmd,
        } => match subcmd {
            Some(DaemonSubcommand::Status) => {
                let client = Client::new();
                match client.check_reachable() {
                    Ok(()) => {
                        println!("daemon reachable at {}", client.base_url());
                        process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("daemon unreachable: {e}");
                        process::exit(1);
                    }
                }
            }
            None => {
                let translator = gemini_api_key
                    .filter(|k| !k.trim().is_empty())
                    .map(|key| TranslatorConfig {
                        base_url: gemini_base_url,
                        model: gemini_model,
                        ..TranslatorConfig::new(key)
                    });
                let config = DaemonConfig {
                    translator,
                    password_cost,
                    ..DaemonConfig::new(port, data_dir)
                };
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => fail(
                        ClinicError::Internal(format!("failed to create tokio runtime: {e}")),
                        mode,
                    ),
                };
                if let Err(e) = rt.block_on(daemon::start(config)) {
                    fail(e, mode);
                }
            }
        },

        Commands::NextId { prefix, last } => match id::next_id(prefix, last.as_deref()) {
            Ok(next) => output::print_next_id(&next, mode),
            Err(e) => fail(e.into(), mode),
        },

        Commands::Patient(cmd) => run_patient(cmd, mode),
        Commands::Doctor(cmd) => run_doctor(cmd, mode),
        Commands::Sleep(cmd) => run_sleep(cmd, mode),
        Commands::File(cmd) => run_file(cmd, mode),

        Commands::Translate { text } => match Client::new().translate(&text) {
            Ok(t) => output::print_translation(&t, mode),
            Err(e) => fail(e, mode),
        },

        Commands::Status => match Client::new().status() {
            Ok(counts) => output::print_status(&counts, mode),
            Err(e) => fail(e, mode),
        },
    }
}

fn run_patient(cmd: PatientCommand, mode: OutputMode) {
    let client = Client::new();
    match cmd {
        PatientCommand::Create {
            name,
            gender,
            birth_date,
            phone,
            email,
            address,
            notes,
            password,
            confirm_password,
        } => {
            let params = CreatePatientParams {
                name,
                gender,
                birth_date,
                phone,
                email,
                address,
                notes,
                password,
                confirm_password,
            };
            match client.create_patient(&params) {
                Ok(p) => output::print_patient(&p, mode),
                Err(e) => fail(e, mode),
            }
        }
        PatientCommand::Show { id } => match client.get_patient(&id) {
            Ok(detail) => output::print_patient_detail(&detail, mode),
            Err(e) => fail(e, mode),
        },
        PatientCommand::List => match client.list_patients() {
            Ok(list) => output::print_patient_list(&list, mode),
            Err(e) => fail(e, mode),
        },
        PatientCommand::Update {
            id,
            name,
            gender,
            birth_date,
            phone,
            email,
            address,
            notes,
            password,
            confirm_password,
        } => {
            let fields = UpdatePatientFields {
                name,
                gender,
                birth_date,
                phone,
                email,
                address,
                notes,
                password,
                confirm_password,
            };
            match client.update_patient(&id, &fields) {
                Ok(p) => output::print_patient(&p, mode),
                Err(e) => fail(e, mode),
            }
        }
        PatientCommand::Delete { id } => match client.delete_patient(&id) {
            Ok(()) => output::print_deleted("patient", &id, mode),
            Err(e) => fail(e, mode),
        },
        PatientCommand::VerifyPassword { id, password } => {
            match client.verify_patient_password(&id, &password) {
                Ok(is_valid) => {
                    output::print_password_check(&id, is_valid, mode);
                    if !is_valid {
                        process::exit(1);
                    }
                }
                Err(e) => fail(e, mode),
            }
        }
    }
}

fn run_doctor(cmd: DoctorCommand, mode: OutputMode) {
    let client = Client::new();
    match cmd {
        DoctorCommand::Create {
            name,
            department,
            phone,
            email,
        } => {
            let params = CreateDoctorParams {
                name,
                department,
                phone,
                email,
            };
            match client.create_doctor(&params) {
                Ok(d) => output::print_doctor(&d, mode),
                Err(e) => fail(e, mode),
            }
        }
        DoctorCommand::Show { id } => match client.get_doctor(&id) {
            Ok(detail) => output::print_doctor_detail(&detail, mode),
            Err(e) => fail(e, mode),
        },
        DoctorCommand::List => match client.list_doctors() {
            Ok(list) => output::print_doctor_list(&list, mode),
            Err(e) => fail(e, mode),
        },
        DoctorCommand::Update {
            id,
            name,
            department,
            phone,
            email,
        } => {
            let fields = UpdateDoctorFields {
                name,
                department,
                phone,
                email,
            };
            match client.update_doctor(&id, &fields) {
                Ok(d) => output::print_doctor(&d, mode),
                Err(e) => fail(e, mode),
            }
        }
        DoctorCommand::Delete { id } => match client.delete_doctor(&id) {
            Ok(()) => output::print_deleted("doctor", &id, mode),
            Err(e) => fail(e, mode),
        },
        DoctorCommand::Link {
            doctor_id,
            patient_ids,
        } => match client.link_patients(&doctor_id, &patient_ids) {
            Ok(detail) => output::print_doctor_detail(&detail, mode),
            Err(e) => fail(e, mode),
        },
        DoctorCommand::Unlink {
            doctor_id,
            patient_id,
        } => match client.unlink_patient(&doctor_id, &patient_id) {
            Ok(()) => output::print_deleted("link", &format!("{doctor_id}/{patient_id}"), mode),
            Err(e) => fail(e, mode),
        },
    }
}

fn run_sleep(cmd: SleepCommand, mode: OutputMode) {
    let client = Client::new();
    match cmd {
        SleepCommand::Add {
            patient,
            start,
            end,
            metrics,
            notes,
        } => {
            let params = CreateSleepRecordParams {
                patient_id: patient,
                record_start: start,
                record_end: end,
                metrics: metrics.into(),
                notes,
            };
            match client.create_sleep_record(&params) {
                Ok(r) => output::print_record(&r, mode),
                Err(e) => fail(e, mode),
            }
        }
        SleepCommand::Show { id } => match client.get_sleep_record(id) {
            Ok(detail) => output::print_record_detail(&detail, mode),
            Err(e) => fail(e, mode),
        },
        SleepCommand::List { patient } => match client.list_sleep_records(patient.as_deref()) {
            Ok(list) => output::print_record_list(&list, mode),
            Err(e) => fail(e, mode),
        },
        SleepCommand::Update {
            id,
            start,
            end,
            metrics,
            notes,
        } => {
            let fields = UpdateSleepRecordFields {
                record_start: start,
                record_end: end,
                metrics: metrics.into(),
                notes,
            };
            match client.update_sleep_record(id, &fields) {
                Ok(r) => output::print_record(&r, mode),
                Err(e) => fail(e, mode),
            }
        }
        SleepCommand::Delete { id } => match client.delete_sleep_record(id) {
            Ok(()) => output::print_deleted("sleep record", &id.to_string(), mode),
            Err(e) => fail(e, mode),
        },
    }
}

fn run_file(cmd: FileCommand, mode: OutputMode) {
    let client = Client::new();
    match cmd {
        FileCommand::Upload {
            record_id,
            paths,
            content_type,
        } => {
            let mut parts: Vec<UploadPart> = paths
                .iter()
                .map(|path| {
                    let bytes = match std::fs::read(path) {
                        Ok(b) => b,
                        Err(e) => fail(
                            ClinicError::Validation(format!(
                                "cannot read {}: {e}",
                                path.display()
                            )),
                            mode,
                        ),
                    };
                    UploadPart {
                        filename: path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        content_type: content_type
                            .clone()
                            .unwrap_or_else(|| content_type_for(path).to_string()),
                        bytes,
                    }
                })
                .collect();

            if parts.len() > 1 {
                match client.upload_files(record_id, parts) {
                    Ok(batch) => output::print_upload_batch(&batch, mode),
                    Err(e) => fail(e, mode),
                }
                return;
            }
            let Some(part) = parts.pop() else {
                fail(ClinicError::Validation("no files given".to_string()), mode);
            };
            match client.upload_file(record_id, &part.filename, &part.content_type, part.bytes) {
                Ok(f) => output::print_file(&f, mode),
                Err(e) => fail(e, mode),
            }
        }
        FileCommand::List {
            record_id,
            category,
        } => match client.list_files(record_id, category) {
            Ok(list) => output::print_file_list(&list, mode),
            Err(e) => fail(e, mode),
        },
        FileCommand::Get { id, out } => {
            let bytes = match client.download_file(id) {
                Ok(b) => b,
                Err(e) => fail(e, mode),
            };
            let written = match &out {
                Some(path) => std::fs::write(path, &bytes),
                None => std::io::stdout().write_all(&bytes),
            };
            if let Err(e) = written {
                fail(
                    ClinicError::Internal(format!("failed to write file: {e}")),
                    mode,
                );
            }
            if let Some(path) = out
                && mode == OutputMode::Human
            {
                eprintln!("wrote {} bytes to {}", bytes.len(), path.display());
            }
        }
    }
}
