use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn register(&self, name: &str, id: &str, photo_paths: &[String]) -> zbus::Result<String>;
    async fn scan(&self, image_path: &str) -> zbus::Result<String>;
    async fn list_students(&self) -> zbus::Result<String>;
    async fn remove_student(&self, id: &str) -> zbus::Result<String>;
    async fn list_sessions(&self) -> zbus::Result<String>;
    async fn create_session(&self, payload_json: &str) -> zbus::Result<String>;
    async fn stats(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Seconds to wait for the daemon to answer
    #[arg(long, global = true, default_value_t = 120)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from three or more photos
    Register {
        /// Registration number
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Photo files (jpg, jpeg, png)
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Recognize the students in a classroom photo
    Scan {
        image: PathBuf,
        /// Record the result as an attendance session
        #[arg(long)]
        record: bool,
        #[arg(long, requires = "record")]
        course_name: Option<String>,
        #[arg(long, requires = "record")]
        course_code: Option<String>,
    },
    /// List enrolled students
    Students,
    /// Remove an enrolled student and their photos
    Remove { id: String },
    /// List recorded attendance sessions
    Sessions,
    /// Show attendance statistics
    Stats,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(cli.timeout))
        .build()
        .await
        .context("failed to connect to the message bus")?;
    let proxy = AttendanceProxy::new(&conn).await?;

    let output = match cli.command {
        Commands::Register { id, name, photos } => {
            let paths = photos
                .iter()
                .map(|p| absolute(p))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(%id, photos = paths.len(), "registering");
            proxy.register(&name, &id, &paths).await?
        }
        Commands::Scan {
            image,
            record,
            course_name,
            course_code,
        } => {
            let scan = proxy.scan(&absolute(&image)?).await?;
            if record {
                let payload = session_payload(&scan, course_name, course_code)?;
                let session = proxy.create_session(&payload).await?;
                serde_json::json!({
                    "scan": parse(&scan)?,
                    "session": parse(&session)?["session"],
                })
                .to_string()
            } else {
                scan
            }
        }
        Commands::Students => proxy.list_students().await?,
        Commands::Remove { id } => proxy.remove_student(&id).await?,
        Commands::Sessions => proxy.list_sessions().await?,
        Commands::Stats => proxy.stats().await?,
        Commands::Status => proxy.status().await?,
    };

    println!("{}", serde_json::to_string_pretty(&parse(&output)?)?);
    Ok(())
}

/// The daemon resolves paths in its own working directory.
fn absolute(path: &Path) -> Result<String> {
    let resolved = std::fs::canonicalize(path)
        .with_context(|| format!("cannot access {}", path.display()))?;
    Ok(resolved.to_string_lossy().into_owned())
}

fn parse(json: &str) -> Result<Value> {
    serde_json::from_str(json).context("daemon returned malformed JSON")
}

/// Scan result plus optional course labels, as accepted by CreateSession.
fn session_payload(
    scan: &str,
    course_name: Option<String>,
    course_code: Option<String>,
) -> Result<String> {
    let mut payload = parse(scan)?;
    let object = payload
        .as_object_mut()
        .context("scan result is not a JSON object")?;
    if let Some(name) = course_name {
        object.insert("courseName".into(), Value::String(name));
    }
    if let Some(code) = course_code {
        object.insert("courseCode".into(), Value::String(code));
    }
    Ok(payload.to_string())
}
