use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn start_scanning(&self, metadata_json: &str) -> zbus::Result<String>;
    async fn stop_scanning(&self) -> zbus::Result<String>;
    async fn session(&self) -> zbus::Result<String>;
    async fn reload_faces(&self) -> zbus::Result<String>;
    async fn list_faces(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn start_camera(&self) -> zbus::Result<String>;
    async fn stop_camera(&self) -> zbus::Result<String>;
    async fn camera_status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    /// Print raw JSON replies
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Control the capture camera
    Camera {
        #[command(subcommand)]
        action: CameraAction,
    },
    /// Start or stop an attendance scan
    Scan {
        #[command(subcommand)]
        action: ScanAction,
    },
    /// Show the current session
    Session,
    /// Enrolled faces
    Faces {
        #[command(subcommand)]
        action: FacesAction,
    },
    /// Show daemon status
    Status,
    /// List local V4L2 capture devices (no daemon needed)
    Devices,
}

#[derive(Subcommand)]
enum CameraAction {
    Start,
    Stop,
    Status,
}

#[derive(Subcommand)]
enum ScanAction {
    /// Open a session for a class meeting
    Start {
        /// Class identifier (policy lookup key)
        #[arg(long)]
        class: String,
        /// Timetable slot identifier
        #[arg(long)]
        slot: Option<String>,
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        lecturer: Option<String>,
        /// Number of students expected
        #[arg(long)]
        expected: Option<usize>,
        /// Scheduled start, RFC 3339 (e.g. 2026-03-02T09:00:00Z)
        #[arg(long, value_parser = parse_start)]
        start: Option<DateTime<Utc>>,
    },
    /// Close the session and print the final roll
    Stop,
}

#[derive(Subcommand)]
enum FacesAction {
    List,
    /// Re-read the enrollment directory
    Reload,
}

fn parse_start(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected RFC 3339 timestamp: {e}"))
}

fn session_metadata(
    class: String,
    slot: Option<String>,
    room: Option<String>,
    lecturer: Option<String>,
    expected: Option<usize>,
    start: Option<DateTime<Utc>>,
) -> Value {
    serde_json::json!({
        "class_id": class,
        "timetable_slot_id": slot,
        "room": room,
        "lecturer": lecturer,
        "expected_count": expected,
        "scheduled_start": start,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Devices => {
            list_devices();
            return Ok(());
        }
        command => command,
    };

    let session_bus = cli.session_bus || std::env::var("ROLLCALL_BUS").is_ok_and(|v| v == "session");
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    let reply = match command {
        Commands::Camera { action } => match action {
            CameraAction::Start => proxy.start_camera().await?,
            CameraAction::Stop => proxy.stop_camera().await?,
            CameraAction::Status => proxy.camera_status().await?,
        },
        Commands::Scan { action } => match action {
            ScanAction::Start { class, slot, room, lecturer, expected, start } => {
                let metadata = session_metadata(class, slot, room, lecturer, expected, start);
                proxy.start_scanning(&metadata.to_string()).await?
            }
            ScanAction::Stop => proxy.stop_scanning().await?,
        },
        Commands::Session => proxy.session().await?,
        Commands::Faces { action } => match action {
            FacesAction::List => proxy.list_faces().await?,
            FacesAction::Reload => proxy.reload_faces().await?,
        },
        Commands::Status => proxy.status().await?,
        Commands::Devices => return Ok(()),
    };

    let value: Value = serde_json::from_str(&reply).context("daemon sent invalid JSON")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", render(&value));
    }
    Ok(())
}

fn list_devices() {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

/// Human-readable form of a daemon reply. Session states print as a roll;
/// everything else as indented JSON.
fn render(value: &Value) -> String {
    match value.get("entries").and_then(Value::as_array) {
        Some(entries) => render_roll(value, entries),
        None => serde_json::to_string_pretty(value).map(|s| s + "\n").unwrap_or_default(),
    }
}

fn render_roll(session: &Value, entries: &[Value]) -> String {
    let mut out = String::new();
    let class = session["metadata"]["class_id"].as_str().unwrap_or("-");
    let state = if session["active"].as_bool().unwrap_or(false) { "active" } else { "closed" };
    out.push_str(&format!("Session {class} ({state}): {} present\n", entries.len()));
    for e in entries {
        out.push_str(&format!(
            "  {:<12} {:<24} {:<8} {:.2}\n",
            e["identity_id"].as_str().unwrap_or("?"),
            e["display_name"].as_str().unwrap_or(""),
            e["status"].as_str().unwrap_or("pending"),
            e["confidence"].as_f64().unwrap_or(0.0),
        ));
    }
    out
}
