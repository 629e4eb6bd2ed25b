use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use framer_hw::Camera;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "framer", about = "Face-tracking camera framing CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track the face at INDEX in detection order (negative deselects)
    Select {
        #[arg(allow_hyphen_values = true)]
        index: i32,
    },
    /// Stop tracking and show the full frame
    Clear,
    /// Set the margin around the tracked face, in face sizes per side
    Margin { margin: f64 },
    /// Set the output aspect ratio (16:9, 1:1, 16:10 or W:H)
    Ratio { name: String },
    /// Set the output mode (stream, virtual_cam, none)
    Output { mode: String },
    /// Switch the daemon to another camera device
    Camera { device: String },
    /// List loaded known faces
    Faces,
    /// Show daemon status
    Status,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics directly, bypassing the daemon
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value_t = 30)]
        frames: usize,
    },
}

#[zbus::proxy(
    interface = "org.freedesktop.Framer1",
    default_service = "org.freedesktop.Framer1",
    default_path = "/org/freedesktop/Framer1"
)]
trait Framer {
    fn select_face(&self, index: i32) -> zbus::Result<bool>;
    fn clear_selection(&self) -> zbus::Result<()>;
    fn set_margin(&self, margin: f64) -> zbus::Result<()>;
    fn set_aspect_ratio(&self, name: &str) -> zbus::Result<()>;
    fn set_output_mode(&self, mode: &str) -> zbus::Result<()>;
    fn set_camera(&self, device: &str) -> zbus::Result<()>;
    fn list_known_faces(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

async fn proxy() -> Result<FramerProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot reach the D-Bus session bus")?;
    FramerProxy::new(&conn)
        .await
        .context("framerd is not running")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Select { index } => {
            let tracking = proxy().await?.select_face(index).await?;
            if tracking {
                println!("Tracking face {index}");
            } else {
                println!("Tracking cleared");
            }
        }
        Commands::Clear => {
            proxy().await?.clear_selection().await?;
            println!("Tracking cleared");
        }
        Commands::Margin { margin } => {
            proxy().await?.set_margin(margin).await?;
            println!("Margin set to {margin}");
        }
        Commands::Ratio { name } => {
            proxy().await?.set_aspect_ratio(&name).await?;
            println!("Aspect ratio set to {name}");
        }
        Commands::Output { mode } => {
            proxy().await?.set_output_mode(&mode).await?;
            println!("Output mode set to {mode}");
        }
        Commands::Camera { device } => {
            proxy().await?.set_camera(&device).await?;
            println!("Camera switched to {device}");
        }
        Commands::Faces => {
            print_json(&proxy().await?.list_known_faces().await?)?;
        }
        Commands::Status => {
            print_json(&proxy().await?.status().await?)?;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test { device, frames } => run_camera_test(&device, frames)?,
    }

    Ok(())
}

fn run_camera_test(device: &str, frames: usize) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let camera = Camera::open(device, 1280, 720)?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let mut stream = camera.stream()?;
    let started = Instant::now();
    let (mut captured, mut failed) = (0usize, 0usize);
    let mut brightness = 0.0f32;

    for _ in 0..frames {
        match stream.next_frame() {
            Ok(frame) => {
                captured += 1;
                brightness += frame.avg_brightness();
            }
            Err(e) => {
                failed += 1;
                tracing::debug!(error = %e, "capture failed");
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f32();
    println!("Captured {captured}/{frames} frames ({failed} failed)");
    if captured > 0 {
        println!("Average brightness: {:.1}", brightness / captured as f32);
        println!("Throughput: {:.1} fps", captured as f32 / elapsed.max(f32::EPSILON));
    }
    Ok(())
}
