//! PteroDAQ command-line recorder
//!
//! Lists ports, identifies boards and records timed or edge-triggered runs
//! to the PteroDAQ text format. `--demo` runs against a simulated KL25Z.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use pterodaq_core::board::{probe_code, ChannelKind};
use pterodaq_core::config::{AcquisitionPlan, ChannelSpec, ConnectionConfig};
use pterodaq_core::protocol::list_ports;
use pterodaq_core::session::{Session, TriggerSpec};
use pterodaq_core::sim::SimulatedBoard;

/// PteroDAQ recorder
#[derive(Parser, Debug)]
#[command(name = "pterodaq", version, about = "Record data from PteroDAQ boards")]
struct Cli {
    /// Connection settings (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,

    /// Identify the connected board
    Info {
        #[command(flatten)]
        target: Target,
    },

    /// Record for a fixed time and save the samples
    Record {
        #[command(flatten)]
        target: Target,

        /// Acquisition plan (JSON); a demo plan is used with --demo
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Seconds to record
        #[arg(short, long, default_value_t = 5.0)]
        seconds: f64,

        /// Where to save the recording
        #[arg(short, long)]
        output: PathBuf,

        /// Notes for the recording header
        #[arg(short, long, default_value = "")]
        notes: String,

        /// Write analog values in volts
        #[arg(long)]
        volts: bool,
    },
}

/// Which board to talk to
#[derive(clap::Args, Debug)]
struct Target {
    /// Serial port (first port found when omitted)
    #[arg(short, long, conflicts_with = "demo")]
    port: Option<String>,

    /// Use a simulated board
    #[arg(long)]
    demo: bool,
}

/// A connected session, keeping the simulated board alive in demo mode
struct Connection {
    session: Session,
    _board: Option<SimulatedBoard>,
}

fn connect(cli: &Cli, target: &Target) -> Result<Connection> {
    let mut settings = match &cli.config {
        Some(path) => ConnectionConfig::load(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => ConnectionConfig::default(),
    };
    if target.port.is_some() {
        settings.port_name = target.port.clone();
    }
    let mut session = Session::new(settings);

    if target.demo {
        let (board, host) = SimulatedBoard::kl25z().context("Failed to start simulated board")?;
        board.set_jitter(7, 200);
        board.set_analog(probe_code(ChannelKind::Analog, 8), 20000);
        board.set_analog(probe_code(ChannelKind::Analog, 9), 45000);
        session
            .connect(Box::new(host))
            .context("Failed to connect to simulated board")?;
        return Ok(Connection {
            session,
            _board: Some(board),
        });
    }

    let port = session.connect_port().context("Failed to connect")?;
    tracing::info!("Using {}", port);
    Ok(Connection {
        session,
        _board: None,
    })
}

fn demo_plan() -> AcquisitionPlan {
    AcquisitionPlan {
        trigger: TriggerSpec::timed(0.01),
        reference: "Power".into(),
        averaging: None,
        channels: vec![ChannelSpec::pin("PTB0"), ChannelSpec::pin("PTB1")],
    }
}

fn list(cli: &Cli) -> Result<()> {
    let ports = list_ports();
    if cli.json {
        let json: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "product": p.product,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  [{:04x}:{:04x}] {}",
                port.name,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.name),
        }
    }
    Ok(())
}

fn info(cli: &Cli, target: &Target) -> Result<()> {
    let connection = connect(cli, target)?;
    let session = &connection.session;
    let Some(profile) = session.profile() else {
        bail!("Board did not identify itself");
    };

    if cli.json {
        let json = serde_json::json!({
            "board": profile.name(),
            "version": session.version(),
            "supply_volts": profile.power_voltage(),
            "references": profile.references().collect::<Vec<_>>(),
            "averaging": profile.averaging_options().collect::<Vec<_>>(),
            "trigger_pins": profile.trigger_pins().collect::<Vec<_>>(),
            "pins": profile.pins().len(),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    println!("Board:      {}", profile.name());
    println!("Firmware:   {}", session.version().unwrap_or("?"));
    println!("Supply:     {:.3} V", profile.power_voltage());
    println!(
        "References: {}",
        profile.references().collect::<Vec<_>>().join(", ")
    );
    println!(
        "Averaging:  {}",
        profile.averaging_options().collect::<Vec<_>>().join(", ")
    );
    println!(
        "Triggers:   {}",
        profile.trigger_pins().collect::<Vec<_>>().join(" ")
    );
    println!("Pins:       {}", profile.pins().len());
    Ok(())
}

fn record(
    cli: &Cli,
    target: &Target,
    plan: Option<&Path>,
    seconds: f64,
    output: &Path,
    notes: &str,
    volts: bool,
) -> Result<()> {
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("Recording time must be positive, got {}", seconds);
    }
    let plan = match plan {
        Some(path) => AcquisitionPlan::load(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?,
        None if target.demo => demo_plan(),
        None => bail!("--plan is required unless --demo is given"),
    };

    let mut connection = connect(cli, target)?;
    let session = &mut connection.session;
    session
        .configure_plan(&plan)
        .context("Failed to configure board")?;
    if let Some(period) = session.actual_period() {
        tracing::info!("Timer period {:.9} s", period);
    }

    session.start().context("Failed to start sampling")?;
    thread::sleep(Duration::from_secs_f64(seconds));
    session.stop().context("Failed to stop sampling")?;

    if let Some(message) = session.trigger_error() {
        tracing::warn!("{}", message);
    }
    session
        .save(output, notes, volts, None)
        .with_context(|| format!("Failed to save {}", output.display()))?;

    let counters = session.link_counters();
    if cli.json {
        let json = serde_json::json!({
            "output": output,
            "samples": session.row_count(),
            "dropped": session.dropped_packets(),
            "link": counters,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!(
            "Saved {} samples to {} ({} dropped, {} corrupt frames)",
            session.row_count(),
            output.display(),
            session.dropped_packets(),
            counters.checksum_errors + counters.truncated_frames
        );
    }
    session.disconnect();
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Ports => list(&cli),
        Commands::Info { target } => info(&cli, target),
        Commands::Record {
            target,
            plan,
            seconds,
            output,
            notes,
            volts,
        } => record(&cli, target, plan.as_deref(), *seconds, output, notes, *volts),
    }
}
