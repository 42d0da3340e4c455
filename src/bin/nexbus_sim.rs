//! Runs the protocol engine against a simulated Nexmosphere controller on
//! an in-memory duplex link: a button panel, an RFID reader with one
//! antenna, and a presence sensor, all scripted. Useful for demos and for
//! exercising handlers without hardware.

use clap::{App, Arg};
use colored::*;
use nexbus::transport::{PortDescriptor, SerialLink, TransportProvider};
use nexbus::{Event, EventKind, Service, ServiceConfig};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::time::sleep;
use tracing::warn;

const SIM_PORT_NAME: &str = "sim0";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("nexbus-sim")
        .version("0.1.0")
        .about("Nexmosphere protocol engine - simulated controller")
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print events as JSON instead of colored text"),
        )
        .arg(
            Arg::with_name("hold-interval")
                .long("hold-interval")
                .value_name("MS")
                .help("Hold event interval for the button panel (0 disables)")
                .takes_value(true)
                .default_value("500"),
        )
        .get_matches();

    let json_output = matches.is_present("json");
    let hold_interval_ms: u64 = matches
        .value_of("hold-interval")
        .unwrap_or("500")
        .parse()
        .map_err(|_| "hold-interval must be a number of milliseconds")?;

    println!("📡 Nexmosphere Protocol Engine (simulated controller)");
    println!("=====================================================");

    let config = ServiceConfig {
        scan_interval: Duration::from_secs(1),
        settle_delay: Duration::from_secs(1),
        ready_timeout: Duration::from_secs(2),
        queue_tick_interval: Duration::from_millis(250),
        ..ServiceConfig::default()
    };
    let service = Service::with_config(Box::new(SimulatedTransport), config);

    service.add_handler(Arc::new(move |event: Event| {
        if json_output {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!("failed to encode event: {e}"),
            }
        } else {
            print_event(&event);
        }
    }));

    service.start()?;

    // Configure the panel's hold interval once the controller shows up.
    let interval = Duration::from_millis(hold_interval_ms);
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_millis(200)).await;
            if service.set_hold_interval(SIM_PORT_NAME, 1, interval).is_ok() {
                break;
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("\n📡 shutting down");
    Ok(())
}

fn print_event(event: &Event) {
    let kind = format!("{:?}", event.kind);
    let kind = match event.kind {
        EventKind::Button => kind.cyan(),
        EventKind::RfidTag | EventKind::RfidAntenna => kind.magenta(),
        EventKind::Presence => kind.yellow(),
        EventKind::Device => kind.green(),
        EventKind::Controller => kind.blue(),
    };
    let duration = event
        .duration_ms
        .map(|ms| format!(" ({ms}ms)"))
        .unwrap_or_default();
    println!(
        "{:>12}  {:?} addr={} {}{}",
        kind,
        event.action,
        event.address,
        event.data.as_deref().unwrap_or("-"),
        duration.dimmed(),
    );
}

/// Transport that reports a single virtual port and wires each open to a
/// fresh scripted firmware task.
struct SimulatedTransport;

impl TransportProvider for SimulatedTransport {
    fn list_ports(&self) -> io::Result<Vec<PortDescriptor>> {
        Ok(vec![PortDescriptor {
            name: SIM_PORT_NAME.to_string(),
            is_usb: true,
            vendor_id: "067b".to_string(),
            product_id: "2303".to_string(),
        }])
    }

    fn open(&self, _port: &PortDescriptor) -> io::Result<Box<dyn SerialLink>> {
        let (engine_side, firmware_side) = tokio::io::duplex(4096);
        tokio::spawn(run_firmware(firmware_side));
        Ok(Box::new(engine_side))
    }
}

/// Scripted controller firmware: answers discovery probes, then loops
/// through button, RFID and presence activity.
async fn run_firmware(link: DuplexStream) {
    let (reader, writer) = tokio::io::split(link);
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    // Command responder: TYPE probes for three devices, RFID status dump.
    let responder_writer = Arc::clone(&writer);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = match line.as_str() {
                "D001B[TYPE]" => Some("D001B[TYPE=XTB4N6]"),
                "D002B[TYPE]" => Some("D002B[TYPE=XRDR1]"),
                "D003B[TYPE]" => Some("D003B[TYPE=XY240]"),
                "X002B[]" => Some("X002B[d005 d000]"),
                _ => None,
            };
            if let Some(reply) = reply {
                let mut w = responder_writer.lock().await;
                if w.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    });

    // Activity script.
    let script: &[(&str, u64)] = &[
        ("X001A[1]", 1200), // button 1 down, held
        ("X001A[0]", 800),  // released
        ("XR[PU005]", 100), // tag leaves antenna 5...
        ("X002A[1]", 1500), // ...reader confirms pickup
        ("XR[PB005]", 100),
        ("X002A[0]", 1500),
        ("X003B[Dz=2]", 1000),
        ("X003B[Dz=0]", 2000),
    ];
    sleep(Duration::from_secs(4)).await;
    loop {
        for (line, pause_ms) in script {
            {
                let mut w = writer.lock().await;
                if w.write_all(format!("{line}\r\n").as_bytes()).await.is_err() {
                    return;
                }
            }
            sleep(Duration::from_millis(*pause_ms)).await;
        }
    }
}
