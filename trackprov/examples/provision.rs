//! Provision a tracker over serial
//!
//! This example lists the USB serial adapters it can see, opens one, and
//! runs a full provisioning attempt, printing every status update.
//!
//! # Prerequisites
//!
//! - A tracker flashed with the provisioning firmware, attached over USB
//! - A device identifier and token issued by the registry backend
//!
//! # Usage
//!
//! ```bash
//! cargo run --example provision -- --port /dev/ttyUSB0 --device-id TRK-0099 --token tok_abc123
//! ```
//!
//! Without `--port` the only detected adapter is used.

use std::env;
use std::sync::Arc;

use trackprov::{
    ChannelRegistry, PortDescriptor, PortFilter, ProvisioningRequest, SessionBuilder,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("=== trackprov Provisioning Example ===\n");

    let registry = Arc::new(ChannelRegistry::system());
    let found = registry.discover(&PortFilter::default()).await?;
    println!("Found {} serial adapter(s):", found);
    for (i, port) in registry.list_granted().iter().enumerate() {
        println!("  [{}] {}", i, port);
    }
    println!();

    let request = match ProvisioningRequest::new(&args.device_id, &args.token) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let mut session = SessionBuilder::new(registry)
        .baud_rate(args.baud)
        .build()?;

    // Print every state change as it happens
    let mut updates = session.handle().subscribe();
    let printer = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let outcome = updates.borrow_and_update().clone();
            println!("[{}] {}", outcome.status, outcome.message);
        }
    });

    let port = args.port.map(PortDescriptor::new);
    let result = session.run(&request, port.as_ref()).await;
    drop(session);
    let _ = printer.await;

    match result {
        Ok(outcome) if outcome.success => {
            println!("\nDone: {}", outcome.message);
            Ok(())
        }
        Ok(outcome) => {
            println!("\nStopped: {}", outcome.message);
            Ok(())
        }
        Err(e) => {
            eprintln!("\nProvisioning failed: {}", e);
            if let Some(tail) = hint_for(&e) {
                eprintln!("{}", tail);
            }
            eprintln!("\nTo provision by hand:\n{}", request.manual_instructions());
            std::process::exit(1);
        }
    }
}

fn hint_for(e: &trackprov::Error) -> Option<&'static str> {
    match e.kind() {
        trackprov::ErrorKind::ChannelUnavailable => {
            Some("Check that the adapter is plugged in and not held by a serial monitor.")
        }
        trackprov::ErrorKind::BootTimeout => Some("Press the reset button and try again."),
        _ => None,
    }
}

struct Args {
    port: Option<String>,
    device_id: String,
    token: String,
    baud: u32,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut port = None;
        let mut device_id = env::var("TRACKPROV_DEVICE_ID").unwrap_or_default();
        let mut token = env::var("TRACKPROV_TOKEN").unwrap_or_default();
        let mut baud = trackprov::transport::config::DEFAULT_BAUD_RATE;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--port" | "-p" => {
                    i += 1;
                    if i < args.len() {
                        port = Some(args[i].clone());
                    }
                }
                "--device-id" | "-d" => {
                    i += 1;
                    if i < args.len() {
                        device_id = args[i].clone();
                    }
                }
                "--token" | "-t" => {
                    i += 1;
                    if i < args.len() {
                        token = args[i].clone();
                    }
                }
                "--baud" | "-b" => {
                    i += 1;
                    if i < args.len() {
                        baud = args[i].parse().unwrap_or(baud);
                    }
                }
                "--help" => {
                    println!("Usage: provision [--port PATH] --device-id ID --token TOKEN [--baud RATE]");
                    println!();
                    println!("The identifier and token can also come from TRACKPROV_DEVICE_ID and TRACKPROV_TOKEN.");
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            port,
            device_id,
            token,
            baud,
        }
    }
}
