//! Dumps ALERT2 IND stream files.
//!
//! Reads each input file as an IND byte stream and prints every
//! decoded message, the way a field tech checks what a receiver has
//! been forwarding.

use anyhow::{Context, Result};
use clap::Parser;
use fieldlink::alert2::{IndEvent, IndMessage, IndStream};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "indcat", about = "Decode ALERT2 IND stream files")]
struct Args {
    /// IND stream files to decode.
    files: Vec<PathBuf>,
    /// Print the raw line ahead of each decoded message.
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    let mut values_total = 0usize;
    for path in &args.files {
        let content = std::fs::read(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let mut stream = IndStream::new();
        for event in stream.on_data(&content) {
            match event {
                IndEvent::Content(line) => {
                    if args.raw {
                        println!("> {line}");
                    }
                }
                IndEvent::Message(IndMessage::Mant(mant)) => {
                    println!("MANT message received");
                    println!("  received: {}", mant.received_time);
                    println!("  source: {}", mant.source_address);
                    println!("  port: {:?}", mant.service_port);
                    if let Some(pdu) = &mant.pdu {
                        let pdu_time = pdu.pdu_time(mant.received_time);
                        println!("  pdu time: {pdu_time}");
                        println!("  apdu id: {}", pdu.apdu_id);
                        println!("  test: {}", pdu.from_test);
                        for report in &pdu.reports {
                            println!("  report of type {}", report.report_type);
                            for value in &report.values {
                                println!(
                                    "    sensor {} = {} at {}",
                                    value.sensor_id,
                                    value.magnitude_float(),
                                    value.time_stamp(pdu_time)
                                );
                                values_total += 1;
                            }
                        }
                    }
                }
                IndEvent::Message(IndMessage::Airlink(_)) => {
                    println!("AirLink message received");
                }
                IndEvent::Message(IndMessage::Concentration(_)) => {
                    println!("Concentration message received");
                }
                IndEvent::Message(IndMessage::Status(parameters)) => {
                    println!("Status message received");
                    for (name, value) in parameters {
                        println!("  {name} = {value}");
                    }
                }
                IndEvent::Error { error, line } => {
                    eprintln!("decode error: {error}");
                    eprintln!("  {line}");
                }
            }
        }
    }
    println!("{values_total} sensor values decoded");
    Ok(())
}
