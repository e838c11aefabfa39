//! Ground-side CLI: builds signed uplink command frames, sends them to the
//! simulator over TCP, and renders command statuses and live telemetry.

use clap::{App, Arg, SubCommand};
use colored::*;
use ed25519_dalek::SigningKey;
use satexec::protocol::{opcode, Command, CommandPriority, CommandSource};
use satexec::subsystems::SubsystemId;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8195";

/// Ground-test signing seed shared with the simulator. Never flown.
const DEMO_KEY_SEED: [u8; 32] = [0x5A; 32];

static NEXT_COMMAND_ID: AtomicU32 = AtomicU32::new(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("satexec")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Ground control CLI for the satellite executive simulator")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("priority")
                .long("priority")
                .value_name("PRIORITY")
                .possible_values(&["emergency", "high", "normal", "low", "deferred"])
                .default_value("normal")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("Verify the executive is responsive"))
        .subcommand(
            SubCommand::with_name("mode")
                .about("Set the power mode")
                .arg(
                    Arg::with_name("mode")
                        .required(true)
                        .possible_values(&[
                            "normal",
                            "low-power",
                            "critical",
                            "emergency",
                            "hibernation",
                        ]),
                ),
        )
        .subcommand(
            SubCommand::with_name("enable")
                .about("Enable a subsystem at a power level")
                .arg(Arg::with_name("subsystem").required(true).possible_values(&[
                    "rf", "obc", "adcs", "thermal", "payload", "sensors",
                ]))
                .arg(
                    Arg::with_name("level")
                        .required(true)
                        .validator(|v| match v.parse::<f32>() {
                            Ok(level) if (0.0..=1.0).contains(&level) => Ok(()),
                            _ => Err("level must be between 0.0 and 1.0".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("disable")
                .about("Disable a subsystem")
                .arg(Arg::with_name("subsystem").required(true).possible_values(&[
                    "rf", "obc", "adcs", "thermal", "payload", "sensors",
                ])),
        )
        .subcommand(SubCommand::with_name("telemetry").about("Request a telemetry collection"))
        .subcommand(
            SubCommand::with_name("event")
                .about("Signal a named event to the task scheduler")
                .arg(Arg::with_name("name").required(true)),
        )
        .subcommand(
            SubCommand::with_name("safe-mode")
                .about("Safe-mode control")
                .subcommand(SubCommand::with_name("enter").about("Commanded safe-mode entry"))
                .subcommand(
                    SubCommand::with_name("recover")
                        .about("Staged recovery")
                        .arg(
                            Arg::with_name("level")
                                .required(true)
                                .possible_values(&["0", "1", "2", "3"]),
                        ),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("Stream live telemetry"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let priority = parse_priority(matches.value_of("priority").unwrap_or("normal"));

    match matches.subcommand() {
        ("ping", _) => {
            let response =
                send_frame(host, port, build(opcode::PING, priority, Vec::new())).await?;
            print_response("Ping", &response);
        }
        ("mode", Some(sub)) => {
            let mode = parse_mode(sub.value_of("mode").unwrap());
            let response = send_frame(
                host,
                port,
                build(opcode::SET_POWER_MODE, priority, vec![mode]),
            )
            .await?;
            print_response("Set mode", &response);
        }
        ("enable", Some(sub)) => {
            let subsystem = parse_subsystem(sub.value_of("subsystem").unwrap());
            let level: f32 = sub.value_of("level").unwrap().parse()?;
            let permille = (level * 1000.0).round() as u16;
            let mut payload = vec![subsystem.to_wire()];
            payload.extend_from_slice(&permille.to_be_bytes());
            let response = send_frame(
                host,
                port,
                build(opcode::ENABLE_SUBSYSTEM, priority, payload),
            )
            .await?;
            print_response("Enable subsystem", &response);
        }
        ("disable", Some(sub)) => {
            let subsystem = parse_subsystem(sub.value_of("subsystem").unwrap());
            let response = send_frame(
                host,
                port,
                build(
                    opcode::DISABLE_SUBSYSTEM,
                    priority,
                    vec![subsystem.to_wire()],
                ),
            )
            .await?;
            print_response("Disable subsystem", &response);
        }
        ("telemetry", _) => {
            let response = send_frame(
                host,
                port,
                build(opcode::COLLECT_TELEMETRY, priority, Vec::new()),
            )
            .await?;
            print_response("Telemetry request", &response);
        }
        ("event", Some(sub)) => {
            let name = sub.value_of("name").unwrap();
            let response = send_frame(
                host,
                port,
                build(opcode::SIGNAL_EVENT, priority, name.as_bytes().to_vec()),
            )
            .await?;
            print_response("Signal event", &response);
        }
        ("safe-mode", Some(sub)) => match sub.subcommand() {
            ("enter", _) => {
                let response = send_frame(
                    host,
                    port,
                    build(
                        opcode::ENTER_SAFE_MODE,
                        CommandPriority::Emergency,
                        Vec::new(),
                    ),
                )
                .await?;
                print_response("Enter safe mode", &response);
            }
            ("recover", Some(recover)) => {
                let level: u8 = recover.value_of("level").unwrap().parse()?;
                let response = send_frame(
                    host,
                    port,
                    build(
                        opcode::ATTEMPT_RECOVERY,
                        CommandPriority::Emergency,
                        vec![level],
                    ),
                )
                .await?;
                print_response("Attempt recovery", &response);
            }
            _ => {
                println!(
                    "{}",
                    "safe-mode subcommand required (enter | recover)".yellow()
                );
            }
        },
        ("monitor", _) => {
            monitor(host, port).await?;
        }
        _ => {
            println!(
                "{}",
                "No command specified. Use --help for usage information.".yellow()
            );
            println!("{}", "Quick start:".bright_green());
            println!(
                "  {}  start the simulator",
                "cargo run --bin satexec-simulator".bright_cyan()
            );
            println!("  {}  test the link", "satexec ping".bright_cyan());
            println!("  {}  watch telemetry", "satexec monitor".bright_cyan());
        }
    }

    Ok(())
}

fn build(code: u16, priority: CommandPriority, payload: Vec<u8>) -> Command {
    let id = NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed);
    let mut command = Command::new(id, code, priority, CommandSource::GroundStation, payload);
    command.sign(&SigningKey::from_bytes(&DEMO_KEY_SEED));
    command
}

fn parse_priority(value: &str) -> CommandPriority {
    match value {
        "emergency" => CommandPriority::Emergency,
        "high" => CommandPriority::High,
        "low" => CommandPriority::Low,
        "deferred" => CommandPriority::Deferred,
        _ => CommandPriority::Normal,
    }
}

fn parse_mode(value: &str) -> u8 {
    match value {
        "low-power" => 1,
        "critical" => 2,
        "emergency" => 3,
        "hibernation" => 4,
        _ => 0,
    }
}

fn parse_subsystem(value: &str) -> SubsystemId {
    match value {
        "obc" => SubsystemId::Obc,
        "adcs" => SubsystemId::Adcs,
        "thermal" => SubsystemId::Thermal,
        "payload" => SubsystemId::Payload,
        "sensors" => SubsystemId::Sensors,
        _ => SubsystemId::Rf,
    }
}

async fn send_frame(
    host: &str,
    port: u16,
    command: Command,
) -> Result<String, Box<dyn std::error::Error>> {
    let frame = command.encode()?;
    let hex: String = frame.iter().map(|byte| format!("{:02x}", byte)).collect();

    let stream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!(
                "{} failed to connect to {}:{}",
                "error:".red().bold(),
                host,
                port
            );
            if err.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!(
                    "{} start the simulator with: {}",
                    "hint:".yellow(),
                    "cargo run --bin satexec-simulator".bright_cyan()
                );
            }
            return Err(err.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    writer.write_all(hex.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut lines = BufReader::new(reader).lines();
    // Telemetry lines may interleave; the command response is the first
    // non-TLM line.
    while let Some(line) = lines.next_line().await? {
        if !line.starts_with("TLM ") {
            return Ok(line);
        }
    }
    Err("connection closed before response".into())
}

async fn monitor(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "{}",
        "monitoring telemetry (Ctrl-C to stop)...".bright_blue().bold()
    );
    let stream = TcpStream::connect((host, port)).await?;
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(json) = line.strip_prefix("TLM ") else {
            continue;
        };
        match serde_json::from_str::<serde_json::Value>(json) {
            Ok(packet) => {
                let packet_type = packet["packet_type"].as_u64().unwrap_or(0);
                let id = packet["id"].as_u64().unwrap_or(0);
                let timestamp = packet["timestamp_ms"].as_u64().unwrap_or(0);
                let label = match packet_type {
                    1 => "POWER".bright_green(),
                    2 => "SCHED".bright_blue(),
                    3 => "HEALTH".bright_magenta(),
                    0xF0 => "SAFEMODE".bright_red().bold(),
                    _ => "OTHER".white(),
                };
                println!("[{}] #{} {}", timestamp / 1000, id, label);
            }
            Err(_) => println!("{}", json),
        }
    }
    Ok(())
}

fn print_response(action: &str, response: &str) {
    match serde_json::from_str::<serde_json::Value>(response) {
        Ok(parsed) => {
            let status = parsed["status"].as_str().unwrap_or("Unknown");
            let detail = parsed["detail"].as_str().unwrap_or("");
            match status {
                "Success" => {
                    println!("{} {}: {}", "ok".green().bold(), action, detail.bright_white());
                }
                "Pending" => {
                    println!("{} {}: queued for dispatch", "..".yellow(), action);
                }
                _ => {
                    println!(
                        "{} {}: {} ({})",
                        "failed".red().bold(),
                        action,
                        status.bright_red(),
                        detail
                    );
                }
            }
        }
        Err(_) => println!("{}", response),
    }
}
