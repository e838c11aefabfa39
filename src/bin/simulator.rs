//! Ground-test simulator: runs the satellite executive with simulated
//! sensors, accepts hex-encoded uplink command frames over TCP (one per
//! line), replies with JSON command statuses, and broadcasts JSON telemetry
//! to every connected client.

use std::sync::Arc;
use std::time::Duration;

use satexec::command::TrustAnchors;
use satexec::executive::{ExecutiveConfig, SatelliteExecutive};
use satexec::health::{
    ComponentType, RadiationReading, RadiationSensor, TemperatureSensor,
};
use satexec::protocol::{Command, CommandSource};
use satexec::rf::LoopbackTransceiver;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{error, info, warn};

const TCP_PORT: u16 = 8195;
const TELEMETRY_BROADCAST_BUFFER: usize = 256;
const UPDATE_PERIOD_MS: u64 = 1000;

/// Ground-test signing seed shared with the CLI. Never flown.
const DEMO_KEY_SEED: [u8; 32] = [0x5A; 32];

/// Linear congruential generator driving the simulated space environment.
/// Fixed seed keeps runs reproducible.
struct EnvironmentModel {
    rng_state: u64,
}

impl EnvironmentModel {
    fn new() -> Self {
        Self {
            rng_state: 0x1234_5678_9ABC_DEF0,
        }
    }

    fn next(&mut self) -> u64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.rng_state
    }

    fn jitter(&mut self, span: f32) -> f32 {
        let unit = (self.next() >> 40) as f32 / (1u64 << 24) as f32;
        (unit - 0.5) * 2.0 * span
    }
}

struct SimulatedRadiationSensor {
    model: EnvironmentModel,
    dose_rate: f32,
    total_dose: f32,
}

impl RadiationSensor for SimulatedRadiationSensor {
    fn read(&mut self) -> RadiationReading {
        self.dose_rate = (self.dose_rate + self.model.jitter(0.1)).max(0.0);
        self.total_dose += self.dose_rate * (UPDATE_PERIOD_MS as f32 / 3_600_000.0);
        RadiationReading {
            total_dose_rads: self.total_dose,
            dose_rate_rads_per_hour: self.dose_rate,
            seu_count: 0,
        }
    }
}

struct SimulatedTemperatureSensor {
    model: EnvironmentModel,
    baseline_c: f32,
}

impl TemperatureSensor for SimulatedTemperatureSensor {
    fn read(&mut self, component: ComponentType, _sensor_id: &str) -> f32 {
        let offset = match component {
            ComponentType::Processor => 12.0,
            ComponentType::PowerSystem => 8.0,
            ComponentType::CommunicationSystem => 15.0,
            _ => 0.0,
        };
        self.baseline_c + offset + self.model.jitter(0.5)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("satexec ground-test simulator");
    println!("=============================");

    let signing_key = ed25519_dalek::SigningKey::from_bytes(&DEMO_KEY_SEED);
    let mut anchors = TrustAnchors::new();
    for source in CommandSource::ALL {
        anchors.set(source, signing_key.verifying_key());
    }

    let executive = Arc::new(SatelliteExecutive::new(
        ExecutiveConfig {
            trust_anchors: anchors,
            ..ExecutiveConfig::default()
        },
        Box::new(LoopbackTransceiver::new()),
        Box::new(SimulatedRadiationSensor {
            model: EnvironmentModel::new(),
            dose_rate: 0.8,
            total_dose: 0.0,
        }),
        Box::new(SimulatedTemperatureSensor {
            model: EnvironmentModel::new(),
            baseline_c: 18.0,
        }),
    )?);
    executive.start();

    let (telemetry_tx, _) = broadcast::channel::<String>(TELEMETRY_BROADCAST_BUFFER);

    let tcp_executive = Arc::clone(&executive);
    let tcp_telemetry = telemetry_tx.clone();
    tokio::spawn(async move {
        if let Err(err) = serve(tcp_executive, tcp_telemetry).await {
            error!("TCP server error: {}", err);
        }
    });

    info!("listening on 127.0.0.1:{}", TCP_PORT);

    let mut interval = time::interval(Duration::from_millis(UPDATE_PERIOD_MS));
    loop {
        interval.tick().await;

        let tick_executive = Arc::clone(&executive);
        let packets = tokio::task::spawn_blocking(move || {
            tick_executive.update(UPDATE_PERIOD_MS as u32);
            let command = tick_executive.command();
            for packet in command.collect_telemetry(false) {
                command.queue_telemetry(packet);
            }
            command.drain_telemetry()
        })
        .await?;

        for packet in packets {
            match serde_json::to_string(&packet) {
                Ok(json) => {
                    let _ = telemetry_tx.send(json);
                }
                Err(err) => warn!("telemetry serialization failed: {}", err),
            }
        }
    }
}

async fn serve(
    executive: Arc<SatelliteExecutive>,
    telemetry_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("127.0.0.1", TCP_PORT)).await?;
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("client connected: {}", peer);
        let client_executive = Arc::clone(&executive);
        let telemetry_rx = telemetry_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, client_executive, telemetry_rx).await {
                warn!("client {} error: {}", peer, err);
            }
            info!("client disconnected: {}", peer);
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    executive: Arc<SatelliteExecutive>,
    mut telemetry_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let response = process_frame(&executive, &line).await;
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            telemetry = telemetry_rx.recv() => {
                match telemetry {
                    Ok(json) => {
                        writer.write_all(b"TLM ").await?;
                        writer.write_all(json.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("client lagged, skipped {} telemetry packets", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}

async fn process_frame(executive: &Arc<SatelliteExecutive>, line: &str) -> String {
    let Some(frame) = decode_hex(line) else {
        return r#"{"status":"InvalidCommand","detail":"bad hex frame"}"#.to_string();
    };
    let command = match Command::decode(&frame) {
        Ok(command) => command,
        Err(err) => {
            return format!(
                r#"{{"status":"InvalidCommand","detail":"{}"}}"#,
                err
            );
        }
    };

    let id = command.id;
    let (status_tx, status_rx) = tokio::sync::oneshot::channel();
    let callback: satexec::command::CommandCallback = Box::new(move |status, detail: &str| {
        let _ = status_tx.send((status, detail.to_string()));
    });

    let submit_executive = Arc::clone(executive);
    let immediate = tokio::task::spawn_blocking(move || {
        submit_executive
            .command()
            .process_command(command, Some(callback))
    })
    .await
    .unwrap_or(satexec::protocol::CommandStatus::ExecutionError);

    // Queued commands resolve on the next executive tick; wait briefly for
    // the terminal status.
    let outcome = time::timeout(Duration::from_secs(5), status_rx).await;
    match outcome {
        Ok(Ok((status, detail))) => format!(
            r#"{{"id":{},"status":{},"detail":{}}}"#,
            id,
            serde_json::to_string(&status).unwrap_or_default(),
            serde_json::Value::String(detail)
        ),
        _ => format!(
            r#"{{"id":{},"status":{},"detail":"queued"}}"#,
            id,
            serde_json::to_string(&immediate).unwrap_or_default()
        ),
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&text[index..index + 2], 16).ok())
        .collect()
}
