use anyhow::{Context, Result};
use log::{debug, error, info};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use ubms_lib::protocol::{self, RawFrame};
use ubms_lib::{candump, runtime, Bridge, PackState};

use crate::{commandline, mqtt};

const FRAME_QUEUE_DEPTH: usize = 1024;

type LineReader = tokio::io::Lines<Box<dyn AsyncBufRead + Unpin + Send>>;

async fn open_input(input: &Path) -> Result<LineReader> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if input == Path::new("-") {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("Cannot open input file {input:?}"))?;
        Box::new(BufReader::new(file))
    };
    Ok(reader.lines())
}

async fn next_record(lines: &mut LineReader) -> Result<Option<candump::CandumpRecord>> {
    while let Some(line) = lines.next_line().await.context("Cannot read input")? {
        if line.trim().is_empty() {
            continue;
        }
        match candump::parse_line(&line) {
            Some(record) => return Ok(Some(record)),
            None => debug!("Skipping line {line:?}"),
        }
    }
    Ok(None)
}

/// Sends every frame of `input` to the ingestion loop. With `realtime` the
/// recorded gaps between frames are kept.
async fn read_frames(input: PathBuf, realtime: bool, frames: mpsc::Sender<RawFrame>) -> Result<()> {
    let mut lines = open_input(&input).await?;
    let mut pacing: Option<(Duration, Instant)> = None;
    while let Some(record) = next_record(&mut lines).await? {
        if realtime {
            let (first, start) = *pacing.get_or_insert((record.timestamp, Instant::now()));
            let offset = record.timestamp.saturating_sub(first);
            tokio::time::sleep_until(tokio::time::Instant::from_std(start + offset)).await;
        }
        match record.to_frame(Instant::now()) {
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => debug!("Skipping frame {:03X}: {e}", record.id),
        }
    }
    Ok(())
}

/// Flattens a JSON value into one `(topic, payload)` pair per leaf.
fn simple_topics(topic: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                simple_topics(&format!("{topic}/{k}"), v, out);
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                simple_topics(&format!("{topic}/{i}"), v, out);
            }
        }
        serde_json::Value::String(s) => out.push((topic.to_string(), s.clone())),
        serde_json::Value::Number(n) => out.push((topic.to_string(), n.to_string())),
        serde_json::Value::Bool(b) => out.push((topic.to_string(), b.to_string())),
        serde_json::Value::Null => {
            // Do not publish unknown values
        }
    }
}

fn format_value(value: Option<f32>, unit: &str, precision: usize) -> String {
    match value {
        Some(value) => format!("{value:.precision$} {unit}"),
        None => "unknown".into(),
    }
}

fn print_state(state: &PackState) {
    let source = state
        .current_source
        .map(|source| format!(" ({source:?})"))
        .unwrap_or_default();
    println!("Voltage: {}", format_value(state.voltage, "V", 2));
    println!("Current: {}{source}", format_value(state.current, "A", 1));
    println!("SOC: {}", format_value(state.soc, "%", 0));
    println!(
        "Capacity: {} of {:.0} Ah",
        format_value(state.remaining_capacity_ah, "Ah", 1),
        state.installed_capacity_ah
    );
    if let (Some(min), Some(max)) = (state.min_cell_voltage, state.max_cell_voltage) {
        println!(
            "Cell voltage: min {:.3} V (module {} cell {}), max {:.3} V (module {} cell {})",
            min.value, min.module, min.cell, max.value, max.module, max.cell
        );
    }
    if let (Some(min), Some(max)) = (state.min_temperature, state.max_temperature) {
        println!(
            "Temperature: min {:.1} °C (module {}), max {:.1} °C (module {})",
            min.value, min.module, max.value, max.module
        );
    }
    println!(
        "Modules online: {}/{}",
        state.modules_online, state.modules_expected
    );
    if let Some(mode) = state.bms.operating_mode {
        println!("BMS mode: {mode}");
    }
    for alarm in &state.alarms {
        println!("Alarm: {alarm}");
    }
    if !state.stale.is_empty() {
        println!("Stale: {:?}", state.stale);
    }
    for issue in &state.issues {
        println!("Data quality: {issue:?}");
    }
}

enum Sink {
    Console,
    Mqtt {
        publisher: mqtt::MqttPublisher,
        format: commandline::MqttFormat,
    },
}

impl Sink {
    fn create(output: &commandline::DaemonOutput) -> Result<Self> {
        match output {
            commandline::DaemonOutput::Console => Ok(Sink::Console),
            commandline::DaemonOutput::Mqtt {
                config_file,
                format,
            } => {
                let config = mqtt::MqttConfig::load(config_file).with_context(|| {
                    format!("Failed to open MQTT config file at {config_file:?}")
                })?;
                info!("Successfully loaded MQTT config from {config_file:?}: {config:?}");
                Ok(Sink::Mqtt {
                    publisher: mqtt::MqttPublisher::new(config),
                    format: format.clone(),
                })
            }
        }
    }

    async fn publish(&self, state: &PackState) {
        match self {
            Sink::Console => {
                println!("--- Pack state at {} ---", chrono::Local::now().to_rfc3339());
                print_state(state);
                println!("--------------------------");
            }
            Sink::Mqtt { publisher, format } => {
                let value = match serde_json::to_value(state) {
                    Ok(value) => value,
                    Err(e) => {
                        error!("Failed to serialize pack state: {e}");
                        return;
                    }
                };
                match format {
                    commandline::MqttFormat::Json => {
                        let payload = json!({
                            "timestamp": chrono::Utc::now().to_rfc3339(),
                            "pack": value,
                        });
                        if let Err(e) = publisher
                            .publish(publisher.topic(), payload.to_string())
                            .await
                        {
                            error!("Failed to publish data to MQTT: {e:?}");
                        }
                    }
                    commandline::MqttFormat::Simple => {
                        let mut topics = Vec::new();
                        simple_topics(publisher.topic(), &value, &mut topics);
                        for (topic, payload) in topics {
                            if let Err(e) = publisher.publish(&topic, payload).await {
                                error!("Failed to publish message to topic {topic}: {e}");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn close(self) {
        if let Sink::Mqtt { publisher, .. } = self {
            publisher.disconnect().await;
        }
    }
}

pub async fn run(
    bridge: Bridge,
    output: commandline::DaemonOutput,
    input: PathBuf,
    realtime: bool,
) -> Result<()> {
    info!(
        "Starting bridge: output={output:?}, input={input:?}, interval={:?}",
        bridge.config().interval
    );
    let sink = Sink::create(&output)?;
    let bridge = Arc::new(bridge);

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (state_tx, mut state_rx) = watch::channel(bridge.current_state());

    let reader = tokio::spawn(read_frames(input, realtime, frame_tx));
    let mut ingest = tokio::spawn(runtime::ingest(
        Arc::clone(&bridge),
        frame_rx,
        shutdown_rx.clone(),
    ));
    let aggregate = tokio::spawn(runtime::aggregate(
        Arc::clone(&bridge),
        state_tx,
        shutdown_rx,
    ));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut frames_read = None;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            count = &mut ingest => {
                info!("Input exhausted");
                frames_read = Some(count.context("Ingest task failed")?);
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                sink.publish(&state).await;
            }
        }
    }

    shutdown_tx.send_replace(true);
    let frames_read = match frames_read {
        Some(count) => count,
        None => ingest.await.context("Ingest task failed")?,
    };
    let last = aggregate.await.context("Aggregation task failed")?;
    if reader.is_finished() {
        reader.await.context("Input task failed")??;
        // the last frames may postdate the last tick
        sink.publish(&bridge.tick(Instant::now())).await;
    } else {
        reader.abort();
        debug!("Last state: {last:?}");
    }
    sink.close().await;

    info!(
        "Processed {frames_read} frames: {:?}",
        bridge.statistics()
    );
    Ok(())
}

/// Prints each frame of `input` with its decoded content.
pub async fn decode(input: PathBuf) -> Result<()> {
    let mut lines = open_input(&input).await?;
    while let Some(record) = next_record(&mut lines).await? {
        match protocol::decode_payload(record.id, &record.payload) {
            Ok(message) => println!("{:03X}: {message:?}", record.id),
            Err(e) => println!("{:03X}: {e}", record.id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_state_into_topics() {
        let value = json!({
            "soc": 80.0,
            "fresh": true,
            "voltage": null,
            "min_cell_voltage": { "module": 3, "cell": 2 },
            "stale": ["voltage"],
        });
        let mut topics = Vec::new();
        simple_topics("ubms", &value, &mut topics);
        topics.sort();
        assert_eq!(
            topics,
            vec![
                ("ubms/fresh".to_string(), "true".to_string()),
                ("ubms/min_cell_voltage/cell".to_string(), "2".to_string()),
                ("ubms/min_cell_voltage/module".to_string(), "3".to_string()),
                ("ubms/soc".to_string(), "80.0".to_string()),
                ("ubms/stale/0".to_string(), "voltage".to_string()),
            ]
        );
    }

    #[test]
    fn formats_unknown_values() {
        assert_eq!(format_value(Some(52.8), "V", 2), "52.80 V");
        assert_eq!(format_value(None, "A", 1), "unknown");
    }

    #[tokio::test]
    async fn reads_frames_from_a_candump_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(1.000000) can0 0C0#50").unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "(1.100000) can0 351#00FA0050").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        read_frames(file.path().to_path_buf(), false, tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.map(|frame| frame.id()), Some(0x0C0));
        assert_eq!(rx.recv().await.map(|frame| frame.id()), Some(0x351));
        assert!(rx.recv().await.is_none());
    }
}
