use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use rsocket_frame::Payload;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Where a printed payload came from.
#[derive(Clone, Copy, Debug)]
pub struct PayloadSource<'a> {
    pub interaction: &'a str,
    pub stream_id: Option<u32>,
    pub peer: &'a str,
}

#[derive(Serialize)]
struct PayloadOutput<'a> {
    schema_id: &'a str,
    interaction: &'a str,
    stream_id: Option<u32>,
    peer: &'a str,
    data_size: usize,
    data: String,
    metadata: Option<String>,
    timestamp: String,
}

pub fn print_payload(payload: &Payload, source: PayloadSource<'_>, format: OutputFormat) {
    let metadata = payload.metadata.as_deref().map(preview);
    match format {
        OutputFormat::Json => {
            let out = PayloadOutput {
                schema_id: "https://schemas.3leaps.dev/rsocket/cli/v1/payload.schema.json",
                interaction: source.interaction,
                stream_id: source.stream_id,
                peer: source.peer,
                data_size: payload.data.len(),
                data: preview(&payload.data),
                metadata,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["INTERACTION", "STREAM", "SIZE", "METADATA", "DATA"])
                .add_row(vec![
                    source.interaction.to_string(),
                    source.stream_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
                    payload.data.len().to_string(),
                    metadata.unwrap_or_default(),
                    preview(&payload.data),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let stream = source.stream_id.map_or_else(|| "-".to_string(), |id| id.to_string());
            match metadata {
                Some(metadata) => println!(
                    "{} stream={} size={} peer={} metadata={} data={}",
                    source.interaction,
                    stream,
                    payload.data.len(),
                    source.peer,
                    metadata,
                    preview(&payload.data)
                ),
                None => println!(
                    "{} stream={} size={} peer={} data={}",
                    source.interaction,
                    stream,
                    payload.data.len(),
                    source.peer,
                    preview(&payload.data)
                ),
            }
        }
        OutputFormat::Raw => print_raw(&payload.data),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn preview(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", bytes.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
