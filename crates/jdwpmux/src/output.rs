use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use jdwpmux_frame::{Packet, PacketKind};
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

#[derive(Debug, Serialize)]
pub struct PacketOutput {
    pub id: u32,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_set: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<u8>,
    pub error_code: u16,
    pub length: usize,
    /// DDMS chunk types, for DDMS commands.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,
    pub timestamp: String,
}

impl PacketOutput {
    pub fn describe(packet: &Packet) -> Self {
        let kind = match packet.kind() {
            PacketKind::Command { .. } => "command",
            PacketKind::Reply => "reply",
            PacketKind::Error { .. } => "error",
        };
        let chunks = if packet.is_ddms_command() {
            packet
                .ddms_chunks()
                .map(|chunks| chunks.iter().map(|c| c.chunk_type.to_string()).collect())
                .unwrap_or_else(|_| vec!["<malformed>".to_string()])
        } else {
            Vec::new()
        };
        Self {
            id: packet.id,
            kind,
            cmd_set: packet.cmd_set(),
            cmd: packet.cmd(),
            error_code: packet.error_code(),
            length: packet.length(),
            chunks,
            timestamp: now_unix_millis(),
        }
    }

    fn command_label(&self) -> String {
        match (self.cmd_set, self.cmd) {
            (Some(cmd_set), Some(cmd)) => format!("{cmd_set}/{cmd}"),
            _ => "-".to_string(),
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// One packet per line in every format, so monitor output can be streamed.
pub fn print_packet(packet: &Packet, format: OutputFormat) {
    let out = PacketOutput::describe(packet);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "KIND", "COMMAND", "ERROR", "LENGTH", "CHUNKS"])
                .add_row(vec![
                    out.id.to_string(),
                    out.kind.to_string(),
                    out.command_label(),
                    out.error_code.to_string(),
                    out.length.to_string(),
                    out.chunks.join(","),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "id={} kind={} command={} error={} length={} chunks=[{}]",
                out.id,
                out.kind,
                out.command_label(),
                out.error_code,
                out.length,
                out.chunks.join(",")
            );
        }
        OutputFormat::Raw => {
            println!("{} {} {}", out.id, out.kind, out.command_label());
        }
    }
}

/// Print `(field, value)` rows as a two-column table or aligned text.
pub fn print_fields(title: &str, rows: &[(&str, String)], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in rows {
                table.add_row(vec![field.to_string(), value.clone()]);
            }
            println!("{table}");
        }
        _ => {
            println!("{title}:");
            for (field, value) in rows {
                println!("  {:<22}{}", format!("{field}:"), value);
            }
        }
    }
}

pub fn or_unknown(value: Option<impl ToString>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn now_unix_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
