use crate::events::Event;
use crate::repository::{CursorRow, DecodeFailureRow};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

/// Counters shown by the `stats` command.
#[derive(Debug, Clone, Default)]
pub struct IndexerStats {
    pub events_by_status: Vec<(String, u64)>,
    pub decode_failures: u64,
    pub queued_messages: u64,
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn finish_csv(wtr: Writer<Vec<u8>>) -> String {
    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

fn opt_to_string<T: ToString>(value: Option<T>) -> String {
    value.map_or("N/A".to_string(), |v| v.to_string())
}

pub fn format_events(events: &[Event], format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => format_events_table(events),
        OutputFormat::Json => format_events_json(events),
        OutputFormat::Csv => format_events_csv(events),
    }
}

fn format_events_table(events: &[Event]) -> String {
    if events.is_empty() {
        return "No events found.".to_string();
    }

    let mut table = new_table(vec![
        "Block",
        "Event",
        "Status",
        "Dest Chain",
        "Msg Hash",
        "Tx Hash",
        "Log Index",
    ]);
    for event in events {
        table.add_row(vec![
            Cell::new(event.block_number),
            Cell::new(event.name),
            Cell::new(event.status.as_str()),
            Cell::new(opt_to_string(event.dest_chain_id)),
            Cell::new(shorten_hash(&format!("{:?}", event.msg_hash))),
            Cell::new(shorten_hash(&format!("{:?}", event.transaction_hash))),
            Cell::new(event.log_index),
        ]);
    }
    table.to_string()
}

fn format_events_json(events: &[Event]) -> String {
    serde_json::to_string_pretty(events).unwrap_or_else(|_| "[]".to_string())
}

fn format_events_csv(events: &[Event]) -> String {
    let mut wtr = Writer::from_writer(vec![]);
    let _ = wtr.write_record([
        "block_number",
        "event_name",
        "status",
        "src_chain_id",
        "dest_chain_id",
        "msg_hash",
        "transaction_hash",
        "log_index",
        "payload",
    ]);
    for event in events {
        let _ = wtr.write_record([
            &event.block_number.to_string(),
            event.name.name(),
            event.status.as_str(),
            &event.src_chain_id.to_string(),
            &opt_to_string(event.dest_chain_id),
            &format!("{:?}", event.msg_hash),
            &format!("{:?}", event.transaction_hash),
            &event.log_index.to_string(),
            &event.payload.to_string(),
        ]);
    }
    finish_csv(wtr)
}

pub fn format_cursors(cursors: &[CursorRow], format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if cursors.is_empty() {
                return "No watch targets found.".to_string();
            }
            let mut table = new_table(vec![
                "Chain",
                "Contract",
                "Event",
                "Genesis Block",
                "Last Processed Block",
            ]);
            for cursor in cursors {
                table.add_row(vec![
                    Cell::new(cursor.chain_id),
                    Cell::new(&cursor.contract_address),
                    Cell::new(&cursor.event_name),
                    Cell::new(opt_to_string(cursor.genesis_block)),
                    Cell::new(opt_to_string(cursor.last_processed_block)),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let rows: Vec<_> = cursors
                .iter()
                .map(|c| {
                    json!({
                        "chain_id": c.chain_id,
                        "contract_address": c.contract_address,
                        "event_name": c.event_name,
                        "genesis_block": c.genesis_block,
                        "last_processed_block": c.last_processed_block,
                        "updated_at": c.updated_at,
                    })
                })
                .collect();
            serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record([
                "chain_id",
                "contract_address",
                "event_name",
                "genesis_block",
                "last_processed_block",
            ]);
            for c in cursors {
                let _ = wtr.write_record([
                    &c.chain_id.to_string(),
                    &c.contract_address,
                    &c.event_name,
                    &opt_to_string(c.genesis_block),
                    &opt_to_string(c.last_processed_block),
                ]);
            }
            finish_csv(wtr)
        }
    }
}

pub fn format_failures(failures: &[DecodeFailureRow], format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if failures.is_empty() {
                return "No decode failures recorded.".to_string();
            }
            let mut table = new_table(vec!["Block", "Tx Hash", "Log Index", "Reason"]);
            for failure in failures {
                table.add_row(vec![
                    Cell::new(opt_to_string(failure.block_number)),
                    Cell::new(
                        failure
                            .transaction_hash
                            .as_deref()
                            .map_or("N/A".to_string(), shorten_hash),
                    ),
                    Cell::new(opt_to_string(failure.log_index)),
                    Cell::new(&failure.reason),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let rows: Vec<_> = failures
                .iter()
                .map(|f| {
                    json!({
                        "src_chain_id": f.src_chain_id,
                        "contract_address": f.contract_address,
                        "block_number": f.block_number,
                        "transaction_hash": f.transaction_hash,
                        "log_index": f.log_index,
                        "reason": f.reason,
                        "data": f.data,
                        "created_at": f.created_at,
                    })
                })
                .collect();
            serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record([
                "block_number",
                "transaction_hash",
                "log_index",
                "reason",
                "data",
            ]);
            for f in failures {
                let _ = wtr.write_record([
                    &opt_to_string(f.block_number),
                    &f.transaction_hash.clone().unwrap_or_default(),
                    &opt_to_string(f.log_index),
                    &f.reason,
                    &f.data,
                ]);
            }
            finish_csv(wtr)
        }
    }
}

pub fn format_stats(stats: &IndexerStats, format: OutputFormat) -> String {
    let total: u64 = stats.events_by_status.iter().map(|(_, n)| n).sum();
    let mut rows: Vec<(String, u64)> = vec![("total_events".to_string(), total)];
    rows.extend(
        stats
            .events_by_status
            .iter()
            .map(|(status, n)| (format!("events_{}", status), *n)),
    );
    rows.push(("decode_failures".to_string(), stats.decode_failures));
    rows.push(("queued_messages".to_string(), stats.queued_messages));

    match format {
        OutputFormat::Table => {
            let mut table = new_table(vec!["Metric", "Value"]);
            for (metric, value) in &rows {
                table.add_row(vec![Cell::new(metric), Cell::new(value)]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let map: serde_json::Map<String, serde_json::Value> = rows
                .into_iter()
                .map(|(metric, value)| (metric, json!(value)))
                .collect();
            serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["metric", "value"]);
            for (metric, value) in &rows {
                let _ = wtr.write_record([metric.as_str(), &value.to_string()]);
            }
            finish_csv(wtr)
        }
    }
}

fn shorten_hash(hash: &str) -> String {
    if hash.len() <= 12 {
        return hash.to_string();
    }
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}
