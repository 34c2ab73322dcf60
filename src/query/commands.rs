use crate::events::{BridgeEventKind, EventStatus};
use crate::query::formatters::{
    IndexerStats, OutputFormat, format_cursors, format_events, format_failures, format_stats,
};
use crate::repository::{CursorRepository, DecodeFailureRepository, EventFilter, EventRepository};
use anyhow::{Result, anyhow};

#[derive(Debug, Default)]
pub struct EventQuery {
    pub status: Option<String>,
    pub event_name: Option<String>,
    pub block: Option<u64>,
    pub block_range: Option<(u64, u64)>,
    pub limit: usize,
    pub offset: usize,
}

pub fn cmd_events(
    event_repo: &EventRepository,
    query: EventQuery,
    format: OutputFormat,
) -> Result<()> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<EventStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let event_name = query
        .event_name
        .as_deref()
        .map(|s| s.parse::<BridgeEventKind>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let block_range = match (query.block, query.block_range) {
        (Some(block), _) => Some((block, block)),
        (None, Some((start, end))) if start > end => {
            return Err(anyhow!("Invalid block range: {} > {}", start, end));
        }
        (None, range) => range,
    };

    let events = event_repo.query_events(&EventFilter {
        status,
        event_name,
        block_range,
        limit: query.limit,
        offset: query.offset,
    })?;
    println!("{}", format_events(&events, format));

    Ok(())
}

pub fn cmd_cursor(cursor_repo: &CursorRepository, format: OutputFormat) -> Result<()> {
    let cursors = cursor_repo.list()?;
    println!("{}", format_cursors(&cursors, format));

    Ok(())
}

pub fn cmd_failures(
    failure_repo: &DecodeFailureRepository,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let failures = failure_repo.recent(limit)?;
    println!("{}", format_failures(&failures, format));

    Ok(())
}

/// The queue may live in another database, so its size is passed in.
pub fn cmd_stats(
    event_repo: &EventRepository,
    failure_repo: &DecodeFailureRepository,
    queued_messages: u64,
    format: OutputFormat,
) -> Result<()> {
    let stats = IndexerStats {
        events_by_status: event_repo.count_by_status()?,
        decode_failures: failure_repo.count()?,
        queued_messages,
    };
    println!("{}", format_stats(&stats, format));

    Ok(())
}
