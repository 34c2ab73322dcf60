use anyhow::Result;
use bridge_indexer::query::commands::{EventQuery, cmd_cursor, cmd_events, cmd_failures, cmd_stats};
use bridge_indexer::query::formatters::OutputFormat;
use bridge_indexer::repository::{
    CursorRepository, Database, DecodeFailureRepository, EventRepository, QueueRepository,
};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "query")]
#[command(about = "Inspect indexed bridge events", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    /// Defaults to DATABASE_URL
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stored events, newest first
    Events {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        event_name: Option<String>,

        #[arg(long)]
        block: Option<u64>,

        #[arg(long, num_args = 2, value_names = ["START", "END"])]
        block_range: Option<Vec<u64>>,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Progress cursor of every watch target
    Cursor,
    /// Logs that could not be decoded
    Failures {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    dotenv::dotenv().ok();
    let database_url = cli.database.unwrap_or_else(|| {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./indexer.db".to_string())
    });
    let queue_database_url =
        std::env::var("QUEUE_DATABASE_URL").unwrap_or_else(|_| database_url.clone());

    let db = Database::new(&database_url)?;

    match cli.command {
        Commands::Events {
            status,
            event_name,
            block,
            block_range,
            limit,
            offset,
        } => {
            let query = EventQuery {
                status,
                event_name,
                block,
                block_range: block_range.and_then(|v| Some((*v.first()?, *v.get(1)?))),
                limit,
                offset,
            };
            db.with_conn(|conn| cmd_events(&EventRepository::new(conn), query, format))?;
        }
        Commands::Cursor => {
            db.with_conn(|conn| cmd_cursor(&CursorRepository::new(conn), format))?;
        }
        Commands::Failures { limit } => {
            db.with_conn(|conn| cmd_failures(&DecodeFailureRepository::new(conn), limit, format))?;
        }
        Commands::Stats => {
            let queue_db = if queue_database_url == database_url {
                db.clone()
            } else {
                Database::new(&queue_database_url)?
            };
            let queued = queue_db.with_conn(|conn| QueueRepository::new(conn).count())?;
            db.with_conn(|conn| {
                let event_repo = EventRepository::new(conn);
                let failure_repo = DecodeFailureRepository::new(conn);
                cmd_stats(&event_repo, &failure_repo, queued, format)
            })?;
        }
    }

    Ok(())
}
