use anyhow::{Context, Result};
use bridge_indexer::repository::Database;

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    dotenv::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set in .env")?;
    let queue_database_url =
        std::env::var("QUEUE_DATABASE_URL").unwrap_or_else(|_| database_url.clone());

    println!("Running migrations on database: {database_url}");
    let _db = Database::new(&database_url)?;

    if queue_database_url != database_url {
        println!("Running migrations on queue database: {queue_database_url}");
        let _queue_db = Database::new(&queue_database_url)?;
    }

    println!("Migrations completed successfully!");

    Ok(())
}
