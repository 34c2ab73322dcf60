pub mod cursor_repository;
pub mod database;
pub mod decode_failure_repository;
pub mod event_repository;
pub mod queue_repository;
pub mod suspended_repository;

pub use cursor_repository::{CursorRepository, CursorRow};
pub use database::Database;
pub use decode_failure_repository::{DecodeFailureRepository, DecodeFailureRow};
pub use event_repository::{EventFilter, EventRepository};
pub use queue_repository::QueueRepository;
pub use suspended_repository::SuspendedTransactionRepository;
