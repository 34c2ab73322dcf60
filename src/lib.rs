pub mod chain;
pub mod config;
pub mod coordinator;
pub mod crawler;
pub mod cursor;
pub mod deployment;
pub mod error;
pub mod events;
pub mod mock;
pub mod processor;
pub mod query;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod rpc;
pub mod store;
pub mod sweeper;
pub mod watcher;
