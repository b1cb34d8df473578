//! Shared services wrapping the database for front ends and the sync engine.

mod database;

pub use database::JournalDatabase;
