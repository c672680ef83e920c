// Library entry point for the invoicing desk core
pub mod activity;
pub mod auth;
pub mod clock;
pub mod config;
pub mod console;
pub mod db;
pub mod desk;
pub mod events;
pub mod invoices;
pub mod notifications;
pub mod preferences;
pub mod session;
pub mod store;
pub mod users;

#[cfg(test)]
mod testing;

pub use desk::{Desk, DeskError};
