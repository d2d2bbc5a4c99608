//! alertwatch - topic watchdog
//!
//! Tracks expected publication activity on bus topics and device points,
//! raising alerts when they go quiet and logging outages to SQLite.

pub mod alert;
pub mod bus;
pub mod config;
pub mod db;
pub mod scheduler;
pub mod watch;
pub mod web;
