//! Romdepot - DAT ingestion and depot bookkeeping
//!
//! Core library providing DAT parsing, the rom index, depot root accounting
//! and the refresh pipeline that keeps the index in step with a DAT tree.

pub mod config;
pub mod dat;
pub mod db;
pub mod depot;
pub mod services;
