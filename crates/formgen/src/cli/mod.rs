//! CLI module for formgen
//!
//! Each subcommand lives in its own module; all of them go through
//! [`context::Engine`] and never issue SQL themselves.

pub mod error;
pub mod output;

// Configuration and store access
pub mod config;
pub mod context;

// Catalog
pub mod form;
pub mod version;

// Schema engine
pub mod ddl;
pub mod publish;
pub mod rows;
