//! fs-tracer - fs_usage attribution and filtering library
//!
//! This library exposes the line parser, the process attribution engine, the
//! filtering pipeline and the renderers used by the `fs-tracer` binary.

#![deny(unsafe_code)]

pub mod app;
pub mod attribution;
pub mod cli;
pub mod config;
pub mod constants;
pub mod filter;
pub mod fsusage;
pub mod logging;
pub mod models;
pub mod output;
pub mod pipeline;
