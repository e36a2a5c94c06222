#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod declare;
pub mod error;
pub mod export;
pub mod provider;
pub mod settings;
