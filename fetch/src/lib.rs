//! `tdsfetch`: downloads one torrent from a magnet link or a `.torrent` file.
//!
//! The binary resolves a [`config::RunConfiguration`], bootstraps a
//! [`session::Session`] on an [`engine::Engine`] and hands it to the
//! [`coordinator::Coordinator`], which runs until the download completes, fails
//! or a termination signal arrives.

pub mod app;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gate;
pub mod logging;
pub mod progress;
pub mod report;
pub mod session;
pub mod signals;
