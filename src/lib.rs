#![forbid(unsafe_code)]

//! Channel archiver: mirrors subscribed video channels into a file tree and
//! records them in a catalog.

pub mod catalog;
pub mod channel;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod playlist;
pub mod security;
pub mod staging;
pub mod subscriptions;
pub mod ytdlp;

#[cfg(test)]
mod testing;
