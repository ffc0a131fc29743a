//! Dealer video analysis portal: client-side job lifecycle tracking.
//!
//! This library submits dealer videos (a single URL, or a spreadsheet of
//! URLs) to a remote analysis service and owns the asynchronous life of each
//! job: fixed-interval status polling, cancellation, deletion, final result
//! retrieval, and reconciliation of locally cached state with the service
//! after a restart.

pub mod config;
pub mod models;
pub mod services;
