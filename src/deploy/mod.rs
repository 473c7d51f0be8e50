//! Deployment pipeline.
//!
//! ```text
//!   HTTP / CLI trigger
//!          │
//!          ▼
//!   dispatcher ──(pending row)──▶ Launcher ──▶ worker
//!          │                                    │
//!          ▼                                    ▼
//!         db ◀──────── log ◀──── workspace ─ fetcher ─ installer ─ injector
//!          ▲
//!          │
//!       status ◀── pollers
//! ```

pub mod api;
pub mod db;
pub mod dispatcher;
pub mod fetcher;
pub mod injector;
pub mod installer;
pub mod log;
pub mod models;
pub mod server;
pub mod status;
pub mod validate;
pub mod worker;
pub mod workspace;
