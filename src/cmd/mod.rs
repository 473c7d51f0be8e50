//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                    |
//! |-----------|-------------------------------------|
//! | `setup`   | `Init`, config and logging bootstrap |
//! | `records` | `App`, `Env`                        |
//! | `deploy`  | `Deploy`, `Worker`, `Sweep`         |
//! | `report`  | `Status`, `Logs`, `History`         |
//! | `serve`   | `Serve`                             |

pub mod deploy;
pub mod records;
pub mod report;
pub mod serve;
pub mod setup;

pub use deploy::{cmd_deploy, cmd_sweep, cmd_worker};
pub use records::{cmd_app, cmd_env};
pub use report::{cmd_history, cmd_logs, cmd_status};
pub use serve::cmd_serve;
pub use setup::{cmd_init, init_diagnostics, load_config};
