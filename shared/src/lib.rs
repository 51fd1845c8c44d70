//! Shared library for the support desk AI Lambda functions.
//!
//! Holds the AI run pipeline (trigger, lifecycle manager, drafting and
//! heuristic analysis), its storage contract and the common Lambda plumbing.

pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod drafting;
pub mod error;
pub mod heuristic;
pub mod http;
pub mod models;
pub mod pipeline;
pub mod secrets;
pub mod store;
pub mod sweeper;
pub mod trigger;

pub use auth::{extract_agent, AuthenticatedAgent};
pub use config::{Config, ProviderKind};
pub use dispatch::{LambdaDispatcher, RunDispatcher, RunInvocation};
pub use drafting::{DraftingClient, DraftingError, TextGenerator};
pub use error::{Error, Result};
pub use pipeline::{RunManager, RunOutcome};
pub use secrets::{get_database_credentials, get_secret, DatabaseCredentials};
pub use store::{MemoryStore, PgTicketStore, TicketStore};
pub use sweeper::{sweep_stale_runs, SweepPolicy, SweepReport};
pub use trigger::RunTrigger;
