//! Declarative test-step interpreter.
//!
//! A case is a list of JSON step definitions. Each step may loop over
//! resolved data, gate itself on dependency assertions, run database
//! or HTTP actions with bounded retry, and assert on the results. Step
//! outcomes are aggregated per logical step and recorded against the
//! case's test data.

pub mod action;
pub mod assertion;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod loop_expander;
pub mod model;
pub mod pg;
pub mod placeholder;
pub mod retry;
pub mod runner;
pub mod source;
pub mod step;
pub mod stop_condition;
pub mod store;
pub mod validator;

pub use config::*;
pub use model::*;
pub use runner::*;

pub use db::{RelationalClient, Row};
pub use error::StepError;
pub use http::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, TransportError};
pub use pg::PgRelationalClient;
pub use source::{SourceKind, SqlVariableCatalog, StaticVariableCatalog, VariableCatalog};
pub use step::{ExecutorSettings, StepExecutor};
pub use store::{MemoryTestDataStore, SqlTestDataStore, TestDataStore};
pub use validator::{validate, Condition, Verdict};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
