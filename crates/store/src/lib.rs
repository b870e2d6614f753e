pub mod aggregate;
pub mod db;
pub mod query;
pub mod retention;

pub use aggregate::aggregate;
pub use db::{FlowStore, PutOutcome};
