pub mod aggregate;
pub mod auditor;
pub mod canonical;
pub mod config;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod lifecycle;
pub mod paths;
pub mod registry;
pub mod staging;
pub mod util;
pub mod warn;
