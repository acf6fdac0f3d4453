//! Agent console core: session store, context builder, streaming engine.

pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod router;
pub mod settings;
pub mod store;
pub mod usage;
pub mod vcs;
