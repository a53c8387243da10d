//! Site availability checks published through a message broker and
//! consumed into a status store.
//!
//! The producer side runs [`prober::SiteProber`] and hands each
//! [`model::ProbeResult`] to [`publisher::Publisher`]; the consumer side reads
//! them back through [`consumer::EventStream`] and writes them to a
//! [`store::StatusStore`]. [`worker`] wires both sides to a [`config::Config`].

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod model;
pub mod prober;
pub mod publisher;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use model::ProbeResult;
