//! A port agent: the mediator between one scientific instrument (TCP,
//! serial, or DIGI-fronted) and the driver software that consumes it.
//! Instrument bytes are framed into timestamped packets and fanned out to
//! every connected driver; driver commands flow back the other way.

pub mod agent;
pub mod build;
pub mod config;
pub mod connection;
pub mod publisher;

pub use agent::PortAgent;
