//! ferrytrace Core - Domain types, configuration and collaborator ports
//!
//! This crate holds everything the queueing and submission crates share:
//! - **Domain types** - `Record`, `RecordId`, `UniqueEvent`, `SummedEvent`, ordering policies
//! - **Configuration** - YAML-backed `Config` with validation and a builder
//! - **Port definitions** - `ITransport`, `IClock`, `IPayloadSerializer`
//!
//! # Architecture
//!
//! The domain module is pure data and rules with no I/O. Ports define the
//! trait interfaces for the delivery transport, time source and payload
//! serializer; adapter crates and host applications provide implementations.

pub mod config;
pub mod domain;
pub mod ports;
