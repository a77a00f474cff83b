//! `fedbridge` is the server side of a federated training orchestrator.
//!
//! A [`job::Job`] runs one [`controller::Controller`] against a fixed roster of client sites,
//! reached through a [`controller::TaskChannel`]. Two workflows are provided:
//!
//! - [`controller::CyclicController`] relays one artifact from client to client, round after
//!   round;
//! - [`controller::BridgeController`] stands up a bridge RPC server ([`adaptor::Adaptor`]) through
//!   which the processes of an external training job send their aggregation requests to a
//!   [`runner::Runner`], and watches the job until every rank is done.
//!
//! Settings are read by [`settings::Settings`]; the `fedbridge-controller` binary runs simulated
//! jobs with the sites of [`simulation`].

pub mod adaptor;
pub mod common;
pub mod controller;
pub mod job;
pub mod runner;
pub mod settings;
pub mod signal;
pub mod simulation;
