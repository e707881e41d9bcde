//! Keel Core
//!
//! Core types and abstractions for the Keel CI/CD master.
//!
//! This crate contains:
//! - Domain types: status catalog, pipeline templates and their runtime instances,
//!   work requests and the worker registry
//! - DTOs: payloads exchanged between the master and its executors

pub mod domain;
pub mod dto;
