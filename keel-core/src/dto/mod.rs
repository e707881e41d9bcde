//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs exchanged between the master, its push workers
//! and the operators driving it over HTTP.

pub mod pipeline;
pub mod work;
pub mod worker;
