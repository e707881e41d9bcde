//! Core domain types
//!
//! This module contains the core domain structures used across Keel services.
//! Templates are immutable operator configuration; instances are created per
//! pipeline run and driven to completion by the master.

pub mod instance;
pub mod status;
pub mod template;
pub mod work;
pub mod worker;
