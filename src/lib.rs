//! sharkwatch library
//!
//! Geofence membership and alert fan-out for shark detections.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
