//! Custom Resource Definitions for Tether
//!
//! This module contains all CRD definitions used by the Tether controller.

mod central_connection;

pub use central_connection::{
    format_time, CentralConnection, CentralConnectionSpec, CentralConnectionStatus,
    CertificateStatus, ConnectionPhase, StatusError, SynchronizationStatus,
};
