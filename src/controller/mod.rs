//! Controller implementations for Tether CRDs
//!
//! This module contains the reconciliation logic for CentralConnection resources.

mod connection;

pub use connection::{
    error_policy, reconcile, should_renew, should_synchronize, ConnectionClient, Context,
    ContextBuilder, KubeConnectionClient,
};
