//! Stories about an agent obtaining and keeping a connector certificate
//!
//! # Test Organization
//!
//! - `fixtures`: the fake connector and the shared component wiring
//!
//! - `certificate_lifecycle`: Stories about the first handshake, storing the
//!   issued credentials, reading them back, and rotating them on renewal

mod certificate_lifecycle;
mod fixtures;
