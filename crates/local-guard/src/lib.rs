//! # local-guard
//!
//! Admission control for the QuicPair gateway. This crate decides whether a
//! caller is on the local network (loopback, private, link-local, or the
//! `100.64.0.0/10` shared address space used by mesh VPN overlays) so the
//! gateway can refuse everybody else.
//!
//! ## Usage
//!
//! ```rust
//! use local_guard::AdmissionGate;
//!
//! let gate = AdmissionGate::new(true);
//! assert!(gate.admit_remote("10.1.2.3:51000").is_ok());
//! assert!(gate.admit_remote("8.8.8.8:51000").is_err());
//! assert!(gate.admit_origin(Some("http://localhost:5173")).is_ok());
//! ```

mod guard;
mod origin;

pub use guard::{is_local_ip, AdmissionDenied, AdmissionGate};
pub use origin::{validate_origin, OriginRejection};
