//! Security modules for the rate limiter.
//!
//! Provides client identity resolution behind proxies and security event
//! reporting.

pub mod client_ip;
pub mod events;

pub use client_ip::{ClientIdentity, TrustedProxies, resolve};
pub use events::{EventSink, SecurityEvent, Severity, TracingEventSink, UnavailableCause};
