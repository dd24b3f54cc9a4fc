//! Lunchtrip Library
//!
//! Live location sharing for groups heading out to lunch: an authenticated
//! HTTP surface plus a WebSocket hub that fans position updates out to every
//! connected peer.

pub mod api;
pub mod auth;
pub mod config;
pub mod ws;
