//! Network entry points.

pub mod websocket;
