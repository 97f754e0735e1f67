//! Viewer-facing transport: WebSocket listener and frame helpers.

pub mod websocket;
