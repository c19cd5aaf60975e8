//! Shared protocol types and utilities for the Themisto client.

/// Jupyter message types
pub mod jupyter_message;

/// Kernel info reply types
pub mod kernel_info;

/// Kernel spec models
pub mod kernel_spec;

/// REST resource models
pub mod models;

/// Typed shell request and reply contents
pub mod requests;

/// Message validation
pub mod validate;

/// WebSocket frame codec
pub mod wire_frame;
