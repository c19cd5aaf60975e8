//! The Themisto kernel client: a Rust client for Jupyter's kernel and
//! session protocols over a mixed REST + WebSocket interface.
//!
//! The centerpiece is the kernel channel engine
//! ([`kernel_connection::KernelConnection`]), which multiplexes many logical
//! request/reply exchanges over one WebSocket, routes unsolicited iopub
//! traffic, tracks kernel lifecycle state, reconnects with exponential
//! backoff, and maintains the comm sub-channels. Session coordinators bind
//! engines to server-side sessions, and the manager layer keeps a polled
//! fleet view of kernels, sessions, and kernel specs.

pub mod comm;
pub mod error;
pub mod kernel_connection;
pub mod kernel_manager;
pub mod managed_socket;
pub mod message_future;
pub mod rest;
pub mod running_kernels;
pub mod session;
pub mod session_manager;

pub use running_kernels::find_running_kernel;
