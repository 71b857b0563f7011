//! Sluice control plane
//!
//! Starts, supervises and tears down the pieces of a local proxy session:
//! protocol relay backends, the traffic redirection mode and the OS state
//! they touch (driver service, DNS servers, firewall rules).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MainController                        │
//! │   preflight: connectivity ─ resolve ─ firewall ─ port check  │
//! │                                                              │
//! │  ┌──────────────────┐      ┌──────────────────────────────┐  │
//! │  │ ServerController │◀─────│ ModeController               │  │
//! │  │ relay backend on │ tcp  │  Redirector ── driver, DNS   │  │
//! │  │ SOCKS5 local port│      │   └─ UDP sidecar relay       │  │
//! │  └──────────────────┘      │  Rule ──────── Privoxy       │  │
//! │                            └──────────────────────────────┘  │
//! └───────────────────────────────│──────────────────────────────┘
//!                                 ▼
//!                       Platform (OS seams, fakes in tests)
//! ```
//!
//! Every backend is an opaque executable. Readiness is decided by watching
//! its output for marker substrings, and every failure rolls the session
//! back to nothing running.

pub mod args;
pub mod backend;
pub mod config;
pub mod context;
pub mod controller;
pub mod dns;
pub mod driver;
pub mod error;
pub mod event;
pub mod mode;
pub mod model;
pub mod nat;
pub mod platform;
pub mod port;
pub mod process;
pub mod readiness;
pub mod resolver;
pub mod server;
pub mod sidecar;
pub mod state;

pub use config::{ConfigError, Settings};
pub use context::ControlContext;
pub use controller::{MainController, Session};
pub use driver::{DriverImage, DriverLifecycleManager};
pub use error::ControlError;
pub use event::{ControlEvent, EventBus, LogLine, Notice};
pub use mode::ModeController;
pub use model::{ModeDescriptor, ModeKind, ProtocolFamily, ServerDescriptor};
pub use nat::NatReport;
pub use platform::Platform;
pub use server::ServerController;
pub use state::ControllerState;
