//! Shufflebox - client runtime for server-coordinated game shuffling.
//!
//! Each client wraps one emulator process. The coordination server tells it
//! which game each player instance should be running, when to pause/resume,
//! and when to swap save-state context; the client drives the emulator
//! through a small script embedded in it and moves saves and assets around
//! every swap.
//!
//! # Architecture
//!
//! - [`transport`] - reconnecting duplex channel to the server
//! - [`bridge`] - acknowledged line protocol to the embedded script
//! - [`supervisor`] - emulator process lifecycle, restart-mode reconciliation
//! - [`controller`] - the state machine tying the three together
//! - [`assets`] / [`saves`] - file transfer collaborators
//! - [`session`] - lock-guarded session state and game catalog
//!
//! Commands flow server -> transport -> controller -> bridge -> script;
//! events flow the other way.

pub mod assets;
pub mod bridge;
pub mod command;
pub mod config;
pub mod controller;
pub mod env;
pub mod saves;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use assets::AssetStore;
pub use bridge::{BridgeError, BridgeEvent, EmulatorBridge, StyledMessage};
pub use command::{Command, CommandKind};
pub use config::{Config, KeyValueFile};
pub use controller::{CommandController, ControllerSettings};
pub use saves::{SaveDownload, SaveStore};
pub use session::{GameCatalog, GameEntry, SessionSnapshot, SessionState};
pub use supervisor::ProcessSupervisor;
pub use transport::ServerTransport;
