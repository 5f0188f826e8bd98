pub mod audio;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod ipc;
pub mod signals;

pub use controller::Controller;
pub use daemon::{Daemon, DEFAULT_TICK_SECONDS};
pub use error::CommandError;
pub use signals::{BlockReason, PageSignal, PageSink, SoundPlayer};
