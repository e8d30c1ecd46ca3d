//! Collaborators around the engine: console output and connectivity

pub mod network;
pub mod progress;

pub use network::{AlwaysOnline, ConnectivityFlag, ConnectivityMonitor};
pub use progress::ConsoleReporter;
