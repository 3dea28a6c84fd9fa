//! Scenario tests that drive the library end to end the way the binary
//! does: atlas files on disk, real UDP sockets and telemetry listeners.

mod overflow;
mod scenarios;
