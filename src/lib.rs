//! Antfarm -- orchestration of simulated Sia networks.
//!
//! Spawns a fleet of siad daemons ("ants"), drives each through scripted
//! background jobs (mining, hosting, renting, spending), waits for the
//! fleet to converge on one consensus group, and exposes a registry
//! endpoint so multiple antfarms can federate.

pub mod ant;
pub mod barrier;
pub mod client;
pub mod config;
pub mod farm;
pub mod jobs;
pub mod process;
pub mod threadgroup;
pub mod types;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod testing;
