//! Runtime-facing plumbing for the rkl node daemon.
//!
//! The only backend is the Container Runtime Interface: see [`cri`].

pub mod cri;
