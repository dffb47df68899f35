//! Shared plumbing for the heron crates: directory layout and
//! small persistence helpers.

pub mod paths;
pub mod persist;
pub mod test;
