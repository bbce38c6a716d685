// handlers/elevated/mod.rs - Privileged operator handlers
//
// Routes under this module sit behind JWT auth plus a capability check.

pub mod migration;
