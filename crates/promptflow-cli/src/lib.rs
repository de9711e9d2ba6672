//! Promptflow CLI library — command implementations shared by the
//! `promptflow` binary and the integration tests.

pub mod commands;
