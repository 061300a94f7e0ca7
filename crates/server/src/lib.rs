//! Workbench backend: embedded preview serving for project workspaces.

pub mod preview;
