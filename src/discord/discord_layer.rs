// Discord layer - commands, event plumbing and the Discord-side adapters for
// the core leveling ports.

#[path = "commands/command_catalog.rs"]
pub mod commands;

#[path = "leveling/leveling_announcements.rs"]
pub mod leveling_announcements;

#[path = "leveling/role_provisioner.rs"]
pub mod role_provisioner;

// Re-export command types for convenience
pub use commands::leveling::{Data, Error};
