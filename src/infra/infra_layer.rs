// Implementations of the ports declared in core.
// Each feature gets its own submodule.

#[path = "leveling/leveling_store.rs"]
pub mod leveling;
