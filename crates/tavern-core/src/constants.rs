//! Package-level constants.

/// Current version of the Tavern server (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "tavern";

/// Version string that is compatible with every other version.
///
/// Development builds report this so they can talk to released builds.
pub const DEVELOPMENT_VERSION: &str = "DEVELOPMENT";
