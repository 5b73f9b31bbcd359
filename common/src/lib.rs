// Meridian common library - main library exports

pub mod calculations;
pub mod hash;
pub mod params;
pub mod types;

// Flattened re-exports
pub use self::hash::Hash;
pub use self::types::*;
