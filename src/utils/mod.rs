//! Small shared utilities: modular arithmetic and DOT escaping.

mod dot;
mod math;

pub use dot::escape_dot;
pub use math::{mod_inv, mod_inv32};
