pub mod diff;
pub mod hash;
