mod resolve;
mod rule;

pub use resolve::{resolve, PackageIdentity, ResolveFlags, Selection};
pub use rule::{validate_rules, OptionOverrides, SelectionError, SelectionRule};
