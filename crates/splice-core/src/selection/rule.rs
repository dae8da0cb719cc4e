use crate::catalog::Catalog;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Option key to override value for one patch.
pub type OptionOverrides = BTreeMap<String, Value>;

/// A declarative instruction to force a patch on or off.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionRule {
    EnableByName { name: String, options: OptionOverrides },
    EnableByIndex { index: usize, options: OptionOverrides },
    DisableByName { name: String },
    DisableByIndex { index: usize },
}

impl SelectionRule {
    pub fn enable(name: impl Into<String>) -> Self {
        SelectionRule::EnableByName {
            name: name.into(),
            options: OptionOverrides::new(),
        }
    }

    pub fn enable_index(index: usize) -> Self {
        SelectionRule::EnableByIndex {
            index,
            options: OptionOverrides::new(),
        }
    }

    pub fn disable(name: impl Into<String>) -> Self {
        SelectionRule::DisableByName { name: name.into() }
    }

    pub fn disable_index(index: usize) -> Self {
        SelectionRule::DisableByIndex { index }
    }

    pub fn is_enable(&self) -> bool {
        matches!(
            self,
            SelectionRule::EnableByName { .. } | SelectionRule::EnableByIndex { .. }
        )
    }

    /// Option overrides carried by an enable rule.
    pub fn options(&self) -> Option<&OptionOverrides> {
        match self {
            SelectionRule::EnableByName { options, .. }
            | SelectionRule::EnableByIndex { options, .. } => Some(options),
            _ => None,
        }
    }

    pub fn options_mut(&mut self) -> Option<&mut OptionOverrides> {
        match self {
            SelectionRule::EnableByName { options, .. }
            | SelectionRule::EnableByIndex { options, .. } => Some(options),
            _ => None,
        }
    }
}

/// A rule that does not refer to anything in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    UnknownPatch(String),
    IndexOutOfRange { index: usize, len: usize },
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionError::UnknownPatch(name) => {
                write!(f, "no patch named '{}' in the supplied bundles", name)
            }
            SelectionError::IndexOutOfRange { index, len } => write!(
                f,
                "patch index {} is out of range (catalog has {} patches)",
                index, len
            ),
        }
    }
}

impl std::error::Error for SelectionError {}

/// Reject rules that name patches or indices the catalog does not have.
pub fn validate_rules(catalog: &Catalog, rules: &[SelectionRule]) -> Result<(), SelectionError> {
    for rule in rules {
        match rule {
            SelectionRule::EnableByName { name, .. } | SelectionRule::DisableByName { name } => {
                if catalog.find(name).is_none() {
                    return Err(SelectionError::UnknownPatch(name.clone()));
                }
            }
            SelectionRule::EnableByIndex { index, .. } | SelectionRule::DisableByIndex { index } => {
                if *index >= catalog.len() {
                    return Err(SelectionError::IndexOutOfRange {
                        index: *index,
                        len: catalog.len(),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PatchDefinition;
    use std::path::Path;

    fn catalog() -> Catalog {
        Catalog::from_definitions(
            vec![PatchDefinition::new("A"), PatchDefinition::new("B")],
            Path::new("."),
        )
        .unwrap()
    }

    #[test]
    fn accepts_known_names_and_indices() {
        let rules = vec![SelectionRule::enable("A"), SelectionRule::disable_index(1)];
        assert!(validate_rules(&catalog(), &rules).is_ok());
    }

    #[test]
    fn rejects_unknown_name() {
        let rules = vec![SelectionRule::disable("Z")];
        assert_eq!(
            validate_rules(&catalog(), &rules),
            Err(SelectionError::UnknownPatch("Z".to_string()))
        );
    }

    #[test]
    fn rejects_out_of_range_index() {
        let rules = vec![SelectionRule::enable_index(2)];
        assert_eq!(
            validate_rules(&catalog(), &rules),
            Err(SelectionError::IndexOutOfRange { index: 2, len: 2 })
        );
    }
}
