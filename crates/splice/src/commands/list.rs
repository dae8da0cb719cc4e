use std::io::{self, Write};

use splice_core::catalog::{Catalog, CatalogError, Compatibility, Patch};

use crate::args::ListArgs;

fn is_listed(patch: &Patch, package: Option<&str>) -> bool {
    match package {
        None => true,
        Some(package) => !matches!(
            patch.compatibility_with(package),
            Compatibility::Unlisted | Compatibility::NoVersions
        ),
    }
}

fn compatibility_line(patch: &Patch) -> Option<String> {
    let packages = patch.compatible_packages()?;
    let described: Vec<String> = packages
        .iter()
        .map(|(name, versions)| match versions {
            None => format!("{} (any version)", name),
            Some(versions) if versions.is_empty() => format!("{} (no versions)", name),
            Some(versions) => format!(
                "{} ({})",
                name,
                versions.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        })
        .collect();
    Some(described.join("; "))
}

fn write_patch(patch: &Patch, with_options: bool, out: &mut dyn Write) -> io::Result<()> {
    let default = if patch.uses() { "enabled" } else { "disabled" };
    writeln!(out, "[{}] {} ({})", patch.index(), patch.name(), default)?;
    if let Some(description) = patch.description() {
        writeln!(out, "    {}", description)?;
    }
    match compatibility_line(patch) {
        Some(line) => writeln!(out, "    Compatible with: {}", line)?,
        None => writeln!(out, "    Compatible with: any package")?,
    }
    if with_options && !patch.options().is_empty() {
        writeln!(out, "    Options:")?;
        for option in patch.options() {
            let required = if option.required { " (required)" } else { "" };
            writeln!(out, "      {} = {}{}", option.key, option.default, required)?;
            if let Some(description) = &option.description {
                writeln!(out, "          {}", description)?;
            }
        }
    }
    Ok(())
}

/// Print every patch in the catalog, optionally only those that can apply
/// to `--package`.
pub fn run(args: &ListArgs, out: &mut dyn Write) -> Result<usize, CatalogError> {
    let catalog = Catalog::load(&args.bundles)?;
    let mut shown = 0;
    for patch in catalog.patches() {
        if !is_listed(patch, args.package.as_deref()) {
            continue;
        }
        // stdout closing early (e.g. piped to head) ends the listing
        if write_patch(patch, args.with_options, out).is_err() {
            break;
        }
        shown += 1;
    }
    Ok(shown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn list(bundle: PathBuf, with_options: bool, package: Option<&str>) -> (usize, String) {
        let args = ListArgs {
            bundles: vec![bundle],
            with_options,
            package: package.map(str::to_string),
        };
        let mut out = Vec::new();
        let shown = run(&args, &mut out).unwrap();
        (shown, String::from_utf8(out).unwrap())
    }

    const BUNDLE: &str = r#"{"version": 1, "patches": [
        {"name": "Hide ads", "description": "Removes banners"},
        {"name": "Branding", "use": false,
         "compatible_packages": {"com.example": ["1.0", "1.1"], "com.other": null},
         "options": [{"key": "title", "default": "Splice", "required": true,
                      "description": "App title"}]},
        {"name": "Legacy", "compatible_packages": {"com.example": []}}
    ]}"#;

    #[test]
    fn lists_every_patch() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bundle.json"), BUNDLE).unwrap();

        let (shown, text) = list(dir.path().to_path_buf(), false, None);

        assert_eq!(shown, 3);
        assert!(text.contains("[0] Hide ads (enabled)\n    Removes banners\n    Compatible with: any package"));
        assert!(text.contains("[1] Branding (disabled)"));
        assert!(text.contains("Compatible with: com.example (1.0, 1.1); com.other (any version)"));
        assert!(text.contains("[2] Legacy (enabled)\n    Compatible with: com.example (no versions)"));
        assert!(!text.contains("Options:"));
    }

    #[test]
    fn shows_options_on_request() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bundle.json"), BUNDLE).unwrap();

        let (_, text) = list(dir.path().to_path_buf(), true, None);

        assert!(text.contains("      title = \"Splice\" (required)\n          App title"));
    }

    #[test]
    fn filters_by_package() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bundle.json"), BUNDLE).unwrap();

        let (shown, text) = list(dir.path().to_path_buf(), false, Some("com.other"));

        assert_eq!(shown, 2);
        assert!(text.contains("Hide ads"));
        assert!(text.contains("Branding"));
        assert!(!text.contains("Legacy"));
    }

    #[test]
    fn missing_bundle_is_an_error() {
        let dir = tempdir().unwrap();
        let args = ListArgs {
            bundles: vec![dir.path().join("missing")],
            with_options: false,
            package: None,
        };

        let result = run(&args, &mut Vec::new());

        assert!(matches!(result, Err(CatalogError::BundleNotFound(_))));
    }
}
