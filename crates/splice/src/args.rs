//! Command-line arguments shared by the binary and its tests.

use clap::{ArgMatches, Args};
use serde_json::Value;
use splice_core::selection::SelectionRule;
use std::fmt;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct PatchArgs {
    /// Artifact to patch (a ZIP with package.json at its root)
    pub artifact: PathBuf,

    /// Patch bundle (directory or .tar.gz). Repeat for multiple.
    #[arg(short = 'p', long = "patches", value_name = "BUNDLE", required = true)]
    pub bundles: Vec<PathBuf>,

    /// Enable a patch by name
    #[arg(short, long, value_name = "NAME")]
    pub enable: Vec<String>,

    /// Enable a patch by catalog index
    #[arg(long = "ei", value_name = "INDEX")]
    pub enable_index: Vec<usize>,

    /// Disable a patch by name
    #[arg(short, long, value_name = "NAME")]
    pub disable: Vec<String>,

    /// Disable a patch by catalog index
    #[arg(long = "di", value_name = "INDEX")]
    pub disable_index: Vec<usize>,

    /// Option for the preceding enabled patch. VALUE is JSON or a plain
    /// string; a bare KEY sets null.
    #[arg(short = 'O', long, value_name = "KEY[=VALUE]")]
    pub options: Vec<String>,

    /// Only run explicitly enabled patches
    #[arg(long)]
    pub exclusive: bool,

    /// Ignore version compatibility
    #[arg(short, long)]
    pub force: bool,

    /// Path to write the patched artifact to
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Install to a device (the first available one without SERIAL)
    #[arg(short, long, value_name = "SERIAL", num_args = 0..=1)]
    pub install: Option<Option<String>>,

    /// Install by bind-mounting over the installed package
    #[arg(long)]
    pub mount: bool,

    /// Keystore to sign with (generated if missing)
    #[arg(long)]
    pub keystore: Option<PathBuf>,

    #[arg(long)]
    pub keystore_password: Option<String>,

    #[arg(long, default_value = "Splice Key")]
    pub keystore_entry_alias: String,

    #[arg(long)]
    pub keystore_entry_password: Option<String>,

    /// Name of the signer
    #[arg(long, default_value = "Splice")]
    pub signer: String,

    /// Directory for intermediate files
    #[arg(short, long)]
    pub temporary_files_path: Option<PathBuf>,

    /// Skip signing
    #[arg(long)]
    pub unsigned: bool,

    /// Native library ABI to strip. Repeat for multiple.
    #[arg(long = "rip-lib", value_name = "ABI")]
    pub rip_lib: Vec<String>,

    /// Options file used when no options are given on the command line
    #[arg(long)]
    pub options_file: Option<PathBuf>,

    /// Delete the temporary files directory afterwards
    #[arg(long)]
    pub purge: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Patch bundle (directory or .tar.gz). Repeat for multiple.
    #[arg(short = 'p', long = "patches", value_name = "BUNDLE", required = true)]
    pub bundles: Vec<PathBuf>,

    /// Show each patch's options
    #[arg(long)]
    pub with_options: bool,

    /// Only list patches compatible with this package
    #[arg(long, value_name = "NAME")]
    pub package: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    /// `-O` given before any enable flag.
    OptionWithoutPatch(String),
    EmptyOptionKey(String),
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::OptionWithoutPatch(option) => write!(
                f,
                "option '{}' must follow -e/--enable or --ei",
                option
            ),
            ArgsError::EmptyOptionKey(option) => write!(f, "option '{}' has no key", option),
        }
    }
}

impl std::error::Error for ArgsError {}

/// Parse `KEY[=VALUE]`.
pub fn parse_option(raw: &str) -> Result<(String, Value), ArgsError> {
    let (key, value) = match raw.split_once('=') {
        Some((key, value)) => {
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
            (key, value)
        }
        None => (raw, Value::Null),
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(ArgsError::EmptyOptionKey(raw.to_string()));
    }
    Ok((key.to_string(), value))
}

enum Flag {
    Enable(String),
    EnableIndex(usize),
    Disable(String),
    DisableIndex(usize),
    Option(String),
}

fn collect<T: Clone + Send + Sync + 'static>(
    matches: &ArgMatches,
    id: &str,
    flag: fn(T) -> Flag,
    into: &mut Vec<(usize, Flag)>,
) {
    let (Some(indices), Some(values)) = (matches.indices_of(id), matches.get_many::<T>(id)) else {
        return;
    };
    into.extend(indices.zip(values.cloned().map(flag)));
}

/// Build selection rules from the command line, binding each `-O` to the
/// closest enable flag before it.
pub fn selection_rules(matches: &ArgMatches) -> Result<Vec<SelectionRule>, ArgsError> {
    let mut flags = Vec::new();
    collect(matches, "enable", Flag::Enable, &mut flags);
    collect(matches, "enable_index", Flag::EnableIndex, &mut flags);
    collect(matches, "disable", Flag::Disable, &mut flags);
    collect(matches, "disable_index", Flag::DisableIndex, &mut flags);
    collect(matches, "options", Flag::Option, &mut flags);
    flags.sort_by_key(|(index, _)| *index);

    let mut rules = Vec::new();
    let mut last_enable = None;
    for (_, flag) in flags {
        match flag {
            Flag::Enable(name) => {
                last_enable = Some(rules.len());
                rules.push(SelectionRule::enable(name));
            }
            Flag::EnableIndex(index) => {
                last_enable = Some(rules.len());
                rules.push(SelectionRule::enable_index(index));
            }
            Flag::Disable(name) => rules.push(SelectionRule::disable(name)),
            Flag::DisableIndex(index) => rules.push(SelectionRule::disable_index(index)),
            Flag::Option(raw) => {
                let (key, value) = parse_option(&raw)?;
                let options = last_enable
                    .and_then(|i| rules.get_mut(i))
                    .and_then(SelectionRule::options_mut)
                    .ok_or(ArgsError::OptionWithoutPatch(raw))?;
                options.insert(key, value);
            }
        }
    }
    Ok(rules)
}
