use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use impedit_core::Symbol;

#[derive(Parser, Debug)]
#[command(
    name = "impedit",
    version,
    about = "Edit the import table of a PE file",
    long_about = "Edit the import table of a PE file.\n\
                  Can be used to make a program load a DLL at startup.\n\
                  Arguments may be written as --name:value or --name=value."
)]
pub struct Cli {
    /// Action to perform
    #[arg(long, value_enum)]
    pub action: Action,

    /// Path to the target .exe or .dll
    #[arg(long)]
    pub target: PathBuf,

    /// DLL_PATH::FUNCTION to add or remove; `#N` as FUNCTION means ordinal N.
    /// The DLL must be loadable from the target's search path at run time.
    #[arg(long)]
    pub symbol: Option<Symbol>,

    /// Where to write the modified file [default: <target>_modified.<ext>]
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Skip export validation on add; required to remove
    #[arg(long)]
    pub force: bool,

    /// Compare module names case-insensitively
    #[arg(long)]
    pub ignore_case: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    List,
    Add,
    Remove,
}

/// Rewrite `--name:value` into `--name=value`.  Only the first `:` is
/// touched, and only when no `=` precedes it, so `--symbol:a.dll::F` and
/// `--target:C:\app.exe` both survive intact.
pub fn normalize<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let Some(text) = arg.to_str() else { return arg };
            let Some(body) = text.strip_prefix("--") else { return arg };
            match (body.find(':'), body.find('=')) {
                (Some(colon), eq) if eq.map_or(true, |eq| colon < eq) => {
                    OsString::from(format!("--{}={}", &body[..colon], &body[colon + 1..]))
                }
                _ => arg,
            }
        })
        .collect()
}
