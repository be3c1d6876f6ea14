use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use impedit_core::{
    DirectoryEntry, EditError, EditOptions, ExportEntry, Image, LookupError, NameMatch, Symbol,
    Validation,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::args::{Action, Cli};
use crate::fsutil::{self, FsExportSource};

/// Problems with the command line that are caught before the target is read.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("the target file does not exist: {0}")]
    MissingTarget(PathBuf),
    #[error("the target file is locked: {0}; close any program using it")]
    TargetLocked(PathBuf),
    #[error("no symbol specified; use --symbol:DLL_PATH::FUNCTION")]
    MissingSymbol,
    #[error("the save directory does not exist: {0}")]
    MissingSaveDir(PathBuf),
    #[error("the file to save to is locked: {0}; close any program using it")]
    OutputLocked(PathBuf),
}

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    if !cli.target.is_file() {
        return Err(ValidationError::MissingTarget(cli.target.clone()).into());
    }
    if fsutil::is_locked(&cli.target) {
        return Err(ValidationError::TargetLocked(cli.target.clone()).into());
    }
    match cli.action {
        Action::List => {
            let image = load(&cli.target)?;
            print_listing(&image, &cli.target);
            Ok(())
        }
        Action::Add => edit(cli, add),
        Action::Remove => edit(cli, remove),
    }
}

fn load(target: &Path) -> anyhow::Result<Image> {
    let data = fs::read(target).with_context(|| format!("failed to read {}", target.display()))?;
    let image = Image::parse(data).with_context(|| format!("failed to parse {}", target.display()))?;
    let signed = image
        .nt_headers()
        .directory(DirectoryEntry::Security)
        .is_some_and(|dir| dir.is_present());
    if signed {
        warn!("the target file is signed; modifying it will invalidate the signature");
    }
    Ok(image)
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn print_listing(image: &Image, target: &Path) {
    println!("Imported functions:");
    for record in image.list_imports() {
        println!("  Import - {record} ({:X})", record.iat_rva);
    }
    println!(" The hex value after each import is the RVA of its IAT slot.");

    let label = target.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    println!("Exported functions:");
    let mut exports = image.list_exports().peekable();
    if exports.peek().is_none() {
        println!("  No exported functions found!");
    }
    for export in exports {
        println!("  Export - {label}::{}", export_label(export));
    }
}

fn export_label(export: &ExportEntry) -> String {
    let name = match &export.name {
        Some(name) => name.clone(),
        None => format!("#{}", export.ordinal),
    };
    match &export.forwarder {
        Some(target) => format!("{name} -> {target}"),
        None => format!("{name} ({:X})", export.address),
    }
}

// ---------------------------------------------------------------------------
// add / remove
// ---------------------------------------------------------------------------

type Mutation = fn(&mut Image, &Symbol, &Cli, &EditOptions) -> anyhow::Result<()>;

fn edit(cli: &Cli, mutate: Mutation) -> anyhow::Result<()> {
    let symbol = cli.symbol.as_ref().ok_or(ValidationError::MissingSymbol)?;
    let save = save_path(cli)?;
    let mut image = load(&cli.target)?;
    let options = EditOptions {
        module_match: if cli.ignore_case { NameMatch::IgnoreAsciiCase } else { NameMatch::Exact },
        ..EditOptions::default()
    };

    mutate(&mut image, symbol, cli, &options)?;

    let bytes = image.build().context("failed to rebuild the image")?;
    fsutil::write_atomic(&save, &bytes)?;
    info!("Modified binary saved to: {}", save.display());
    Ok(())
}

fn save_path(cli: &Cli) -> Result<PathBuf, ValidationError> {
    let path = match &cli.save {
        Some(path) => {
            let dir = fsutil::parent_dir(path);
            if !dir.is_dir() {
                return Err(ValidationError::MissingSaveDir(dir.to_path_buf()));
            }
            path.clone()
        }
        None => {
            let path = fsutil::default_save_path(&cli.target);
            warn!("No save path specified! Defaulting to: {}", path.display());
            path
        }
    };
    if fsutil::is_locked(&path) {
        return Err(ValidationError::OutputLocked(path));
    }
    Ok(path)
}

fn add(image: &mut Image, symbol: &Symbol, cli: &Cli, options: &EditOptions) -> anyhow::Result<()> {
    info!("Attempting to add import: {symbol}");

    let dll_dir = Path::new(&symbol.module_path).parent().unwrap_or(Path::new(""));
    let target_dir = cli.target.parent().unwrap_or(Path::new(""));
    if dll_dir != target_dir {
        warn!("The DLL is not in the same directory as the target file!");
        warn!("Copy the DLL next to the target or onto its search path, or it will fail to load");
    }

    let module = symbol.module_name();
    if image.imports().iter().any(|d| options.module_match.matches(&d.module_name, module)) {
        info!("Library already exists, using existing module");
    }

    let validation = if cli.force { Validation::Skip } else { Validation::Exports(&FsExportSource) };
    match image.add_import(symbol, validation, options) {
        Ok(_) => Ok(()),
        Err(err @ EditError::Lookup(LookupError::SymbolNotFound { .. })) => {
            info!(
                "TIP: list the DLL's exports with --action:list --target:{}",
                symbol.module_path
            );
            warn!("If you are sure the function exists, append --force");
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn remove(image: &mut Image, symbol: &Symbol, cli: &Cli, options: &EditOptions) -> anyhow::Result<()> {
    info!("Attempting to remove import: {symbol}");
    match image.remove_import(symbol, cli.force, options) {
        Ok(entry) => {
            info!("Removed {symbol} (IAT slot was {:X})", entry.iat_rva);
            Ok(())
        }
        Err(err @ EditError::Refused(_)) => {
            warn!("Removing an import will likely break code that calls through it");
            warn!("Restoring the original file is usually the safer choice");
            warn!("If you understand the risk, append the --force flag");
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}
