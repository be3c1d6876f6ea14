//! Import mutation engine.
//!
//! Edits move an [`Image`] through `Parsed -> Validated -> Mutated`; building
//! it is the final `Rebuilt` step.  Every operation works on a copy of the
//! import model and only commits it once the new layout has been planned, so
//! a failure leaves the image exactly as it was.

pub mod layout;
pub mod symbol;

use std::fmt;

use crate::error::{EditError, LookupError, PolicyRefusal};
use crate::pe::exports::{ExportEntry, ExportTable};
use crate::pe::imports::{ImportDescriptor, ImportEntry, ImportKind};
use crate::pe::Image;

use self::symbol::{Symbol, SymbolRef};

/// Reserved name of the section holding appended import data.
pub const DEFAULT_SECTION_NAME: &str = ".imptab";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How module names are compared.  Function names are always exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NameMatch {
    #[default]
    Exact,
    IgnoreAsciiCase,
}

impl NameMatch {
    pub fn matches(self, a: &str, b: &str) -> bool {
        match self {
            NameMatch::Exact => a == b,
            NameMatch::IgnoreAsciiCase => a.eq_ignore_ascii_case(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOptions {
    pub module_match: NameMatch,
    /// Base name for the appended section; `2`..`9` are suffixed when taken.
    pub section_name: String,
}

impl Default for EditOptions {
    fn default() -> Self {
        EditOptions {
            module_match: NameMatch::default(),
            section_name: DEFAULT_SECTION_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Parsed,
    Validated,
    Mutated,
    Rebuilt,
}

// ---------------------------------------------------------------------------
// Export validation
// ---------------------------------------------------------------------------

/// Supplies the export table of a module named on the command line.
pub trait ExportSource {
    fn exports(&self, module_path: &str) -> Result<ExportTable, LookupError>;
}

impl<F> ExportSource for F
where
    F: Fn(&str) -> Result<ExportTable, LookupError>,
{
    fn exports(&self, module_path: &str) -> Result<ExportTable, LookupError> {
        self(module_path)
    }
}

#[derive(Clone, Copy)]
pub enum Validation<'a> {
    /// Trust the caller (`--force`).
    Skip,
    Exports(&'a dyn ExportSource),
}

impl fmt::Debug for Validation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validation::Skip => f.write_str("Skip"),
            Validation::Exports(_) => f.write_str("Exports(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// One `(module, function, iat_rva)` triple from [`Image::list_imports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRecord<'a> {
    pub module: &'a str,
    pub kind: &'a ImportKind,
    pub iat_rva: u32,
}

impl fmt::Display for ImportRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.kind)
    }
}

impl Image {
    /// Every import in file order.
    pub fn list_imports(&self) -> impl Iterator<Item = ImportRecord<'_>> + Clone + '_ {
        self.imports.iter().flat_map(|desc| {
            desc.entries.iter().map(move |entry| ImportRecord {
                module: &desc.module_name,
                kind: &entry.kind,
                iat_rva: entry.iat_rva,
            })
        })
    }

    /// Every export in address-table order; empty when the image exports
    /// nothing.
    pub fn list_exports(&self) -> impl Iterator<Item = &ExportEntry> + Clone + '_ {
        self.exports().into_iter().flat_map(|table| table.entries.iter())
    }

    pub fn find_import(&self, symbol: &Symbol, options: &EditOptions) -> Option<ImportRecord<'_>> {
        let (d, e) = locate(&self.imports, symbol, options.module_match)?;
        let desc = &self.imports[d];
        let entry = &desc.entries[e];
        Some(ImportRecord { module: &desc.module_name, kind: &entry.kind, iat_rva: entry.iat_rva })
    }

    // -- mutation -----------------------------------------------------------

    /// Add `symbol` to the import table and return the RVA of its IAT slot.
    pub fn add_import(
        &mut self,
        symbol: &Symbol,
        validation: Validation<'_>,
        options: &EditOptions,
    ) -> Result<u32, EditError> {
        let module = symbol.module_name();
        if locate(&self.imports, symbol, options.module_match).is_some() {
            return Err(LookupError::AlreadyExists {
                module: module.to_string(),
                function: symbol.function.to_string(),
            }
            .into());
        }

        let kind = match validation {
            Validation::Skip => match &symbol.function {
                SymbolRef::Name(name) => ImportKind::ByName { name: name.clone(), hint: 0 },
                SymbolRef::Ordinal(ord) => ImportKind::ByOrdinal(*ord),
            },
            Validation::Exports(source) => validate(source, symbol)?,
        };
        self.transition(EditState::Validated);

        let mut candidate = self.imports.clone();
        let target = match candidate
            .iter()
            .position(|d| options.module_match.matches(&d.module_name, module))
        {
            Some(d) => d,
            None => {
                candidate.push(ImportDescriptor::added(module.to_string()));
                candidate.len() - 1
            }
        };
        candidate[target].entries.push(ImportEntry::appended(kind));
        let slot = candidate[target].entries.len() - 1;

        self.commit(candidate, options).map_err(|err| {
            self.state = self.settled_state();
            err
        })?;
        let iat_rva = self.imports[target].entries[slot].iat_rva;
        tracing::info!(
            module,
            function = %symbol.function,
            iat_rva = format_args!("{iat_rva:#x}"),
            "import added"
        );
        Ok(iat_rva)
    }

    /// Remove `symbol` from the import table.  Without `force` nothing is
    /// touched: code calling through the slot would break at run time.
    pub fn remove_import(
        &mut self,
        symbol: &Symbol,
        force: bool,
        options: &EditOptions,
    ) -> Result<ImportEntry, EditError> {
        if !force {
            return Err(PolicyRefusal {
                module: symbol.module_name().to_string(),
                function: symbol.function.to_string(),
            }
            .into());
        }
        let (d, e) = locate(&self.imports, symbol, options.module_match).ok_or_else(|| {
            LookupError::ImportNotFound {
                module: symbol.module_name().to_string(),
                function: symbol.function.to_string(),
            }
        })?;
        self.transition(EditState::Validated);

        let mut candidate = self.imports.clone();
        let removed = candidate[d].entries.remove(e);
        if candidate[d].entries.is_empty() {
            let desc = candidate.remove(d);
            tracing::debug!(module = %desc.module_name, "dropping empty import descriptor");
        }

        self.commit(candidate, options).map_err(|err| {
            self.state = self.settled_state();
            err
        })?;
        tracing::info!(module = symbol.module_name(), function = %symbol.function, "import removed");
        Ok(removed)
    }

    fn commit(&mut self, mut candidate: Vec<ImportDescriptor>, options: &EditOptions) -> Result<(), EditError> {
        let ctx = self.layout_context();
        let plan = layout::plan(&ctx, &mut candidate, &options.section_name)?;
        let (headers, sections) = match &plan {
            Some(plan) => layout::apply(&ctx, plan)?,
            None => (ctx.nt.clone(), ctx.sections.to_vec()),
        };
        self.imports = candidate;
        self.headers = headers;
        self.sections = sections;
        self.plan = plan;
        self.transition(self.settled_state());
        Ok(())
    }

    /// `Mutated` once the model differs from the input, `Parsed` otherwise.
    fn settled_state(&self) -> EditState {
        if self.plan.is_some() {
            EditState::Mutated
        } else {
            EditState::Parsed
        }
    }

    fn transition(&mut self, next: EditState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "edit state");
            self.state = next;
        }
    }
}

fn locate(imports: &[ImportDescriptor], symbol: &Symbol, rule: NameMatch) -> Option<(usize, usize)> {
    let module = symbol.module_name();
    imports.iter().enumerate().find_map(|(d, desc)| {
        if !rule.matches(&desc.module_name, module) {
            return None;
        }
        desc.position(&symbol.function).map(|e| (d, e))
    })
}

fn validate(source: &dyn ExportSource, symbol: &Symbol) -> Result<ImportKind, LookupError> {
    let table = source.exports(&symbol.module_path)?;
    let not_found = || LookupError::SymbolNotFound {
        module: symbol.module_name().to_string(),
        function: symbol.function.to_string(),
    };
    match &symbol.function {
        SymbolRef::Name(name) => {
            let entry = table.find_name(name).ok_or_else(not_found)?;
            let hint = entry.name_index.and_then(|i| u16::try_from(i).ok()).unwrap_or(0);
            Ok(ImportKind::ByName { name: name.clone(), hint })
        }
        SymbolRef::Ordinal(ord) => {
            table.find_ordinal(*ord).ok_or_else(not_found)?;
            Ok(ImportKind::ByOrdinal(*ord))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use crate::pe::imports::DescriptorOrigin;
    use crate::testing::PeFixture;

    fn image(fixture: PeFixture) -> Image {
        Image::parse(fixture.build()).unwrap()
    }

    fn sym(s: &str) -> Symbol {
        s.parse().unwrap()
    }

    fn listed(image: &Image) -> Vec<String> {
        image.list_imports().map(|r| r.to_string()).collect()
    }

    fn helper_exports(path: &str) -> Result<ExportTable, LookupError> {
        if path.ends_with("helper.dll") {
            let data = PeFixture::new().exports("helper.dll", &["Beta", "Alpha", "Gamma"]).build();
            Ok(Image::parse(data).unwrap().exports().unwrap().clone())
        } else {
            Err(LookupError::ModuleNotFound { module: path.to_string(), reason: "missing".into() })
        }
    }

    #[test]
    fn add_new_module_creates_descriptor() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess"]));
        let opts = EditOptions::default();
        img.add_import(&sym("user32.dll::MessageBoxA"), Validation::Skip, &opts).unwrap();
        assert_eq!(img.state(), EditState::Mutated);
        assert_eq!(listed(&img), ["kernel32.dll::ExitProcess", "user32.dll::MessageBoxA"]);
        assert!(matches!(img.imports()[1].origin, DescriptorOrigin::Added));

        let rebuilt = Image::parse(img.build().unwrap()).unwrap();
        assert_eq!(listed(&rebuilt), ["kernel32.dll::ExitProcess", "user32.dll::MessageBoxA"]);
    }

    #[test]
    fn add_to_existing_module_emits_continuation() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess"]));
        let opts = EditOptions::default();
        img.add_import(&sym("kernel32.dll::Sleep"), Validation::Skip, &opts).unwrap();
        assert_eq!(img.imports().len(), 1);

        let rebuilt = Image::parse(img.build().unwrap()).unwrap();
        let modules: Vec<&str> = rebuilt.imports().iter().map(|d| d.module_name.as_str()).collect();
        assert_eq!(modules, ["kernel32.dll", "kernel32.dll"]);
        assert_eq!(rebuilt.imports()[0].name_rva, rebuilt.imports()[1].name_rva);
        assert_eq!(listed(&rebuilt), ["kernel32.dll::ExitProcess", "kernel32.dll::Sleep"]);
    }

    #[test]
    fn duplicate_add_is_rejected_and_changes_nothing() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess"]));
        let before = img.imports().to_vec();
        let err = img
            .add_import(&sym("kernel32.dll::ExitProcess"), Validation::Skip, &EditOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            EditError::Lookup(LookupError::AlreadyExists {
                module: "kernel32.dll".into(),
                function: "ExitProcess".into(),
            })
        );
        assert_eq!(img.imports(), before.as_slice());
        assert_eq!(img.state(), EditState::Parsed);
        assert!(!img.is_modified());
    }

    #[test]
    fn second_identical_add_fails() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess"]));
        let opts = EditOptions::default();
        img.add_import(&sym("user32.dll::MessageBoxA"), Validation::Skip, &opts).unwrap();
        let err = img.add_import(&sym("user32.dll::MessageBoxA"), Validation::Skip, &opts);
        assert!(matches!(err, Err(EditError::Lookup(LookupError::AlreadyExists { .. }))));
    }

    #[test]
    fn module_match_policy_controls_case() {
        let mut img = image(PeFixture::new().import("KERNEL32.dll", &["ExitProcess"]));
        let exact = EditOptions::default();
        let loose = EditOptions { module_match: NameMatch::IgnoreAsciiCase, ..EditOptions::default() };

        assert!(img.find_import(&sym("kernel32.dll::ExitProcess"), &exact).is_none());
        assert!(img.find_import(&sym("kernel32.dll::ExitProcess"), &loose).is_some());
        let err = img.add_import(&sym("kernel32.dll::ExitProcess"), Validation::Skip, &loose);
        assert!(matches!(err, Err(EditError::Lookup(LookupError::AlreadyExists { .. }))));

        img.add_import(&sym("kernel32.dll::Sleep"), Validation::Skip, &loose).unwrap();
        assert_eq!(img.imports().len(), 1);
        assert_eq!(img.imports()[0].module_name, "KERNEL32.dll");
    }

    #[test]
    fn remove_without_force_is_refused() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess", "Sleep"]));
        let err = img
            .remove_import(&sym("kernel32.dll::Sleep"), false, &EditOptions::default())
            .unwrap_err();
        assert!(matches!(err, EditError::Refused(_)));
        assert_eq!(img.state(), EditState::Parsed);
        assert_eq!(listed(&img), ["kernel32.dll::ExitProcess", "kernel32.dll::Sleep"]);
        // Refusal does not depend on the symbol existing.
        let err = img.remove_import(&sym("nope.dll::Nothing"), false, &EditOptions::default());
        assert!(matches!(err, Err(EditError::Refused(_))));
    }

    #[test]
    fn forced_remove_deletes_entry() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess", "Sleep"]));
        let removed = img
            .remove_import(&sym("kernel32.dll::Sleep"), true, &EditOptions::default())
            .unwrap();
        assert_eq!(removed.kind.to_string(), "Sleep");
        let rebuilt = Image::parse(img.build().unwrap()).unwrap();
        assert_eq!(listed(&rebuilt), ["kernel32.dll::ExitProcess"]);
    }

    #[test]
    fn removing_last_entry_drops_descriptor() {
        let data = PeFixture::new()
            .import("kernel32.dll", &["ExitProcess"])
            .import("user32.dll", &["MessageBoxW"])
            .build();
        let mut img = Image::parse(data.clone()).unwrap();
        img.remove_import(&sym("user32.dll::MessageBoxW"), true, &EditOptions::default())
            .unwrap();
        let dir = img.nt_headers().directory(crate::DirectoryEntry::Import).unwrap();
        assert_eq!(dir.size, 40);

        let out = img.build().unwrap();
        assert_eq!(out.len(), data.len());
        let rebuilt = Image::parse(out).unwrap();
        assert_eq!(rebuilt.imports().len(), 1);
        assert_eq!(listed(&rebuilt), ["kernel32.dll::ExitProcess"]);
    }

    fn modules(image: &Image) -> Vec<&str> {
        image.imports().iter().map(|d| d.module_name.as_str()).collect()
    }

    fn with_empty_module() -> Vec<u8> {
        PeFixture::new()
            .import("kernel32.dll", &["ExitProcess", "Sleep"])
            .import("empty.dll", &[])
            .build()
    }

    #[test]
    fn module_without_entries_survives_add() {
        let data = with_empty_module();
        let mut img = Image::parse(data.clone()).unwrap();
        assert_eq!(modules(&img), ["kernel32.dll", "empty.dll"]);
        let old_dir = img.nt_headers().directory(crate::DirectoryEntry::Import).unwrap();
        let old_at = img.translator().rva_to_offset(old_dir.virtual_address).unwrap() as usize;

        img.add_import(&sym("user32.dll::MessageBoxA"), Validation::Skip, &EditOptions::default())
            .unwrap();
        let out = img.build().unwrap();
        let rebuilt = Image::parse(out.clone()).unwrap();
        assert_eq!(modules(&rebuilt), ["kernel32.dll", "empty.dll", "user32.dll"]);

        // Both original rows are carried over byte for byte.
        let dir = rebuilt.nt_headers().directory(crate::DirectoryEntry::Import).unwrap();
        assert_eq!(dir.size, 4 * 20);
        let new_at = rebuilt.translator().rva_to_offset(dir.virtual_address).unwrap() as usize;
        assert_eq!(&out[new_at..new_at + 40], &data[old_at..old_at + 40]);
    }

    #[test]
    fn module_without_entries_survives_forced_remove() {
        let data = with_empty_module();
        let opts = EditOptions::default();

        let mut img = Image::parse(data.clone()).unwrap();
        img.remove_import(&sym("kernel32.dll::Sleep"), true, &opts).unwrap();
        let out = img.build().unwrap();
        assert_eq!(out.len(), data.len());
        let rebuilt = Image::parse(out).unwrap();
        assert_eq!(modules(&rebuilt), ["kernel32.dll", "empty.dll"]);
        assert_eq!(listed(&rebuilt), ["kernel32.dll::ExitProcess"]);

        // Emptying kernel32 drops only its row.
        let mut img = Image::parse(data).unwrap();
        img.remove_import(&sym("kernel32.dll::Sleep"), true, &opts).unwrap();
        img.remove_import(&sym("kernel32.dll::ExitProcess"), true, &opts).unwrap();
        let dir = img.nt_headers().directory(crate::DirectoryEntry::Import).unwrap();
        assert_eq!(dir.size, 40);
        let rebuilt = Image::parse(img.build().unwrap()).unwrap();
        assert_eq!(modules(&rebuilt), ["empty.dll"]);
    }

    #[test]
    fn removing_missing_import_fails() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess"]));
        let err = img.remove_import(&sym("kernel32.dll::Sleep"), true, &EditOptions::default());
        assert!(matches!(err, Err(EditError::Lookup(LookupError::ImportNotFound { .. }))));
        assert_eq!(img.state(), EditState::Parsed);
    }

    #[test]
    fn add_then_remove_restores_original_bytes() {
        let data = PeFixture::new().import("kernel32.dll", &["ExitProcess"]).build();
        let mut img = Image::parse(data.clone()).unwrap();
        let opts = EditOptions::default();
        img.add_import(&sym("user32.dll::MessageBoxA"), Validation::Skip, &opts).unwrap();
        img.remove_import(&sym("user32.dll::MessageBoxA"), true, &opts).unwrap();
        assert_eq!(img.state(), EditState::Parsed);
        assert_eq!(img.build().unwrap(), data);
    }

    #[test]
    fn validation_supplies_hint_and_rejects_unknown() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess"]));
        let opts = EditOptions::default();
        let source = helper_exports;

        img.add_import(&sym("libs/helper.dll::Beta"), Validation::Exports(&source), &opts).unwrap();
        let entry = img.imports()[1].entries[0].clone();
        assert_eq!(entry.kind, ImportKind::ByName { name: "Beta".into(), hint: 1 });
        assert_eq!(img.imports()[1].module_name, "helper.dll");

        let err = img.add_import(&sym("libs/helper.dll::Delta"), Validation::Exports(&source), &opts);
        assert!(matches!(err, Err(EditError::Lookup(LookupError::SymbolNotFound { .. }))));

        img.add_import(&sym("libs/helper.dll::#3"), Validation::Exports(&source), &opts).unwrap();
        let err = img.add_import(&sym("libs/helper.dll::#9"), Validation::Exports(&source), &opts);
        assert!(matches!(err, Err(EditError::Lookup(LookupError::SymbolNotFound { .. }))));

        let err = img.add_import(&sym("other.dll::Thing"), Validation::Exports(&source), &opts);
        assert!(matches!(err, Err(EditError::Lookup(LookupError::ModuleNotFound { .. }))));
    }

    #[test]
    fn build_failure_leaves_model_untouched() {
        let mut img = image(PeFixture::new().import("kernel32.dll", &["ExitProcess"]));
        let opts = EditOptions { section_name: ".waytoolong".into(), ..EditOptions::default() };
        let err = img.add_import(&sym("user32.dll::MessageBoxA"), Validation::Skip, &opts);
        assert_eq!(err, Err(EditError::Build(BuildError::SectionName(".waytoolong".into()))));
        assert_eq!(listed(&img), ["kernel32.dll::ExitProcess"]);
        assert_eq!(img.state(), EditState::Parsed);
        assert!(!img.is_modified());
    }

    #[test]
    fn listing_exports_of_a_dll() {
        let img = image(PeFixture::new().exports("helper.dll", &["Beta", "Alpha"]));
        let names: Vec<_> = img.list_exports().filter_map(|e| e.name.as_deref()).collect();
        assert_eq!(names, ["Beta", "Alpha"]);
        let none = image(PeFixture::new());
        assert_eq!(none.list_exports().count(), 0);
    }
}
