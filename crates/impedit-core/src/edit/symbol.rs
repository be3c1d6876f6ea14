use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The function half of a symbol: a name, or `#N` for ordinal `N`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolRef {
    Name(String),
    Ordinal(u16),
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolRef::Name(name) => f.write_str(name),
            SymbolRef::Ordinal(ord) => write!(f, "#{ord}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolParseError {
    #[error("expected MODULE_PATH::FUNCTION, got {0:?}")]
    MissingSeparator(String),
    #[error("module path is empty")]
    EmptyModule,
    #[error("function name is empty")]
    EmptyFunction,
    #[error("invalid ordinal {0:?}")]
    BadOrdinal(String),
}

/// `MODULE_PATH::FUNCTION` as given on the command line.
///
/// The path is what export validation reads from disk; only its file-name
/// component is recorded in the import table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub module_path: String,
    pub function: SymbolRef,
}

impl Symbol {
    pub fn new(module_path: impl Into<String>, function: SymbolRef) -> Self {
        Symbol { module_path: module_path.into(), function }
    }

    /// File-name component of the module path, accepting either separator.
    pub fn module_name(&self) -> &str {
        self.module_path
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(&self.module_path)
    }
}

impl FromStr for Symbol {
    type Err = SymbolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (module, function) = s
            .split_once("::")
            .ok_or_else(|| SymbolParseError::MissingSeparator(s.to_string()))?;
        if module.is_empty() {
            return Err(SymbolParseError::EmptyModule);
        }
        let symbol = Symbol { module_path: module.to_string(), function: function.parse()? };
        if symbol.module_name().is_empty() {
            return Err(SymbolParseError::EmptyModule);
        }
        Ok(symbol)
    }
}

impl FromStr for SymbolRef {
    type Err = SymbolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SymbolParseError::EmptyFunction);
        }
        match s.strip_prefix('#') {
            Some(digits) => digits
                .parse::<u16>()
                .map(SymbolRef::Ordinal)
                .map_err(|_| SymbolParseError::BadOrdinal(s.to_string())),
            None => Ok(SymbolRef::Name(s.to_string())),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module_name(), self.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_ordinal() {
        let s: Symbol = "user32.dll::MessageBoxA".parse().unwrap();
        assert_eq!(s.module_name(), "user32.dll");
        assert_eq!(s.function, SymbolRef::Name("MessageBoxA".into()));

        let s: Symbol = "ws2_32.dll::#23".parse().unwrap();
        assert_eq!(s.function, SymbolRef::Ordinal(23));
        assert_eq!(s.to_string(), "ws2_32.dll::#23");
    }

    #[test]
    fn module_name_strips_directories() {
        let s: Symbol = r"C:\libs\helper.dll::Init".parse().unwrap();
        assert_eq!(s.module_path, r"C:\libs\helper.dll");
        assert_eq!(s.module_name(), "helper.dll");

        let s: Symbol = "./build/out/helper.dll::Init".parse().unwrap();
        assert_eq!(s.module_name(), "helper.dll");
        assert_eq!(s.to_string(), "helper.dll::Init");
    }

    #[test]
    fn splits_on_first_separator() {
        let s: Symbol = "mod.dll::ns::Func".parse().unwrap();
        assert_eq!(s.module_path, "mod.dll");
        assert_eq!(s.function, SymbolRef::Name("ns::Func".into()));
    }

    #[test]
    fn rejects_malformed_symbols() {
        assert!(matches!("user32.dll".parse::<Symbol>(), Err(SymbolParseError::MissingSeparator(_))));
        assert_eq!("::Func".parse::<Symbol>(), Err(SymbolParseError::EmptyModule));
        assert_eq!("dir/::Func".parse::<Symbol>(), Err(SymbolParseError::EmptyModule));
        assert_eq!("a.dll::".parse::<Symbol>(), Err(SymbolParseError::EmptyFunction));
        assert!(matches!("a.dll::#x".parse::<Symbol>(), Err(SymbolParseError::BadOrdinal(_))));
        assert!(matches!("a.dll::#70000".parse::<Symbol>(), Err(SymbolParseError::BadOrdinal(_))));
    }
}
