//! Code modules loaded in the crashed process.

use range_map::{Range, RangeMap};
use std::borrow::Cow;

/// An executable or shared library loaded in a process.
pub trait Module {
    /// The base address of this code module as it was loaded by the process.
    fn base_address(&self) -> u64;
    /// The size of the code module.
    fn size(&self) -> u64;
    /// The path or file name that the code module was loaded from.
    fn code_file(&self) -> Cow<str>;
    /// An identifying string used to discriminate between multiple versions
    /// and builds of the same code module.
    fn code_identifier(&self) -> Cow<str>;
    /// The filename containing debugging information associated with the code
    /// module. If debugging information is stored in a file separate from the
    /// code module itself (as is the case when .pdb or .dSYM files are used),
    /// this will be different from `code_file`.
    fn debug_file(&self) -> Option<Cow<str>>;
    /// An identifying string similar to `code_identifier`, but identifies a
    /// specific version and build of the associated debug file.
    fn debug_identifier(&self) -> Option<Cow<str>>;
    /// A human-readable representation of the code module's version.
    fn version(&self) -> Option<Cow<str>>;
}

/// A code module as recorded in a process snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// The load address of this module.
    pub base_address: u64,
    /// The size of this module's address range.
    pub size: u64,
    /// The path the module was loaded from.
    pub code_file: String,
    /// A build identifier for the module.
    pub code_identifier: String,
    /// The associated debug file, if recorded.
    pub debug_file: Option<String>,
    /// The identifier of the associated debug file.
    pub debug_identifier: Option<String>,
    /// Version string, if recorded.
    pub version: Option<String>,
}

impl ModuleInfo {
    /// Create a `ModuleInfo` at `base_address` of `size` bytes, loaded
    /// from `code_file`.
    pub fn new(code_file: &str, base_address: u64, size: u64) -> ModuleInfo {
        ModuleInfo {
            base_address,
            size,
            code_file: String::from(code_file),
            code_identifier: String::new(),
            debug_file: None,
            debug_identifier: None,
            version: None,
        }
    }

    fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.base_address,
            self.base_address.checked_add(self.size)? - 1,
        ))
    }
}

impl Module for ModuleInfo {
    fn base_address(&self) -> u64 {
        self.base_address
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn code_file(&self) -> Cow<str> {
        Cow::Borrowed(&self.code_file)
    }
    fn code_identifier(&self) -> Cow<str> {
        Cow::Borrowed(&self.code_identifier)
    }
    fn debug_file(&self) -> Option<Cow<str>> {
        self.debug_file.as_deref().map(Cow::Borrowed)
    }
    fn debug_identifier(&self) -> Option<Cow<str>> {
        self.debug_identifier.as_deref().map(Cow::Borrowed)
    }
    fn version(&self) -> Option<Cow<str>> {
        self.version.as_deref().map(Cow::Borrowed)
    }
}

/// The list of modules loaded in the process, indexed by address range.
#[derive(Debug, Clone)]
pub struct ModuleList {
    /// Modules in the order they were recorded.
    modules: Vec<ModuleInfo>,
    /// Map from address range to index in `modules`. Modules without a
    /// sensible address range or that overlap an earlier module are
    /// excluded from lookup but kept in `modules`.
    modules_by_addr: RangeMap<u64, usize>,
}

impl ModuleList {
    /// An empty `ModuleList`.
    pub fn new() -> ModuleList {
        ModuleList {
            modules: vec![],
            modules_by_addr: RangeMap::new(),
        }
    }

    /// Build a `ModuleList` from `modules`.
    ///
    /// Overlapping ranges keep the earlier module; later overlaps are
    /// dropped from address lookup only.
    pub fn from_modules(modules: Vec<ModuleInfo>) -> ModuleList {
        let mut ranges: Vec<(Range<u64>, usize)> = modules
            .iter()
            .enumerate()
            .filter_map(|(i, module)| module.memory_range().map(|r| (r, i)))
            .collect();
        ranges.sort_by_key(|&(r, _)| r);
        let mut sorted: Vec<(Range<u64>, usize)> = Vec::with_capacity(ranges.len());
        for (range, i) in ranges {
            if let Some(&(last, _)) = sorted.last() {
                if range.start <= last.end {
                    continue;
                }
            }
            sorted.push((range, i));
        }
        ModuleList {
            modules,
            modules_by_addr: sorted.into_iter().collect(),
        }
    }

    /// Return the module whose address range covers `address`, if any.
    pub fn module_at_address(&self, address: u64) -> Option<&ModuleInfo> {
        self.modules_by_addr
            .get(address)
            .map(|&index| &self.modules[index])
    }

    /// The module corresponding to the main executable.
    pub fn main_module(&self) -> Option<&ModuleInfo> {
        // The main executable is always the first module in a snapshot's
        // module list.
        self.modules.first()
    }

    /// Iterate over the modules in arbitrary (recorded) order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }

    /// Iterate over the modules in order by memory address.
    pub fn by_addr(&self) -> impl DoubleEndedIterator<Item = &ModuleInfo> {
        self.modules_by_addr
            .ranges_values()
            .map(move |&(_, index)| &self.modules[index])
    }
}

impl Default for ModuleList {
    fn default() -> ModuleList {
        ModuleList::new()
    }
}
