//! Locating, parsing, and querying debug symbol files.
//!
//! The symbol format is the breakpad text format: one file per module,
//! found by debug file name and debug identifier. A [`SymbolSupplier`]
//! locates the file for a module, and the [`Symbolizer`] caches the
//! parsed [`SymbolFile`]s (including negative results, so a module with
//! no symbols is only searched for once) and answers the three questions
//! stack walking needs:
//!
//! * [`Symbolizer::fill_symbol`] resolves a frame's function and source
//!   line.
//! * [`Symbolizer::walk_frame`] unwinds one frame using call-frame-info
//!   rules.
//! * [`Symbolizer::find_windows_frame_info`] hands the x86 unwinder the
//!   Windows frame record covering an address.

use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, trace};

use corewalk_common::{basename, Module};

pub mod postfix;
mod sym_file;

pub use crate::postfix::PostfixEvaluator;
pub use crate::sym_file::{
    walker, CfiRules, Function, PublicSymbol, SourceLine, StackInfoCfi, StackInfoWin, SymbolFile,
    WinFrameType, WinStackThing,
};

/// A `Module` implementation that holds arbitrary data.
///
/// Mostly useful for tests; other uses would probably be better served
/// by a custom implementation.
#[derive(Default)]
pub struct SimpleModule {
    pub base_address: Option<u64>,
    pub size: Option<u64>,
    pub code_file: Option<String>,
    pub code_identifier: Option<String>,
    pub debug_file: Option<String>,
    pub debug_id: Option<String>,
    pub version: Option<String>,
}

impl SimpleModule {
    /// Create a `SimpleModule` with the given `debug_file` and `debug_id`.
    ///
    /// Uses `default` for the remaining fields.
    pub fn new(debug_file: &str, debug_id: &str) -> SimpleModule {
        SimpleModule {
            debug_file: Some(String::from(debug_file)),
            debug_id: Some(String::from(debug_id)),
            ..SimpleModule::default()
        }
    }
}

impl Module for SimpleModule {
    fn base_address(&self) -> u64 {
        self.base_address.unwrap_or(0)
    }
    fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }
    fn code_file(&self) -> Cow<str> {
        self.code_file
            .as_ref()
            .map_or(Cow::from(""), |s| Cow::Borrowed(&s[..]))
    }
    fn code_identifier(&self) -> Cow<str> {
        self.code_identifier
            .as_ref()
            .map_or(Cow::from(""), |s| Cow::Borrowed(&s[..]))
    }
    fn debug_file(&self) -> Option<Cow<str>> {
        self.debug_file.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
    fn debug_identifier(&self) -> Option<Cow<str>> {
        self.debug_id.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
    fn version(&self) -> Option<Cow<str>> {
        self.version.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
}

/// If `filename` ends with `match_extension`, remove it. Append
/// `new_extension` to the result.
fn replace_or_add_extension(filename: &str, match_extension: &str, new_extension: &str) -> String {
    let mut bits = filename.split('.').collect::<Vec<_>>();
    if bits.len() > 1
        && bits
            .last()
            .map_or(false, |e| e.to_lowercase() == match_extension)
    {
        bits.pop();
    }
    bits.push(new_extension);
    bits.join(".")
}

/// The symbol-server-style relative path for `module`'s symbol file:
/// `<debug leaf>/<debug id>/<debug leaf with .sym extension>`.
///
/// Returns `None` if the module lacks a debug file name or identifier.
pub fn breakpad_sym_lookup(module: &dyn Module) -> Option<PathBuf> {
    let debug_file = module.debug_file()?;
    let debug_id = module.debug_identifier()?;
    if debug_id.is_empty() {
        return None;
    }

    let leaf = basename(&debug_file);
    let filename = replace_or_add_extension(leaf, "pdb", "sym");
    let mut path = PathBuf::from(leaf);
    path.push(debug_id.as_ref());
    path.push(&filename);
    Some(path)
}

/// Possible results of locating or parsing symbols for a module.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    /// Symbol file could not be found.
    #[error("symbol file not found")]
    NotFound,
    /// The module lacks the debug info needed to look up its symbols.
    #[error("module is missing a debug file name or debug identifier")]
    MissingDebugFileOrId,
    /// Symbol file could not be loaded into memory.
    #[error("couldn't read input stream")]
    LoadError(#[from] std::io::Error),
    /// Symbol file was too corrupt to be parsed at all.
    #[error("parse error: {0} at line {1}")]
    ParseError(&'static str, u64),
    /// The symbol supplier asked for the work to be abandoned; retrying
    /// later may succeed.
    #[error("symbol loading was interrupted")]
    Interrupt,
}

impl PartialEq for SymbolError {
    fn eq(&self, other: &SymbolError) -> bool {
        matches!(
            (self, other),
            (SymbolError::NotFound, SymbolError::NotFound)
                | (
                    SymbolError::MissingDebugFileOrId,
                    SymbolError::MissingDebugFileOrId
                )
                | (SymbolError::LoadError(_), SymbolError::LoadError(_))
                | (SymbolError::ParseError(..), SymbolError::ParseError(..))
                | (SymbolError::Interrupt, SymbolError::Interrupt)
        )
    }
}

/// Possible results of [`Symbolizer::fill_symbol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FillSymbolError {
    /// No symbols could be found for the module.
    #[error("no symbols for the module")]
    MissingSymbols,
    /// The module's symbol file exists but could not be parsed.
    #[error("the module's symbols are corrupt")]
    CorruptSymbols,
    /// Symbol loading was interrupted by the supplier; the result is not
    /// cached and a later attempt may succeed.
    #[error("symbol loading was interrupted")]
    Interrupted,
}

/// A trait for things that can locate symbols for a given module.
pub trait SymbolSupplier {
    /// Locate and load a symbol file for `module`.
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError>;
}

/// A `SymbolSupplier` that locates symbols in a local disk path
/// hierarchy laid out like a symbol server.
pub struct SimpleSymbolSupplier {
    /// Local search paths, tried in order.
    paths: Vec<PathBuf>,
}

impl SimpleSymbolSupplier {
    pub fn new(paths: Vec<PathBuf>) -> SimpleSymbolSupplier {
        SimpleSymbolSupplier { paths }
    }
}

impl SymbolSupplier for SimpleSymbolSupplier {
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError> {
        let rel_path = breakpad_sym_lookup(module).ok_or(SymbolError::MissingDebugFileOrId)?;
        for path in &self.paths {
            let test_path = path.join(&rel_path);
            if test_path.is_file() {
                trace!("SimpleSymbolSupplier found file {}", test_path.display());
                return SymbolFile::from_file(&test_path);
            }
        }
        Err(SymbolError::NotFound)
    }
}

/// A `SymbolSupplier` that maps module debug file names to in-memory
/// symbol file contents. Only useful for tests.
#[derive(Default, Debug, Clone)]
pub struct StringSymbolSupplier {
    modules: HashMap<String, String>,
}

impl StringSymbolSupplier {
    pub fn new(modules: HashMap<String, String>) -> StringSymbolSupplier {
        StringSymbolSupplier { modules }
    }
}

impl SymbolSupplier for StringSymbolSupplier {
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError> {
        let debug_file = module.debug_file().ok_or(SymbolError::MissingDebugFileOrId)?;
        let contents = self
            .modules
            .get(debug_file.as_ref())
            .ok_or(SymbolError::NotFound)?;
        SymbolFile::from_bytes(contents.as_bytes())
    }
}

/// A trait for setting symbol information on something, typically a
/// stack frame.
pub trait FrameSymbolizer {
    /// The program counter value for this frame.
    fn get_instruction(&self) -> u64;
    /// Set the name, base address, and parameter size of the function in
    /// which this frame is executing.
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32);
    /// Set the source file and (1-based) line number.
    fn set_source_file(&mut self, file: &str, line: u32, base: u64);
}

/// The register-access surface call-frame-info evaluation needs from a
/// frame being unwound.
///
/// Registers are addressed by name, without any `$` prefix, because
/// that's the level the CFI rules speak at.
pub trait FrameWalker {
    /// The instruction of the callee frame.
    fn get_instruction(&self) -> u64;
    /// Whether the callee frame itself has a callee (it is not the
    /// context frame).
    fn has_grand_callee(&self) -> bool;
    /// The stack parameter size of the callee's callee, or 0.
    fn get_grand_callee_parameter_size(&self) -> u32;
    /// Read a register-width value from stack memory.
    fn get_register_at_address(&self, address: u64) -> Option<u64>;
    /// Get a register from the callee's frame, if it is valid.
    fn get_callee_register(&self, name: &str) -> Option<u64>;
    /// Set a register in the caller's frame.
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()>;
    /// Mark a register in the caller's frame as unknown.
    fn clear_caller_register(&mut self, name: &str);
    /// Set the caller's stack pointer from the computed canonical frame
    /// address.
    fn set_cfa(&mut self, val: u64) -> Option<()>;
    /// Set the caller's instruction pointer from the recovered return
    /// address.
    fn set_ra(&mut self, val: u64) -> Option<()>;
}

/// A simple implementation of `FrameSymbolizer` that just holds values.
#[derive(Debug, Default)]
pub struct SimpleFrame {
    pub instruction: u64,
    pub function: Option<String>,
    pub function_base: Option<u64>,
    pub parameter_size: Option<u32>,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
    pub source_line_base: Option<u64>,
}

impl SimpleFrame {
    /// Instantiate a `SimpleFrame` with instruction pointer `instruction`.
    pub fn with_instruction(instruction: u64) -> SimpleFrame {
        SimpleFrame {
            instruction,
            ..SimpleFrame::default()
        }
    }
}

impl FrameSymbolizer for SimpleFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, function: &str, base: u64, parameter_size: u32) {
        self.function = Some(String::from(function));
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file = Some(String::from(file));
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
}

// A unique key for looking up cached symbols for a module.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct ModuleKey {
    code_file: String,
    code_identifier: String,
    debug_file: Option<String>,
    debug_identifier: Option<String>,
}

impl ModuleKey {
    fn new(module: &dyn Module) -> ModuleKey {
        ModuleKey {
            code_file: module.code_file().to_string(),
            code_identifier: module.code_identifier().to_string(),
            debug_file: module.debug_file().map(|s| s.to_string()),
            debug_identifier: module.debug_identifier().map(|s| s.to_string()),
        }
    }
}

/// Statistics on the symbols of a module.
#[derive(Default, Debug, Clone)]
pub struct SymbolStats {
    /// The debug file of the module, if any.
    pub debug_file: Option<String>,
    /// The debug identifier of the module, if any.
    pub debug_identifier: Option<String>,
    /// If the symbols for this module were locateable and parseable.
    pub loaded_symbols: bool,
    /// If the symbols were located but corrupt.
    pub corrupt_symbols: bool,
}

/// Symbolicates stack frames, loading symbols on demand through a
/// [`SymbolSupplier`] and caching the outcome per module.
///
/// Negative results are cached too: a module whose symbols could not be
/// found is not searched for again for the life of this object (or until
/// [`Symbolizer::reset`]). The one exception is an interrupted lookup,
/// which is never cached, so a retried run can succeed.
pub struct Symbolizer {
    /// Symbol supplier for locating symbols.
    supplier: Box<dyn SymbolSupplier>,
    /// Cache of symbol locating results, keyed by module.
    symbols: Mutex<HashMap<ModuleKey, Result<SymbolFile, SymbolError>>>,
}

impl Symbolizer {
    /// Create a `Symbolizer` that uses `supplier` to locate symbols.
    pub fn new<T: SymbolSupplier + 'static>(supplier: T) -> Symbolizer {
        Symbolizer {
            supplier: Box::new(supplier),
            symbols: Mutex::new(HashMap::new()),
        }
    }

    /// The name of the symbol at `address` in the module named by
    /// `debug_file` and `debug_id`, if one can be found.
    ///
    /// `address` should be a virtual memory address.
    pub fn get_symbol_at_address(
        &self,
        debug_file: &str,
        debug_id: &str,
        address: u64,
    ) -> Option<String> {
        let module = SimpleModule::new(debug_file, debug_id);
        let mut frame = SimpleFrame::with_instruction(address);
        self.fill_symbol(&module, &mut frame).ok()?;
        frame.function
    }

    /// Fill symbol information in `frame` using the instruction address
    /// from `frame`, and the module information from `module`.
    pub fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError> {
        let mut cache = self.symbols.lock().unwrap();
        let entry = match cache.entry(ModuleKey::new(module)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let result = self.load_symbols(module);
                if matches!(result, Err(SymbolError::Interrupt)) {
                    return Err(FillSymbolError::Interrupted);
                }
                slot.insert(result)
            }
        };
        match entry {
            Ok(sym) => {
                sym.fill_symbol(module, frame);
                Ok(())
            }
            Err(SymbolError::ParseError(..)) => Err(FillSymbolError::CorruptSymbols),
            Err(_) => Err(FillSymbolError::MissingSymbols),
        }
    }

    /// Try to use CFI unwind rules from this module's symbols to walk
    /// `walker` back one frame.
    pub fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        self.with_symbols(module, |sym| sym.walk_frame(module, walker))
    }

    /// The Windows unwind record from this module's symbols covering
    /// `instruction` (an absolute address), if any.
    pub fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<StackInfoWin> {
        let addr = instruction.wrapping_sub(module.base_address());
        self.with_symbols(module, |sym| sym.find_windows_frame_info(addr).cloned())
    }

    /// Collect various statistics on the symbols, keyed by the leaf name
    /// of the module's code file.
    pub fn stats(&self) -> HashMap<String, SymbolStats> {
        let cache = self.symbols.lock().unwrap();
        cache
            .iter()
            .map(|(key, result)| {
                let stats = SymbolStats {
                    debug_file: key.debug_file.clone(),
                    debug_identifier: key.debug_identifier.clone(),
                    loaded_symbols: result.is_ok(),
                    corrupt_symbols: matches!(result, Err(SymbolError::ParseError(..))),
                };
                (basename(&key.code_file).to_string(), stats)
            })
            .collect()
    }

    /// Forget everything this symbolizer has cached, including negative
    /// lookup results. Call this between independent processing runs.
    pub fn reset(&self) {
        self.symbols.lock().unwrap().clear();
    }

    fn load_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError> {
        let result = self.supplier.locate_symbols(module);
        if let Err(ref e) = result {
            debug!("no symbols for module {}: {}", module.code_file(), e);
        }
        result
    }

    fn with_symbols<T>(
        &self,
        module: &dyn Module,
        f: impl FnOnce(&SymbolFile) -> Option<T>,
    ) -> Option<T> {
        let mut cache = self.symbols.lock().unwrap();
        let entry = match cache.entry(ModuleKey::new(module)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let result = self.load_symbols(module);
                if matches!(result, Err(SymbolError::Interrupt)) {
                    // Not cached; a later attempt may succeed.
                    return None;
                }
                slot.insert(result)
            }
        };
        match entry {
            Ok(sym) => f(sym),
            Err(_) => None,
        }
    }
}
