//! The interface between the stack walker and its symbol source.
//!
//! The unwinders ask three things of symbols: fill in a frame's function
//! and source line, evaluate call-frame-info rules for an address, and
//! (on x86) hand over the Windows frame record covering an address.
//! [`SymbolProvider`] captures exactly that surface; the standard
//! implementation is [`Symbolizer`] from `corewalk-symbols`.

use corewalk_common::Module;
use std::collections::HashMap;
use std::path::PathBuf;

pub use corewalk_symbols::{
    FillSymbolError, FrameSymbolizer, FrameWalker, SimpleSymbolSupplier, StackInfoWin,
    StringSymbolSupplier, SymbolStats, Symbolizer,
};

/// The symbol operations stack walking needs.
///
/// All three operations are best-effort: a provider with no information
/// for the module simply reports that and the walker falls back to a less
/// trusted strategy.
pub trait SymbolProvider {
    /// Fill symbol information in `frame` using the instruction address
    /// from `frame`, and the module information from `module`.
    fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError>;

    /// Use call-frame-info rules from `module`'s symbols to walk `walker`
    /// back one frame.
    fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()>;

    /// The Windows unwind record from `module`'s symbols covering
    /// `instruction` (an absolute address), if any.
    fn find_windows_frame_info(&self, module: &dyn Module, instruction: u64)
        -> Option<StackInfoWin>;

    /// Collect various statistics on the symbols.
    fn stats(&self) -> HashMap<String, SymbolStats> {
        HashMap::new()
    }
}

impl SymbolProvider for Symbolizer {
    fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError> {
        self.fill_symbol(module, frame)
    }
    fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        self.walk_frame(module, walker)
    }
    fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<StackInfoWin> {
        self.find_windows_frame_info(module, instruction)
    }
    fn stats(&self) -> HashMap<String, SymbolStats> {
        self.stats()
    }
}

/// A `SymbolProvider` that queries a sequence of providers in turn,
/// using the first that has an answer.
#[derive(Default)]
pub struct MultiSymbolProvider {
    providers: Vec<Box<dyn SymbolProvider>>,
}

impl MultiSymbolProvider {
    pub fn new() -> MultiSymbolProvider {
        Default::default()
    }

    pub fn add(&mut self, provider: Box<dyn SymbolProvider>) {
        self.providers.push(provider);
    }
}

impl SymbolProvider for MultiSymbolProvider {
    fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError> {
        // Return Ok if any provider succeeds, or the first error otherwise.
        let mut best_result = Err(FillSymbolError::MissingSymbols);
        for provider in &self.providers {
            let new_result = provider.fill_symbol(module, frame);
            if new_result.is_ok() {
                return new_result;
            }
            if best_result == Err(FillSymbolError::MissingSymbols) {
                best_result = new_result;
            }
        }
        best_result
    }

    fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        for provider in &self.providers {
            let result = provider.walk_frame(module, walker);
            if result.is_some() {
                return result;
            }
        }
        None
    }

    fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<StackInfoWin> {
        for provider in &self.providers {
            let result = provider.find_windows_frame_info(module, instruction);
            if result.is_some() {
                return result;
            }
        }
        None
    }

    fn stats(&self) -> HashMap<String, SymbolStats> {
        let mut result = HashMap::new();
        for provider in &self.providers {
            // Merge all the stats, newest takes precedence.
            result.extend(provider.stats());
        }
        result
    }
}

/// A convenience for creating a [`SimpleSymbolSupplier`] that looks up
/// symbols in the given local paths.
pub fn simple_symbol_supplier(symbol_paths: Vec<PathBuf>) -> SimpleSymbolSupplier {
    SimpleSymbolSupplier::new(symbol_paths)
}

/// A convenience for creating a [`StringSymbolSupplier`] that maps debug
/// file names to in-memory symbol file contents.
pub fn string_symbol_supplier(modules: HashMap<String, String>) -> StringSymbolSupplier {
    StringSymbolSupplier::new(modules)
}
