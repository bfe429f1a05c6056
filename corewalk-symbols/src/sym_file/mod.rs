use corewalk_common::Module;
use std::path::Path;

use crate::{FrameSymbolizer, FrameWalker, SymbolError};

mod parser;
mod types;
pub mod walker;

use parser::SymbolParser;
pub use types::*;

impl SymbolFile {
    /// Parse a `SymbolFile` from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<SymbolFile, SymbolError> {
        let mut parser = SymbolParser::new();
        let consumed = parser.parse_more(bytes)?;
        if consumed < bytes.len() {
            // The input doesn't end in a newline; feed the parser the
            // tail with one appended so the final record isn't lost.
            let mut tail = bytes[consumed..].to_vec();
            tail.push(b'\n');
            let used = parser.parse_more(&tail)?;
            if used < tail.len() {
                return Err(SymbolError::ParseError(
                    "unexpected trailing input",
                    parser.lines,
                ));
            }
        }
        if parser.lines == 0 {
            return Err(SymbolError::ParseError("empty file", 0));
        }
        Ok(parser.finish())
    }

    /// Parse a `SymbolFile` from a file on disk.
    pub fn from_file(path: &Path) -> Result<SymbolFile, SymbolError> {
        let bytes = std::fs::read(path)?;
        SymbolFile::from_bytes(&bytes)
    }

    /// Fill in `frame`'s function and source line info for its
    /// instruction address.
    ///
    /// A FUNC record covering the address wins; otherwise the nearest
    /// preceding PUBLIC symbol is used, with no line info.
    pub fn fill_symbol(&self, module: &dyn Module, frame: &mut dyn FrameSymbolizer) {
        let addr = frame.get_instruction().wrapping_sub(module.base_address());
        if let Some(func) = self.functions.get(addr) {
            frame.set_function(
                &func.name,
                func.address + module.base_address(),
                func.parameter_size,
            );
            if let Some(line) = func.lines.get(addr) {
                let file = self
                    .files
                    .get(&line.file)
                    .map(|s| s.as_str())
                    .unwrap_or("<unknown file>");
                frame.set_source_file(file, line.line, line.address + module.base_address());
            }
        } else if let Some(public) = self.find_nearest_public(addr) {
            frame.set_function(
                &public.name,
                public.address + module.base_address(),
                public.parameter_size,
            );
        }
    }

    /// Try to unwind one frame using this file's call-frame-info rules.
    pub fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        let addr = walker.get_instruction().wrapping_sub(module.base_address());
        let info = self.cfi_stack_info.get(addr)?;
        // `add_rules` are deltas applied on top of `init`, in address
        // order, up to and including the current address.
        let mut count = 0;
        for rule in &info.add_rules {
            if rule.address <= addr {
                count += 1;
            } else {
                break;
            }
        }
        walker::walk_with_stack_cfi(&info.init, &info.add_rules[..count], walker)
    }

    /// Windows unwind info covering the given module-relative address,
    /// preferring frame-data records over FPO records.
    pub fn find_windows_frame_info(&self, addr: u64) -> Option<&StackInfoWin> {
        self.win_stack_framedata_info
            .get(addr)
            .or_else(|| self.win_stack_fpo_info.get(addr))
    }

    /// The last PUBLIC symbol at or before `addr`, if any.
    pub fn find_nearest_public(&self, addr: u64) -> Option<&PublicSymbol> {
        match self.publics.binary_search_by_key(&addr, |p| p.address) {
            Ok(index) => Some(&self.publics[index]),
            Err(0) => None,
            Err(index) => Some(&self.publics[index - 1]),
        }
    }
}
