//! Reconstructs the call stacks of a crashed process from raw register
//! state and captured stack memory.
//!
//! The entry point is [`walk_stack`], which takes the register context of
//! one thread plus that thread's stack memory and produces a [`CallStack`]
//! of [`StackFrame`]s, innermost first. Above it,
//! [`processor::process_snapshot`] walks every thread of a snapshot and
//! assembles a [`processor::ProcessState`].
//!
//! Each frame after the first is recovered by the unwinder for the
//! snapshot's architecture, which tries strategies in decreasing order of
//! reliability and tags the resulting frame with a [`FrameTrust`]:
//!
//! * call-frame-info rules from the module's symbols,
//! * Windows frame data (x86 only),
//! * the architecture's frame-pointer convention,
//! * scanning the stack for something that looks like a return address.
//!
//! Symbol lookup is delegated to a [`SymbolProvider`], typically the
//! [`Symbolizer`] from `corewalk-symbols`.

mod amd64;
mod arm;
mod arm64;
mod mips;
mod ppc;
pub mod processor;
mod sparc;
pub mod symbols;
pub mod system_info;
mod x86;

use corewalk_common::{Context, ContextValidity, CpuContext, RawContext};
use scroll::ctx::{SizeWith, TryFromCtx};
use scroll::Endian;
use std::collections::{BTreeSet, HashSet};
use std::convert::TryFrom;
use tracing::trace;

pub use corewalk_common::{Module, ModuleInfo, ModuleList, StackMemory};
pub use crate::processor::*;
pub use crate::symbols::*;
pub use crate::system_info::*;

struct GetCallerFrameArgs<'a, P> {
    callee_frame: &'a StackFrame,
    grand_callee_frame: Option<&'a StackFrame>,
    stack_memory: StackMemory<'a>,
    modules: &'a ModuleList,
    system_info: &'a SystemInfo,
    symbol_provider: &'a P,
    /// Whether the scan tier may be used for this frame; the driver turns
    /// this off once enough frames have already been found by scanning.
    stack_scan_allowed: bool,
}

impl<P> GetCallerFrameArgs<'_, P> {
    fn valid(&self) -> &ContextValidity {
        &self.callee_frame.context.valid
    }
}

mod impl_prelude {
    pub(crate) use super::{
        CfiStackWalker, FrameTrust, GetCallerFrameArgs, StackFrame, SymbolProvider,
    };
}

/// Indicates how well the instruction pointer derived during
/// stack walking is trusted. Since the stack walker can resort to
/// stack scanning, it can wind up with dubious frames.
///
/// The variants are ordered so that greater compares more trustworthy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameTrust {
    /// Unknown.
    None,
    /// Scanned the stack, found this.
    Scan,
    /// Found while scanning stack using call frame info.
    CfiScan,
    /// Derived from frame pointer.
    FramePointer,
    /// Derived from call frame info.
    CallFrameInfo,
    /// Given as instruction pointer in a context.
    Context,
}

impl FrameTrust {
    /// Return a string describing how a stack frame was found
    /// by the stackwalker.
    pub fn description(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "given as instruction pointer in context",
            FrameTrust::CallFrameInfo => "call frame info",
            FrameTrust::CfiScan => "call frame info with scanning",
            FrameTrust::FramePointer => "previous frame's frame pointer",
            FrameTrust::Scan => "stack scanning",
            FrameTrust::None => "unknown",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "context",
            FrameTrust::CallFrameInfo => "cfi",
            FrameTrust::CfiScan => "cfi_scan",
            FrameTrust::FramePointer => "frame_pointer",
            FrameTrust::Scan => "scan",
            FrameTrust::None => "non",
        }
    }
}

/// A single stack frame produced from unwinding a thread's stack.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// The program counter location as an absolute virtual address.
    ///
    /// - For the innermost called frame in a stack, this will be an exact
    ///   program counter or instruction pointer value.
    ///
    /// - For all other frames, this address is within the instruction that
    ///   caused execution to branch to this frame's callee (although it may
    ///   not point to the exact beginning of that instruction). This ensures
    ///   that, when we look up the source code location for this frame, we
    ///   get the source location of the call, not of the point at which
    ///   control will resume when the call returns, which may be on the next
    ///   line.
    pub instruction: u64,

    /// The instruction address (program counter) that execution of this
    /// function would resume at, if the callee returns.
    ///
    /// This is the return address of the callee, unmodified. For the
    /// innermost frame it equals `instruction`. Prefer `instruction` for
    /// lookups: if the callee never returns, the return address may fall
    /// outside the caller's function entirely.
    pub resume_address: u64,

    /// The module in which the instruction resides.
    pub module: Option<ModuleInfo>,

    /// The function name, may be omitted if debug symbols are not available.
    pub function_name: Option<String>,

    /// The start address of the function, may be omitted if debug symbols
    /// are not available.
    pub function_base: Option<u64>,

    /// The size, in bytes, of the arguments pushed on the stack for this
    /// function. Windows frame-data unwinding needs this value to work;
    /// it's otherwise uninteresting.
    pub parameter_size: Option<u32>,

    /// The source file name, may be omitted if debug symbols are not
    /// available.
    pub source_file_name: Option<String>,

    /// The (1-based) source line number, may be omitted if debug symbols
    /// are not available.
    pub source_line: Option<u32>,

    /// The start address of the source line, may be omitted if debug
    /// symbols are not available.
    pub source_line_base: Option<u64>,

    /// Amount of trust the stack walker has in the instruction pointer
    /// of this frame.
    pub trust: FrameTrust,

    /// The CPU context containing register state for this frame.
    pub context: Context,
}

impl StackFrame {
    /// Create a `StackFrame` from a `Context`.
    pub fn from_context(context: Context, trust: FrameTrust) -> StackFrame {
        StackFrame {
            instruction: context.get_instruction_pointer(),
            // Initialized the same as `instruction`, but left unmodified
            // during stack walking.
            resume_address: context.get_instruction_pointer(),
            module: None,
            function_name: None,
            function_base: None,
            parameter_size: None,
            source_file_name: None,
            source_line: None,
            source_line_base: None,
            trust,
            context,
        }
    }
}

impl FrameSymbolizer for StackFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32) {
        self.function_name = Some(String::from(name));
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file_name = Some(String::from(file));
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
}

/// Information about the results of unwinding a thread's stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStackInfo {
    /// Everything went great.
    Ok,
    /// No register context was provided, couldn't do anything.
    MissingContext,
    /// No stack memory was provided, couldn't unwind past the top frame.
    MissingMemory,
    /// The walk was cut short by the frame limit.
    MaxFramesReached,
    /// This thread wrote the snapshot, it was skipped.
    DumpThreadSkipped,
}

/// A stack of `StackFrame`s produced as a result of unwinding a thread.
#[derive(Debug, Clone)]
pub struct CallStack {
    /// The stack frames.
    /// By convention, the stack frame at index 0 is the innermost callee
    /// frame, and the frame at the highest index in a call stack is the
    /// outermost caller.
    pub frames: Vec<StackFrame>,
    /// Information about this `CallStack`.
    pub info: CallStackInfo,
    /// The identifier of the thread.
    pub thread_id: u32,
    /// The name of the thread, if known.
    pub thread_name: Option<String>,
}

impl CallStack {
    /// Construct a CallStack that just has the unsymbolicated context frame.
    ///
    /// This is the desired input for the stack walker.
    pub fn with_context(context: Context) -> CallStack {
        CallStack {
            frames: vec![StackFrame::from_context(context, FrameTrust::Context)],
            info: CallStackInfo::Ok,
            thread_id: 0,
            thread_name: None,
        }
    }

    /// Create a `CallStack` with `info` and no frames.
    pub fn with_info(id: u32, info: CallStackInfo) -> CallStack {
        CallStack {
            frames: vec![],
            info,
            thread_id: id,
            thread_name: None,
        }
    }
}

/// How far a single walk is allowed to go.
///
/// The limits exist to guarantee termination on corrupted or adversarial
/// stack data; the scanned-frame limit is separate because scanning is
/// the most failure-prone and most expensive strategy, so it can be
/// disabled independently of the total frame cap.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// The maximum number of frames in a `CallStack`.
    pub max_frames: usize,
    /// The maximum number of frames that may be found by stack scanning.
    /// Set to 0 to disable scanning entirely.
    pub max_frames_scanned: usize,
}

impl Default for WalkOptions {
    fn default() -> WalkOptions {
        WalkOptions {
            max_frames: 1024,
            max_frames_scanned: 1024,
        }
    }
}

/// The outcome of a completed [`walk_stack`].
#[derive(Debug, Clone)]
pub struct WalkResult {
    /// The frames recovered for this thread.
    pub stack: CallStack,
    /// Code files of modules that frames landed in but for which no
    /// symbols could be found, deduplicated.
    pub modules_without_symbols: BTreeSet<String>,
    /// Code files of modules whose symbols were found but too corrupt to
    /// use, deduplicated.
    pub modules_with_corrupt_symbols: BTreeSet<String>,
}

/// The symbol supplier asked for the walk to be abandoned.
///
/// Nothing about the walk itself failed; retrying later (for instance
/// after a symbol fetch completes) may succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("symbol loading was interrupted")]
pub struct WalkInterrupted;

/// Unwind a thread's stack, frame by frame, until no further caller can
/// be recovered.
///
/// `context` is the thread's captured register state; with `None` the
/// result is an empty stack flagged [`CallStackInfo::MissingContext`].
/// Without `stack_memory` only the context frame is produced.
pub fn walk_stack<P>(
    context: Option<Context>,
    stack_memory: Option<StackMemory<'_>>,
    modules: &ModuleList,
    system_info: &SystemInfo,
    options: &WalkOptions,
    symbol_provider: &P,
) -> Result<WalkResult, WalkInterrupted>
where
    P: SymbolProvider,
{
    let mut modules_without_symbols = BTreeSet::new();
    let mut modules_with_corrupt_symbols = BTreeSet::new();

    let mut stack = match context {
        Some(context) => CallStack::with_context(context),
        None => {
            return Ok(WalkResult {
                stack: CallStack::with_info(0, CallStackInfo::MissingContext),
                modules_without_symbols,
                modules_with_corrupt_symbols,
            })
        }
    };

    // The unwinders need a stack they can actually read something from;
    // `memory_range` rejects empty memory or an overflowing size.
    let stack_memory = stack_memory.and_then(|memory| memory.memory_range().map(|_| memory));

    let mut frames_scanned = 0;
    loop {
        // Symbolicate the newest frame.
        let frame = match stack.frames.last_mut() {
            Some(frame) => frame,
            None => unreachable!("walk loop always has a newest frame"),
        };
        fill_source_line_info(
            frame,
            modules,
            symbol_provider,
            &mut modules_without_symbols,
            &mut modules_with_corrupt_symbols,
        )?;
        if let FrameTrust::Scan | FrameTrust::CfiScan = frame.trust {
            frames_scanned += 1;
        }

        if stack.frames.len() >= options.max_frames {
            trace!("frame limit reached, ending walk");
            stack.info = CallStackInfo::MaxFramesReached;
            break;
        }

        let stack_memory = match stack_memory {
            Some(memory) => memory,
            None => {
                stack.info = CallStackInfo::MissingMemory;
                break;
            }
        };

        // Walk the new frame.
        let callee_frame = match stack.frames.last() {
            Some(frame) => frame,
            None => unreachable!("walk loop always has a newest frame"),
        };
        let grand_callee_frame = stack
            .frames
            .len()
            .checked_sub(2)
            .and_then(|idx| stack.frames.get(idx));
        match callee_frame.function_name.as_ref() {
            Some(name) => trace!("unwinding {}", name),
            None => trace!("unwinding 0x{:016x}", callee_frame.instruction),
        }
        let new_frame = get_caller_frame(&GetCallerFrameArgs {
            callee_frame,
            grand_callee_frame,
            stack_memory,
            modules,
            system_info,
            symbol_provider,
            stack_scan_allowed: frames_scanned < options.max_frames_scanned,
        });

        match new_frame {
            Some(new_frame) => stack.frames.push(new_frame),
            None => break,
        }
    }

    Ok(WalkResult {
        stack,
        modules_without_symbols,
        modules_with_corrupt_symbols,
    })
}

fn get_caller_frame<P>(args: &GetCallerFrameArgs<'_, P>) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    match args.callee_frame.context.raw {
        RawContext::X86(ref ctx) => x86::get_caller_frame(ctx, args),
        RawContext::Amd64(ref ctx) => amd64::get_caller_frame(ctx, args),
        RawContext::Arm(ref ctx) => arm::get_caller_frame(ctx, args),
        RawContext::Arm64(ref ctx) => arm64::get_caller_frame(ctx, args),
        RawContext::Ppc(ref ctx) => ppc::get_caller_frame(ctx, args),
        RawContext::Sparc(ref ctx) => sparc::get_caller_frame(ctx, args),
        RawContext::Mips(ref ctx) => mips::get_caller_frame(ctx, args),
    }
}

fn fill_source_line_info<P>(
    frame: &mut StackFrame,
    modules: &ModuleList,
    symbol_provider: &P,
    modules_without_symbols: &mut BTreeSet<String>,
    modules_with_corrupt_symbols: &mut BTreeSet<String>,
) -> Result<(), WalkInterrupted>
where
    P: SymbolProvider,
{
    // Find the module whose address range covers this frame's instruction.
    let module = match modules.module_at_address(frame.instruction) {
        Some(module) => module,
        None => return Ok(()),
    };
    frame.module = Some(module.clone());

    match symbol_provider.fill_symbol(module, frame) {
        Ok(()) => {}
        Err(FillSymbolError::MissingSymbols) => {
            modules_without_symbols.insert(module.code_file.clone());
        }
        Err(FillSymbolError::CorruptSymbols) => {
            modules_with_corrupt_symbols.insert(module.code_file.clone());
        }
        Err(FillSymbolError::Interrupted) => return Err(WalkInterrupted),
    }
    Ok(())
}

/// The caller-register state being rebuilt while evaluating one module's
/// call-frame-info rules.
///
/// Starts out as a clone of the callee's context with only the forwarded
/// callee-saved registers considered valid; the rule evaluation then sets
/// (or clears) registers through the `FrameWalker` methods.
struct CfiStackWalker<'a, C: CpuContext> {
    instruction: u64,
    has_grand_callee: bool,
    grand_callee_parameter_size: u32,

    callee_ctx: &'a C,
    callee_validity: &'a ContextValidity,

    caller_ctx: C,
    caller_validity: HashSet<&'static str>,

    module: &'a ModuleInfo,
    stack_memory: StackMemory<'a>,
}

impl<'a, C> CfiStackWalker<'a, C>
where
    C: CpuContext + Clone,
{
    fn from_ctx_and_args<P, R>(
        ctx: &'a C,
        args: &'a GetCallerFrameArgs<'a, P>,
        callee_forwarded_regs: R,
    ) -> Option<Self>
    where
        R: Fn(&ContextValidity) -> HashSet<&'static str>,
    {
        let module = args
            .modules
            .module_at_address(args.callee_frame.instruction)?;
        let grand_callee = args.grand_callee_frame;
        Some(Self {
            instruction: args.callee_frame.instruction,
            has_grand_callee: grand_callee.is_some(),
            grand_callee_parameter_size: grand_callee.and_then(|f| f.parameter_size).unwrap_or(0),

            callee_ctx: ctx,
            callee_validity: args.valid(),

            // Default to forwarding all callee-saved regs verbatim.
            // The CFI evaluator may clear or overwrite these values.
            // The stack pointer and instruction pointer are not included.
            caller_ctx: ctx.clone(),
            caller_validity: callee_forwarded_regs(args.valid()),

            module,
            stack_memory: args.stack_memory,
        })
    }
}

impl<'a, C> FrameWalker for CfiStackWalker<'a, C>
where
    C: CpuContext,
    C::Register: TryFrom<u64>,
    u64: TryFrom<C::Register>,
    C::Register: TryFromCtx<'a, Endian, [u8], Error = scroll::Error> + SizeWith<Endian>,
{
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn has_grand_callee(&self) -> bool {
        self.has_grand_callee
    }
    fn get_grand_callee_parameter_size(&self) -> u32 {
        self.grand_callee_parameter_size
    }
    fn get_register_at_address(&self, address: u64) -> Option<u64> {
        let result: Option<C::Register> = self.stack_memory.get_memory_at_address(address);
        result.and_then(|val| u64::try_from(val).ok())
    }
    fn get_callee_register(&self, name: &str) -> Option<u64> {
        self.callee_ctx
            .get_register(name, self.callee_validity)
            .and_then(|val| u64::try_from(val).ok())
    }
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()> {
        let memoized = self.caller_ctx.memoize_register(name)?;
        let val = C::Register::try_from(val).ok()?;
        self.caller_validity.insert(memoized);
        self.caller_ctx.set_register(name, val)
    }
    fn clear_caller_register(&mut self, name: &str) {
        self.caller_validity.remove(name);
    }
    fn set_cfa(&mut self, val: u64) -> Option<()> {
        let stack_pointer_reg = self.caller_ctx.stack_pointer_register_name();
        let val = C::Register::try_from(val).ok()?;
        self.caller_validity.insert(stack_pointer_reg);
        self.caller_ctx.set_register(stack_pointer_reg, val)
    }
    fn set_ra(&mut self, val: u64) -> Option<()> {
        let instruction_pointer_reg = self.caller_ctx.instruction_pointer_register_name();
        let val = C::Register::try_from(val).ok()?;
        self.caller_validity.insert(instruction_pointer_reg);
        self.caller_ctx.set_register(instruction_pointer_reg, val)
    }
}

/// Checks if we can dismiss the validity of an instruction based on our
/// symbols, to refine the quality of each unwinder's
/// instruction_seems_valid implementation.
fn instruction_seems_valid_by_symbols<P>(
    instruction: u64,
    modules: &ModuleList,
    symbol_provider: &P,
) -> bool
where
    P: SymbolProvider,
{
    // Our input is a candidate return address, but we *really* want to
    // validate the address of the call instruction *before* the return
    // address. In theory this symbol-based analysis shouldn't *care*
    // whether we're looking at the call or the instruction after it, but
    // there is one corner case where the return address can be invalid
    // but the instruction before it isn't: noreturn.
    //
    // If the *callee* is noreturn, then the caller has no obligation to
    // have any instructions after the call! So e.g. on x86 if you CALL a
    // noreturn function, the return address that's implicitly pushed
    // *could* be one-past-the-end of the "function".
    //
    // We don't otherwise need the instruction pointer to be terribly
    // precise, so subtracting 1 from the address is sufficient to handle
    // this corner case.
    let instruction = instruction.saturating_sub(1);

    // NULL pointer is definitely not valid.
    if instruction == 0 {
        return false;
    }

    let module = match modules.module_at_address(instruction) {
        Some(module) => module,
        None => {
            // We couldn't even map this address to a module. Reject the
            // pointer so that we have *some* way to distinguish "normal"
            // pointers from instruction addresses.
            return false;
        }
    };

    // Create a dummy frame symbolizing implementation to feed into
    // our symbol provider with the address we're interested in. If
    // it tries to set a non-empty function name, then we can reasonably
    // assume the instruction address is valid.
    struct DummyFrame {
        instruction: u64,
        has_name: bool,
    }
    impl FrameSymbolizer for DummyFrame {
        fn get_instruction(&self) -> u64 {
            self.instruction
        }
        fn set_function(&mut self, name: &str, _base: u64, _parameter_size: u32) {
            self.has_name = !name.is_empty();
        }
        fn set_source_file(&mut self, _file: &str, _line: u32, _base: u64) {}
    }

    let mut frame = DummyFrame {
        instruction,
        has_name: false,
    };

    if symbol_provider.fill_symbol(module, &mut frame).is_ok() {
        frame.has_name
    } else {
        // If the symbol provider returns an Error, this means that we
        // didn't have any symbols for the *module*. Just assume the
        // instruction is valid in this case so that scanning works
        // when we have no symbols.
        true
    }
}

#[cfg(test)]
mod arm64_unittest;
