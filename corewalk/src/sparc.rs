use super::impl_prelude::*;
use corewalk_common::{
    Context, ContextValidity, CpuContext, RawContext, SparcRegisterNumbers, CONTEXT_SPARC,
};
use std::collections::HashSet;
use tracing::trace;

type SparcContext = CONTEXT_SPARC;

// Registers are modeled as 64-bit, but the stack layout is the 32-bit
// one: saved window words are 4 bytes wide.
const WORD_WIDTH: u64 = 4;
const STACK_POINTER: &str = SparcRegisterNumbers::StackPointer.name();
const FRAME_POINTER: &str = SparcRegisterNumbers::FramePointer.name();
const PROGRAM_COUNTER: &str = "pc";
// The locals and ins of the register window are spilled to the stack on
// a window overflow, so the caller may rely on all of them surviving.
const CALLEE_SAVED_REGS: &[&str] = &[
    "l0", "l1", "l2", "l3", "l4", "l5", "l6", "l7", "i0", "i1", "i2", "i3", "i4", "i5", "fp",
    "i7",
];

// Offsets into the register window save area at %sp.
const SAVED_FP_OFFSET: u64 = WORD_WIDTH * 14;
const SAVED_RA_OFFSET: u64 = WORD_WIDTH * 15;

fn get_caller_by_cfi<P>(ctx: &SparcContext, args: &GetCallerFrameArgs<'_, P>) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying cfi");

    let _last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    let mut stack_walker = CfiStackWalker::from_ctx_and_args(ctx, args, callee_forwarded_regs)?;

    args.symbol_provider
        .walk_frame(stack_walker.module, &mut stack_walker)?;
    let caller_pc = stack_walker.caller_ctx.get_register_always(PROGRAM_COUNTER);
    let caller_sp = stack_walker.caller_ctx.get_register_always(STACK_POINTER);

    trace!(
        "cfi evaluation was successful -- caller_pc: 0x{:08x}, caller_sp: 0x{:08x}",
        caller_pc,
        caller_sp,
    );

    // Do absolutely NO validation! As long as the rules evaluated (which
    // does include pc and sp resolving), assume the values are correct.

    let context = Context {
        raw: RawContext::Sparc(stack_walker.caller_ctx),
        valid: ContextValidity::Some(stack_walker.caller_validity),
    };
    Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo))
}

fn callee_forwarded_regs(valid: &ContextValidity) -> HashSet<&'static str> {
    match valid {
        ContextValidity::All => CALLEE_SAVED_REGS.iter().copied().collect(),
        ContextValidity::Some(ref which) => CALLEE_SAVED_REGS
            .iter()
            .filter(|&reg| which.contains(reg))
            .copied()
            .collect(),
    }
}

fn get_caller_by_register_window<P>(
    ctx: &SparcContext,
    args: &GetCallerFrameArgs<'_, P>,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying register window");
    // The SPARC `save` instruction rotates the register window and points
    // %sp at a 16-word save area where the window's locals and ins are
    // spilled on overflow. The callee's %fp is the caller's %sp, and the
    // caller's own %fp and return address sit in the save area at the
    // *callee's* %sp (saved %i6 and %i7).
    //
    // sp := fp
    // fp := *(sp + 56)
    // pc := *(sp + 60)
    let last_sp = ctx.get_register(STACK_POINTER, args.valid())?;
    let caller_sp = ctx.get_register(FRAME_POINTER, args.valid())?;

    let caller_fp: u32 = args
        .stack_memory
        .get_memory_at_address(last_sp.checked_add(SAVED_FP_OFFSET)?)?;
    // The saved %i7 holds the address of the call instruction; the frame
    // resumes two instructions after it, but we only report the return
    // address here and let the caller adjust for lookups.
    let caller_ra: u32 = args
        .stack_memory
        .get_memory_at_address(last_sp.checked_add(SAVED_RA_OFFSET)?)?;

    // Don't do any more validation, just assume it worked.

    trace!(
        "register window seems valid -- caller_pc: 0x{:08x}, caller_sp: 0x{:08x}",
        caller_ra,
        caller_sp,
    );

    let mut caller_ctx = SparcContext::default();
    caller_ctx.set_register(PROGRAM_COUNTER, caller_ra as u64);
    caller_ctx.set_register(STACK_POINTER, caller_sp);
    caller_ctx.set_register(FRAME_POINTER, caller_fp as u64);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(STACK_POINTER);
    valid.insert(FRAME_POINTER);

    let context = Context {
        raw: RawContext::Sparc(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

fn get_caller_by_scan<P>(ctx: &SparcContext, args: &GetCallerFrameArgs<'_, P>) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying scan");
    // Stack scanning is just walking from the end of the frame until we encounter
    // a value on the stack that looks like a pointer into some code (it's an address
    // in a range covered by one of our modules). If we find such an instruction,
    // we assume it's a spilled return address from some register window.
    // The next frame is then assumed to end just before that value.
    let last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    // Number of word-sized values to scan through in our search.
    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;

    // The first frame of an unwind can be really messed up, and therefore
    // benefits from a longer scan.
    let scan_range = if let FrameTrust::Context = args.callee_frame.trust {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_pc = last_sp.checked_add(i * WORD_WIDTH)?;
        let caller_pc: u32 = args.stack_memory.get_memory_at_address(address_of_pc)?;
        if instruction_seems_valid(caller_pc as u64, args.modules, args.symbol_provider) {
            let caller_sp = address_of_pc.checked_add(WORD_WIDTH)?;

            // Don't do any more validation, and don't try to restore fp.

            trace!(
                "scan seems valid -- caller_pc: 0x{:08x}, caller_sp: 0x{:08x}",
                caller_pc,
                caller_sp,
            );

            let mut caller_ctx = SparcContext::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc as u64);
            caller_ctx.set_register(STACK_POINTER, caller_sp);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);

            let context = Context {
                raw: RawContext::Sparc(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            return Some(StackFrame::from_context(context, FrameTrust::Scan));
        }
    }

    None
}

/// The most strict validation we have for instruction pointers.
///
/// This is only used for stack-scanning, because it's explicitly
/// trying to distinguish between total garbage and correct values.
/// cfi and register window approaches do not use this validation
/// because by default they're working with plausible/trustworthy
/// data.
fn instruction_seems_valid<P>(
    instruction: u64,
    modules: &crate::ModuleList,
    symbol_provider: &P,
) -> bool
where
    P: SymbolProvider,
{
    super::instruction_seems_valid_by_symbols(instruction, modules, symbol_provider)
}

pub fn get_caller_frame<P>(
    ctx: &SparcContext,
    args: &GetCallerFrameArgs<'_, P>,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    let mut frame = None;
    if frame.is_none() {
        frame = get_caller_by_cfi(ctx, args);
    }
    if frame.is_none() {
        frame = get_caller_by_register_window(ctx, args);
    }
    if frame.is_none() && args.stack_scan_allowed {
        frame = get_caller_by_scan(ctx, args);
    }
    let mut frame = frame?;

    // We now check the frame to see if it looks like unwinding is complete,
    // based on the frame we computed having a nonsense value. Returning
    // None signals to the unwinder to stop unwinding.

    // if the instruction is within the first ~page of memory, it's basically
    // null, and we can assume unwinding is complete.
    if frame.context.get_instruction_pointer() < 4096 {
        trace!("instruction pointer was nullish, assuming unwind complete");
        return None;
    }
    // If the new stack pointer is at a lower address than the old,
    // then that's clearly incorrect. Treat this as end-of-stack to
    // enforce progress and avoid infinite loops. Unlike the link-register
    // architectures there is no leaf exception here: even a leaf gets a
    // fresh register window, so a legitimate caller always has a higher sp.
    if frame.context.get_stack_pointer() <= ctx.get_register_always(STACK_POINTER) {
        trace!("stack pointer went backwards, assuming unwind complete");
        return None;
    }

    // Ok, the frame now seems well and truly valid, do final cleanup.

    // A caller's pc is the return address, which points at (or after) the
    // call instruction. Set the value to 4 less than that, so it points
    // within the call instruction (sparc instructions are all 4 bytes
    // wide). This is important because we use this value to lookup the
    // CFI we need to unwind the next frame.
    let ip = frame.context.get_instruction_pointer();
    frame.instruction = ip - 4;

    Some(frame)
}
