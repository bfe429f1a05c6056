use super::impl_prelude::*;
use corewalk_common::{
    Context, ContextValidity, CpuContext, PpcRegisterNumbers, RawContext, CONTEXT_PPC,
};
use std::collections::HashSet;
use tracing::trace;

type PpcContext = CONTEXT_PPC;
type Pointer = <PpcContext as CpuContext>::Register;

const POINTER_WIDTH: Pointer = std::mem::size_of::<Pointer>() as Pointer;
const STACK_POINTER: &str = PpcRegisterNumbers::StackPointer.name();
const PROGRAM_COUNTER: &str = "pc";
const CALLEE_SAVED_REGS: &[&str] = &[
    "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26",
    "r27", "r28", "r29", "r30", "r31",
];

fn get_caller_by_cfi<P>(ctx: &PpcContext, args: &GetCallerFrameArgs<'_, P>) -> Option<StackFrame>
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
        raw: RawContext::Ppc(stack_walker.caller_ctx),
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

fn get_caller_by_back_chain<P>(
    ctx: &PpcContext,
    args: &GetCallerFrameArgs<'_, P>,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying back chain");
    // The PPC ABI threads a "back chain" through the stack: the word at
    // 0(r1) is the caller's stack pointer, and a function that calls
    // anything stores the saved lr at 8 bytes into the *caller's* frame.
    // So to restore the caller's registers, we have:
    //
    // sp := *(sp)
    // pc := *(*(sp) + ptr*2)
    let last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    if last_sp >= u32::MAX - POINTER_WIDTH * 2 {
        // Although this code generally works fine if the pointer math overflows,
        // debug builds will still panic, and this guard protects against it without
        // drowning the rest of the code in checked_add.
        return None;
    }
    let caller_sp: Pointer = args.stack_memory.get_memory_at_address(last_sp as u64)?;
    let (caller_pc, caller_sp) = if caller_sp == 0 {
        // A zeroed back chain marks the outermost frame. Force termination
        // via the caller_sp <= last_sp check in get_caller_frame.
        (0, last_sp)
    } else {
        let caller_pc = args
            .stack_memory
            .get_memory_at_address(caller_sp as u64 + POINTER_WIDTH as u64 * 2)?;
        (caller_pc, caller_sp)
    };

    // Don't do any more validation, just assume it worked.

    trace!(
        "back chain seems valid -- caller_pc: 0x{:08x}, caller_sp: 0x{:08x}",
        caller_pc,
        caller_sp,
    );

    let mut caller_ctx = PpcContext::default();
    caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
    caller_ctx.set_register(STACK_POINTER, caller_sp);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(STACK_POINTER);

    let context = Context {
        raw: RawContext::Ppc(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

fn get_caller_by_scan<P>(ctx: &PpcContext, args: &GetCallerFrameArgs<'_, P>) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying scan");
    // Stack scanning is just walking from the end of the frame until we encounter
    // a value on the stack that looks like a pointer into some code (it's an address
    // in a range covered by one of our modules). If we find such an instruction,
    // we assume it's a saved lr value spilled by the caller's prologue.
    // The next frame is then assumed to end just before that value.
    let last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    // Number of pointer-sized values to scan through in our search.
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
        let address_of_pc = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_pc = args
            .stack_memory
            .get_memory_at_address(address_of_pc as u64)?;
        if instruction_seems_valid(caller_pc, args.modules, args.symbol_provider) {
            // The saved lr sits at the bottom of the caller's frame,
            // so sp is just address_of_pc + ptr
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;

            // Don't do any more validation, and don't try to restore the
            // back chain.

            trace!(
                "scan seems valid -- caller_pc: 0x{:08x}, caller_sp: 0x{:08x}",
                caller_pc,
                caller_sp,
            );

            let mut caller_ctx = PpcContext::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
            caller_ctx.set_register(STACK_POINTER, caller_sp);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);

            let context = Context {
                raw: RawContext::Ppc(caller_ctx),
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
/// cfi and back_chain approaches do not use this validation
/// because by default they're working with plausible/trustworthy
/// data.
fn instruction_seems_valid<P>(
    instruction: Pointer,
    modules: &crate::ModuleList,
    symbol_provider: &P,
) -> bool
where
    P: SymbolProvider,
{
    super::instruction_seems_valid_by_symbols(instruction as u64, modules, symbol_provider)
}

pub fn get_caller_frame<P>(ctx: &PpcContext, args: &GetCallerFrameArgs<'_, P>) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    let mut frame = None;
    if frame.is_none() {
        frame = get_caller_by_cfi(ctx, args);
    }
    if frame.is_none() {
        frame = get_caller_by_back_chain(ctx, args);
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
    // enforce progress and avoid infinite loops.

    let sp = frame.context.get_stack_pointer();
    let last_sp = ctx.get_register_always(STACK_POINTER) as u64;
    if sp <= last_sp {
        // Ppc leaf functions may not actually touch the stack (thanks
        // to the link register allowing you to "push" the return address
        // to a register), so we need to permit the stack pointer to not
        // change for the first frame of the unwind. After that we need
        // more strict validation to avoid infinite loops.
        let is_leaf = args.callee_frame.trust == FrameTrust::Context && sp == last_sp;
        if !is_leaf {
            trace!("stack pointer went backwards, assuming unwind complete");
            return None;
        }
    }

    // Ok, the frame now seems well and truly valid, do final cleanup.

    // A caller's pc is the return address, which is the instruction
    // *after* the branch that caused us to arrive at the callee. Set
    // the value to 4 less than that, so it points to the branch
    // instruction (ppc instructions are all 4 bytes wide). This is
    // important because we use this value to lookup the CFI we need
    // to unwind the next frame.
    let ip = frame.context.get_instruction_pointer();
    frame.instruction = ip - 4;

    Some(frame)
}
