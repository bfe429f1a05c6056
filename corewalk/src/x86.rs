// Note since x86 and Amd64 have basically the same ABI, this implementation
// is written to largely erase the details of the two wherever possible,
// so that it can be copied between the two with minimal changes. It's not
// worth the effort to *actually* unify the implementations.

use super::impl_prelude::*;
use corewalk_common::{Context, ContextValidity, RawContext, CONTEXT_X86};
use corewalk_symbols::{PostfixEvaluator, StackInfoWin, WinStackThing};
use std::collections::HashSet;
use tracing::trace;

type Pointer = u32;
const POINTER_WIDTH: Pointer = 4;
const INSTRUCTION_REGISTER: &str = "eip";
const STACK_POINTER_REGISTER: &str = "esp";
const FRAME_POINTER_REGISTER: &str = "ebp";
const CALLEE_SAVED_REGS: &[&str] = &["ebp", "ebx", "edi", "esi"];

fn get_caller_by_cfi<P>(ctx: &CONTEXT_X86, args: &GetCallerFrameArgs<'_, P>) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying cfi");

    if let ContextValidity::Some(ref which) = args.valid() {
        if !which.contains(STACK_POINTER_REGISTER) {
            return None;
        }
    }

    let mut stack_walker = CfiStackWalker::from_ctx_and_args(ctx, args, callee_forwarded_regs)?;

    args.symbol_provider
        .walk_frame(stack_walker.module, &mut stack_walker)?;
    let caller_ip = stack_walker.caller_ctx.eip;
    let caller_sp = stack_walker.caller_ctx.esp;

    trace!(
        "cfi evaluation was successful -- caller_ip: 0x{:08x}, caller_sp: 0x{:08x}",
        caller_ip,
        caller_sp,
    );

    // Do absolutely NO validation! As long as the rules evaluated (which
    // does include ip and sp resolving), assume the values are correct.

    let context = Context {
        raw: RawContext::X86(stack_walker.caller_ctx),
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

/// Unwind with the Windows unwind record covering the callee's address.
///
/// Records come in two shapes. Newer toolchains emit a postfix program
/// that recovers the caller's registers through a [`PostfixEvaluator`];
/// older FPO records only describe the frame's layout, and the caller's
/// state is computed structurally from the frame sizes.
fn get_caller_by_windows_frame_info<P>(
    ctx: &CONTEXT_X86,
    args: &GetCallerFrameArgs<'_, P>,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying windows frame info");

    if let ContextValidity::Some(ref which) = args.valid() {
        if !which.contains(STACK_POINTER_REGISTER) || !which.contains(FRAME_POINTER_REGISTER) {
            return None;
        }
    }

    let module = args
        .modules
        .module_at_address(args.callee_frame.instruction)?;
    let info = args
        .symbol_provider
        .find_windows_frame_info(module, args.callee_frame.instruction)?;

    let grand_callee_parameter_size = args
        .grand_callee_frame
        .and_then(|frame| frame.parameter_size)
        .unwrap_or(0);

    match info.program_string_or_base_pointer {
        WinStackThing::ProgramString(ref program) => {
            get_caller_by_win_program_string(ctx, args, &info, program, grand_callee_parameter_size)
        }
        WinStackThing::AllocatesBasePointer(allocates) => {
            get_caller_by_win_frame_layout(ctx, args, &info, allocates, grand_callee_parameter_size)
        }
    }
}

fn get_caller_by_win_program_string<P>(
    ctx: &CONTEXT_X86,
    args: &GetCallerFrameArgs<'_, P>,
    info: &StackInfoWin,
    program: &str,
    grand_callee_parameter_size: u32,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    let frame_size = info
        .local_size
        .checked_add(info.saved_register_size)?
        .checked_add(grand_callee_parameter_size)?;

    // Programs emitted for alloca-using functions reference the raSearch
    // variables (spelled with an '@' alignment somewhere in the program);
    // those recover the return address relative to the frame pointer, not
    // the stack pointer.
    let search_start = if program.contains('@') {
        ctx.ebp.checked_add(POINTER_WIDTH)?
    } else {
        ctx.esp.checked_add(frame_size)?
    };

    let mut evaluator = PostfixEvaluator::new(Some(&args.stack_memory));
    evaluator
        .dictionary
        .insert("$esp".to_string(), ctx.esp as u64);
    evaluator
        .dictionary
        .insert("$ebp".to_string(), ctx.ebp as u64);
    let ebx_valid = match args.valid() {
        ContextValidity::All => true,
        ContextValidity::Some(ref which) => which.contains("ebx"),
    };
    if ebx_valid {
        evaluator
            .dictionary
            .insert("$ebx".to_string(), ctx.ebx as u64);
    }
    evaluator
        .dictionary
        .insert(".cbParams".to_string(), info.parameter_size as u64);
    evaluator.dictionary.insert(
        ".cbCalleeParams".to_string(),
        grand_callee_parameter_size as u64,
    );
    evaluator
        .dictionary
        .insert(".cbSavedRegs".to_string(), info.saved_register_size as u64);
    evaluator
        .dictionary
        .insert(".cbLocals".to_string(), info.local_size as u64);
    evaluator
        .dictionary
        .insert(".raSearch".to_string(), search_start as u64);
    evaluator
        .dictionary
        .insert(".raSearchStart".to_string(), search_start as u64);

    if evaluator.evaluate(program) {
        let caller_ip = evaluator.dictionary.get("$eip").copied();
        let caller_sp = evaluator.dictionary.get("$esp").copied();
        if let (Some(caller_ip), Some(caller_sp)) = (caller_ip, caller_sp) {
            // The programs are untrusted input; only accept a result whose
            // return address lands in a module we know about.
            if args.modules.module_at_address(caller_ip).is_some() {
                trace!(
                    "windows program evaluation was successful -- caller_ip: 0x{:08x}, caller_sp: 0x{:08x}",
                    caller_ip,
                    caller_sp,
                );

                let mut caller_ctx = CONTEXT_X86 {
                    eip: caller_ip as Pointer,
                    esp: caller_sp as Pointer,
                    ..CONTEXT_X86::default()
                };
                let mut valid = HashSet::new();
                valid.insert(INSTRUCTION_REGISTER);
                valid.insert(STACK_POINTER_REGISTER);
                // The seeded $ebp counts as recovered here even if the
                // program never reassigned it; a program that needed a
                // different value would have overwritten it.
                if let Some(&val) = evaluator.dictionary.get("$ebp") {
                    caller_ctx.ebp = val as Pointer;
                    valid.insert("ebp");
                }
                if let Some(&val) = evaluator.dictionary.get("$ebx") {
                    caller_ctx.ebx = val as Pointer;
                    valid.insert("ebx");
                }
                if let Some(&val) = evaluator.dictionary.get("$esi") {
                    caller_ctx.esi = val as Pointer;
                    valid.insert("esi");
                }
                if let Some(&val) = evaluator.dictionary.get("$edi") {
                    caller_ctx.edi = val as Pointer;
                    valid.insert("edi");
                }
                let context = Context {
                    raw: RawContext::X86(caller_ctx),
                    valid: ContextValidity::Some(valid),
                };
                return Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo));
            }
            trace!("windows program produced implausible caller_ip, trying scan");
        }
    } else {
        trace!("windows program evaluation failed, trying scan");
    }

    // The record was wrong about this frame. The frame sizes it claims
    // still tell us roughly where the return address should be, so scan a
    // little from there.
    if !args.stack_scan_allowed {
        return None;
    }
    scan_from_address(args, search_start)
}

fn get_caller_by_win_frame_layout<P>(
    ctx: &CONTEXT_X86,
    args: &GetCallerFrameArgs<'_, P>,
    info: &StackInfoWin,
    allocates_base_pointer: bool,
    grand_callee_parameter_size: u32,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    let frame_size = info
        .local_size
        .checked_add(info.saved_register_size)?
        .checked_add(grand_callee_parameter_size)?;

    let mut eip_address = ctx.esp.checked_add(frame_size)?;
    let mut caller_ip: Pointer = args.stack_memory.get_memory_at_address(eip_address as u64)?;

    // A frame that tail-calls (or is still in its prologue) can leave its
    // own return address where we expected the caller's. If the value we
    // read is the callee's own address and there is no grand-callee to
    // explain the layout, skip over it.
    if args.grand_callee_frame.is_none() && caller_ip == ctx.eip {
        eip_address = eip_address.checked_add(POINTER_WIDTH)?;
        caller_ip = args.stack_memory.get_memory_at_address(eip_address as u64)?;
    }

    let caller_sp = eip_address.checked_add(POINTER_WIDTH)?;

    let mut valid = HashSet::new();
    valid.insert(INSTRUCTION_REGISTER);
    valid.insert(STACK_POINTER_REGISTER);

    let mut caller_ctx = CONTEXT_X86 {
        eip: caller_ip,
        esp: caller_sp,
        ..CONTEXT_X86::default()
    };

    if allocates_base_pointer {
        // The callee pushed the caller's %ebp after its arguments and the
        // other saved registers; it sits one pointer below the saved regs.
        let ebp_address = ctx
            .esp
            .checked_add(grand_callee_parameter_size)?
            .checked_add(info.saved_register_size)?
            .checked_sub(POINTER_WIDTH * 2)?;
        caller_ctx.ebp = args.stack_memory.get_memory_at_address(ebp_address as u64)?;
        valid.insert(FRAME_POINTER_REGISTER);
    } else {
        // The callee never touched %ebp (or %ebx), forward them.
        caller_ctx.ebp = ctx.ebp;
        valid.insert(FRAME_POINTER_REGISTER);
        let ebx_valid = match args.valid() {
            ContextValidity::All => true,
            ContextValidity::Some(ref which) => which.contains("ebx"),
        };
        if ebx_valid {
            caller_ctx.ebx = ctx.ebx;
            valid.insert("ebx");
        }
    }

    trace!(
        "windows frame layout seems valid -- caller_ip: 0x{:08x}, caller_sp: 0x{:08x}",
        caller_ip,
        caller_sp,
    );

    let context = Context {
        raw: RawContext::X86(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo))
}

/// Scan upward from `start` for something that looks like a return
/// address, producing a frame with only %eip and %esp recovered.
///
/// This is the fallback for a Windows unwind record that evaluated but
/// produced garbage; the frame gets the lower CfiScan trust.
fn scan_from_address<P>(args: &GetCallerFrameArgs<'_, P>, start: Pointer) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    let default_scan_range = 40;

    for i in 0..default_scan_range {
        let address_of_ip = start.checked_add(i * POINTER_WIDTH)?;
        let caller_ip = args
            .stack_memory
            .get_memory_at_address(address_of_ip as u64)?;
        if instruction_seems_valid(caller_ip, args.modules, args.symbol_provider) {
            let caller_sp = address_of_ip.checked_add(POINTER_WIDTH)?;

            trace!(
                "windows scan seems valid -- caller_ip: 0x{:08x}, caller_sp: 0x{:08x}",
                caller_ip,
                caller_sp,
            );

            let caller_ctx = CONTEXT_X86 {
                eip: caller_ip,
                esp: caller_sp,
                ..CONTEXT_X86::default()
            };
            let mut valid = HashSet::new();
            valid.insert(INSTRUCTION_REGISTER);
            valid.insert(STACK_POINTER_REGISTER);
            let context = Context {
                raw: RawContext::X86(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            return Some(StackFrame::from_context(context, FrameTrust::CfiScan));
        }
    }

    None
}

fn get_caller_by_frame_pointer<P>(
    ctx: &CONTEXT_X86,
    args: &GetCallerFrameArgs<'_, P>,
) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying frame pointer");
    if let ContextValidity::Some(ref which) = args.valid() {
        if !which.contains(FRAME_POINTER_REGISTER) {
            return None;
        }
    }

    let last_bp = ctx.ebp;
    // Assume that the standard %bp-using x86 calling convention is in
    // use.
    //
    // The typical x86 calling convention, when frame pointers are present,
    // is for the calling procedure to use CALL, which pushes the return
    // address onto the stack and sets the instruction pointer (%ip) to
    // the entry point of the called routine.  The called routine then
    // PUSHes the calling routine's frame pointer (%bp) onto the stack
    // before copying the stack pointer (%sp) to the frame pointer (%bp).
    // Therefore, the calling procedure's frame pointer is always available
    // by dereferencing the called procedure's frame pointer, and the return
    // address is always available at the memory location immediately above
    // the address pointed to by the called procedure's frame pointer.  The
    // calling procedure's stack pointer (%sp) is 2 pointers higher than the
    // value of the called procedure's frame pointer at the time the calling
    // procedure made the CALL: 1 pointer for the return address pushed by the
    // CALL itself, and 1 pointer for the callee's PUSH of the caller's frame
    // pointer.
    //
    // %ip_new = *(%bp_old + ptr)
    // %bp_new = *(%bp_old)
    // %sp_new = %bp_old + ptr*2

    if last_bp >= u32::MAX - POINTER_WIDTH * 2 {
        // Although this code generally works fine if the pointer math overflows,
        // debug builds will still panic, and this guard protects against it without
        // drowning the rest of the code in checked_add.
        return None;
    }
    let caller_ip = args
        .stack_memory
        .get_memory_at_address(last_bp as u64 + POINTER_WIDTH as u64)?;
    let caller_bp = args.stack_memory.get_memory_at_address(last_bp as u64)?;
    let caller_sp = last_bp + POINTER_WIDTH * 2;

    trace!(
        "frame pointer seems valid -- caller_ip: 0x{:08x}, caller_sp: 0x{:08x}",
        caller_ip,
        caller_sp,
    );

    let caller_ctx = CONTEXT_X86 {
        eip: caller_ip,
        esp: caller_sp,
        ebp: caller_bp,
        ..CONTEXT_X86::default()
    };
    let mut valid = HashSet::new();
    valid.insert(INSTRUCTION_REGISTER);
    valid.insert(STACK_POINTER_REGISTER);
    valid.insert(FRAME_POINTER_REGISTER);
    let context = Context {
        raw: RawContext::X86(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

fn get_caller_by_scan<P>(ctx: &CONTEXT_X86, args: &GetCallerFrameArgs<'_, P>) -> Option<StackFrame>
where
    P: SymbolProvider,
{
    trace!("trying scan");
    // Stack scanning is just walking from the end of the frame until we encounter
    // a value on the stack that looks like a pointer into some code (it's an address
    // in a range covered by one of our modules). If we find such an instruction,
    // we assume it's an ip value that was pushed by the CALL instruction that created
    // the current frame. The next frame is then assumed to end just before that
    // ip value.
    let last_bp = match args.valid() {
        ContextValidity::All => Some(ctx.ebp),
        ContextValidity::Some(ref which) => {
            if !which.contains(STACK_POINTER_REGISTER) {
                trace!("cannot scan without stack pointer");
                return None;
            }
            if which.contains(FRAME_POINTER_REGISTER) {
                Some(ctx.ebp)
            } else {
                None
            }
        }
    };
    let last_sp = ctx.esp;

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
        let address_of_ip = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_ip = args
            .stack_memory
            .get_memory_at_address(address_of_ip as u64)?;
        if instruction_seems_valid(caller_ip, args.modules, args.symbol_provider) {
            // ip is pushed by CALL, so sp is just address_of_ip + ptr
            let caller_sp = address_of_ip.checked_add(POINTER_WIDTH)?;

            // Try to restore bp as well. This can be possible in two cases:
            //
            // 1. This function has the standard prologue that pushes bp and
            //    sets bp = sp. If this is the case, then the current bp should be
            //    immediately after (before in memory) address_of_ip.
            //
            // 2. This function does not use bp, and has just preserved it
            //    from the caller. If this is the case, bp should be before
            //    (after in memory) address_of_ip.
            //
            // We then try our best to eliminate bogus-looking bp's with some
            // simple heuristics like "is a valid stack address".
            let mut caller_bp = None;

            // Max reasonable size for a single x86 frame is 128 KB.  This value is used in
            // a heuristic for recovering of the EBP chain after a scan for return address.
            // This value is based on a stack frame size histogram built for a set of
            // popular third party libraries which suggests that 99.5% of all frames are
            // smaller than 128 KB.
            const MAX_REASONABLE_GAP_BETWEEN_FRAMES: Pointer = 128 * 1024;

            // If we're on the first iteration of the scan, there can't possibly be a frame pointer,
            // because the entire stack frame is taken up by the return pointer. And if we're
            // not on the first iteration, then the last iteration already loaded the location
            // we expect the frame pointer to be in, so we can unconditionally load it here.
            if i > 0 {
                let address_of_bp = address_of_ip - POINTER_WIDTH;
                let bp = args
                    .stack_memory
                    .get_memory_at_address(address_of_bp as u64)?;

                if bp > address_of_ip && bp - address_of_bp <= MAX_REASONABLE_GAP_BETWEEN_FRAMES {
                    // Sanity check that resulting bp is still inside stack memory.
                    if args
                        .stack_memory
                        .get_memory_at_address::<Pointer>(bp as u64)
                        .is_some()
                    {
                        caller_bp = Some(bp);
                    }
                } else if let Some(last_bp) = last_bp {
                    if last_bp >= caller_sp {
                        // Sanity check that resulting bp is still inside stack memory.
                        if args
                            .stack_memory
                            .get_memory_at_address::<Pointer>(last_bp as u64)
                            .is_some()
                        {
                            caller_bp = Some(last_bp);
                        }
                    }
                }
            }

            trace!(
                "scan seems valid -- caller_ip: 0x{:08x}, caller_sp: 0x{:08x}",
                caller_ip,
                caller_sp,
            );

            let caller_ctx = CONTEXT_X86 {
                eip: caller_ip,
                esp: caller_sp,
                ebp: caller_bp.unwrap_or(0),
                ..CONTEXT_X86::default()
            };
            let mut valid = HashSet::new();
            valid.insert(INSTRUCTION_REGISTER);
            valid.insert(STACK_POINTER_REGISTER);
            if caller_bp.is_some() {
                valid.insert(FRAME_POINTER_REGISTER);
            }
            let context = Context {
                raw: RawContext::X86(caller_ctx),
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
/// cfi and frame_pointer approaches do not use this validation
/// because by default they're working with plausible/trustworthy
/// data.
///
/// Specifically, not using this validation allows cfi/fp methods
/// to unwind through frames we don't have mapped modules for (such as
/// OS APIs). This may seem confusing since we obviously don't have cfi
/// for unmapped modules!
///
/// The way this works is that we will use cfi to unwind some frame we
/// know about and *end up* in a function we know nothing about, but with
/// all the right register values. At this point, frame pointers will
/// often do the correct thing even though we don't know what code we're
/// in -- until we get back into code we do know about and cfi kicks back in.
/// At worst, this sets scanning up in a better position for success!
///
/// If we applied this more rigorous validation to cfi/fp methods, we
/// would just discard the correct register values from the known frame
/// and immediately start doing unreliable scans.
fn instruction_seems_valid<P>(
    instruction: Pointer,
    modules: &crate::ModuleList,
    symbol_provider: &P,
) -> bool
where
    P: SymbolProvider,
{
    if instruction == 0 {
        return false;
    }

    super::instruction_seems_valid_by_symbols(instruction as u64, modules, symbol_provider)
}

pub fn get_caller_frame<P>(
    ctx: &CONTEXT_X86,
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
        frame = get_caller_by_windows_frame_info(ctx, args);
    }
    if frame.is_none() {
        frame = get_caller_by_frame_pointer(ctx, args);
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
    if frame.context.get_stack_pointer() <= ctx.esp as u64 {
        trace!("stack pointer went backwards, assuming unwind complete");
        return None;
    }

    // Ok, the frame now seems well and truly valid, do final cleanup.

    // A caller's ip is the return address, which is the instruction
    // *after* the CALL that caused us to arrive at the callee. Set
    // the value to one less than that, so it points within the
    // CALL instruction. This is important because we use this value
    // to lookup the CFI we need to unwind the next frame.
    let ip = frame.context.get_instruction_pointer();
    frame.instruction = ip - 1;

    Some(frame)
}
