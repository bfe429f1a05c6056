//! CPU register contexts for the supported architectures.
//!
//! Each supported architecture gets a `CONTEXT_*` struct holding the
//! captured register state, named and laid out after the conventional
//! CONTEXT records crash reporters emit. [`CpuContext`] provides uniform
//! by-name register access over them, which is what lets the call-frame-info
//! machinery stay architecture-generic: symbol files talk about registers
//! as strings (`$esp`, `x29`, `ra`), and the unwinders resolve those names
//! against these structs.
//!
//! Downstream code must never read a register whose name is absent from a
//! frame's [`ContextValidity`]; only the innermost frame of a walk has all
//! registers valid.

#![allow(non_camel_case_types)]

use smart_default::SmartDefault;
use std::collections::HashSet;

/// Which registers of a [`Context`] hold known-good values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValidity {
    /// All registers are valid. This is only ever true for the register
    /// state captured in the snapshot itself.
    All,
    /// Only the named registers are valid. Stack unwinding recovers a
    /// subset of the caller's registers, and everything it does not
    /// recover is unknown.
    Some(HashSet<&'static str>),
}

/// Uniform by-name register access over an architecture's context struct.
pub trait CpuContext {
    /// The word size of general-purpose registers.
    type Register: Copy;

    /// The general-purpose registers of this architecture, in canonical
    /// name form.
    fn registers(&self) -> &'static [&'static str];

    /// Map a register name, possibly an alias like `"r11"` for `"fp"`,
    /// to its canonical `'static` name.
    fn memoize_register(&self, reg: &str) -> Option<&'static str>;

    /// Get a register value regardless of whether it is valid.
    ///
    /// Panics on an unknown register name; callers are expected to only
    /// pass names from [`CpuContext::registers`] or successfully memoized
    /// names.
    fn get_register_always(&self, reg: &str) -> Self::Register;

    /// Get a register value if it is valid in `valid`.
    fn get_register(&self, reg: &str, valid: &ContextValidity) -> Option<Self::Register> {
        match valid {
            ContextValidity::All => Some(self.get_register_always(reg)),
            ContextValidity::Some(which) => {
                if which.contains(reg) {
                    Some(self.get_register_always(reg))
                } else {
                    None
                }
            }
        }
    }

    /// Set a register value, if that register exists.
    fn set_register(&mut self, reg: &str, val: Self::Register) -> Option<()>;

    /// The name of the register holding the stack pointer.
    fn stack_pointer_register_name(&self) -> &'static str;

    /// The name of the register holding the instruction pointer.
    fn instruction_pointer_register_name(&self) -> &'static str;
}

fn memoize(regs: &'static [&'static str], reg: &str) -> Option<&'static str> {
    regs.iter().find(|&&r| r == reg).copied()
}

/// x86 floating point state.
#[derive(Clone, SmartDefault)]
pub struct FLOATING_SAVE_AREA_X86 {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    #[default([0; 80])]
    pub register_area: [u8; 80],
    pub cr0_npx_state: u32,
}

/// An x86 CPU context.
#[derive(Clone, SmartDefault)]
pub struct CONTEXT_X86 {
    pub context_flags: u32,
    pub float_save: FLOATING_SAVE_AREA_X86,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

static X86_REGS: [&str; 10] = [
    "eip", "esp", "ebp", "ebx", "edi", "esi", "eax", "ecx", "edx", "eflags",
];

impl CpuContext for CONTEXT_X86 {
    type Register = u32;

    fn registers(&self) -> &'static [&'static str] {
        &X86_REGS
    }

    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        memoize(&X86_REGS, reg)
    }

    fn get_register_always(&self, reg: &str) -> u32 {
        match reg {
            "eip" => self.eip,
            "esp" => self.esp,
            "ebp" => self.ebp,
            "ebx" => self.ebx,
            "edi" => self.edi,
            "esi" => self.esi,
            "eax" => self.eax,
            "ecx" => self.ecx,
            "edx" => self.edx,
            "eflags" => self.eflags,
            _ => unreachable!("Invalid x86 register: {}", reg),
        }
    }

    fn set_register(&mut self, reg: &str, val: u32) -> Option<()> {
        match reg {
            "eip" => self.eip = val,
            "esp" => self.esp = val,
            "ebp" => self.ebp = val,
            "ebx" => self.ebx = val,
            "edi" => self.edi = val,
            "esi" => self.esi = val,
            "eax" => self.eax = val,
            "ecx" => self.ecx = val,
            "edx" => self.edx = val,
            "eflags" => self.eflags = val,
            _ => return None,
        }
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "esp"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "eip"
    }
}

/// An x86-64 (amd64) CPU context.
#[derive(Clone, SmartDefault)]
pub struct CONTEXT_AMD64 {
    pub context_flags: u32,
    pub mx_csr: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub eflags: u32,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    #[default([0; 512])]
    pub float_save: [u8; 512],
}

static AMD64_REGS: [&str; 17] = [
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

impl CpuContext for CONTEXT_AMD64 {
    type Register = u64;

    fn registers(&self) -> &'static [&'static str] {
        &AMD64_REGS
    }

    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        memoize(&AMD64_REGS, reg)
    }

    fn get_register_always(&self, reg: &str) -> u64 {
        match reg {
            "rax" => self.rax,
            "rdx" => self.rdx,
            "rcx" => self.rcx,
            "rbx" => self.rbx,
            "rsi" => self.rsi,
            "rdi" => self.rdi,
            "rbp" => self.rbp,
            "rsp" => self.rsp,
            "r8" => self.r8,
            "r9" => self.r9,
            "r10" => self.r10,
            "r11" => self.r11,
            "r12" => self.r12,
            "r13" => self.r13,
            "r14" => self.r14,
            "r15" => self.r15,
            "rip" => self.rip,
            _ => unreachable!("Invalid amd64 register: {}", reg),
        }
    }

    fn set_register(&mut self, reg: &str, val: u64) -> Option<()> {
        match reg {
            "rax" => self.rax = val,
            "rdx" => self.rdx = val,
            "rcx" => self.rcx = val,
            "rbx" => self.rbx = val,
            "rsi" => self.rsi = val,
            "rdi" => self.rdi = val,
            "rbp" => self.rbp = val,
            "rsp" => self.rsp = val,
            "r8" => self.r8 = val,
            "r9" => self.r9 = val,
            "r10" => self.r10 = val,
            "r11" => self.r11 = val,
            "r12" => self.r12 = val,
            "r13" => self.r13 = val,
            "r14" => self.r14 = val,
            "r15" => self.r15 = val,
            "rip" => self.rip = val,
            _ => return None,
        }
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "rsp"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "rip"
    }
}

/// An ARM CPU context.
#[derive(Clone, Default)]
pub struct CONTEXT_ARM {
    pub context_flags: u32,
    pub iregs: [u32; 16],
    pub cpsr: u32,
}

/// Offsets into `CONTEXT_ARM.iregs` for registers with a dedicated or
/// conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ArmRegisterNumbers {
    IosFramePointer = 7,
    FramePointer = 11,
    StackPointer = 13,
    LinkRegister = 14,
    ProgramCounter = 15,
}

impl ArmRegisterNumbers {
    pub const fn name(self) -> &'static str {
        match self {
            Self::IosFramePointer => "r7",
            Self::FramePointer => "fp",
            Self::StackPointer => "sp",
            Self::LinkRegister => "lr",
            Self::ProgramCounter => "pc",
        }
    }
}

static ARM_REGS: [&str; 16] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "fp", "r12", "sp", "lr",
    "pc",
];

fn arm_canonical(reg: &str) -> &str {
    match reg {
        "r11" => "fp",
        "r13" => "sp",
        "r14" => "lr",
        "r15" => "pc",
        other => other,
    }
}

impl CpuContext for CONTEXT_ARM {
    type Register = u32;

    fn registers(&self) -> &'static [&'static str] {
        &ARM_REGS
    }

    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        memoize(&ARM_REGS, arm_canonical(reg))
    }

    fn get_register_always(&self, reg: &str) -> u32 {
        let index = ARM_REGS
            .iter()
            .position(|&r| r == arm_canonical(reg))
            .unwrap_or_else(|| unreachable!("Invalid arm register: {}", reg));
        self.iregs[index]
    }

    fn set_register(&mut self, reg: &str, val: u32) -> Option<()> {
        let index = ARM_REGS.iter().position(|&r| r == arm_canonical(reg))?;
        self.iregs[index] = val;
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "sp"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "pc"
    }
}

/// An aarch64 (arm64) CPU context.
#[derive(Clone, Default)]
pub struct CONTEXT_ARM64 {
    pub context_flags: u32,
    pub cpsr: u32,
    pub iregs: [u64; 32],
    pub pc: u64,
}

/// Offsets into `CONTEXT_ARM64.iregs` for registers with a dedicated or
/// conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Arm64RegisterNumbers {
    FramePointer = 29,
    LinkRegister = 30,
    StackPointer = 31,
    ProgramCounter = 32,
}

impl Arm64RegisterNumbers {
    pub const fn name(self) -> &'static str {
        match self {
            Self::FramePointer => "fp",
            Self::LinkRegister => "lr",
            Self::StackPointer => "sp",
            Self::ProgramCounter => "pc",
        }
    }
}

static ARM64_REGS: [&str; 33] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "fp", "lr", "sp", "pc",
];

fn arm64_canonical(reg: &str) -> &str {
    match reg {
        "x29" => "fp",
        "x30" => "lr",
        other => other,
    }
}

impl CpuContext for CONTEXT_ARM64 {
    type Register = u64;

    fn registers(&self) -> &'static [&'static str] {
        &ARM64_REGS
    }

    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        memoize(&ARM64_REGS, arm64_canonical(reg))
    }

    fn get_register_always(&self, reg: &str) -> u64 {
        let index = ARM64_REGS
            .iter()
            .position(|&r| r == arm64_canonical(reg))
            .unwrap_or_else(|| unreachable!("Invalid arm64 register: {}", reg));
        if index == Arm64RegisterNumbers::ProgramCounter as usize {
            self.pc
        } else {
            self.iregs[index]
        }
    }

    fn set_register(&mut self, reg: &str, val: u64) -> Option<()> {
        let index = ARM64_REGS.iter().position(|&r| r == arm64_canonical(reg))?;
        if index == Arm64RegisterNumbers::ProgramCounter as usize {
            self.pc = val;
        } else {
            self.iregs[index] = val;
        }
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "sp"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "pc"
    }
}

/// A MIPS CPU context.
#[derive(Clone, Default)]
pub struct CONTEXT_MIPS {
    pub context_flags: u32,
    pub iregs: [u64; 32],
    pub mdhi: u64,
    pub mdlo: u64,
    pub epc: u64,
    pub badvaddr: u64,
    pub status: u32,
    pub cause: u32,
}

/// Offsets into `CONTEXT_MIPS.iregs` for registers with a dedicated or
/// conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum MipsRegisterNumbers {
    S0 = 16,
    S1 = 17,
    S2 = 18,
    S3 = 19,
    S4 = 20,
    S5 = 21,
    S6 = 22,
    S7 = 23,
    GlobalPointer = 28,
    StackPointer = 29,
    FramePointer = 30,
    ReturnAddress = 31,
}

impl MipsRegisterNumbers {
    pub const fn name(self) -> &'static str {
        match self {
            Self::S0 => "s0",
            Self::S1 => "s1",
            Self::S2 => "s2",
            Self::S3 => "s3",
            Self::S4 => "s4",
            Self::S5 => "s5",
            Self::S6 => "s6",
            Self::S7 => "s7",
            Self::GlobalPointer => "gp",
            Self::StackPointer => "sp",
            Self::FramePointer => "fp",
            Self::ReturnAddress => "ra",
        }
    }
}

static MIPS_REGS: [&str; 33] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp",
    "fp", "ra", "pc",
];

impl CpuContext for CONTEXT_MIPS {
    type Register = u64;

    fn registers(&self) -> &'static [&'static str] {
        &MIPS_REGS
    }

    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        memoize(&MIPS_REGS, reg)
    }

    fn get_register_always(&self, reg: &str) -> u64 {
        let index = MIPS_REGS
            .iter()
            .position(|&r| r == reg)
            .unwrap_or_else(|| unreachable!("Invalid mips register: {}", reg));
        if index == 32 {
            self.epc
        } else {
            self.iregs[index]
        }
    }

    fn set_register(&mut self, reg: &str, val: u64) -> Option<()> {
        let index = MIPS_REGS.iter().position(|&r| r == reg)?;
        if index == 32 {
            self.epc = val;
        } else {
            self.iregs[index] = val;
        }
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "sp"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "pc"
    }
}

/// A PPC CPU context.
#[derive(Clone, Default)]
pub struct CONTEXT_PPC {
    pub context_flags: u32,
    pub srr0: u32,
    pub srr1: u32,
    pub gpr: [u32; 32],
    pub cr: u32,
    pub xer: u32,
    pub lr: u32,
    pub ctr: u32,
}

/// Offsets into `CONTEXT_PPC.gpr` for registers with a dedicated or
/// conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum PpcRegisterNumbers {
    StackPointer = 1,
}

impl PpcRegisterNumbers {
    pub const fn name(self) -> &'static str {
        match self {
            Self::StackPointer => "r1",
        }
    }
}

static PPC_REGS: [&str; 35] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26",
    "r27", "r28", "r29", "r30", "r31", "pc", "lr", "ctr",
];

impl CpuContext for CONTEXT_PPC {
    type Register = u32;

    fn registers(&self) -> &'static [&'static str] {
        &PPC_REGS
    }

    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        memoize(&PPC_REGS, reg)
    }

    fn get_register_always(&self, reg: &str) -> u32 {
        match reg {
            "pc" => self.srr0,
            "lr" => self.lr,
            "ctr" => self.ctr,
            _ => {
                let index = PPC_REGS
                    .iter()
                    .position(|&r| r == reg)
                    .unwrap_or_else(|| unreachable!("Invalid ppc register: {}", reg));
                self.gpr[index]
            }
        }
    }

    fn set_register(&mut self, reg: &str, val: u32) -> Option<()> {
        match reg {
            "pc" => self.srr0 = val,
            "lr" => self.lr = val,
            "ctr" => self.ctr = val,
            _ => {
                let index = PPC_REGS.iter().position(|&r| r == reg)?;
                if index >= 32 {
                    return None;
                }
                self.gpr[index] = val;
            }
        }
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "r1"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "pc"
    }
}

/// A SPARC CPU context.
#[derive(Clone, Default)]
pub struct CONTEXT_SPARC {
    pub context_flags: u32,
    pub g_r: [u64; 32],
    pub ccr: u64,
    pub pc: u64,
    pub npc: u64,
    pub y: u64,
}

/// Offsets into `CONTEXT_SPARC.g_r` for registers with a dedicated or
/// conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum SparcRegisterNumbers {
    StackPointer = 14,
    FramePointer = 30,
}

impl SparcRegisterNumbers {
    pub const fn name(self) -> &'static str {
        match self {
            Self::StackPointer => "sp",
            Self::FramePointer => "fp",
        }
    }
}

static SPARC_REGS: [&str; 33] = [
    "g0", "g1", "g2", "g3", "g4", "g5", "g6", "g7", "o0", "o1", "o2", "o3", "o4", "o5", "sp",
    "o7", "l0", "l1", "l2", "l3", "l4", "l5", "l6", "l7", "i0", "i1", "i2", "i3", "i4", "i5",
    "fp", "i7", "pc",
];

fn sparc_canonical(reg: &str) -> &str {
    match reg {
        "o6" => "sp",
        "i6" => "fp",
        other => other,
    }
}

impl CpuContext for CONTEXT_SPARC {
    type Register = u64;

    fn registers(&self) -> &'static [&'static str] {
        &SPARC_REGS
    }

    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        memoize(&SPARC_REGS, sparc_canonical(reg))
    }

    fn get_register_always(&self, reg: &str) -> u64 {
        let index = SPARC_REGS
            .iter()
            .position(|&r| r == sparc_canonical(reg))
            .unwrap_or_else(|| unreachable!("Invalid sparc register: {}", reg));
        if index == 32 {
            self.pc
        } else {
            self.g_r[index]
        }
    }

    fn set_register(&mut self, reg: &str, val: u64) -> Option<()> {
        let index = SPARC_REGS
            .iter()
            .position(|&r| r == sparc_canonical(reg))?;
        if index == 32 {
            self.pc = val;
        } else {
            self.g_r[index] = val;
        }
        Some(())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        "sp"
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        "pc"
    }
}

/// The architecture-specific register state captured for a thread.
#[derive(Clone)]
pub enum RawContext {
    X86(CONTEXT_X86),
    Amd64(CONTEXT_AMD64),
    Arm(CONTEXT_ARM),
    Arm64(CONTEXT_ARM64),
    Ppc(CONTEXT_PPC),
    Sparc(CONTEXT_SPARC),
    Mips(CONTEXT_MIPS),
}

impl std::fmt::Debug for RawContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arch = match self {
            RawContext::X86(_) => "x86",
            RawContext::Amd64(_) => "amd64",
            RawContext::Arm(_) => "arm",
            RawContext::Arm64(_) => "arm64",
            RawContext::Ppc(_) => "ppc",
            RawContext::Sparc(_) => "sparc",
            RawContext::Mips(_) => "mips",
        };
        f.debug_struct("RawContext").field("arch", &arch).finish()
    }
}

/// A CPU context with a record of which registers are valid.
#[derive(Debug, Clone)]
pub struct Context {
    pub raw: RawContext,
    pub valid: ContextValidity,
}

impl Context {
    /// Wrap a raw context captured from a snapshot; all registers are
    /// considered valid.
    pub fn from_raw(raw: RawContext) -> Context {
        Context {
            raw,
            valid: ContextValidity::All,
        }
    }

    /// The instruction pointer of this context.
    pub fn get_instruction_pointer(&self) -> u64 {
        match &self.raw {
            RawContext::X86(ctx) => ctx.eip as u64,
            RawContext::Amd64(ctx) => ctx.rip,
            RawContext::Arm(ctx) => ctx.iregs[ArmRegisterNumbers::ProgramCounter as usize] as u64,
            RawContext::Arm64(ctx) => ctx.pc,
            RawContext::Ppc(ctx) => ctx.srr0 as u64,
            RawContext::Sparc(ctx) => ctx.pc,
            RawContext::Mips(ctx) => ctx.epc,
        }
    }

    /// The stack pointer of this context.
    pub fn get_stack_pointer(&self) -> u64 {
        match &self.raw {
            RawContext::X86(ctx) => ctx.esp as u64,
            RawContext::Amd64(ctx) => ctx.rsp,
            RawContext::Arm(ctx) => ctx.iregs[ArmRegisterNumbers::StackPointer as usize] as u64,
            RawContext::Arm64(ctx) => ctx.iregs[Arm64RegisterNumbers::StackPointer as usize],
            RawContext::Ppc(ctx) => ctx.gpr[PpcRegisterNumbers::StackPointer as usize] as u64,
            RawContext::Sparc(ctx) => ctx.g_r[SparcRegisterNumbers::StackPointer as usize],
            RawContext::Mips(ctx) => ctx.iregs[MipsRegisterNumbers::StackPointer as usize],
        }
    }
}
