//! Whole-process analysis: walks every thread of a captured snapshot and
//! assembles the results into a [`ProcessState`].

use crate::system_info::SystemInfo;
use crate::{
    walk_stack, CallStack, CallStackInfo, SymbolProvider, WalkInterrupted, WalkOptions,
};
use corewalk_common::{Context, ModuleList, StackMemory};
use std::collections::BTreeSet;
use std::time::SystemTime;
use tracing::trace;

/// The captured state of one thread.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    /// The identifier of the thread.
    pub thread_id: u32,
    /// The name of the thread, if known.
    pub name: Option<String>,
    /// The thread's register state, if it was captured.
    pub context: Option<Context>,
    /// The base address of the captured stack memory.
    pub stack_base: u64,
    /// The captured stack memory, starting at `stack_base`.
    pub stack: Vec<u8>,
}

impl ThreadSnapshot {
    fn stack_memory(&self) -> Option<StackMemory<'_>> {
        if self.stack.is_empty() {
            None
        } else {
            Some(StackMemory::new(self.stack_base, &self.stack))
        }
    }
}

/// Everything captured from the crashed process that stack walking needs.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    /// When the snapshot was taken.
    pub time: SystemTime,
    /// Information about the system that produced the snapshot.
    pub system_info: Option<SystemInfo>,
    /// The threads of the process. A snapshot with no thread list at all
    /// cannot be processed.
    pub threads: Option<Vec<ThreadSnapshot>>,
    /// The modules that were loaded into the process.
    pub modules: ModuleList,
    /// A string describing why the snapshot was taken, if it was taken in
    /// response to a crash.
    pub crash_reason: Option<String>,
    /// The address associated with the crash, like the address that was
    /// faultily dereferenced.
    pub crash_address: Option<u64>,
    /// The register state at the point of the exception, which supersedes
    /// the requesting thread's own captured context (that context is
    /// inside the handler that wrote the snapshot, not at the fault).
    pub exception_context: Option<Context>,
    /// The thread that wrote the snapshot.
    pub dump_thread_id: Option<u32>,
    /// The thread that requested the snapshot be taken; for a crash this
    /// is the crashing thread.
    pub requesting_thread_id: Option<u32>,
}

/// The state of a process as reconstructed from a snapshot.
#[derive(Debug, Clone)]
pub struct ProcessState {
    /// When the snapshot was taken.
    pub time: SystemTime,
    /// A string describing why the snapshot was taken, if it was taken in
    /// response to a crash.
    pub crash_reason: Option<String>,
    /// The address associated with the crash.
    pub crash_address: Option<u64>,
    /// The index into `threads` of the thread that requested the
    /// snapshot.
    pub requesting_thread: Option<usize>,
    /// Information about the system that produced the snapshot.
    pub system_info: SystemInfo,
    /// The reconstructed call stacks, one per thread, in the snapshot's
    /// thread order.
    pub threads: Vec<CallStack>,
    /// The modules that were loaded into the process.
    pub modules: ModuleList,
    /// Code files of modules that frames landed in but for which no
    /// symbols could be found.
    pub modules_without_symbols: BTreeSet<String>,
    /// Code files of modules whose symbols were found but too corrupt to
    /// use.
    pub modules_with_corrupt_symbols: BTreeSet<String>,
}

/// An error encountered during processing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("the snapshot has no thread list")]
    MissingThreadList,
    #[error("the snapshot has no system info")]
    MissingSystemInfo,
    #[error("symbol loading was interrupted")]
    Interrupted,
}

impl From<WalkInterrupted> for ProcessError {
    fn from(_: WalkInterrupted) -> ProcessError {
        ProcessError::Interrupted
    }
}

/// Walk the stack of every thread in `snapshot` and assemble a
/// [`ProcessState`].
///
/// The thread that wrote the snapshot is not walked (its stack only
/// describes the writing machinery) unless it is also the requesting
/// thread; its `CallStack` is flagged
/// [`CallStackInfo::DumpThreadSkipped`]. The requesting thread is walked
/// from the exception context when one is present.
pub fn process_snapshot<P>(
    snapshot: &ProcessSnapshot,
    options: &WalkOptions,
    symbol_provider: &P,
) -> Result<ProcessState, ProcessError>
where
    P: SymbolProvider,
{
    let system_info = snapshot
        .system_info
        .clone()
        .ok_or(ProcessError::MissingSystemInfo)?;
    let threads = snapshot
        .threads
        .as_ref()
        .ok_or(ProcessError::MissingThreadList)?;

    let mut requesting_thread = None;
    let mut stacks = Vec::with_capacity(threads.len());
    let mut modules_without_symbols = BTreeSet::new();
    let mut modules_with_corrupt_symbols = BTreeSet::new();

    for (i, thread) in threads.iter().enumerate() {
        let is_requesting = snapshot.requesting_thread_id == Some(thread.thread_id);
        if is_requesting {
            requesting_thread = Some(i);
        }

        if snapshot.dump_thread_id == Some(thread.thread_id) && !is_requesting {
            trace!("skipping thread {} (wrote the snapshot)", thread.thread_id);
            stacks.push(CallStack::with_info(
                thread.thread_id,
                CallStackInfo::DumpThreadSkipped,
            ));
            continue;
        }

        // The requesting thread's own context was captured inside the
        // machinery that wrote the snapshot; the exception context is
        // where the crash actually happened.
        let context = if is_requesting && snapshot.exception_context.is_some() {
            snapshot.exception_context.clone()
        } else {
            thread.context.clone()
        };

        trace!("walking thread {}", thread.thread_id);
        let walked = walk_stack(
            context,
            thread.stack_memory(),
            &snapshot.modules,
            &system_info,
            options,
            symbol_provider,
        )?;

        let mut stack = walked.stack;
        stack.thread_id = thread.thread_id;
        stack.thread_name = thread.name.clone();
        stacks.push(stack);
        modules_without_symbols.extend(walked.modules_without_symbols);
        modules_with_corrupt_symbols.extend(walked.modules_with_corrupt_symbols);
    }

    Ok(ProcessState {
        time: snapshot.time,
        crash_reason: snapshot.crash_reason.clone(),
        crash_address: snapshot.crash_address,
        requesting_thread,
        system_info,
        threads: stacks,
        modules: snapshot.modules.clone(),
        modules_without_symbols,
        modules_with_corrupt_symbols,
    })
}
