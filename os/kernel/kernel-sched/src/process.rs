use crate::args::ArgumentImage;
use crate::context::SavedContext;
use crate::fs::DescriptorTable;
use crate::pid::Pid;
use alloc::boxed::Box;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PageDirectory;

/// Lifecycle state of a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessStatus {
    /// Created, never dispatched.
    Initialized,
    /// Executing, or preempted while executing.
    Running,
    Waiting,
    Stopped,
    /// Terminated; kept until reaped so the exit code stays readable.
    Finished,
    /// Forked child awaiting its first dispatch.
    Forked,
}

impl ProcessStatus {
    /// Whether the dispatcher may pick a process in this state.
    #[must_use]
    pub const fn is_dispatchable(self) -> bool {
        matches!(self, Self::Running | Self::Initialized | Self::Forked)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Stopped => "stopped",
            Self::Finished => "finished",
            Self::Forked => "forked",
        };
        f.pad(name)
    }
}

/// Where a process's stack lives: `[base, base + size)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StackRegion {
    pub base: VirtualAddress,
    pub size: u32,
}

impl StackRegion {
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u32) -> Self {
        Self { base, size }
    }

    /// One past the highest stack byte.
    #[must_use]
    pub const fn top(self) -> u32 {
        self.base.as_u32().wrapping_add(self.size)
    }

    #[must_use]
    pub const fn pages(self) -> u32 {
        self.size.div_ceil(4096)
    }

    #[must_use]
    pub const fn contains(self, address: u32) -> bool {
        address >= self.base.as_u32() && address - self.base.as_u32() < self.size
    }
}

/// Entry point while alive, exit code once finished.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessCode {
    Entry(VirtualAddress),
    Exit(i32),
}

/// Process control block.
pub struct Process {
    pub(crate) pid: Pid,
    pub(crate) parent: Option<Pid>,
    pub(crate) status: ProcessStatus,
    /// Status to return to when woken from `Waiting` or `Stopped`.
    pub(crate) parked_from: Option<ProcessStatus>,
    /// Valid while the process is not running.
    pub(crate) context: SavedContext,
    pub(crate) stack: StackRegion,
    pub(crate) code: ProcessCode,
    pub(crate) descriptors: DescriptorTable,
    /// `None` for the bootstrap process, which runs in the kernel directory,
    /// and after the address space is freed.
    pub(crate) directory: Option<Box<PageDirectory>>,
    /// Stack contents to install on first dispatch.
    pub(crate) arguments: Option<ArgumentImage>,
}

impl Process {
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub const fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[must_use]
    pub const fn status(&self) -> ProcessStatus {
        self.status
    }

    #[must_use]
    pub const fn context(&self) -> &SavedContext {
        &self.context
    }

    /// Where the architecture code saves this process's registers.
    pub const fn context_mut(&mut self) -> &mut SavedContext {
        &mut self.context
    }

    #[must_use]
    pub const fn stack(&self) -> StackRegion {
        self.stack
    }

    #[must_use]
    pub const fn code(&self) -> ProcessCode {
        self.code
    }

    /// The exit code, once finished.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self.code {
            ProcessCode::Exit(code) => Some(code),
            ProcessCode::Entry(_) => None,
        }
    }

    #[must_use]
    pub const fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    #[must_use]
    pub fn directory(&self) -> Option<&PageDirectory> {
        self.directory.as_deref()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("stack", &self.stack)
            .field("code", &self.code)
            .field("descriptors", &self.descriptors.len())
            .field(
                "directory",
                &self.directory.as_ref().map(|d| d.physical_address()),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_region_bounds() {
        let stack = StackRegion::new(VirtualAddress::new(0xBFFF_C000), 0x4000);
        assert_eq!(stack.top(), 0xC000_0000);
        assert_eq!(stack.pages(), 4);
        assert!(stack.contains(0xBFFF_C000));
        assert!(stack.contains(0xBFFF_FFFF));
        assert!(!stack.contains(0xC000_0000));
        assert!(!stack.contains(0xBFFF_BFFF));
    }

    #[test]
    fn only_runnable_states_are_dispatchable() {
        assert!(ProcessStatus::Running.is_dispatchable());
        assert!(ProcessStatus::Initialized.is_dispatchable());
        assert!(ProcessStatus::Forked.is_dispatchable());
        assert!(!ProcessStatus::Waiting.is_dispatchable());
        assert!(!ProcessStatus::Stopped.is_dispatchable());
        assert!(!ProcessStatus::Finished.is_dispatchable());
    }
}
