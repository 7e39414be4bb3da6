//! # Round-Robin Scheduler
//!
//! Processes sit in one list headed by the bootstrap process. On every timer
//! tick the dispatcher walks the list from the process after the current
//! one, wrapping at the end, and picks the first process that is running,
//! newly created, or freshly forked. There are no priorities.
//!
//! The scheduler never switches stacks itself. [`Scheduler::timer_tick`]
//! makes the target address space live and returns a [`Dispatch`] telling
//! the architecture code how to continue.

use crate::args::{ArgumentImage, TaskArgs};
use crate::context::{Dispatch, EntryFrame, SavedContext};
use crate::fs::{DescriptorError, DescriptorTable, FileError, FileSystem, OpenFile, OpenFlags, SeekFrom};
use crate::pid::Pid;
use crate::platform::{Cpu, MemoryContext};
use crate::process::{Process, ProcessCode, ProcessStatus, StackRegion};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::{DEFAULT_STACK_SIZE, PROCESS_STACK_TOP};
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_vmem::{MapError, MapFlags, PageDirectory};

/// Stack bytes kept free below the arguments for the entry call frame:
/// alignment padding, `argc`, `argv`, `envp` and the return address.
const ENTRY_FRAME_RESERVE: usize = 32;

/// Parameters of a new process.
pub struct TaskSpec {
    pub entry: VirtualAddress,
    /// Rounded up to whole pages; zero selects [`DEFAULT_STACK_SIZE`].
    pub stack_size: u32,
    /// The process's address space, typically prepared by a program loader
    /// starting from [`Scheduler::new_address_space`].
    pub directory: PageDirectory,
    pub args: TaskArgs,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("arguments need {needed} bytes but the stack holds {available}")]
    ArgumentsTooLarge { needed: usize, available: usize },
    #[error("a stack of {0:#x} bytes does not fit below the kernel")]
    StackTooLarge(u32),
    #[error("cannot map the process stack: {0}")]
    Map(#[from] MapError),
}

/// Process list and dispatcher.
pub struct Scheduler<Mem: MemoryContext, F: FileSystem> {
    /// Linked processes in dispatch order; index 0 is the bootstrap process.
    processes: Vec<Box<Process>>,
    /// Terminated processes awaiting [`reap`](Self::reap).
    finished: Vec<Box<Process>>,
    /// Index of the current process, or of its successor once the current
    /// process has been unlinked.
    current: usize,
    current_unlinked: bool,
    next_pid: u32,
    ticks: u64,
    memory: Mem,
    fs: F,
}

impl<Mem: MemoryContext, F: FileSystem> Scheduler<Mem, F> {
    /// A scheduler whose only process is the running kernel itself.
    pub fn new(memory: Mem, fs: F, boot_stack: StackRegion) -> Self {
        let bootstrap = Process {
            pid: Pid::BOOTSTRAP,
            parent: None,
            status: ProcessStatus::Running,
            parked_from: None,
            context: SavedContext::default(),
            stack: boot_stack,
            code: ProcessCode::Entry(VirtualAddress::zero()),
            descriptors: DescriptorTable::new(),
            directory: None,
            arguments: None,
        };
        Self {
            processes: vec![Box::new(bootstrap)],
            finished: Vec::new(),
            current: 0,
            current_unlinked: false,
            next_pid: 1,
            ticks: 0,
            memory,
            fs,
        }
    }

    pub const fn memory(&mut self) -> &mut Mem {
        &mut self.memory
    }

    pub const fn fs(&mut self) -> &mut F {
        &mut self.fs
    }

    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Pids of the linked processes in dispatch order.
    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.processes.iter().map(|p| p.pid)
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn index_of(&self, pid: Pid) -> Option<usize> {
        self.processes.iter().position(|p| p.pid == pid)
    }

    /// A fresh address space holding only the kernel mappings.
    pub fn new_address_space(&mut self) -> PageDirectory {
        self.memory.with_memory(|m| m.new_address_space())
    }

    fn discard_address_space(&mut self, directory: PageDirectory) {
        self.memory.with_memory(|m| m.free_directory(directory));
    }

    /// Create a process that starts at `spec.entry` on its first dispatch.
    ///
    /// The stack is mapped at the top of the process's address space and
    /// open descriptors of the current process are inherited.
    ///
    /// # Errors
    /// [`TaskError`] if the stack cannot hold the arguments or cannot be
    /// mapped. The address space is freed in that case.
    pub fn create_task<C: Cpu>(&mut self, cpu: &mut C, spec: TaskSpec) -> Result<Pid, TaskError> {
        let TaskSpec {
            entry,
            stack_size,
            mut directory,
            args,
        } = spec;

        let requested = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let Some(size) = requested
            .checked_next_multiple_of(Size4K::SIZE)
            .filter(|size| *size <= PROCESS_STACK_TOP)
        else {
            self.discard_address_space(directory);
            return Err(TaskError::StackTooLarge(stack_size));
        };
        let stack = StackRegion::new(VirtualAddress::new(PROCESS_STACK_TOP - size), size);

        let image = ArgumentImage::build(&args, stack.top());
        let needed = image
            .as_ref()
            .map_or(usize::MAX, |image| image.len() + ENTRY_FRAME_RESERVE);
        let (Some(image), true) = (image, needed <= size as usize) else {
            self.discard_address_space(directory);
            return Err(TaskError::ArgumentsTooLarge {
                needed,
                available: size as usize,
            });
        };

        let mapped = self
            .memory
            .with_memory(|m| m.map_anonymous(&mut directory, stack.base, stack.pages(), MapFlags::PRIVATE));
        if let Err(e) = mapped {
            self.discard_address_space(directory);
            return Err(e.into());
        }

        let parent = if self.current_unlinked {
            &self.processes[0]
        } else {
            &self.processes[self.current]
        };
        let parent_pid = parent.pid;
        let descriptors = inherit_descriptors(&mut self.fs, &parent.descriptors);

        let pid = self.allocate_pid();
        let process = Box::new(Process {
            pid,
            parent: Some(parent_pid),
            status: ProcessStatus::Initialized,
            parked_from: None,
            context: SavedContext::default(),
            stack,
            code: ProcessCode::Entry(entry),
            descriptors,
            directory: Some(Box::new(directory)),
            arguments: Some(image),
        });
        cpu.without_interrupts(|_| self.processes.push(process));

        log::info!(
            "created {pid} (parent {parent_pid}): entry {entry}, stack {:#x}..{:#x}",
            stack.base.as_u32(),
            stack.top()
        );
        Ok(pid)
    }

    /// Duplicate the current process.
    ///
    /// `context` is where the caller will continue: the child is dispatched
    /// by jumping to it. The address space is copied eagerly, live stack
    /// included, and descriptors are inherited.
    ///
    /// # Panics
    /// When called from the bootstrap process or with a stack pointer
    /// outside the caller's stack.
    pub fn fork<C: Cpu>(&mut self, cpu: &mut C, context: SavedContext) -> Pid {
        cpu.without_interrupts(|_| self.fork_current(context))
    }

    fn fork_current(&mut self, context: SavedContext) -> Pid {
        assert!(!self.current_unlinked, "fork without a current process");
        let parent = &mut self.processes[self.current];
        let (parent_pid, stack, code) = (parent.pid, parent.stack, parent.code);
        let Some(parent_directory) = parent.directory.as_deref_mut() else {
            panic!("{parent_pid} cannot fork: its stack lives in the shared kernel region");
        };
        assert!(
            stack.contains(context.esp),
            "fork with stack pointer {:#x} outside the stack of {parent_pid}",
            context.esp
        );

        let directory = self.memory.with_memory(|m| m.clone_directory(parent_directory));
        let descriptors = inherit_descriptors(&mut self.fs, &parent.descriptors);

        let pid = self.allocate_pid();
        self.processes.push(Box::new(Process {
            pid,
            parent: Some(parent_pid),
            status: ProcessStatus::Forked,
            parked_from: None,
            context,
            stack,
            code,
            descriptors,
            directory: Some(Box::new(directory)),
            arguments: None,
        }));
        log::info!(
            "forked {parent_pid} into {pid}, resuming at {:#x}, {} live stack bytes",
            context.eip,
            stack.top() - context.esp
        );
        pid
    }

    fn select_next(&self) -> Option<usize> {
        let len = self.processes.len();
        let start = if self.current_unlinked {
            self.current
        } else {
            self.current + 1
        };
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| self.processes[index].status.is_dispatchable())
    }

    /// Timer interrupt: acknowledge it, checkpoint the interrupted process
    /// and pick the next one.
    ///
    /// The chosen process's address space is live when this returns.
    ///
    /// # Panics
    /// If a new process's argument stack is not mapped.
    pub fn timer_tick<C: Cpu>(&mut self, cpu: &mut C, interrupted: SavedContext) -> Dispatch {
        cpu.acknowledge_timer();
        self.ticks += 1;

        if !self.current_unlinked {
            // A process that parked itself ran until this tick.
            let current = &mut self.processes[self.current];
            if matches!(
                current.status,
                ProcessStatus::Running | ProcessStatus::Waiting | ProcessStatus::Stopped
            ) {
                current.context = interrupted;
            }
        }

        let Some(next) = self.select_next() else {
            log::trace!("tick {}: nothing to run", self.ticks);
            // The idle loop belongs to no process.
            if !self.current_unlinked {
                self.current = (self.current + 1) % self.processes.len();
                self.current_unlinked = true;
            }
            return Dispatch::Idle;
        };
        self.current = next;
        self.current_unlinked = false;

        let process = &mut self.processes[next];
        match process.directory.as_deref_mut() {
            // SAFETY: the directory is boxed in the PCB and only freed after
            // the kernel directory has been switched back in.
            Some(directory) => self.memory.with_memory(|m| unsafe { m.switch_to(directory, cpu) }),
            None => self.memory.with_memory(|m| m.switch_to_kernel(cpu)),
        }

        let pid = process.pid;
        let dispatch = match process.status {
            ProcessStatus::Initialized => {
                let ProcessCode::Entry(entry) = process.code else {
                    panic!("{pid} has no entry point");
                };
                let frame = match (process.arguments.take(), process.directory.as_deref()) {
                    (Some(image), Some(directory)) => {
                        self.memory
                            .with_memory(|m| m.write_bytes(directory, VirtualAddress::new(image.base()), image.bytes()))
                            .unwrap_or_else(|e| panic!("argument stack of {pid} is not mapped: {e}"));
                        image.entry_frame(entry.as_u32())
                    }
                    _ => EntryFrame {
                        entry: entry.as_u32(),
                        stack_pointer: process.stack.top() & !15,
                        ..EntryFrame::default()
                    },
                };
                process.status = ProcessStatus::Running;
                Dispatch::Enter(frame)
            }
            ProcessStatus::Forked => {
                process.status = ProcessStatus::Running;
                Dispatch::Jump(process.context)
            }
            ProcessStatus::Running => Dispatch::Resume(process.context),
            status => panic!("dispatched {pid} in state {status}"),
        };
        log::trace!("tick {}: {pid} -> {dispatch:?}", self.ticks);
        dispatch
    }

    fn unlink(&mut self, index: usize) -> Box<Process> {
        let process = self.processes.remove(index);
        if index < self.current {
            self.current -= 1;
        } else if index == self.current {
            self.current_unlinked = true;
        }
        if self.current >= self.processes.len() {
            self.current = 0;
        }
        process
    }

    /// End process `pid`: unlink it, close its descriptors, free its stack
    /// and address space, and keep the PCB with `exit_code` for
    /// [`reap`](Self::reap).
    ///
    /// # Panics
    /// For the bootstrap process or an unknown pid.
    pub fn free_process<C: Cpu>(&mut self, cpu: &mut C, pid: Pid, exit_code: i32) {
        assert!(!pid.is_bootstrap(), "the bootstrap process never terminates");
        let index = self
            .index_of(pid)
            .unwrap_or_else(|| panic!("{pid} is not in the process list"));
        let mut process = cpu.without_interrupts(|_| self.unlink(index));

        for (id, file) in process.descriptors.drain() {
            if let Err(e) = self.fs.close(file) {
                log::warn!("closing descriptor {id} of {pid} failed: {e}");
            }
        }

        if let Some(mut directory) = process.directory.take() {
            let stack = process.stack;
            cpu.without_interrupts(|cpu| {
                self.memory.with_memory(|m| {
                    m.unmap_range(&mut directory, stack.base, stack.pages(), cpu);
                    if m.vmm().is_active(&directory) {
                        m.switch_to_kernel(cpu);
                    }
                });
            });
            let directory = *directory;
            let released = self.memory.with_memory(|m| m.free_directory(directory));
            log::debug!(
                "{pid}: released {} frames and {} tables",
                released.frames + stack.pages() as usize,
                released.tables
            );
        }

        process.status = ProcessStatus::Finished;
        process.code = ProcessCode::Exit(exit_code);
        process.context = SavedContext::default();
        log::info!("{pid} exited with code {exit_code}");
        self.finished.push(process);
    }

    /// End the current process.
    ///
    /// # Panics
    /// If there is no current process or it is the bootstrap process.
    pub fn exit_current<C: Cpu>(&mut self, cpu: &mut C, exit_code: i32) {
        let pid = self.current_pid().unwrap_or_else(|| panic!("exit without a current process"));
        self.free_process(cpu, pid, exit_code);
    }

    /// Find a process, linked or finished.
    #[must_use]
    pub fn lookup(&self, pid: Pid) -> Option<&Process> {
        self.processes
            .iter()
            .chain(&self.finished)
            .find(|p| p.pid == pid)
            .map(|p| &**p)
    }

    pub fn lookup_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes
            .iter_mut()
            .chain(&mut self.finished)
            .find(|p| p.pid == pid)
            .map(|p| &mut **p)
    }

    #[must_use]
    pub fn current_pid(&self) -> Option<Pid> {
        (!self.current_unlinked).then(|| self.processes[self.current].pid)
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        if self.current_unlinked {
            None
        } else {
            Some(&mut self.processes[self.current])
        }
    }

    /// Park a process in `Waiting` or `Stopped`, or wake it with `Running`.
    /// A woken process continues in the state it was parked from.
    ///
    /// Returns `false` if `pid` is not linked.
    ///
    /// # Panics
    /// For states only the scheduler assigns.
    pub fn set_status(&mut self, pid: Pid, status: ProcessStatus) -> bool {
        let Some(process) = self.processes.iter_mut().find(|p| p.pid == pid) else {
            return false;
        };
        match status {
            ProcessStatus::Waiting | ProcessStatus::Stopped => {
                if process.status.is_dispatchable() {
                    process.parked_from = Some(process.status);
                }
                process.status = status;
            }
            ProcessStatus::Running => {
                if matches!(process.status, ProcessStatus::Waiting | ProcessStatus::Stopped) {
                    process.status = process.parked_from.take().unwrap_or(ProcessStatus::Running);
                }
            }
            ProcessStatus::Initialized | ProcessStatus::Forked | ProcessStatus::Finished => {
                panic!("{status} is assigned by the scheduler, not on request");
            }
        }
        log::debug!("{pid} is now {}", process.status);
        true
    }

    /// Drop the PCB of a finished process and return its exit code.
    pub fn reap(&mut self, pid: Pid) -> Option<i32> {
        let index = self.finished.iter().position(|p| p.pid == pid)?;
        let process = self.finished.swap_remove(index);
        log::debug!("reaped {pid}");
        process.exit_code()
    }

    /// Copy out of `pid`'s address space.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if part of the range is unmapped or `pid` has
    /// no address space of its own.
    pub fn read_memory(&mut self, pid: Pid, va: VirtualAddress, buf: &mut [u8]) -> Result<(), MapError> {
        let directory = self
            .processes
            .iter()
            .find(|p| p.pid == pid)
            .and_then(|p| p.directory.as_deref())
            .ok_or(MapError::NotMapped(va))?;
        self.memory.with_memory(|m| m.read_bytes(directory, va, buf))
    }

    /// Copy into `pid`'s address space.
    ///
    /// # Errors
    /// As [`read_memory`](Self::read_memory).
    pub fn write_memory(&mut self, pid: Pid, va: VirtualAddress, bytes: &[u8]) -> Result<(), MapError> {
        let directory = self
            .processes
            .iter()
            .find(|p| p.pid == pid)
            .and_then(|p| p.directory.as_deref())
            .ok_or(MapError::NotMapped(va))?;
        self.memory.with_memory(|m| m.write_bytes(directory, va, bytes))
    }

    fn linked_mut(&mut self, pid: Pid) -> &mut Process {
        self.processes
            .iter_mut()
            .find(|p| p.pid == pid)
            .unwrap_or_else(|| panic!("{pid} is not in the process list"))
    }

    /// Add an already open file to `pid`'s descriptor table.
    ///
    /// # Errors
    /// [`DescriptorError::TableFull`].
    ///
    /// # Panics
    /// If `pid` is not linked.
    pub fn install_descriptor(&mut self, pid: Pid, file: OpenFile) -> Result<u32, DescriptorError> {
        self.linked_mut(pid).descriptors.insert(file)
    }

    fn current_descriptor(&mut self, id: u32) -> Result<OpenFile, FileError> {
        let process = self
            .current_mut()
            .unwrap_or_else(|| panic!("file access without a current process"));
        Ok(*process.descriptors.get(id).ok_or(DescriptorError::NotOpen(id))?)
    }

    /// Open `path` for the current process.
    ///
    /// # Errors
    /// [`FileError`] from the file system or a full descriptor table.
    pub fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<u32, FileError> {
        let file = self.fs.open(path, flags)?;
        let process = self
            .current_mut()
            .unwrap_or_else(|| panic!("file access without a current process"));
        match process.descriptors.insert(file) {
            Ok(id) => Ok(id),
            Err(e) => {
                if let Err(close) = self.fs.close(file) {
                    log::warn!("closing unplaced file failed: {close}");
                }
                Err(e.into())
            }
        }
    }

    /// # Errors
    /// [`FileError`].
    pub fn read_file(&mut self, id: u32, buf: &mut [u8]) -> Result<usize, FileError> {
        let file = self.current_descriptor(id)?;
        Ok(self.fs.read(&file, buf)?)
    }

    /// # Errors
    /// [`FileError`].
    pub fn write_file(&mut self, id: u32, buf: &[u8]) -> Result<usize, FileError> {
        let file = self.current_descriptor(id)?;
        Ok(self.fs.write(&file, buf)?)
    }

    /// # Errors
    /// [`FileError`].
    pub fn seek_file(&mut self, id: u32, pos: SeekFrom) -> Result<u64, FileError> {
        let file = self.current_descriptor(id)?;
        Ok(self.fs.seek(&file, pos)?)
    }

    /// # Errors
    /// [`FileError`].
    pub fn tell_file(&mut self, id: u32) -> Result<u64, FileError> {
        let file = self.current_descriptor(id)?;
        Ok(self.fs.tell(&file)?)
    }

    /// # Errors
    /// [`FileError`] if `id` is not open or the file system fails to close.
    pub fn close_file(&mut self, id: u32) -> Result<(), FileError> {
        let process = self
            .current_mut()
            .unwrap_or_else(|| panic!("file access without a current process"));
        let file = process.descriptors.remove(id)?;
        Ok(self.fs.close(file)?)
    }

    /// Log every process.
    pub fn dump(&self) {
        log::info!("{} processes, tick {}", self.processes.len(), self.ticks);
        for (index, process) in self.processes.iter().enumerate() {
            let marker = if index == self.current && !self.current_unlinked { '*' } else { ' ' };
            log::info!(
                "{marker} {:>5} {:<11} stack {:#010x}+{:#x} fds {}",
                process.pid.as_u32(),
                process.status,
                process.stack.base.as_u32(),
                process.stack.size,
                process.descriptors.len()
            );
        }
        for process in &self.finished {
            log::info!("  {:>5} finished, code {:?}", process.pid.as_u32(), process.exit_code());
        }
    }
}

/// Copy every open descriptor of `source` through the file system, keeping
/// descriptor numbers.
fn inherit_descriptors<F: FileSystem>(fs: &mut F, source: &DescriptorTable) -> DescriptorTable {
    let mut table = DescriptorTable::new();
    for (id, file) in source.iter() {
        match fs.copy_descriptor(file) {
            Ok(copy) => {
                if let Err(e) = table.insert_at(id, copy) {
                    log::warn!("descriptor {id} not inherited: {e}");
                }
            }
            Err(e) => log::warn!("descriptor {id} not inherited: {e}"),
        }
    }
    table
}
