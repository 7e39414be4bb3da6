use kernel_alloc::testing::{self, RecordingHardware, TestMemory};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sched::{
    Cpu, DescriptorError, Dispatch, FileError, FileSystem, FsError, FsId, OpenFile, OpenFlags, Pid, ProcessStatus,
    SavedContext, Scheduler, SeekFrom, StackRegion, TaskArgs, TaskError, TaskSpec,
};
use kernel_vmem::PagingHardware;
use std::collections::BTreeSet;

#[derive(Default)]
struct TestCpu {
    hw: RecordingHardware,
    acknowledged: u64,
    masked: usize,
}

impl PagingHardware for TestCpu {
    unsafe fn load_directory(&mut self, directory: PhysicalAddress) {
        unsafe { self.hw.load_directory(directory) };
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        self.hw.invalidate_page(va);
    }
}

impl Cpu for TestCpu {
    fn acknowledge_timer(&mut self) {
        self.acknowledged += 1;
    }

    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.masked += 1;
        let result = f(self);
        self.masked -= 1;
        result
    }
}

/// Hands out numbered handles and records copies and closes.
#[derive(Default)]
struct TestFs {
    next: u64,
    open: BTreeSet<u64>,
    copies: Vec<(u64, u64)>,
    closed: Vec<u64>,
}

impl TestFs {
    fn handle(&mut self, flags: OpenFlags) -> OpenFile {
        self.next += 1;
        self.open.insert(self.next);
        OpenFile {
            flags,
            fs: FsId(1),
            handle: self.next,
        }
    }
}

impl FileSystem for TestFs {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<OpenFile, FsError> {
        if path.starts_with("/missing") {
            return Err(FsError::NotFound);
        }
        Ok(self.handle(flags))
    }

    fn read(&mut self, file: &OpenFile, buf: &mut [u8]) -> Result<usize, FsError> {
        if !file.flags.read() {
            return Err(FsError::PermissionDenied);
        }
        buf.fill(u8::try_from(file.handle).unwrap_or(0xFF));
        Ok(buf.len())
    }

    fn write(&mut self, file: &OpenFile, buf: &[u8]) -> Result<usize, FsError> {
        if file.flags.write() {
            Ok(buf.len())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    fn seek(&mut self, _file: &OpenFile, pos: SeekFrom) -> Result<u64, FsError> {
        match pos {
            SeekFrom::Start(offset) => Ok(offset),
            _ => Err(FsError::InvalidSeek),
        }
    }

    fn tell(&mut self, _file: &OpenFile) -> Result<u64, FsError> {
        Ok(0)
    }

    fn close(&mut self, file: OpenFile) -> Result<(), FsError> {
        if !self.open.remove(&file.handle) {
            return Err(FsError::BadHandle);
        }
        self.closed.push(file.handle);
        Ok(())
    }

    fn copy_descriptor(&mut self, file: &OpenFile) -> Result<OpenFile, FsError> {
        let copy = self.handle(file.flags);
        self.copies.push((file.handle, copy.handle));
        Ok(copy)
    }
}

type Sched = Scheduler<TestMemory, TestFs>;

const BOOT_STACK: StackRegion = StackRegion::new(VirtualAddress::new(0xC010_0000), 0x4000);
const STACK_TOP: u32 = 0xC000_0000;

fn scheduler() -> Sched {
    Scheduler::new(testing::kernel_memory(), TestFs::default(), BOOT_STACK)
}

fn spawn_with(s: &mut Sched, cpu: &mut TestCpu, entry: u32, args: TaskArgs) -> Result<Pid, TaskError> {
    let directory = s.new_address_space();
    s.create_task(
        cpu,
        TaskSpec {
            entry: VirtualAddress::new(entry),
            stack_size: 0,
            directory,
            args,
        },
    )
}

fn spawn(s: &mut Sched, cpu: &mut TestCpu) -> Pid {
    spawn_with(s, cpu, 0x0040_0000, TaskArgs::new()).unwrap()
}

fn context(tag: u32) -> SavedContext {
    SavedContext {
        eip: tag,
        esp: STACK_TOP - 0x100,
        ebp: STACK_TOP - 0x80,
        ..SavedContext::default()
    }
}

/// Run `n` ticks, tagging each interrupted context with the tick number,
/// and report who was dispatched.
fn run(s: &mut Sched, cpu: &mut TestCpu, n: u32) -> Vec<(Pid, Dispatch)> {
    (0..n)
        .map(|_| {
            let tag = u32::try_from(s.ticks()).unwrap() + 1;
            let dispatch = s.timer_tick(cpu, context(tag));
            (s.current_pid().unwrap(), dispatch)
        })
        .collect()
}

fn used_frames(s: &mut Sched) -> usize {
    s.memory().vmm().frames().used_frames()
}

#[test]
fn two_tasks_alternate_strictly() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    assert!(s.set_status(Pid::BOOTSTRAP, ProcessStatus::Waiting));
    let a = spawn(&mut s, &mut cpu);
    let b = spawn(&mut s, &mut cpu);

    let trace = run(&mut s, &mut cpu, 6);

    let order: Vec<Pid> = trace.iter().map(|(pid, _)| *pid).collect();
    assert_eq!(order, vec![a, b, a, b, a, b]);
    assert!(matches!(trace[0].1, Dispatch::Enter(_)));
    assert!(matches!(trace[1].1, Dispatch::Enter(_)));
    // a was interrupted by tick 2 and resumed by tick 3.
    assert_eq!(trace[2].1, Dispatch::Resume(context(2)));
    assert_eq!(trace[3].1, Dispatch::Resume(context(3)));
    assert_eq!(cpu.acknowledged, 6);
    assert_eq!(cpu.masked, 0);

    let b_directory = s.lookup(b).unwrap().directory().unwrap().physical_address();
    assert_eq!(cpu.hw.loads.last(), Some(&b_directory));
}

#[test]
fn bootstrap_takes_its_turn_in_the_kernel_directory() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    let a = spawn(&mut s, &mut cpu);

    let trace = run(&mut s, &mut cpu, 3);

    assert_eq!(trace[0].0, a);
    assert_eq!(trace[1], (Pid::BOOTSTRAP, Dispatch::Resume(context(1))));
    assert_eq!(trace[2].0, a);
    let kernel = s.memory().vmm().kernel().physical_address();
    assert_eq!(cpu.hw.loads[1], kernel);
}

#[test]
fn waiting_processes_are_skipped_until_woken() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.set_status(Pid::BOOTSTRAP, ProcessStatus::Waiting);
    let a = spawn(&mut s, &mut cpu);
    let b = spawn(&mut s, &mut cpu);
    let c = spawn(&mut s, &mut cpu);
    s.set_status(b, ProcessStatus::Waiting);

    let order: Vec<Pid> = run(&mut s, &mut cpu, 4).into_iter().map(|(pid, _)| pid).collect();
    assert_eq!(order, vec![a, c, a, c]);

    // Parked before its first run, so it still starts at its entry point.
    s.set_status(b, ProcessStatus::Running);
    assert_eq!(s.lookup(b).unwrap().status(), ProcessStatus::Initialized);
    let trace = run(&mut s, &mut cpu, 2);
    assert_eq!(trace[0].0, a);
    assert_eq!(trace[1].0, b);
    assert!(matches!(trace[1].1, Dispatch::Enter(_)));
}

#[test]
fn nothing_runnable_means_idle() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.set_status(Pid::BOOTSTRAP, ProcessStatus::Stopped);
    assert_eq!(s.timer_tick(&mut cpu, context(1)), Dispatch::Idle);
    assert_eq!(cpu.acknowledged, 1);
}

#[test]
fn parked_process_resumes_from_its_last_tick() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.set_status(Pid::BOOTSTRAP, ProcessStatus::Waiting);
    let a = spawn(&mut s, &mut cpu);
    let b = spawn(&mut s, &mut cpu);
    run(&mut s, &mut cpu, 2);
    assert_eq!(s.current_pid(), Some(b));

    // b blocks itself and keeps running until the next tick.
    s.set_status(b, ProcessStatus::Waiting);
    s.set_status(a, ProcessStatus::Waiting);
    assert_eq!(s.timer_tick(&mut cpu, context(3)), Dispatch::Idle);
    assert_eq!(s.current_pid(), None);
    assert_eq!(s.timer_tick(&mut cpu, context(4)), Dispatch::Idle);

    s.set_status(b, ProcessStatus::Running);
    assert_eq!(s.timer_tick(&mut cpu, context(5)), Dispatch::Resume(context(3)));
    assert_eq!(s.current_pid(), Some(b));
}

#[test]
fn first_dispatch_lays_out_arguments() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.set_status(Pid::BOOTSTRAP, ProcessStatus::Waiting);
    let args = TaskArgs::new().arg("sh").arg("-c").env("HOME=/");
    let a = spawn_with(&mut s, &mut cpu, 0x0040_1000, args).unwrap();

    let Dispatch::Enter(frame) = s.timer_tick(&mut cpu, context(1)) else {
        panic!("expected a first run");
    };
    assert_eq!(frame.entry, 0x0040_1000);
    assert_eq!(frame.argc, 2);
    assert_eq!(frame.stack_pointer % 16, 0);
    assert!(frame.stack_pointer <= frame.envp && frame.envp < frame.argv && frame.argv < STACK_TOP);

    let mut word = [0u8; 4];
    s.read_memory(a, VirtualAddress::new(frame.argv + 4), &mut word).unwrap();
    let second = u32::from_le_bytes(word);
    let mut text = [0u8; 3];
    s.read_memory(a, VirtualAddress::new(second), &mut text).unwrap();
    assert_eq!(&text, b"-c\0");
    s.read_memory(a, VirtualAddress::new(frame.argv + 8), &mut word).unwrap();
    assert_eq!(word, [0; 4]);
}

#[test]
fn oversized_arguments_are_rejected_without_leaks() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    let before = used_frames(&mut s);
    let directory = s.new_address_space();

    let result = s.create_task(
        &mut cpu,
        TaskSpec {
            entry: VirtualAddress::new(0x0040_0000),
            stack_size: 4096,
            directory,
            args: TaskArgs::new().arg("x".repeat(5000)),
        },
    );

    assert!(matches!(result, Err(TaskError::ArgumentsTooLarge { available: 4096, .. })));
    assert_eq!(used_frames(&mut s), before);
    assert_eq!(s.pids().count(), 1);
}

#[test]
fn fork_duplicates_the_live_stack() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.set_status(Pid::BOOTSTRAP, ProcessStatus::Waiting);
    for _ in 0..5 {
        spawn(&mut s, &mut cpu);
    }
    let parent = Pid::new(5);
    while s.current_pid() != Some(parent) {
        s.timer_tick(&mut cpu, context(0));
    }

    let live = VirtualAddress::new(STACK_TOP - 64);
    let pattern: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37)).collect();
    s.write_memory(parent, live, &pattern).unwrap();
    let at_fork = SavedContext {
        eip: 0x0040_2345,
        esp: STACK_TOP - 64,
        ebp: STACK_TOP - 16,
        ebx: 7,
        ..SavedContext::default()
    };

    let child = s.fork(&mut cpu, at_fork);

    assert_eq!(child, Pid::new(6));
    let mut copied = [0u8; 64];
    s.read_memory(child, live, &mut copied).unwrap();
    assert_eq!(copied.as_slice(), pattern.as_slice());

    let forked = s.lookup(child).unwrap();
    assert_eq!(forked.status(), ProcessStatus::Forked);
    assert_eq!(forked.parent(), Some(parent));
    assert_eq!(forked.stack(), s.lookup(parent).unwrap().stack());

    // The copies are independent.
    s.write_memory(parent, live, &[0xEE; 64]).unwrap();
    s.read_memory(child, live, &mut copied).unwrap();
    assert_eq!(copied.as_slice(), pattern.as_slice());

    // The child continues where its parent called fork.
    let mut dispatched = None;
    for _ in 0..7 {
        let dispatch = s.timer_tick(&mut cpu, context(0));
        if s.current_pid() == Some(child) {
            dispatched = Some(dispatch);
            break;
        }
    }
    assert_eq!(dispatched, Some(Dispatch::Jump(at_fork)));
    assert_eq!(s.lookup(child).unwrap().status(), ProcessStatus::Running);
}

#[test]
#[should_panic(expected = "cannot fork")]
fn bootstrap_process_cannot_fork() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.fork(&mut cpu, context(1));
}

#[test]
fn exit_releases_everything_and_reap_returns_the_code() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.set_status(Pid::BOOTSTRAP, ProcessStatus::Waiting);
    let before = used_frames(&mut s);
    let a = spawn(&mut s, &mut cpu);
    assert_eq!(used_frames(&mut s), before + 4);
    run(&mut s, &mut cpu, 1);

    s.exit_current(&mut cpu, 42);

    assert_eq!(s.current_pid(), None);
    assert_eq!(used_frames(&mut s), before);
    let kernel = s.memory().vmm().kernel().physical_address();
    assert_eq!(cpu.hw.loads.last(), Some(&kernel));
    let finished = s.lookup(a).unwrap();
    assert_eq!(finished.status(), ProcessStatus::Finished);
    assert_eq!(finished.exit_code(), Some(42));
    assert!(finished.directory().is_none());

    assert_eq!(s.timer_tick(&mut cpu, context(2)), Dispatch::Idle);
    assert_eq!(s.reap(a), Some(42));
    assert!(s.lookup(a).is_none());
    assert_eq!(s.reap(a), None);
}

#[test]
fn exit_hands_over_to_the_successor() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.set_status(Pid::BOOTSTRAP, ProcessStatus::Waiting);
    let a = spawn(&mut s, &mut cpu);
    let b = spawn(&mut s, &mut cpu);
    let c = spawn(&mut s, &mut cpu);
    run(&mut s, &mut cpu, 2);
    assert_eq!(s.current_pid(), Some(b));

    s.exit_current(&mut cpu, 0);

    let order: Vec<Pid> = run(&mut s, &mut cpu, 3).into_iter().map(|(pid, _)| pid).collect();
    assert_eq!(order, vec![c, a, c]);
}

#[test]
fn descriptors_are_inherited_and_closed() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    let flags = OpenFlags::new().with_read(true);
    let console = s.open_file("/dev/console", flags).unwrap();
    assert_eq!(console, 0);

    let a = spawn(&mut s, &mut cpu);

    let inherited = *s.lookup(a).unwrap().descriptors().get(0).unwrap();
    assert_eq!(s.fs().copies, vec![(1, inherited.handle)]);
    assert_ne!(inherited.handle, 1);

    s.free_process(&mut cpu, a, 3);
    assert_eq!(s.fs().closed, vec![inherited.handle]);
}

#[test]
fn file_calls_go_through_the_current_descriptor_table() {
    let mut s = scheduler();
    let id = s
        .open_file("/dev/ram0", OpenFlags::new().with_read(true))
        .unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(s.read_file(id, &mut buf), Ok(4));
    assert_eq!(buf, [1; 4]);
    assert_eq!(s.write_file(id, b"no"), Err(FileError::Fs(FsError::PermissionDenied)));
    assert_eq!(s.seek_file(id, SeekFrom::Start(9)), Ok(9));
    assert_eq!(s.tell_file(id), Ok(0));
    assert_eq!(
        s.open_file("/missing", OpenFlags::new()),
        Err(FileError::Fs(FsError::NotFound))
    );

    s.close_file(id).unwrap();
    assert_eq!(
        s.close_file(id),
        Err(FileError::Descriptor(DescriptorError::NotOpen(id)))
    );
}

#[test]
#[should_panic(expected = "is not in the process list")]
fn freeing_an_unknown_process_panics() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.free_process(&mut cpu, Pid::new(99), 0);
}

#[test]
#[should_panic(expected = "the bootstrap process never terminates")]
fn bootstrap_process_cannot_exit() {
    let mut cpu = TestCpu::default();
    let mut s = scheduler();
    s.exit_current(&mut cpu, 0);
}
