//! Program arguments and their layout on a fresh process stack.
//!
//! ```text
//!  top ─► ┌──────────────────────────┐
//!         │ argv strings, NUL-ended  │
//!         ├──────────────────────────┤ aligned to 4
//!         │ argv[0..argc], NULL      │ ◄─ argv
//!         ├──────────────────────────┤
//!         │ envp strings, NUL-ended  │
//!         ├──────────────────────────┤ aligned to 4
//!         │ envp[..], NULL           │ ◄─ envp
//!         ├──────────────────────────┤ aligned to 16
//!         │ entry call frame         │ ◄─ stack pointer
//!         ▼                          ▼
//! ```

use crate::context::EntryFrame;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// `argv` and `envp` of a new process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskArgs {
    argv: Vec<String>,
    envp: Vec<String>,
}

impl TaskArgs {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            argv: Vec::new(),
            envp: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, var: impl Into<String>) -> Self {
        self.envp.push(var.into());
        self
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    #[must_use]
    pub fn envp(&self) -> &[String] {
        &self.envp
    }
}

/// The top of a process stack with the arguments laid out, ready to be
/// copied to [`base`](Self::base).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArgumentImage {
    base: u32,
    bytes: Vec<u8>,
    argc: u32,
    argv: u32,
    envp: u32,
}

impl ArgumentImage {
    /// Lay out `args` below `top`. `None` if the layout would run below
    /// address zero.
    #[must_use]
    pub fn build(args: &TaskArgs, top: u32) -> Option<Self> {
        let mut sp = top;
        let argv_strings = place_strings(&mut sp, &args.argv)?;
        let argv = place_array(&mut sp, argv_strings.len())?;
        let envp_strings = place_strings(&mut sp, &args.envp)?;
        let envp = place_array(&mut sp, envp_strings.len())?;
        sp &= !15;

        let mut bytes = vec![0; (top - sp) as usize];
        let mut put = |addr: u32, data: &[u8]| {
            let at = (addr - sp) as usize;
            bytes[at..at + data.len()].copy_from_slice(data);
        };
        for (string, addr) in args.argv.iter().chain(&args.envp).zip(argv_strings.iter().chain(&envp_strings)) {
            // The terminating NUL is already zero.
            put(*addr, string.as_bytes());
        }
        for (array, strings) in [(argv, &argv_strings), (envp, &envp_strings)] {
            for (slot, addr) in (array..).step_by(4).zip(strings.iter()) {
                put(slot, &addr.to_le_bytes());
            }
        }

        Some(Self {
            base: sp,
            bytes,
            argc: u32::try_from(args.argv.len()).ok()?,
            argv,
            envp,
        })
    }

    /// Lowest address of the image; also the initial stack pointer.
    #[must_use]
    pub const fn base(&self) -> u32 {
        self.base
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub const fn entry_frame(&self, entry: u32) -> EntryFrame {
        EntryFrame {
            entry,
            stack_pointer: self.base,
            argc: self.argc,
            argv: self.argv,
            envp: self.envp,
        }
    }
}

fn place_strings(sp: &mut u32, strings: &[String]) -> Option<Vec<u32>> {
    strings
        .iter()
        .map(|s| {
            let len = u32::try_from(s.len()).ok()?.checked_add(1)?;
            *sp = sp.checked_sub(len)?;
            Some(*sp)
        })
        .collect()
}

/// Reserve a NULL-terminated array of `count` pointers.
fn place_array(sp: &mut u32, count: usize) -> Option<u32> {
    let size = u32::try_from(count).ok()?.checked_add(1)?.checked_mul(4)?;
    *sp = (*sp & !3).checked_sub(size)?;
    Some(*sp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOP: u32 = 0xC000_0000;

    fn word(image: &ArgumentImage, addr: u32) -> u32 {
        let at = (addr - image.base()) as usize;
        u32::from_le_bytes(image.bytes()[at..at + 4].try_into().unwrap())
    }

    fn string(image: &ArgumentImage, addr: u32) -> String {
        let at = (addr - image.base()) as usize;
        let end = image.bytes()[at..].iter().position(|b| *b == 0).unwrap();
        String::from_utf8(image.bytes()[at..at + end].to_vec()).unwrap()
    }

    #[test]
    fn arrays_point_at_their_strings() {
        let args = TaskArgs::new().arg("init").arg("--verbose").env("TERM=vga");
        let image = ArgumentImage::build(&args, TOP).unwrap();
        let frame = image.entry_frame(0x0040_0000);

        assert_eq!(frame.argc, 2);
        assert_eq!(string(&image, word(&image, frame.argv)), "init");
        assert_eq!(string(&image, word(&image, frame.argv + 4)), "--verbose");
        assert_eq!(word(&image, frame.argv + 8), 0);
        assert_eq!(string(&image, word(&image, frame.envp)), "TERM=vga");
        assert_eq!(word(&image, frame.envp + 4), 0);
    }

    #[test]
    fn image_ends_at_the_top_and_is_aligned() {
        let args = TaskArgs::new().arg("a");
        let image = ArgumentImage::build(&args, TOP).unwrap();
        assert_eq!(image.base() as usize + image.len(), TOP as usize);
        assert_eq!(image.base() % 16, 0);
        assert_eq!(image.entry_frame(0).argv % 4, 0);
        assert!(image.entry_frame(0).envp < image.entry_frame(0).argv);
    }

    #[test]
    fn empty_arguments_still_get_null_arrays() {
        let image = ArgumentImage::build(&TaskArgs::new(), TOP).unwrap();
        let frame = image.entry_frame(0);
        assert_eq!(frame.argc, 0);
        assert_eq!(word(&image, frame.argv), 0);
        assert_eq!(word(&image, frame.envp), 0);
    }

    #[test]
    fn layout_below_zero_is_rejected() {
        let args = TaskArgs::new().arg("x".repeat(64));
        assert!(ArgumentImage::build(&args, 32).is_none());
    }
}
