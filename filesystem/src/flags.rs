use bitflags::bitflags;

bitflags! {
    /// Open-call flags as the guest's libc passes them; values follow the
    /// Linux/glibc `O_*` numbering since that is what guest binaries are
    /// compiled to expect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0o0;
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const NONBLOCK = 0o4000;
        const DIRECTORY = 0o200000;
    }
}

impl OpenFlags {
    pub fn is_write(&self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }

    pub fn is_read(&self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
    pub mode: u32,
}
