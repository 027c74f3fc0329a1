use std::fs::OpenOptions;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::{
    fs::normalize, Dir, DirEntry, File, FileStat, FileSystem, OpenFlags, Result, SeekFrom,
};

/// A filesystem that proxies guest file operations onto a real host
/// directory, jailed so guest paths can never walk above `root` - the
/// counterpart of a debugger session started with a host directory mount.
pub struct SysFs {
    root: PathBuf,
}

impl SysFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SysFs { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let parts = normalize(path)?;
        Ok(parts.iter().fold(self.root.clone(), |acc, p| acc.join(p)))
    }
}

impl FileSystem for SysFs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn File>> {
        let host_path = self.resolve(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(flags.is_write())
            .create(flags.contains(OpenFlags::CREAT))
            .create_new(flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL))
            .truncate(flags.contains(OpenFlags::TRUNC))
            .append(flags.contains(OpenFlags::APPEND))
            .open(host_path)?;
        Ok(Box::new(SysFile { file }))
    }

    fn open_dir(&self, path: &str) -> Result<Box<dyn Dir>> {
        let host_path = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(host_path)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(Box::new(SysDir { entries, pos: 0 }))
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        std::fs::create_dir(self.resolve(path)?)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let host_path = self.resolve(path)?;
        if host_path.is_dir() {
            std::fs::remove_dir(host_path)?;
        } else {
            std::fs::remove_file(host_path)?;
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        std::fs::rename(self.resolve(from)?, self.resolve(to)?)?;
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        let meta = std::fs::metadata(self.resolve(path)?)?;
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
            mode: 0o644,
        })
    }
}

struct SysFile {
    file: std::fs::File,
}

impl File for SysFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file.write(buf)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let pos = match pos {
            SeekFrom::Start(p) => std::io::SeekFrom::Start(p),
            SeekFrom::Current(d) => std::io::SeekFrom::Current(d),
            SeekFrom::End(d) => std::io::SeekFrom::End(d),
        };
        Ok(self.file.seek(pos)?)
    }

    fn stat(&self) -> Result<FileStat> {
        let meta = self.file.metadata()?;
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
            mode: 0o644,
        })
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        Ok(self.file.set_len(size)?)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }
}

struct SysDir {
    entries: Vec<DirEntry>,
    pos: usize,
}

impl Dir for SysDir {
    fn read_entry(&mut self) -> Result<Option<DirEntry>> {
        if self.pos >= self.entries.len() {
            return Ok(None);
        }
        let entry = self.entries[self.pos].clone();
        self.pos += 1;
        Ok(Some(entry))
    }
}

#[allow(dead_code)]
fn is_within(root: &Path, candidate: &Path) -> bool {
    candidate.starts_with(root)
}
