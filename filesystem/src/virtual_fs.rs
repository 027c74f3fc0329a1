use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::{
    fs::normalize, Dir, DirEntry, File, FileStat, FileSystem, FsError, OpenFlags, Result,
    SeekFrom,
};

enum Node {
    File(Arc<Mutex<Vec<u8>>>),
    Dir(HashMap<String, Node>),
}

impl Node {
    fn stat(&self) -> FileStat {
        match self {
            Node::File(data) => FileStat {
                size: data.lock().unwrap().len() as u64,
                is_dir: false,
                mode: 0o644,
            },
            Node::Dir(_) => FileStat {
                size: 0,
                is_dir: true,
                mode: 0o755,
            },
        }
    }
}

/// A sandboxed, purely in-memory filesystem tree. Guests that were not
/// started with a host directory jail (`debugger.mem` without a backing
/// `SysFs`) get one of these, matching the original's `VirtualFS` used when
/// no real filesystem access is granted.
pub struct VirtualFs {
    root: Mutex<Node>,
}

impl VirtualFs {
    pub fn new() -> Self {
        VirtualFs {
            root: Mutex::new(Node::Dir(HashMap::new())),
        }
    }

    fn with_parent<R>(
        &self,
        path: &str,
        f: impl FnOnce(&mut HashMap<String, Node>, &str) -> Result<R>,
    ) -> Result<R> {
        let parts = normalize(path)?;
        let (name, dirs) = match parts.split_last() {
            Some((name, dirs)) => (name.clone(), dirs),
            None => return Err(FsError::InvalidArgument("empty path".into())),
        };
        let mut root = self.root.lock().unwrap();
        let mut cursor = match &mut *root {
            Node::Dir(map) => map,
            Node::File(_) => unreachable!("root is always a directory"),
        };
        for part in dirs {
            cursor = match cursor
                .get_mut(part)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?
            {
                Node::Dir(map) => map,
                Node::File(_) => return Err(FsError::NotADirectory(path.to_string())),
            };
        }
        f(cursor, &name)
    }
}

impl Default for VirtualFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for VirtualFs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn File>> {
        debug!("virtualfs: open {} flags={:?}", path, flags);
        self.with_parent(path, |dir, name| {
            if !dir.contains_key(name) {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(FsError::NotFound(path.to_string()));
                }
                dir.insert(name.to_string(), Node::File(Arc::new(Mutex::new(Vec::new()))));
            } else if flags.contains(OpenFlags::EXCL) && flags.contains(OpenFlags::CREAT) {
                return Err(FsError::AlreadyExists(path.to_string()));
            }

            let data = match dir.get(name).unwrap() {
                Node::File(data) => data.clone(),
                Node::Dir(_) => return Err(FsError::IsADirectory(path.to_string())),
            };

            if flags.contains(OpenFlags::TRUNC) {
                data.lock().unwrap().clear();
            }

            let pos = if flags.contains(OpenFlags::APPEND) {
                data.lock().unwrap().len() as u64
            } else {
                0
            };

            Ok(Box::new(VirtualFile { data, pos }) as Box<dyn File>)
        })
    }

    fn open_dir(&self, path: &str) -> Result<Box<dyn Dir>> {
        let parts = normalize(path)?;
        let root = self.root.lock().unwrap();
        let mut cursor = match &*root {
            Node::Dir(map) => map,
            Node::File(_) => unreachable!(),
        };
        for part in &parts {
            cursor = match cursor
                .get(part)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?
            {
                Node::Dir(map) => map,
                Node::File(_) => return Err(FsError::NotADirectory(path.to_string())),
            };
        }
        let entries = cursor
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                is_dir: matches!(node, Node::Dir(_)),
            })
            .collect();
        Ok(Box::new(VirtualDir { entries, pos: 0 }))
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        self.with_parent(path, |dir, name| {
            if dir.contains_key(name) {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            dir.insert(name.to_string(), Node::Dir(HashMap::new()));
            Ok(())
        })
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.with_parent(path, |dir, name| {
            dir.remove(name)
                .map(|_| ())
                .ok_or_else(|| FsError::NotFound(path.to_string()))
        })
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let node = self.with_parent(from, |dir, name| {
            dir.remove(name)
                .ok_or_else(|| FsError::NotFound(from.to_string()))
        })?;
        self.with_parent(to, |dir, name| {
            dir.insert(name.to_string(), node);
            Ok(())
        })
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        if path.is_empty() || path == "/" {
            return Ok(FileStat {
                size: 0,
                is_dir: true,
                mode: 0o755,
            });
        }
        self.with_parent(path, |dir, name| {
            dir.get(name)
                .map(Node::stat)
                .ok_or_else(|| FsError::NotFound(path.to_string()))
        })
    }
}

struct VirtualFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
}

impl File for VirtualFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock().unwrap();
        let start = self.pos as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock().unwrap();
        let start = self.pos as usize;
        if start + buf.len() > data.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.data.lock().unwrap().len() as u64;
        self.pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(delta) => (self.pos as i64 + delta).max(0) as u64,
            SeekFrom::End(delta) => (len as i64 + delta).max(0) as u64,
        };
        Ok(self.pos)
    }

    fn stat(&self) -> Result<FileStat> {
        Ok(FileStat {
            size: self.data.lock().unwrap().len() as u64,
            is_dir: false,
            mode: 0o644,
        })
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.data.lock().unwrap().resize(size as usize, 0);
        Ok(())
    }
}

struct VirtualDir {
    entries: Vec<DirEntry>,
    pos: usize,
}

impl Dir for VirtualDir {
    fn read_entry(&mut self) -> Result<Option<DirEntry>> {
        if self.pos >= self.entries.len() {
            return Ok(None);
        }
        let entry = self.entries[self.pos].clone();
        self.pos += 1;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back_roundtrips() {
        let fs = VirtualFs::new();
        let mut f = fs.open("/tmp/a.txt", OpenFlags::CREAT | OpenFlags::RDWR).unwrap();
        f.write(b"hello").unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn open_without_creat_on_missing_file_fails() {
        let fs = VirtualFs::new();
        assert!(fs.open("/missing", OpenFlags::RDONLY).is_err());
    }

    #[test]
    fn mkdir_then_list_entries() {
        let fs = VirtualFs::new();
        fs.mkdir("/bin").unwrap();
        fs.open("/bin/a", OpenFlags::CREAT).unwrap();
        fs.open("/bin/b", OpenFlags::CREAT).unwrap();
        let mut dir = fs.open_dir("/bin").unwrap();
        let mut names = Vec::new();
        while let Some(entry) = dir.read_entry().unwrap() {
            names.push(entry.name);
        }
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
