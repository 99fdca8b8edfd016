// File-related system calls.
//
// `Proc` is the per-process state the dispatcher works with: the
// descriptor table and the current working directory. Its methods
// mirror the syscall table and fold the internal error values into
// the boolean-or-minus-one convention user programs see; everything
// richer lives in the layers below.

use std::sync::Arc;

use arrayvec::ArrayString;

use crate::error::Result;
use crate::file::{Fd, FdTable, File, RawFd};
use crate::fs::{Dir, FileSys, Path};
use crate::param::NAME_MAX;

pub struct Proc {
    fs: Arc<FileSys>,
    files: FdTable,
    cwd: Dir,
}

impl Proc {
    /// A fresh process context with the root directory as its cwd.
    /// Dropping it closes every open handle and the cwd, as the
    /// process-termination hook would.
    pub fn new(fs: &Arc<FileSys>) -> Result<Proc> {
        Ok(Proc {
            fs: Arc::clone(fs),
            files: FdTable::new(),
            cwd: Dir::open_root(fs)?,
        })
    }

    /// Creates a file of `initial_size` bytes. False if the path is
    /// bad, the name exists, or the device is out of space.
    pub fn create(&self, path: &str, initial_size: u32) -> bool {
        Path::new(path)
            .and_then(|p| self.fs.create_path(p, initial_size, Some(&self.cwd)))
            .is_ok()
    }

    /// Opens a file or directory and returns its descriptor, or -1.
    pub fn open(&mut self, path: &str) -> isize {
        let opened = Path::new(path)
            .and_then(|p| self.fs.open_path(p, Some(&self.cwd)))
            .and_then(|ip| {
                if ip.is_dir()? {
                    Ok(Fd::Dir(Dir::open(ip)))
                } else {
                    Ok(Fd::File(File::open(ip)))
                }
            });
        match opened {
            Ok(fd) => match self.files.alloc(fd) {
                Ok(n) => n as isize,
                Err(_) => -1,
            },
            Err(_) => -1,
        }
    }

    pub fn close(&mut self, fd: RawFd) -> bool {
        self.files.close(fd).is_ok()
    }

    /// Reads into `dst` at the handle's cursor; -1 on a bad or
    /// directory descriptor.
    pub fn read(&mut self, fd: RawFd, dst: &mut [u8]) -> isize {
        let read = self
            .files
            .get_mut(fd)
            .and_then(Fd::as_file)
            .and_then(|f| f.read(dst));
        match read {
            Ok(n) => n as isize,
            Err(_) => -1,
        }
    }

    /// Writes `src` at the handle's cursor; -1 on a bad or directory
    /// descriptor. A denied or failed write transfers 0 bytes.
    pub fn write(&mut self, fd: RawFd, src: &[u8]) -> isize {
        let written = self
            .files
            .get_mut(fd)
            .and_then(Fd::as_file)
            .and_then(|f| f.write(src));
        match written {
            Ok(n) => n as isize,
            Err(_) => -1,
        }
    }

    pub fn seek(&mut self, fd: RawFd, pos: u32) -> bool {
        self.files
            .get_mut(fd)
            .and_then(Fd::as_file)
            .map(|f| f.seek(pos))
            .is_ok()
    }

    pub fn tell(&self, fd: RawFd) -> isize {
        match self.files.get(fd) {
            Ok(Fd::File(f)) => f.tell() as isize,
            _ => -1,
        }
    }

    pub fn filesize(&self, fd: RawFd) -> isize {
        match self.files.get(fd) {
            Ok(Fd::File(f)) => match f.length() {
                Ok(n) => n as isize,
                Err(_) => -1,
            },
            _ => -1,
        }
    }

    /// Removes a file or an empty directory.
    pub fn remove(&self, path: &str) -> bool {
        Path::new(path)
            .and_then(|p| self.fs.remove_path(p, Some(&self.cwd)))
            .is_ok()
    }

    /// Changes the current working directory.
    pub fn chdir(&mut self, path: &str) -> bool {
        match Path::new(path).and_then(|p| self.fs.resolve_dir(p, Some(&self.cwd))) {
            Ok(dir) => {
                self.cwd = dir;
                true
            }
            Err(_) => false,
        }
    }

    pub fn mkdir(&self, path: &str) -> bool {
        Path::new(path)
            .and_then(|p| self.fs.mkdir_path(p, Some(&self.cwd)))
            .is_ok()
    }

    /// Next entry name of a directory descriptor, skipping "." and
    /// "..". None once exhausted or on a non-directory descriptor.
    pub fn readdir(&mut self, fd: RawFd) -> Option<ArrayString<NAME_MAX>> {
        match self.files.get_mut(fd) {
            Ok(fd) => fd.readdir().ok().flatten(),
            Err(_) => None,
        }
    }

    pub fn isdir(&self, fd: RawFd) -> bool {
        self.files.get(fd).map(|fd| fd.is_dir()).unwrap_or(false)
    }

    pub fn inumber(&self, fd: RawFd) -> isize {
        self.files
            .get(fd)
            .map(|fd| fd.inumber() as isize)
            .unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::fs::SECTOR_SIZE;
    use crate::param::{FSSIZE, NOFILE, RESERVED_FDS};

    fn boot() -> (Arc<FileSys>, Proc) {
        let fs = FileSys::init(Box::new(MemDisk::new(FSSIZE as u32)), true).unwrap();
        let proc = Proc::new(&fs).unwrap();
        (fs, proc)
    }

    #[test]
    fn offset_behavior() {
        let (_fs, mut p) = boot();
        assert!(p.create("alphabet.txt", 0));
        let fd = p.open("alphabet.txt");
        assert!(fd >= RESERVED_FDS as isize);
        let fd = fd as RawFd;
        assert_eq!(
            p.write(fd, b"abcdefghijklmnopqrstuvwxyz"),
            26
        );
        assert!(p.close(fd));

        let fd = p.open("alphabet.txt") as RawFd;
        assert_eq!(p.tell(fd), 0);

        let mut buf = [0u8; 1];
        assert_eq!(p.read(fd, &mut buf), 1);
        assert_eq!(buf[0], b'a');
        assert_eq!(p.tell(fd), 1);

        assert!(p.seek(fd, 10));
        assert_eq!(p.tell(fd), 10);
        assert_eq!(p.read(fd, &mut buf), 1);
        assert_eq!(buf[0], b'k');

        assert!(p.seek(fd, 2));
        assert_eq!(p.tell(fd), 2);
        assert_eq!(p.read(fd, &mut buf), 1);
        assert_eq!(buf[0], b'c');
    }

    #[test]
    fn cold_cache_misses_more_than_warm() {
        let (fs, mut p) = boot();
        assert!(p.create("/test_data.txt", 0));
        let fd = p.open("/test_data.txt") as RawFd;
        let block = [b'a'; SECTOR_SIZE];
        for _ in 0..7 {
            assert_eq!(p.write(fd, &block), SECTOR_SIZE as isize);
        }
        assert!(p.close(fd));

        fs.buffer_reset().unwrap();
        fs.buffer_stats_reset();

        let mut buf = [0u8; SECTOR_SIZE];
        let fd = p.open("/test_data.txt") as RawFd;
        for _ in 0..7 {
            assert_eq!(p.read(fd, &mut buf), SECTOR_SIZE as isize);
        }
        let cold_accesses = fs.buffer_accesses();
        let cold_misses = fs.buffer_miss_count();
        assert!(p.close(fd));

        fs.buffer_stats_reset();
        let fd = p.open("/test_data.txt") as RawFd;
        for _ in 0..7 {
            assert_eq!(p.read(fd, &mut buf), SECTOR_SIZE as isize);
        }
        let warm_accesses = fs.buffer_accesses();
        let warm_misses = fs.buffer_miss_count();
        assert!(p.close(fd));

        assert_eq!(cold_accesses, warm_accesses);
        assert!(warm_misses < cold_misses);
    }

    #[test]
    fn byte_granular_io_coalesces_device_traffic() {
        const SECTORS: usize = 128;
        const TOLERANCE: u64 = 4;

        let (fs, mut p) = boot();
        assert!(p.create("/testfile420", (SECTORS * SECTOR_SIZE) as u32));
        let fd = p.open("/testfile420") as RawFd;

        fs.buffer_reset().unwrap();
        let writes_before = fs.device_writes();
        let byte = [b'z'];
        for _ in 0..SECTORS * SECTOR_SIZE {
            assert_eq!(p.write(fd, &byte), 1);
        }

        assert!(p.seek(fd, 0));
        let reads_before = fs.device_reads();
        let mut out = [0u8];
        for _ in 0..SECTORS * SECTOR_SIZE {
            assert_eq!(p.read(fd, &mut out), 1);
        }
        let writes = fs.device_writes() - writes_before;
        let reads = fs.device_reads() - reads_before;

        assert!(writes <= SECTORS as u64 + TOLERANCE, "writes = {}", writes);
        assert!(reads <= SECTORS as u64 + TOLERANCE, "reads = {}", reads);
    }

    #[test]
    fn mkdir_then_remove_semantics() {
        let (_fs, mut p) = boot();
        assert!(p.mkdir("/a"));
        assert!(p.mkdir("/a/b"));
        assert!(!p.remove("/a")); // not empty
        assert!(p.remove("/a/b"));
        assert!(p.remove("/a"));
        assert_eq!(p.open("/a"), -1);
    }

    #[test]
    fn inumber_is_stable_across_opens() {
        let (_fs, mut p) = boot();
        assert!(p.create("/x", 0));
        let fd1 = p.open("/x") as RawFd;
        let fd2 = p.open("/x") as RawFd;
        let ino = p.inumber(fd1);
        assert!(ino > 0);
        assert_eq!(p.inumber(fd2), ino);

        assert!(p.close(fd1));
        assert!(p.close(fd2));
        let fd3 = p.open("/x") as RawFd;
        assert_eq!(p.inumber(fd3), ino);
    }

    #[test]
    fn chdir_rebases_relative_paths() {
        let (_fs, mut p) = boot();
        assert!(p.mkdir("/home"));
        assert!(p.chdir("/home"));
        assert!(p.create("notes", 0));
        assert!(p.open("/home/notes") >= 0);

        assert!(p.chdir(".."));
        assert!(p.open("home/notes") >= 0);

        assert!(!p.chdir("/home/notes")); // a file, not a directory
        assert!(!p.chdir("/missing"));
    }

    #[test]
    fn directory_descriptors_classify_and_enumerate() {
        let (_fs, mut p) = boot();
        assert!(p.mkdir("/d"));
        assert!(p.create("/d/one", 0));
        assert!(p.create("/d/two", 0));

        let dfd = p.open("/d") as RawFd;
        assert!(p.isdir(dfd));
        let mut names = Vec::new();
        while let Some(name) = p.readdir(dfd) {
            names.push(name.as_str().to_string());
        }
        names.sort();
        assert_eq!(names, ["one", "two"]);
        assert_eq!(p.readdir(dfd), None); // exhausted

        // directory handles do not support byte I/O or cursors
        let mut buf = [0u8; 8];
        assert_eq!(p.read(dfd, &mut buf), -1);
        assert_eq!(p.write(dfd, &buf), -1);
        assert_eq!(p.tell(dfd), -1);
        assert_eq!(p.filesize(dfd), -1);

        let ffd = p.open("/d/one") as RawFd;
        assert!(!p.isdir(ffd));
        assert_eq!(p.readdir(ffd), None);
    }

    #[test]
    fn removing_an_open_file_is_deferred() {
        let (fs, mut p) = boot();
        assert!(p.create("/tmp", 0));
        let fd = p.open("/tmp") as RawFd;
        assert_eq!(p.write(fd, b"still here"), 10);

        assert!(p.remove("/tmp"));
        assert_eq!(p.open("/tmp"), -1); // the name is gone at once

        assert!(p.seek(fd, 0));
        let mut buf = [0u8; 10];
        assert_eq!(p.read(fd, &mut buf), 10); // the data is not
        assert_eq!(&buf, b"still here");

        assert!(p.close(fd));
        assert_eq!(fs.open_inodes(), 1); // only the cwd remains
    }

    #[test]
    fn bad_descriptors_and_paths_fail_cleanly() {
        let (_fs, mut p) = boot();
        assert_eq!(p.open("/nope"), -1);
        assert!(!p.remove("/nope"));
        assert!(!p.create("", 0));

        let mut buf = [0u8; 4];
        assert_eq!(p.read(0, &mut buf), -1); // reserved
        assert_eq!(p.read(77, &mut buf), -1); // never opened
        assert_eq!(p.read(NOFILE + 5, &mut buf), -1); // out of range
        assert!(!p.close(NOFILE + 5));
        assert_eq!(p.inumber(77), -1);
        assert!(!p.isdir(77));
    }

    #[test]
    fn descriptor_table_exhaustion_reports_minus_one() {
        let (_fs, mut p) = boot();
        assert!(p.create("/f", 0));
        for _ in RESERVED_FDS..NOFILE {
            assert!(p.open("/f") >= 0);
        }
        assert_eq!(p.open("/f"), -1);
    }

    #[test]
    fn create_with_initial_size_is_fully_readable() {
        let (_fs, mut p) = boot();
        assert!(p.create("/sized", 3 * SECTOR_SIZE as u32 + 100));
        let fd = p.open("/sized") as RawFd;
        assert_eq!(p.filesize(fd), 3 * SECTOR_SIZE as isize + 100);

        let mut buf = vec![0xffu8; 4 * SECTOR_SIZE];
        assert_eq!(
            p.read(fd, &mut buf),
            3 * SECTOR_SIZE as isize + 100
        );
        assert!(buf[..3 * SECTOR_SIZE + 100].iter().all(|b| *b == 0));
    }

    #[test]
    fn shutdown_persists_everything() {
        let image = Arc::new(MemDisk::new(FSSIZE as u32));
        let fs = FileSys::init(Box::new(Arc::clone(&image)), true).unwrap();
        {
            let mut p = Proc::new(&fs).unwrap();
            assert!(p.mkdir("/keep"));
            assert!(p.create("/keep/data", 0));
            let fd = p.open("/keep/data") as RawFd;
            assert_eq!(p.write(fd, b"persisted"), 9);
        }
        fs.done().unwrap();
        drop(fs);

        // mount the same image again without formatting
        let fs2 = FileSys::init(Box::new(image), false).unwrap();
        let mut p2 = Proc::new(&fs2).unwrap();
        let fd = p2.open("/keep/data") as RawFd;
        assert!(fd >= RESERVED_FDS);
        let mut buf = [0u8; 9];
        assert_eq!(p2.read(fd, &mut buf), 9);
        assert_eq!(&buf, b"persisted");
    }
}
