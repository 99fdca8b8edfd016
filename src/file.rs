// Open file and directory handles.
//
// A handle is either an open file (inode plus byte cursor) or an open
// directory (inode plus enumeration cursor). Each process owns a
// fixed-size table of them; slots 0 and 1 are reserved for the
// console handles managed outside this crate.

use array_macro::array;
use arrayvec::ArrayString;

use crate::error::{FsError, Result};
use crate::fs::{Dir, Inode};
use crate::param::{NAME_MAX, NOFILE, RESERVED_FDS};

/// An open regular file with a cursor.
pub struct File {
    ip: Inode,
    pos: u32,
    deny: bool, // this handle holds one deny-write reference
}

impl File {
    pub fn open(ip: Inode) -> File {
        File {
            ip,
            pos: 0,
            deny: false,
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.ip
    }

    /// Reads at the cursor and advances it.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let n = self.ip.read_at(dst, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Writes at the cursor and advances it. Writing past end of file
    /// extends the file; a cursor parked past the end writes zeros
    /// into the gap.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        let n = self.ip.write_at(src, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Moves the cursor. Seeking past end of file is allowed; the file
    /// only grows on a later write.
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u32 {
        self.pos
    }

    pub fn length(&self) -> Result<u32> {
        self.ip.length()
    }

    /// Denies writes to the underlying inode through any handle, at
    /// most once per handle.
    pub fn deny_write(&mut self) {
        if !self.deny {
            self.deny = true;
            self.ip.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny {
            self.deny = false;
            self.ip.allow_write();
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.deny {
            self.ip.allow_write();
        }
    }
}

/// What a descriptor refers to.
pub enum Fd {
    File(File),
    Dir(Dir),
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fd::File(_) => f.write_str("Fd::File"),
            Fd::Dir(_) => f.write_str("Fd::Dir"),
        }
    }
}

impl Fd {
    pub fn is_dir(&self) -> bool {
        matches!(self, Fd::Dir(_))
    }

    pub fn inumber(&self) -> u32 {
        match self {
            Fd::File(f) => f.inode().inumber(),
            Fd::Dir(d) => d.inode().inumber(),
        }
    }

    /// The file handle inside, for byte I/O.
    pub fn as_file(&mut self) -> Result<&mut File> {
        match self {
            Fd::File(f) => Ok(f),
            Fd::Dir(_) => Err(FsError::IsADirectory),
        }
    }

    /// Next entry name, for directory handles.
    pub fn readdir(&mut self) -> Result<Option<ArrayString<NAME_MAX>>> {
        match self {
            Fd::Dir(d) => d.readdir(),
            Fd::File(_) => Err(FsError::NotADirectory),
        }
    }
}

pub type RawFd = usize;

/// Per-process descriptor table.
pub struct FdTable {
    slots: Box<[Option<Fd>; NOFILE]>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: Box::new(array![_ => None; NOFILE]),
        }
    }

    /// Stores `fd` in the lowest free user slot.
    pub fn alloc(&mut self, fd: Fd) -> Result<RawFd> {
        for (i, slot) in self.slots.iter_mut().enumerate().skip(RESERVED_FDS) {
            if slot.is_none() {
                slot.replace(fd);
                return Ok(i);
            }
        }
        Err(FsError::OutOfHandles)
    }

    pub fn get(&self, fd: RawFd) -> Result<&Fd> {
        if fd < RESERVED_FDS || fd >= NOFILE {
            return Err(FsError::BadArgument);
        }
        self.slots[fd].as_ref().ok_or(FsError::NotFound)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Result<&mut Fd> {
        if fd < RESERVED_FDS || fd >= NOFILE {
            return Err(FsError::BadArgument);
        }
        self.slots[fd].as_mut().ok_or(FsError::NotFound)
    }

    /// Releases the slot, closing whatever it held.
    pub fn close(&mut self, fd: RawFd) -> Result<()> {
        if fd < RESERVED_FDS || fd >= NOFILE {
            return Err(FsError::BadArgument);
        }
        self.slots[fd].take().map(drop).ok_or(FsError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::fs::{FileSys, Path};
    use crate::param::FSSIZE;
    use std::sync::Arc;

    fn fs_with_file(name: &str) -> (Arc<FileSys>, File) {
        let fs = FileSys::init(Box::new(MemDisk::new(FSSIZE as u32)), true).unwrap();
        fs.create_path(Path::new(name).unwrap(), 0, None).unwrap();
        let ip = fs.open_path(Path::new(name).unwrap(), None).unwrap();
        (fs, File::open(ip))
    }

    #[test]
    fn cursor_advances_on_read_and_write() {
        let (_fs, mut f) = fs_with_file("/cursor");
        assert_eq!(f.tell(), 0);
        f.write(b"abcdef").unwrap();
        assert_eq!(f.tell(), 6);

        f.seek(2);
        let mut out = [0u8; 2];
        assert_eq!(f.read(&mut out).unwrap(), 2);
        assert_eq!(&out, b"cd");
        assert_eq!(f.tell(), 4);
    }

    #[test]
    fn seek_past_end_then_write_fills_the_gap_with_zeros() {
        let (_fs, mut f) = fs_with_file("/gap");
        f.write(b"x").unwrap();
        f.seek(1000);
        // reads at or past the length return nothing
        let mut out = [0u8; 4];
        assert_eq!(f.read(&mut out).unwrap(), 0);

        f.seek(1000);
        assert_eq!(f.write(b"y").unwrap(), 1);
        assert_eq!(f.length().unwrap(), 1001);
        f.seek(500);
        assert_eq!(f.read(&mut out[..1]).unwrap(), 1);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn handle_drop_releases_its_deny_reference() {
        let (fs, mut f) = fs_with_file("/deny");
        f.write(b"data").unwrap();
        f.deny_write();
        f.deny_write(); // idempotent per handle
        assert_eq!(f.write(b"nope").unwrap(), 0);
        drop(f);

        let ip = fs.open_path(Path::new("/deny").unwrap(), None).unwrap();
        let mut again = File::open(ip);
        assert_eq!(again.write(b"fine").unwrap(), 4);
    }

    #[test]
    fn fd_table_reserves_stdio_and_fills_lowest_first() {
        let (fs, f) = fs_with_file("/t");
        let mut table = FdTable::new();
        let fd = table.alloc(Fd::File(f)).unwrap();
        assert_eq!(fd, RESERVED_FDS);

        assert_eq!(table.get(0).unwrap_err(), FsError::BadArgument);
        assert_eq!(table.get(3).unwrap_err(), FsError::NotFound);

        table.close(fd).unwrap();
        assert_eq!(table.close(fd).unwrap_err(), FsError::NotFound);

        let ip = fs.open_path(Path::new("/t").unwrap(), None).unwrap();
        let fd2 = table.alloc(Fd::File(File::open(ip))).unwrap();
        assert_eq!(fd2, RESERVED_FDS); // freed slot is reused
    }

    #[test]
    fn fd_table_runs_out_of_handles() {
        let (fs, _keep) = fs_with_file("/many");
        let mut table = FdTable::new();
        for _ in RESERVED_FDS..NOFILE {
            let ip = fs.open_path(Path::new("/many").unwrap(), None).unwrap();
            table.alloc(Fd::File(File::open(ip))).unwrap();
        }
        let ip = fs.open_path(Path::new("/many").unwrap(), None).unwrap();
        assert_eq!(
            table.alloc(Fd::File(File::open(ip))).unwrap_err(),
            FsError::OutOfHandles
        );
    }
}
