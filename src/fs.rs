// File system implementation. Four layers:
//   - Sectors: free-map allocator for raw device sectors.
//   - Files: inode creation, reading, writing, deferred removal.
//   - Directories: inodes with special contents (a dense array of
//     entries naming other inodes), including "." and "..".
//   - Names: paths like /usr/doc/notes.txt for convenient naming,
//     resolved against a per-process current directory.
//
// This file contains the low-level file system manipulation routines.
// The (higher-level) system call implementations are in sysfile.rs.
//
// Every on-disk header field is accessed through the buffer cache on
// each use; the in-memory inode holds nothing but the inode's sector
// number, its flags and its locks. Multi-byte on-disk integers are
// little-endian.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use array_macro::array;
use arrayvec::ArrayString;
use log::debug;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::BufCache;
use crate::disk::{Disk, SectorDevice};
use crate::error::{FsError, Result};
use crate::freemap::FreeMap;
use crate::param::{FSSIZE, NAME_MAX, NINODE};

pub const SECTOR_SIZE: usize = 512;

// Disk layout:
// [ boot sector | free map | root dir inode | on-demand sectors ]
pub const FREE_MAP_START: u32 = 1;
pub const FREE_MAP_SECTORS: u32 = ((FSSIZE + SECTOR_SIZE * 8 - 1) / (SECTOR_SIZE * 8)) as u32;
pub const ROOT_DIR_SECTOR: u32 = FREE_MAP_START + FREE_MAP_SECTORS;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = SECTOR_SIZE / 4;
pub const MAXSECTORS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Capacity, in entries, given to every new subdirectory: just its
/// "." and ".." self-entries. Adding more extends the inode.
const SUBDIR_INIT_ENTRIES: usize = 2;
/// Capacity given to the root directory on format.
const ROOT_INIT_ENTRIES: usize = 16;

// On-disk inode header. Exactly one sector. Written whole on create;
// individual fields are read back through the buffer cache at the
// offsets below.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    pub length: u32, // file size in bytes
    pub is_dir: u32,
    pub direct: [u32; NDIRECT],
    pub indirect: u32,
    pub dindirect: u32,
    pub magic: u32,
    pub pad: [u8; SECTOR_SIZE - 68],
}

const_assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

const OFF_LENGTH: usize = 0;
const OFF_IS_DIR: usize = 4;
const OFF_DIRECT: usize = 8;
const OFF_INDIRECT: usize = OFF_DIRECT + 4 * NDIRECT;
const OFF_DINDIRECT: usize = OFF_INDIRECT + 4;
const OFF_MAGIC: usize = OFF_DINDIRECT + 4;

impl DiskInode {
    fn new(length: u32, is_dir: bool) -> Self {
        Self {
            length: length.to_le(),
            is_dir: (is_dir as u32).to_le(),
            direct: [0; NDIRECT],
            indirect: 0,
            dindirect: 0,
            magic: INODE_MAGIC.to_le(),
            pad: [0; SECTOR_SIZE - 68],
        }
    }
}

// A single directory entry.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEnt {
    sector: u32, // inode sector of the entry; 0 in free slots
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

pub const DIRENT_SIZE: usize = mem::size_of::<DirEnt>();

const_assert!(DIRENT_SIZE == 20);

impl DirEnt {
    fn new(sector: u32, name: &str) -> Self {
        let mut e = Self {
            sector: sector.to_le(),
            name: [0; NAME_MAX + 1],
            in_use: 1,
        };
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        e
    }

    fn name_str(&self) -> Option<&str> {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).ok()
    }

    fn name_eq(&self, other: &str) -> bool {
        self.name_str() == Some(other)
    }
}

static ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

fn bytes_to_sectors(len: usize) -> usize {
    (len + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// The file system: one device, its cache, its allocator and the table
/// of open inodes. Shared process-wide behind an `Arc`.
pub struct FileSys {
    disk: Arc<Disk>,
    pub(crate) cache: BufCache,
    pub(crate) freemap: FreeMap,
    itable: ITable,
    me: Weak<FileSys>, // for minting owning handles from &self
}

impl FileSys {
    /// Opens the file system on `dev`. With `format`, writes a fresh
    /// free map and an empty root directory first.
    pub fn init(dev: Box<dyn SectorDevice>, format: bool) -> Result<Arc<Self>> {
        let disk = Arc::new(Disk::new(dev));
        let cache = BufCache::new(Arc::clone(&disk));
        let freemap = FreeMap::new(disk.sector_count())?;
        let fs = Arc::new_cyclic(|me| Self {
            disk,
            cache,
            freemap,
            itable: ITable::new(),
            me: me.clone(),
        });
        if format {
            fs.format()?;
        } else {
            fs.freemap.open(&fs.cache)?;
        }
        Ok(fs)
    }

    fn handle(&self) -> Arc<FileSys> {
        self.me.upgrade().unwrap()
    }

    fn format(&self) -> Result<()> {
        debug!("formatting file system");
        self.freemap.format();
        self.dir_create(ROOT_DIR_SECTOR, ROOT_INIT_ENTRIES)?;
        let root = Dir::open_root(self)?;
        root.add(".", ROOT_DIR_SECTOR)?;
        root.add("..", ROOT_DIR_SECTOR)?;
        self.freemap.close(&self.cache)
    }

    /// Writes any unwritten data back to the device. Called at
    /// shutdown.
    pub fn done(&self) -> Result<()> {
        self.freemap.close(&self.cache)?;
        self.cache.flush()
    }

    // Test hooks.

    pub fn buffer_reset(&self) -> Result<()> {
        self.cache.reset()
    }

    pub fn buffer_stats_reset(&self) {
        self.cache.stats_reset()
    }

    pub fn buffer_accesses(&self) -> u64 {
        self.cache.accesses()
    }

    pub fn buffer_miss_count(&self) -> u64 {
        self.cache.misses()
    }

    pub fn device_reads(&self) -> u64 {
        self.disk.reads()
    }

    pub fn device_writes(&self) -> u64 {
        self.disk.writes()
    }

    /// Number of distinct inodes currently open.
    pub fn open_inodes(&self) -> usize {
        let entries = self.itable.entries.lock().unwrap();
        entries.iter().filter(|e| e.is_some()).count()
    }

    // Buffered header access. Each call goes through the cache; no
    // header field is mirrored in memory.

    fn read_u32(&self, sector: u32, off: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.cache.read_range(sector, &mut buf, off, off + 4)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, sector: u32, off: usize, val: u32) -> Result<()> {
        self.cache.write_range(sector, &val.to_le_bytes(), off, off + 4)
    }

    fn iget_length(&self, sector: u32) -> Result<u32> {
        self.read_u32(sector, OFF_LENGTH)
    }

    fn iset_length(&self, sector: u32, length: u32) -> Result<()> {
        self.write_u32(sector, OFF_LENGTH, length)
    }

    fn iget_is_dir(&self, sector: u32) -> Result<bool> {
        Ok(self.read_u32(sector, OFF_IS_DIR)? != 0)
    }

    fn iget_direct(&self, sector: u32, i: usize) -> Result<u32> {
        self.read_u32(sector, OFF_DIRECT + 4 * i)
    }

    fn iset_direct(&self, sector: u32, i: usize, target: u32) -> Result<()> {
        self.write_u32(sector, OFF_DIRECT + 4 * i, target)
    }

    fn iget_indirect(&self, sector: u32) -> Result<u32> {
        self.read_u32(sector, OFF_INDIRECT)
    }

    fn iset_indirect(&self, sector: u32, target: u32) -> Result<()> {
        self.write_u32(sector, OFF_INDIRECT, target)
    }

    fn iget_dindirect(&self, sector: u32) -> Result<u32> {
        self.read_u32(sector, OFF_DINDIRECT)
    }

    fn iset_dindirect(&self, sector: u32, target: u32) -> Result<()> {
        self.write_u32(sector, OFF_DINDIRECT, target)
    }

    /// Pointer slot `i` of the indirect table stored in `table`.
    fn map_get(&self, table: u32, i: usize) -> Result<u32> {
        self.read_u32(table, 4 * i)
    }

    fn map_set(&self, table: u32, i: usize, target: u32) -> Result<()> {
        self.write_u32(table, 4 * i, target)
    }

    /// Allocates one sector and zero-fills it through the cache.
    fn get_sector(&self) -> Result<u32> {
        let sector = self.freemap.allocate(1)?;
        if let Err(e) = self.cache.write_range(sector, &ZERO_SECTOR, 0, SECTOR_SIZE) {
            self.freemap.release(sector, 1);
            return Err(e);
        }
        Ok(sector)
    }

    /// Device sector holding byte `pos` of the inode at
    /// `inode_sector`. The caller has clamped `pos` below the length,
    /// so the map must have it; an unmapped index is a corrupt map.
    fn map_sector(&self, inode_sector: u32, pos: usize) -> Result<u32> {
        let i = pos / SECTOR_SIZE;
        assert!(i < MAXSECTORS);
        let sector = if i < NDIRECT {
            self.iget_direct(inode_sector, i)?
        } else if i < NDIRECT + NINDIRECT {
            let ind = self.iget_indirect(inode_sector)?;
            assert!(ind != 0, "inode {}: no indirect sector", inode_sector);
            self.map_get(ind, i - NDIRECT)?
        } else {
            let j = i - NDIRECT - NINDIRECT;
            let dind = self.iget_dindirect(inode_sector)?;
            assert!(dind != 0, "inode {}: no doubly indirect sector", inode_sector);
            let tier = self.map_get(dind, j / NINDIRECT)?;
            assert!(tier != 0, "inode {}: hole in doubly indirect map", inode_sector);
            self.map_get(tier, j % NINDIRECT)?
        };
        assert!(sector != 0, "inode {}: unmapped sector index {}", inode_sector, i);
        Ok(sector)
    }

    /// Grows the sector map of the inode at `inode_sector` to cover
    /// the logical sector indices `[from, to)`. All-or-nothing: every
    /// needed sector, indirect tables included, is allocated up front,
    /// and on shortfall every reserved sector is released again.
    fn extend(&self, inode_sector: u32, from: usize, to: usize) -> Result<()> {
        if to > MAXSECTORS {
            return Err(FsError::OutOfRange);
        }
        if from >= to {
            return Ok(());
        }

        let mut needed = to - from;
        if (from..to).any(|i| (NDIRECT..NDIRECT + NINDIRECT).contains(&i))
            && self.iget_indirect(inode_sector)? == 0
        {
            needed += 1;
        }
        let first_dbl = from.max(NDIRECT + NINDIRECT);
        if first_dbl < to {
            let dind = self.iget_dindirect(inode_sector)?;
            if dind == 0 {
                needed += 1;
            }
            let tier_of = |i: usize| (i - NDIRECT - NINDIRECT) / NINDIRECT;
            for tier in tier_of(first_dbl)..=tier_of(to - 1) {
                if dind == 0 || self.map_get(dind, tier)? == 0 {
                    needed += 1;
                }
            }
        }

        let mut pool = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.get_sector() {
                Ok(sector) => pool.push(sector),
                Err(e) => {
                    for sector in pool {
                        self.freemap.release(sector, 1);
                    }
                    return Err(e);
                }
            }
        }

        // every needed sector is reserved now; installation cannot run
        // out of space
        let mut pool = pool.into_iter();
        for i in from..to {
            self.install_sector(inode_sector, i, &mut pool)?;
        }
        debug_assert!(pool.next().is_none());
        Ok(())
    }

    /// Maps logical sector index `i`, taking fresh sectors from the
    /// reserved pool.
    fn install_sector(
        &self,
        inode_sector: u32,
        i: usize,
        pool: &mut std::vec::IntoIter<u32>,
    ) -> Result<()> {
        let data = pool.next().expect("reserved data sector");
        if i < NDIRECT {
            self.iset_direct(inode_sector, i, data)
        } else if i < NDIRECT + NINDIRECT {
            let mut ind = self.iget_indirect(inode_sector)?;
            if ind == 0 {
                ind = pool.next().expect("reserved indirect sector");
                self.iset_indirect(inode_sector, ind)?;
            }
            self.map_set(ind, i - NDIRECT, data)
        } else {
            let j = i - NDIRECT - NINDIRECT;
            let mut dind = self.iget_dindirect(inode_sector)?;
            if dind == 0 {
                dind = pool.next().expect("reserved doubly indirect sector");
                self.iset_dindirect(inode_sector, dind)?;
            }
            let mut tier = self.map_get(dind, j / NINDIRECT)?;
            if tier == 0 {
                tier = pool.next().expect("reserved tier sector");
                self.map_set(dind, j / NINDIRECT, tier)?;
            }
            self.map_set(tier, j % NINDIRECT, data)
        }
    }

    /// Extends the inode so that bytes up to `new_length` are mapped,
    /// and raises the recorded length. No-op if already long enough.
    fn extend_to(&self, inode_sector: u32, new_length: u32) -> Result<()> {
        let length = self.iget_length(inode_sector)?;
        let from = bytes_to_sectors(length as usize);
        let to = bytes_to_sectors(new_length as usize);
        if to > from {
            self.extend(inode_sector, from, to)?;
        }
        if new_length > length {
            self.iset_length(inode_sector, new_length)?;
        }
        Ok(())
    }

    /// Writes a fresh on-disk inode at `sector` and allocates enough
    /// data sectors to cover `length` bytes.
    fn inode_create(&self, sector: u32, length: u32, is_dir: bool) -> Result<()> {
        let header = DiskInode::new(length, is_dir);
        self.cache
            .write_range(sector, header.as_bytes(), 0, SECTOR_SIZE)?;
        self.extend(sector, 0, bytes_to_sectors(length as usize))
    }

    /// Returns every sector reachable from the inode's map, and the
    /// inode sector itself, to the allocator.
    fn release_inode(&self, sector: u32) -> Result<()> {
        for i in 0..NDIRECT {
            let s = self.iget_direct(sector, i)?;
            if s == 0 {
                break;
            }
            self.freemap.release(s, 1);
        }
        let ind = self.iget_indirect(sector)?;
        self.release_tree(ind, 2)?;
        let dind = self.iget_dindirect(sector)?;
        self.release_tree(dind, 3)?;
        self.freemap.release(sector, 1);
        Ok(())
    }

    /// Releases the pointer tree rooted at `sector`; level 1 is a data
    /// sector, higher levels are tables of `level - 1` trees. Returns
    /// true once the walk runs past the allocated prefix of the map.
    fn release_tree(&self, sector: u32, level: u32) -> Result<bool> {
        if sector == 0 {
            return Ok(true);
        }
        if level > 1 {
            for i in 0..NINDIRECT {
                let child = self.map_get(sector, i)?;
                if self.release_tree(child, level - 1)? {
                    break;
                }
            }
        }
        self.freemap.release(sector, 1);
        Ok(false)
    }

    /// Returns the existing in-memory inode for `sector`, or reads
    /// the header off disk and installs one.
    pub fn inode_open(&self, sector: u32) -> Result<Inode> {
        let mut entries = self.itable.entries.lock().unwrap();
        for e in entries.iter() {
            if let Some(ip) = e {
                if ip.sector == sector {
                    return Ok(Inode::new(self, Arc::clone(ip)));
                }
            }
        }

        let magic = self.read_u32(sector, OFF_MAGIC)?;
        assert!(magic == INODE_MAGIC, "inode {}: bad magic {:#x}", sector, magic);

        let ip = Arc::new(MInode {
            sector,
            meta: Mutex::new(IMeta::default()),
            dir_lock: Mutex::new(()),
        });
        let slot = entries
            .iter_mut()
            .find(|e| e.is_none())
            .expect("inode table full");
        slot.replace(Arc::clone(&ip));
        Ok(Inode::new(self, ip))
    }

    /// Drops one reference to an in-memory inode. The last handle
    /// flushes the entry out of the table, and reclaims the inode's
    /// sectors if it was marked removed.
    fn itable_put(&self, ip: Arc<MInode>) {
        let mut entries = self.itable.entries.lock().unwrap();
        // two references left: the table's and the one being dropped
        if Arc::strong_count(&ip) == 2 {
            let removed = ip.meta.lock().unwrap().removed;
            if removed {
                debug!("reclaiming removed inode {}", ip.sector);
                if let Err(e) = self.release_inode(ip.sector) {
                    log::warn!("inode {}: reclamation failed: {}", ip.sector, e);
                }
            }
            for e in entries.iter_mut() {
                if matches!(e, Some(cur) if Arc::ptr_eq(cur, &ip)) {
                    e.take();
                }
            }
        }
    }

    /// Builds a directory inode with room for `entry_cnt` entries at
    /// the given sector.
    fn dir_create(&self, sector: u32, entry_cnt: usize) -> Result<()> {
        self.inode_create(sector, (entry_cnt * DIRENT_SIZE) as u32, true)
    }

    // Path-level operations, shared by the syscall surface.

    fn start_dir(&self, path: Path<'_>, cwd: Option<&Dir>) -> Result<Dir> {
        match cwd {
            Some(cwd) if !path.is_absolute() => Ok(cwd.reopen()),
            _ => Dir::open_root(self),
        }
    }

    /// Walks `path` and returns the inode it names.
    pub fn resolve(&self, path: Path<'_>, cwd: Option<&Dir>) -> Result<Inode> {
        let mut dir = self.start_dir(path, cwd)?;
        let mut parts = path.components().peekable();
        while let Some(part) = parts.next() {
            let part = part?;
            let next = {
                let _g = dir.inode.dir_lock();
                if dir.inode.is_removed() {
                    return Err(FsError::NotFound);
                }
                let (e, _) = dir.lookup_locked(part)?;
                self.inode_open(u32::from_le(e.sector))?
            };
            if next.is_dir()? {
                dir = Dir::open(next);
            } else {
                if parts.peek().is_some() {
                    return Err(FsError::NotADirectory);
                }
                return Ok(next);
            }
        }
        // out of components: the last directory is the target
        if dir.inode.is_removed() {
            return Err(FsError::NotFound);
        }
        Ok(dir.inode.reopen())
    }

    /// Resolves `path` and insists the result is a directory.
    pub fn resolve_dir(&self, path: Path<'_>, cwd: Option<&Dir>) -> Result<Dir> {
        let inode = self.resolve(path, cwd)?;
        if !inode.is_dir()? {
            return Err(FsError::NotADirectory);
        }
        Ok(Dir::open(inode))
    }

    /// Resolves everything but the final component; returns the parent
    /// directory and the leaf name.
    pub fn resolve_parent<'a>(
        &self,
        path: Path<'a>,
        cwd: Option<&Dir>,
    ) -> Result<(Dir, &'a str)> {
        let (parent, last) = path.split_parent()?;
        let dir = self.resolve_dir(parent, cwd)?;
        Ok((dir, last))
    }

    /// Creates a regular file of `size` bytes at `path`.
    pub fn create_path(&self, path: Path<'_>, size: u32, cwd: Option<&Dir>) -> Result<()> {
        let (dir, name) = self.resolve_parent(path, cwd)?;
        let _g = dir.inode.dir_lock();
        if dir.inode.is_removed() {
            return Err(FsError::NotFound);
        }
        if dir.lookup_locked(name).is_ok() {
            return Err(FsError::Exists);
        }
        let sector = self.freemap.allocate(1)?;
        if let Err(e) = self.inode_create(sector, size, false) {
            self.freemap.release(sector, 1);
            return Err(e);
        }
        if let Err(e) = dir.add_locked(name, sector) {
            let _ = self.release_inode(sector);
            return Err(e);
        }
        Ok(())
    }

    /// Opens the inode `path` names, file or directory.
    pub fn open_path(&self, path: Path<'_>, cwd: Option<&Dir>) -> Result<Inode> {
        self.resolve(path, cwd)
    }

    /// Removes the entry `path` names. Directories must be empty.
    pub fn remove_path(&self, path: Path<'_>, cwd: Option<&Dir>) -> Result<()> {
        let (dir, name) = self.resolve_parent(path, cwd)?;
        dir.remove(name)
    }

    /// Creates a subdirectory at `path`.
    pub fn mkdir_path(&self, path: Path<'_>, cwd: Option<&Dir>) -> Result<()> {
        let (dir, name) = self.resolve_parent(path, cwd)?;
        dir.subdir_create(name)
    }
}

struct ITable {
    entries: Mutex<[Option<Arc<MInode>>; NINODE]>,
}

impl ITable {
    fn new() -> Self {
        Self {
            entries: Mutex::new(array![None; NINODE]),
        }
    }
}

/// In-memory inode: sector number, flags and locks. The header stays
/// on disk (in the cache); open bookkeeping lives in the `Arc` count.
struct MInode {
    sector: u32,
    meta: Mutex<IMeta>,
    dir_lock: Mutex<()>,
}

#[derive(Default)]
struct IMeta {
    removed: bool,
    deny_write_cnt: u32,
}

/// A handle on an open inode. Cloning the handle reopens the inode;
/// dropping the last handle closes it and runs deferred removal.
pub struct Inode {
    fs: Arc<FileSys>,
    ip: Option<Arc<MInode>>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Inode")
    }
}

impl Inode {
    fn new(fs: &FileSys, ip: Arc<MInode>) -> Self {
        Self {
            fs: fs.handle(),
            ip: Some(ip),
        }
    }

    fn ip(&self) -> &Arc<MInode> {
        self.ip.as_ref().unwrap()
    }

    fn dir_lock(&self) -> MutexGuard<'_, ()> {
        self.ip().dir_lock.lock().unwrap()
    }

    /// Opens another handle on the same inode.
    pub fn reopen(&self) -> Inode {
        Inode {
            fs: Arc::clone(&self.fs),
            ip: Some(Arc::clone(self.ip())),
        }
    }

    /// The inode's sector number, its stable identifier.
    pub fn inumber(&self) -> u32 {
        self.ip().sector
    }

    /// Handles currently open on this inode.
    pub fn open_count(&self) -> usize {
        Arc::strong_count(self.ip()) - 1
    }

    pub fn length(&self) -> Result<u32> {
        let _meta = self.ip().meta.lock().unwrap();
        self.fs.iget_length(self.inumber())
    }

    pub fn is_dir(&self) -> Result<bool> {
        let _meta = self.ip().meta.lock().unwrap();
        self.fs.iget_is_dir(self.inumber())
    }

    /// Marks the inode for removal; its sectors are reclaimed when the
    /// last handle closes.
    pub fn mark_removed(&self) {
        self.ip().meta.lock().unwrap().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.ip().meta.lock().unwrap().removed
    }

    /// Blocks writes through any handle until a matching
    /// `allow_write`. Used while an executable image is running.
    pub fn deny_write(&self) {
        let mut meta = self.ip().meta.lock().unwrap();
        meta.deny_write_cnt += 1;
        assert!(meta.deny_write_cnt as usize <= self.open_count());
    }

    pub fn allow_write(&self) {
        let mut meta = self.ip().meta.lock().unwrap();
        assert!(meta.deny_write_cnt > 0);
        meta.deny_write_cnt -= 1;
    }

    /// Reads up to `dst.len()` bytes starting at `offset`, clamped to
    /// the current length. Returns the number of bytes read.
    pub fn read_at(&self, dst: &mut [u8], offset: u32) -> Result<usize> {
        let _meta = self.ip().meta.lock().unwrap();
        let length = self.fs.iget_length(self.inumber())? as usize;
        let size = dst.len();
        let mut offset = offset as usize;
        let mut done = 0;
        while done < size && offset < length {
            let sector = self.fs.map_sector(self.inumber(), offset)?;
            let sector_ofs = offset % SECTOR_SIZE;
            let chunk = (size - done)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - offset);
            self.fs.cache.read_range(
                sector,
                &mut dst[done..done + chunk],
                sector_ofs,
                sector_ofs + chunk,
            )?;
            done += chunk;
            offset += chunk;
        }
        Ok(done)
    }

    /// Writes `src` at `offset`, extending the file first if it ends
    /// past the current length. A failed extension writes nothing and
    /// returns 0; so does a write while writes are denied.
    pub fn write_at(&self, src: &[u8], offset: u32) -> Result<usize> {
        let size = src.len();
        if size == 0 {
            return Ok(0);
        }
        let meta = self.ip().meta.lock().unwrap();
        if meta.deny_write_cnt > 0 {
            return Ok(0);
        }
        let end = offset as usize + size;
        if end > MAXSECTORS * SECTOR_SIZE {
            return Ok(0);
        }
        let length = self.fs.iget_length(self.inumber())? as usize;
        if end > length && self.fs.extend_to(self.inumber(), end as u32).is_err() {
            return Ok(0);
        }
        let _meta = meta; // held to the end: writers serialize per inode

        let mut offset = offset as usize;
        let mut done = 0;
        while done < size {
            let sector = self.fs.map_sector(self.inumber(), offset)?;
            let sector_ofs = offset % SECTOR_SIZE;
            let chunk = (size - done).min(SECTOR_SIZE - sector_ofs);
            self.fs.cache.write_range(
                sector,
                &src[done..done + chunk],
                sector_ofs,
                sector_ofs + chunk,
            )?;
            done += chunk;
            offset += chunk;
        }
        Ok(done)
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let ip = self.ip.take().unwrap();
        self.fs.itable_put(ip);
    }
}

/// An open directory: an inode handle plus an enumeration position.
pub struct Dir {
    inode: Inode,
    pos: u32,
}

impl Dir {
    /// Takes ownership of `inode`, which must be a directory.
    pub fn open(inode: Inode) -> Dir {
        Dir { inode, pos: 0 }
    }

    pub fn open_root(fs: &FileSys) -> Result<Dir> {
        Ok(Dir::open(fs.inode_open(ROOT_DIR_SECTOR)?))
    }

    /// A fresh handle on the same directory, rewound to the start.
    pub fn reopen(&self) -> Dir {
        Dir {
            inode: self.inode.reopen(),
            pos: 0,
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    fn read_entry(&self, ofs: u32) -> Result<Option<DirEnt>> {
        let mut buf = [0u8; DIRENT_SIZE];
        if self.inode.read_at(&mut buf, ofs)? < DIRENT_SIZE {
            return Ok(None);
        }
        Ok(Some(DirEnt::read_from(&buf[..]).unwrap()))
    }

    /// Scans for `name`. Caller holds the directory lock.
    fn lookup_locked(&self, name: &str) -> Result<(DirEnt, u32)> {
        let mut ofs = 0;
        while let Some(e) = self.read_entry(ofs)? {
            if e.in_use != 0 && e.name_eq(name) {
                return Ok((e, ofs));
            }
            ofs += DIRENT_SIZE as u32;
        }
        Err(FsError::NotFound)
    }

    /// Looks `name` up and opens its inode. "." and ".." resolve like
    /// any other entry.
    pub fn lookup(&self, name: &str) -> Result<Inode> {
        let _g = self.inode.dir_lock();
        let (e, _) = self.lookup_locked(name)?;
        self.inode.fs.inode_open(u32::from_le(e.sector))
    }

    /// Writes an entry into the first free slot, or appends one.
    /// Caller holds the directory lock.
    fn add_locked(&self, name: &str, sector: u32) -> Result<()> {
        if name.is_empty() {
            return Err(FsError::BadArgument);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        if self.lookup_locked(name).is_ok() {
            return Err(FsError::Exists);
        }
        let mut ofs = 0;
        while let Some(e) = self.read_entry(ofs)? {
            if e.in_use == 0 {
                break;
            }
            ofs += DIRENT_SIZE as u32;
        }
        let e = DirEnt::new(sector, name);
        if self.inode.write_at(e.as_bytes(), ofs)? != DIRENT_SIZE {
            return Err(FsError::OutOfSpace);
        }
        Ok(())
    }

    pub fn add(&self, name: &str, sector: u32) -> Result<()> {
        let _g = self.inode.dir_lock();
        self.add_locked(name, sector)
    }

    /// Frees the entry for `name` and marks its inode removed; the
    /// sectors come back once the last opener closes. A directory can
    /// only be removed while empty.
    pub fn remove(&self, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(FsError::BadArgument);
        }
        let _g = self.inode.dir_lock();
        let (mut e, ofs) = self.lookup_locked(name)?;
        let target = self.inode.fs.inode_open(u32::from_le(e.sector))?;
        if target.is_dir()? {
            let sub = Dir::open(target.reopen());
            let empty = {
                let _sub_g = sub.inode.dir_lock();
                sub.is_empty_locked()?
            };
            if !empty {
                return Err(FsError::NotEmpty);
            }
        }
        e.in_use = 0;
        if self.inode.write_at(e.as_bytes(), ofs)? != DIRENT_SIZE {
            return Err(FsError::DeviceError);
        }
        target.mark_removed();
        Ok(())
    }

    fn is_empty_locked(&self) -> Result<bool> {
        let mut ofs = 0;
        while let Some(e) = self.read_entry(ofs)? {
            if e.in_use != 0 && !e.name_eq(".") && !e.name_eq("..") {
                return Ok(false);
            }
            ofs += DIRENT_SIZE as u32;
        }
        Ok(true)
    }

    /// True iff the directory holds nothing besides "." and "..".
    pub fn is_empty(&self) -> Result<bool> {
        let _g = self.inode.dir_lock();
        self.is_empty_locked()
    }

    /// Yields the next entry name, skipping free slots and the "."
    /// and ".." self-entries.
    pub fn readdir(&mut self) -> Result<Option<ArrayString<NAME_MAX>>> {
        let _g = self.inode.dir_lock();
        while let Some(e) = self.read_entry(self.pos)? {
            self.pos += DIRENT_SIZE as u32;
            if e.in_use != 0 && !e.name_eq(".") && !e.name_eq("..") {
                if let Some(name) = e.name_str() {
                    return Ok(Some(ArrayString::from(name).unwrap()));
                }
            }
        }
        Ok(None)
    }

    /// Creates a directory named `name` inside `self`, with its "."
    /// and ".." entries pointing at itself and at `self`.
    pub fn subdir_create(&self, name: &str) -> Result<()> {
        let fs = &self.inode.fs;
        let _g = self.inode.dir_lock();
        if self.inode.is_removed() {
            return Err(FsError::NotFound);
        }
        if self.lookup_locked(name).is_ok() {
            return Err(FsError::Exists);
        }
        let sector = fs.freemap.allocate(1)?;
        if let Err(e) = fs.dir_create(sector, SUBDIR_INIT_ENTRIES) {
            fs.freemap.release(sector, 1);
            return Err(e);
        }
        if let Err(e) = self.add_locked(name, sector) {
            let _ = fs.release_inode(sector);
            return Err(e);
        }
        let child = Dir::open(fs.inode_open(sector)?);
        {
            let _child_g = child.inode.dir_lock();
            child.add_locked(".", sector)?;
            child.add_locked("..", self.inode.inumber())?;
        }
        Ok(())
    }
}

/// A borrowed path string: `/`-separated components, absolute when it
/// starts with `/`, otherwise relative to the current directory. The
/// empty path names the current directory itself.
#[derive(Clone, Copy)]
pub struct Path<'a> {
    inner: &'a str,
}

impl<'a> Path<'a> {
    pub fn new(s: &'a str) -> Result<Path<'a>> {
        if s.len() > crate::param::MAXPATH {
            return Err(FsError::PathTooLong);
        }
        Ok(Path { inner: s })
    }

    pub fn is_absolute(&self) -> bool {
        self.inner.starts_with('/')
    }

    pub fn components(&self) -> Components<'a> {
        Components { rest: self.inner }
    }

    /// Splits off the final component: `"a/b/c"` becomes `("a/", "c")`.
    /// Trailing slashes are ignored. Fails on paths with no component
    /// (the root, or the empty path).
    pub fn split_parent(&self) -> Result<(Path<'a>, &'a str)> {
        let trimmed = self.inner.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::BadArgument);
        }
        let (parent, last) = match trimmed.rfind('/') {
            Some(i) => (&trimmed[..=i], &trimmed[i + 1..]),
            None => ("", trimmed),
        };
        if last.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        Ok((Path { inner: parent }, last))
    }
}

pub struct Components<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Components<'a> {
    type Item = Result<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest.trim_start_matches('/');
        if rest.is_empty() {
            self.rest = rest;
            return None;
        }
        let (part, rest) = match rest.split_once('/') {
            Some((part, rest)) => (part, rest),
            None => (rest, ""),
        };
        self.rest = rest;
        if part.len() > NAME_MAX {
            return Some(Err(FsError::NameTooLong));
        }
        Some(Ok(part))
    }
}
