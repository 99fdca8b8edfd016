// Free-sector allocator.
//
// One bit per device sector, kept in memory behind a single mutex and
// persisted in the reserved sector range right after the boot sector.
// The allocator knows nothing about inodes or directories; it hands
// out contiguous runs of sectors and takes them back.

use std::sync::Mutex;

use log::debug;

use crate::bio::BufCache;
use crate::error::{FsError, Result};
use crate::fs::{FREE_MAP_SECTORS, FREE_MAP_START, ROOT_DIR_SECTOR, SECTOR_SIZE};

const MAP_BYTES: usize = FREE_MAP_SECTORS as usize * SECTOR_SIZE;

pub struct FreeMap {
    bits: Mutex<Bitmap>,
}

struct Bitmap {
    bytes: [u8; MAP_BYTES],
}

impl Bitmap {
    fn is_used(&self, sector: u32) -> bool {
        self.bytes[sector as usize / 8] & (1 << (sector % 8)) != 0
    }

    fn set(&mut self, sector: u32) {
        self.bytes[sector as usize / 8] |= 1 << (sector % 8);
    }

    fn clear(&mut self, sector: u32) {
        self.bytes[sector as usize / 8] &= !(1 << (sector % 8));
    }
}

impl FreeMap {
    /// Builds an all-free map for a device of `sector_count` sectors.
    /// The reserved bitmap range can track at most `MAP_BYTES * 8`
    /// sectors; larger devices are rejected.
    pub fn new(sector_count: u32) -> Result<Self> {
        if sector_count as usize > MAP_BYTES * 8 {
            return Err(FsError::OutOfRange);
        }
        let mut bits = Bitmap {
            bytes: [0; MAP_BYTES],
        };
        // bits past the end of the device must never be handed out
        for sector in sector_count..(MAP_BYTES * 8) as u32 {
            bits.set(sector);
        }
        Ok(Self {
            bits: Mutex::new(bits),
        })
    }

    /// Marks the fixed on-disk layout (boot sector, the bitmap itself,
    /// the root directory inode) as allocated. Part of formatting.
    pub fn format(&self) {
        let mut bits = self.bits.lock().unwrap();
        bits.set(0);
        for sector in FREE_MAP_START..FREE_MAP_START + FREE_MAP_SECTORS {
            bits.set(sector);
        }
        bits.set(ROOT_DIR_SECTOR);
    }

    /// Loads the persisted bitmap through the buffer cache.
    pub fn open(&self, cache: &BufCache) -> Result<()> {
        let mut bits = self.bits.lock().unwrap();
        for i in 0..FREE_MAP_SECTORS as usize {
            let chunk = &mut bits.bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            cache.read_range(FREE_MAP_START + i as u32, chunk, 0, SECTOR_SIZE)?;
        }
        Ok(())
    }

    /// Writes the bitmap back through the buffer cache.
    pub fn close(&self, cache: &BufCache) -> Result<()> {
        let bits = self.bits.lock().unwrap();
        for i in 0..FREE_MAP_SECTORS as usize {
            let chunk = &bits.bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            cache.write_range(FREE_MAP_START + i as u32, chunk, 0, SECTOR_SIZE)?;
        }
        Ok(())
    }

    /// Allocates `cnt` contiguous sectors and returns the first one.
    pub fn allocate(&self, cnt: usize) -> Result<u32> {
        if cnt == 0 {
            return Err(FsError::BadArgument);
        }
        let mut bits = self.bits.lock().unwrap();
        let limit = (MAP_BYTES * 8) as u32;
        let mut base = 0;
        'scan: while base + cnt as u32 <= limit {
            for i in 0..cnt as u32 {
                if bits.is_used(base + i) {
                    base += i + 1;
                    continue 'scan;
                }
            }
            for i in 0..cnt as u32 {
                bits.set(base + i);
            }
            return Ok(base);
        }
        debug!("freemap: out of sectors (wanted {})", cnt);
        Err(FsError::OutOfSpace)
    }

    /// Returns `cnt` sectors starting at `sector` to the pool.
    pub fn release(&self, sector: u32, cnt: usize) {
        let mut bits = self.bits.lock().unwrap();
        for i in 0..cnt as u32 {
            assert!(bits.is_used(sector + i), "freeing free sector {}", sector + i);
            bits.clear(sector + i);
        }
    }

    /// Number of sectors currently free.
    pub fn free_count(&self) -> usize {
        let bits = self.bits.lock().unwrap();
        bits.bytes.iter().map(|b| b.count_zeros() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Disk, MemDisk};
    use crate::param::FSSIZE;
    use std::sync::Arc;

    #[test]
    fn allocate_release_round_trip() {
        let map = FreeMap::new(FSSIZE as u32).unwrap();
        map.format();
        let free = map.free_count();

        let base = map.allocate(4).unwrap();
        assert_eq!(map.free_count(), free - 4);
        map.release(base, 4);
        assert_eq!(map.free_count(), free);
    }

    #[test]
    fn allocations_do_not_overlap() {
        let map = FreeMap::new(FSSIZE as u32).unwrap();
        map.format();
        let a = map.allocate(8).unwrap();
        let b = map.allocate(8).unwrap();
        assert!(a + 8 <= b || b + 8 <= a);
    }

    #[test]
    fn format_reserves_the_layout() {
        let map = FreeMap::new(FSSIZE as u32).unwrap();
        map.format();
        // every allocation must land past the root directory sector
        let first = map.allocate(1).unwrap();
        assert!(first > ROOT_DIR_SECTOR);
    }

    #[test]
    fn exhaustion_reports_out_of_space() {
        let map = FreeMap::new(16).unwrap();
        map.format();
        let free = map.free_count();
        let base = map.allocate(free).unwrap();
        assert_eq!(map.allocate(1), Err(FsError::OutOfSpace));
        map.release(base, free);
        assert!(map.allocate(1).is_ok());
    }

    #[test]
    fn oversized_device_is_rejected() {
        assert!(FreeMap::new((MAP_BYTES * 8) as u32 + 1).is_err());
    }

    #[test]
    fn persists_through_the_cache() {
        let disk = Arc::new(Disk::new(Box::new(MemDisk::new(FSSIZE as u32))));
        let cache = BufCache::new(Arc::clone(&disk));

        let map = FreeMap::new(FSSIZE as u32).unwrap();
        map.format();
        let base = map.allocate(3).unwrap();
        map.close(&cache).unwrap();
        cache.flush().unwrap();

        let map2 = FreeMap::new(FSSIZE as u32).unwrap();
        map2.open(&cache).unwrap();
        assert_eq!(map.free_count(), map2.free_count());
        // the persisted copy knows about the allocation
        map2.release(base, 3);
        assert_eq!(map2.free_count(), map.free_count() + 3);
    }
}
