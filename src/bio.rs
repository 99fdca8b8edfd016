// Buffer cache.
//
// The buffer cache is a fixed array of slots holding cached copies of
// disk sector contents. Caching sectors in memory reduces the number
// of device accesses and also provides a synchronization point for
// sectors used by multiple threads.
//
// Interface:
// * To copy bytes out of a cached sector, call read_range.
// * To copy bytes into a cached sector, call write_range; the entry
//   is written back when it is evicted or on flush.
// * flush writes back every dirty entry but keeps them cached;
//   reset additionally drops them (used by the test hooks).
//
// Two levels of locking. The cache mutex owns the slot-to-sector map:
// nothing is installed or evicted without it. Each slot has its own
// lock guarding the data bytes and flags. The cache mutex is always
// acquired before a slot lock, and a thread holding a slot lock never
// takes the cache mutex.
//
// The activity semaphore bounds the number of simultaneously pinned
// entries so the clock sweep can always find a victim. A caller that
// fails to get a permit releases its slot lock and parks on the
// waiters condvar; the release and the park are made atomic by the
// waiters mutex, and every unpin notifies the condvar. A caller that
// waited must re-verify its entry, which may have been evicted in the
// meantime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use array_macro::array;
use log::trace;

use crate::disk::Disk;
use crate::error::Result;
use crate::fs::SECTOR_SIZE;
use crate::param::NBUF;
use crate::semaphore::Semaphore;

pub struct BufCache {
    disk: Arc<Disk>,
    slots: [Mutex<SectorBuf>; NBUF],
    map: Mutex<CacheMap>,
    active: Semaphore,
    waiters: Mutex<()>,
    inactive: Condvar,
    accesses: AtomicU64,
    misses: AtomicU64,
}

/// Who lives where. Guarded by the cache mutex.
struct CacheMap {
    resident: [Option<u32>; NBUF],
    hand: usize,
}

impl CacheMap {
    fn find(&self, sector: u32) -> Option<usize> {
        self.resident.iter().position(|s| *s == Some(sector))
    }
}

struct SectorBuf {
    sector: u32, // synced with the map entry while resident
    used: bool,  // recently-used flag for the clock sweep
    dirty: bool,
    data: [u8; SECTOR_SIZE],
}

impl SectorBuf {
    fn new() -> Self {
        Self {
            sector: 0,
            used: false,
            dirty: false,
            data: [0; SECTOR_SIZE],
        }
    }
}

/// A pinned cache entry. Holds the slot lock and one permit of the
/// activity semaphore; dropping it releases both and notifies any
/// thread waiting for room.
struct BufGuard<'a> {
    cache: &'a BufCache,
    buf: Option<MutexGuard<'a, SectorBuf>>,
}

impl BufGuard<'_> {
    fn data(&self) -> &[u8; SECTOR_SIZE] {
        &self.buf.as_ref().unwrap().data
    }

    fn write(&mut self, src: &[u8], start: usize, end: usize) {
        let buf = self.buf.as_mut().unwrap();
        buf.data[start..end].copy_from_slice(&src[..end - start]);
        buf.dirty = true;
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // Release the slot lock before giving the permit back; a thread
        // holding a slot lock must never wait on the cache mutex, and
        // the woken thread re-takes the cache mutex first thing.
        self.buf.take();
        self.cache.active.up();
        let _waiters = self.cache.waiters.lock().unwrap();
        self.cache.inactive.notify_all();
    }
}

impl BufCache {
    pub fn new(disk: Arc<Disk>) -> Self {
        Self {
            disk,
            slots: array![_ => Mutex::new(SectorBuf::new()); NBUF],
            map: Mutex::new(CacheMap {
                resident: [None; NBUF],
                hand: 0,
            }),
            active: Semaphore::new(NBUF),
            waiters: Mutex::new(()),
            inactive: Condvar::new(),
            accesses: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Copies the bytes `[start, end)` of `sector` into `dst`.
    pub fn read_range(&self, sector: u32, dst: &mut [u8], start: usize, end: usize) -> Result<()> {
        assert!(start <= end && end <= SECTOR_SIZE);
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let buf = self.pin(sector)?;
        dst[..end - start].copy_from_slice(&buf.data()[start..end]);
        Ok(())
    }

    /// Copies `src` into the bytes `[start, end)` of `sector` and
    /// marks the entry dirty.
    pub fn write_range(&self, sector: u32, src: &[u8], start: usize, end: usize) -> Result<()> {
        assert!(start <= end && end <= SECTOR_SIZE);
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let mut buf = self.pin(sector)?;
        buf.write(src, start, end);
        Ok(())
    }

    /// Returns a pinned entry caching `sector`, installing one on a
    /// miss.
    fn pin(&self, sector: u32) -> Result<BufGuard<'_>> {
        loop {
            let mut map = self.map.lock().unwrap();
            if let Some(slot) = map.find(sector) {
                // Hit: take the slot lock under the cache mutex, grant
                // the second chance, then let go of the map.
                let mut buf = self.slots[slot].lock().unwrap();
                debug_assert_eq!(buf.sector, sector);
                buf.used = true;
                drop(map);

                let waiters = self.waiters.lock().unwrap();
                if self.active.try_down() {
                    drop(waiters);
                    return Ok(BufGuard {
                        cache: self,
                        buf: Some(buf),
                    });
                }
                // No room. The slot lock must be released before
                // sleeping or eviction could never free a slot; the
                // waiters mutex makes release-then-park atomic with
                // respect to the notifying side.
                drop(buf);
                let _waiters = self.inactive.wait(waiters).unwrap();
                continue; // re-verify: the entry may be gone by now
            }

            // Miss: confirm absence happened under the cache mutex just
            // above. Get a permit for the incoming entry first.
            let waiters = self.waiters.lock().unwrap();
            if !self.active.try_down() {
                drop(map);
                let _waiters = self.inactive.wait(waiters).unwrap();
                continue; // a concurrent miss may have populated it
            }
            drop(waiters);

            self.misses.fetch_add(1, Ordering::Relaxed);
            let slot = match self.take_slot(&mut map) {
                Ok(slot) => slot,
                Err(e) => {
                    self.give_back_permit();
                    return Err(e);
                }
            };
            debug_assert!(map.resident[slot].is_none());

            let mut buf = self.slots[slot].lock().unwrap();
            buf.sector = sector;
            buf.used = true;
            buf.dirty = false;
            if let Err(e) = self.disk.read(sector, &mut buf.data) {
                drop(buf);
                self.give_back_permit();
                return Err(e);
            }
            map.resident[slot] = Some(sector);
            drop(map);
            return Ok(BufGuard {
                cache: self,
                buf: Some(buf),
            });
        }
    }

    /// Finds a free slot, evicting one if necessary. Caller holds the
    /// cache mutex. Empty slots are preferred; otherwise the clock
    /// hand sweeps, clearing recently-used flags and skipping slots
    /// whose lock cannot be taken without blocking (those are pinned).
    /// The activity semaphore guarantees an unpinned entry exists.
    fn take_slot(&self, map: &mut CacheMap) -> Result<usize> {
        if let Some(slot) = map.resident.iter().position(|s| s.is_none()) {
            return Ok(slot);
        }
        loop {
            let slot = map.hand;
            map.hand = (map.hand + 1) % NBUF;
            if let Ok(mut buf) = self.slots[slot].try_lock() {
                if buf.used {
                    buf.used = false; // second chance
                    continue;
                }
                if buf.dirty {
                    trace!("bcache: evict dirty sector {}", buf.sector);
                    self.disk.write(buf.sector, &buf.data)?;
                    buf.dirty = false;
                }
                map.resident[slot] = None;
                return Ok(slot);
            }
        }
    }

    fn give_back_permit(&self) {
        self.active.up();
        let _waiters = self.waiters.lock().unwrap();
        self.inactive.notify_all();
    }

    /// Writes back every dirty entry; entries stay cached.
    pub fn flush(&self) -> Result<()> {
        let map = self.map.lock().unwrap();
        for (slot, resident) in map.resident.iter().enumerate() {
            if resident.is_some() {
                let mut buf = self.slots[slot].lock().unwrap();
                if buf.dirty {
                    self.disk.write(buf.sector, &buf.data)?;
                    buf.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Writes back every dirty entry and drops all of them.
    pub fn reset(&self) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        for slot in 0..NBUF {
            if map.resident[slot].is_some() {
                let mut buf = self.slots[slot].lock().unwrap();
                if buf.dirty {
                    self.disk.write(buf.sector, &buf.data)?;
                    buf.dirty = false;
                }
                map.resident[slot] = None;
            }
        }
        map.hand = 0;
        Ok(())
    }

    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn stats_reset(&self) {
        self.accesses.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
