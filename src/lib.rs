//! The on-disk file system of a small teaching operating system,
//! lifted onto the host: files and hierarchical directories on top of
//! a fixed-size sector device.
//!
//! Three subsystems carry the weight, stacked as a pipeline:
//!
//! * `bio`: a fixed-capacity write-back sector cache with clock
//!   eviction, which all disk I/O goes through;
//! * `fs`: inodes with a direct / indirect / doubly indirect sector
//!   map, directories stored as entry arrays inside directory inodes,
//!   and path resolution against a current directory;
//! * `sysfile`: per-process descriptor tables and the syscall-shaped
//!   surface the rest of the kernel consumes.
//!
//! `disk` adapts anything sector-addressable (an in-memory image, a
//! flat file) to the cache, `freemap` hands out device sectors, and
//! `semaphore` bounds how many cache entries can be pinned at once.

pub mod bio;
pub mod disk;
pub mod error;
pub mod file;
pub mod freemap;
pub mod fs;
pub mod param;
pub mod semaphore;
pub mod sysfile;

pub use crate::disk::{Disk, FileDisk, MemDisk, SectorDevice};
pub use crate::error::FsError;
pub use crate::file::{Fd, File, RawFd};
pub use crate::fs::{Dir, FileSys, Inode, Path};
pub use crate::sysfile::Proc;
