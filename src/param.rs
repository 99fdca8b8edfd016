// Tunable parameters.

pub const NBUF: usize = 64; // size of the sector buffer cache
pub const NINODE: usize = 64; // maximum number of open inodes
pub const NOFILE: usize = 128; // per-process descriptor table size
pub const RESERVED_FDS: usize = 2; // fds 0 and 1 belong to the console
pub const NAME_MAX: usize = 14; // longest file name component
pub const MAXPATH: usize = 256; // longest path string
pub const FSSIZE: usize = 8192; // default device size in sectors
