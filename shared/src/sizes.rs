pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

/// Size of one block-device sector in bytes.
pub const SECTOR_SIZE: usize = 512;
