//! Read-only FAT16 compatibility driver.
//!
//! Enough to mount legacy media and read files out of it: BPB parsing,
//! FAT chain walking, 8.3 names, subdirectories. Every mutating operation
//! reports `ReadOnly`.
//!
//! Inode numbering: the root directory is inode 1; every other object is
//! addressed by the absolute byte offset of its directory entry divided by
//! 32, plus 2, so `stat` can find the entry again without a search.

extern crate alloc;

use alloc::sync::Arc;

use cinder_abi::fs::FileKind;
use cinder_lib::{IrqMutex, klog_info};

use crate::blockdev::DevId;
use crate::buffer_cache;
use crate::error::{VfsError, VfsResult};
use crate::vfs::traits::{DirEntryInfo, FileSystem, InodeNum, InodeStat};

const ROOT_INO: InodeNum = 1;
const DIRENT_SIZE: u32 = 32;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_VOLUME_ID: u8 = 0x08;
/// End-of-chain marker threshold.
const FAT_EOC: u16 = 0xFFF8;

#[derive(Clone, Copy)]
struct Bpb {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    fat_count: u32,
    root_entries: u32,
    sectors_per_fat: u32,
}

impl Bpb {
    fn fat_offset(&self) -> u32 {
        self.reserved_sectors * self.bytes_per_sector
    }

    fn root_dir_offset(&self) -> u32 {
        self.fat_offset() + self.fat_count * self.sectors_per_fat * self.bytes_per_sector
    }

    fn root_dir_bytes(&self) -> u32 {
        self.root_entries * DIRENT_SIZE
    }

    fn data_offset(&self) -> u32 {
        self.root_dir_offset() + self.root_dir_bytes()
    }

    fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster * self.bytes_per_sector
    }

    fn cluster_offset(&self, cluster: u16) -> u32 {
        self.data_offset() + (cluster as u32 - 2) * self.cluster_bytes()
    }
}

#[derive(Clone, Copy)]
struct RawDirent {
    name: [u8; 11],
    attr: u8,
    first_cluster: u16,
    size: u32,
}

impl RawDirent {
    fn parse(raw: &[u8; 32]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[0..11]);
        Self {
            name,
            attr: raw[11],
            first_cluster: u16::from_le_bytes([raw[26], raw[27]]),
            size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    fn is_free(&self) -> bool {
        self.name[0] == 0x00 || self.name[0] == 0xE5
    }

    fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    /// Render `NAME    EXT` as `name.ext`.
    fn display_name(&self, out: &mut [u8; 12]) -> usize {
        let base_len = self.name[..8].iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        let ext_len = self.name[8..].iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        let mut len = 0;
        for &b in &self.name[..base_len] {
            out[len] = b.to_ascii_lowercase();
            len += 1;
        }
        if ext_len > 0 {
            out[len] = b'.';
            len += 1;
            for &b in &self.name[8..8 + ext_len] {
                out[len] = b.to_ascii_lowercase();
                len += 1;
            }
        }
        len
    }
}

/// Encode a VFS name as a padded 8.3 name; `None` when it does not fit.
fn encode_83(name: &[u8]) -> Option<[u8; 11]> {
    let mut parts = name.splitn(2, |&b| b == b'.');
    let base = parts.next()?;
    let ext = parts.next().unwrap_or(b"");
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }
    let mut out = [b' '; 11];
    for (i, &b) in base.iter().enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, &b) in ext.iter().enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    Some(out)
}

pub struct Fat16Fs {
    dev: DevId,
    bpb: IrqMutex<Bpb>,
}

impl Fat16Fs {
    pub fn probe(dev: DevId) -> VfsResult<Arc<dyn FileSystem>> {
        let mut raw = [0u8; 64];
        buffer_cache::read_bytes(dev, 0, &mut raw)?;
        let bpb = Bpb {
            bytes_per_sector: u16::from_le_bytes([raw[11], raw[12]]) as u32,
            sectors_per_cluster: raw[13] as u32,
            reserved_sectors: u16::from_le_bytes([raw[14], raw[15]]) as u32,
            fat_count: raw[16] as u32,
            root_entries: u16::from_le_bytes([raw[17], raw[18]]) as u32,
            sectors_per_fat: u16::from_le_bytes([raw[22], raw[23]]) as u32,
        };
        if bpb.bytes_per_sector == 0
            || bpb.sectors_per_cluster == 0
            || bpb.fat_count == 0
            || bpb.root_entries == 0
        {
            return Err(VfsError::Invalid);
        }
        klog_info!("fat16: dev {} mounted read-only", dev);
        Ok(Arc::new(Self {
            dev,
            bpb: IrqMutex::new(bpb),
        }))
    }

    fn next_cluster(&self, bpb: &Bpb, cluster: u16) -> VfsResult<Option<u16>> {
        let mut raw = [0u8; 2];
        buffer_cache::read_bytes(self.dev, bpb.fat_offset() + cluster as u32 * 2, &mut raw)?;
        let next = u16::from_le_bytes(raw);
        Ok(if next >= FAT_EOC || next < 2 {
            None
        } else {
            Some(next)
        })
    }

    /// Directory entry at absolute byte offset `offset`.
    fn dirent_at(&self, offset: u32) -> VfsResult<RawDirent> {
        let mut raw = [0u8; 32];
        buffer_cache::read_bytes(self.dev, offset, &mut raw)?;
        Ok(RawDirent::parse(&raw))
    }

    fn ino_to_offset(ino: InodeNum) -> u32 {
        (ino - 2) * DIRENT_SIZE
    }

    fn offset_to_ino(offset: u32) -> InodeNum {
        offset / DIRENT_SIZE + 2
    }

    /// Walk the entries of directory `ino`, invoking `f(offset, entry)`
    /// until it returns `false`.
    fn for_each_entry(
        &self,
        ino: InodeNum,
        mut f: impl FnMut(u32, &RawDirent) -> bool,
    ) -> VfsResult<()> {
        let bpb = *self.bpb.lock();
        if ino == ROOT_INO {
            let base = bpb.root_dir_offset();
            for i in 0..bpb.root_entries {
                let offset = base + i * DIRENT_SIZE;
                let entry = self.dirent_at(offset)?;
                if entry.name[0] == 0x00 {
                    break;
                }
                if !entry.is_free() && entry.attr & ATTR_VOLUME_ID == 0 && !f(offset, &entry) {
                    return Ok(());
                }
            }
            return Ok(());
        }

        let dirent = self.dirent_at(Self::ino_to_offset(ino))?;
        if !dirent.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        let mut cluster = Some(dirent.first_cluster);
        while let Some(c) = cluster {
            let base = bpb.cluster_offset(c);
            for i in 0..bpb.cluster_bytes() / DIRENT_SIZE {
                let offset = base + i * DIRENT_SIZE;
                let entry = self.dirent_at(offset)?;
                if entry.name[0] == 0x00 {
                    return Ok(());
                }
                if !entry.is_free() && entry.attr & ATTR_VOLUME_ID == 0 && !f(offset, &entry) {
                    return Ok(());
                }
            }
            cluster = self.next_cluster(&bpb, c)?;
        }
        Ok(())
    }
}

impl FileSystem for Fat16Fs {
    fn fs_name(&self) -> &'static str {
        "fat16"
    }

    fn dev(&self) -> DevId {
        self.dev
    }

    fn root_ino(&self) -> InodeNum {
        ROOT_INO
    }

    fn read_only(&self) -> bool {
        true
    }

    fn stat(&self, ino: InodeNum) -> VfsResult<InodeStat> {
        if ino == ROOT_INO {
            let mut stat = InodeStat::empty(ino, FileKind::Directory);
            stat.mode = 0o555;
            stat.nlink = 2;
            return Ok(stat);
        }
        let dirent = self.dirent_at(Self::ino_to_offset(ino))?;
        let kind = if dirent.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Regular
        };
        let mut stat = InodeStat::empty(ino, kind);
        stat.mode = if dirent.is_dir() { 0o555 } else { 0o444 };
        stat.size = dirent.size;
        stat.nlink = 1;
        Ok(stat)
    }

    fn lookup(&self, dir: InodeNum, name: &[u8]) -> VfsResult<InodeNum> {
        if name == b"." {
            return Ok(dir);
        }
        if name == b".." && dir == ROOT_INO {
            return Ok(ROOT_INO);
        }
        let wanted = encode_83(name).ok_or(VfsError::NotFound)?;
        let mut found = None;
        self.for_each_entry(dir, |offset, entry| {
            if entry.name == wanted {
                found = Some(Self::offset_to_ino(offset));
                false
            } else {
                true
            }
        })?;
        // ".." entries of subdirectories resolve through the stored
        // cluster like any other name; the 8.3 encoding above rejects it,
        // so handle the literal dot names first.
        if found.is_none() && name == b".." {
            self.for_each_entry(dir, |offset, entry| {
                if &entry.name[..2] == b".." {
                    found = Some(Self::offset_to_ino(offset));
                    false
                } else {
                    true
                }
            })?;
        }
        found.ok_or(VfsError::NotFound)
    }

    fn create(&self, _dir: InodeNum, _name: &[u8], _kind: FileKind, _mode: u16) -> VfsResult<InodeNum> {
        Err(VfsError::ReadOnly)
    }

    fn link(&self, _dir: InodeNum, _name: &[u8], _ino: InodeNum) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn unlink(&self, _dir: InodeNum, _name: &[u8]) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn rename(
        &self,
        _old_dir: InodeNum,
        _old_name: &[u8],
        _new_dir: InodeNum,
        _new_name: &[u8],
    ) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn read(&self, ino: InodeNum, offset: u32, buf: &mut [u8]) -> VfsResult<usize> {
        let dirent = self.dirent_at(Self::ino_to_offset(ino))?;
        if dirent.is_dir() {
            return Err(VfsError::IsDirectory);
        }
        if offset >= dirent.size {
            return Ok(0);
        }
        let bpb = *self.bpb.lock();
        let len = (buf.len() as u32).min(dirent.size - offset) as usize;
        let cluster_bytes = bpb.cluster_bytes();

        // Walk the chain to the starting cluster, then stream.
        let mut cluster = Some(dirent.first_cluster);
        let mut skip = offset / cluster_bytes;
        while skip > 0 {
            cluster = match cluster {
                Some(c) => self.next_cluster(&bpb, c)?,
                None => return Ok(0),
            };
            skip -= 1;
        }

        let mut done = 0usize;
        let mut within = offset % cluster_bytes;
        while done < len {
            let c = match cluster {
                Some(c) => c,
                None => break,
            };
            let chunk = ((cluster_bytes - within) as usize).min(len - done);
            buffer_cache::read_bytes(
                self.dev,
                bpb.cluster_offset(c) + within,
                &mut buf[done..done + chunk],
            )?;
            done += chunk;
            within = 0;
            cluster = self.next_cluster(&bpb, c)?;
        }
        Ok(done)
    }

    fn write(&self, _ino: InodeNum, _offset: u32, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::ReadOnly)
    }

    fn truncate(&self, _ino: InodeNum, _size: u32) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn readdir(&self, ino: InodeNum, pos: usize) -> VfsResult<Option<(DirEntryInfo, usize)>> {
        let mut result = None;
        let mut index = 0usize;
        self.for_each_entry(ino, |offset, entry| {
            if index < pos {
                index += 1;
                return true;
            }
            let mut name = [0u8; 12];
            let name_len = entry.display_name(&mut name);
            let kind = if entry.is_dir() {
                FileKind::Directory
            } else {
                FileKind::Regular
            };
            result = Some((
                DirEntryInfo::new(Self::offset_to_ino(offset), kind, &name[..name_len]),
                index + 1,
            ));
            false
        })?;
        Ok(result)
    }
}

/// Register the driver for mount-by-name.
pub fn register_driver() {
    crate::vfs::traits::register_fs_driver("fat16", Fat16Fs::probe);
}
