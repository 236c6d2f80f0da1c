//! Backup Byte Layout, §4.H.
//!
//! A backup file is a fixed-size, page-aligned header followed by the raw,
//! page-aligned bytes of the item. Grounded on `Fam_Memory_Service_Direct::backup`/
//! `restore`/`get_backup_info`/`list_backup`/`delete_backup` in
//! `examples/original_source/src/memory_service/fam_memory_service_direct.cpp`, which
//! resolve a backup name under the configured `fam_backup_path` and delegate the byte
//! layout to the allocator; the header fields here (region id, item size, uid/gid/mode,
//! name) are exactly what the RPC surface's `backup`/`get_backup_info` operations need
//! to round-trip. The header type is `bytemuck::Pod`, the same pattern the ATL message
//! header uses to move a fixed-size record between Rust and raw bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};

use crate::allocator::pool::PoolAllocator;
use crate::error::{FamError, FamResult};
use crate::util::constants::BYTES_IN_PAGE;

const MAGIC: u64 = 0x4641_4d5f_4255_504b; // "FAM_BUPK" in ASCII, byte-reversed by endianness but unique enough
const NAME_CAP: usize = 256;

/// Fixed-size backup header, padded to exactly one page so the payload that follows it
/// always starts on a page boundary.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawHeader {
    magic: u64,
    region_id: u64,
    item_size: u64,
    file_start_pos: u64,
    uid: u32,
    gid: u32,
    mode: u32,
    name_len: u32,
    name: [u8; NAME_CAP],
    _reserved: [u8; BYTES_IN_PAGE - (8 * 4 + 4 * 4 + NAME_CAP)],
}

/// Ergonomic view over [`RawHeader`], returned by [`get_backup_info`]/[`restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub file_start_pos: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawHeader>(), BYTES_IN_PAGE);

fn header_size() -> usize {
    std::mem::size_of::<RawHeader>()
}

fn backup_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

fn page_align_up(n: u64) -> u64 {
    let page = BYTES_IN_PAGE as u64;
    (n + page - 1) / page * page
}

/// Check requester `(uid, gid)` against the file's owner `(file_uid, file_gid)` and
/// POSIX `mode` bits for read access, the same three-tier owner/group/other check
/// `stat`-based permission gates use elsewhere in this system.
fn permits_read(mode: u32, file_uid: u32, file_gid: u32, uid: u32, gid: u32) -> bool {
    const S_IRUSR: u32 = 0o400;
    const S_IRGRP: u32 = 0o040;
    const S_IROTH: u32 = 0o004;
    if uid == file_uid {
        mode & S_IRUSR != 0
    } else if gid == file_gid {
        mode & S_IRGRP != 0
    } else {
        mode & S_IROTH != 0
    }
}

/// Back up `size` bytes of `region_id` starting at `offset` into `backup_dir/name`.
/// `file_start_pos` records where this file's payload begins within the logical
/// (possibly cross-server striped) item, so `restore` can reassemble a striped backup
/// from several per-server files.
#[allow(clippy::too_many_arguments)]
pub fn backup(
    pool: &PoolAllocator,
    backup_dir: &Path,
    name: &str,
    region_id: u64,
    offset: u64,
    size: u64,
    file_start_pos: u64,
    uid: u32,
    gid: u32,
    mode: u32,
) -> FamResult<()> {
    fs::create_dir_all(backup_dir).map_err(|e| FamError::resource(format!("backup: {e}")))?;
    if name.len() >= NAME_CAP {
        return Err(FamError::out_of_range("backup name too long"));
    }

    let mut header = RawHeader::zeroed();
    header.magic = MAGIC;
    header.region_id = region_id;
    header.item_size = size;
    header.file_start_pos = file_start_pos;
    header.uid = uid;
    header.gid = gid;
    header.mode = mode;
    header.name_len = name.len() as u32;
    header.name[..name.len()].copy_from_slice(name.as_bytes());

    let path = backup_path(backup_dir, name);
    let mut file = File::create(&path).map_err(|e| FamError::resource(format!("backup: {e}")))?;
    file.write_all(bytemuck::bytes_of(&header))
        .map_err(|e| FamError::resource(format!("backup: {e}")))?;

    let src = pool.get_local_pointer(region_id, offset)?;
    let bytes = unsafe { std::slice::from_raw_parts(src.to_ptr::<u8>(), size as usize) };
    file.write_all(bytes)
        .map_err(|e| FamError::resource(format!("backup: {e}")))?;

    let padded_payload = page_align_up(size);
    if padded_payload > size {
        let pad = vec![0u8; (padded_payload - size) as usize];
        file.write_all(&pad)
            .map_err(|e| FamError::resource(format!("backup: {e}")))?;
    }
    Ok(())
}

fn read_header(path: &Path) -> FamResult<RawHeader> {
    let mut file = File::open(path).map_err(|_| FamError::not_found("backup not found"))?;
    let mut buf = vec![0u8; header_size()];
    file.read_exact(&mut buf)
        .map_err(|e| FamError::resource(format!("restore: {e}")))?;
    let header: RawHeader = *bytemuck::from_bytes(&buf);
    if header.magic != MAGIC {
        return Err(FamError::resource("backup file has an invalid header"));
    }
    Ok(header)
}

/// Restore a previously backed-up item into `(dest_region_id, dest_offset)`, which
/// must already be allocated with at least the backup's `item_size` bytes. Checks
/// `(uid, gid)` for read permission against the header's recorded owner/mode first.
pub fn restore(
    pool: &PoolAllocator,
    backup_dir: &Path,
    name: &str,
    dest_region_id: u64,
    dest_offset: u64,
    requester_uid: u32,
    requester_gid: u32,
) -> FamResult<BackupInfo> {
    let path = backup_path(backup_dir, name);
    let header = read_header(&path)?;
    if !permits_read(header.mode, header.uid, header.gid, requester_uid, requester_gid) {
        return Err(FamError::no_permission("requester lacks read permission on backup"));
    }

    let mut file = File::open(&path).map_err(|_| FamError::not_found("backup not found"))?;
    file.seek(SeekFrom::Start(header_size() as u64))
        .map_err(|e| FamError::resource(format!("restore: {e}")))?;
    let mut payload = vec![0u8; header.item_size as usize];
    file.read_exact(&mut payload)
        .map_err(|e| FamError::resource(format!("restore: {e}")))?;

    let dst = pool.get_local_pointer(dest_region_id, dest_offset)?;
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), dst.to_mut_ptr::<u8>(), payload.len());
    }

    Ok(BackupInfo {
        name: name.to_string(),
        mode: header.mode,
        size: header.item_size,
        uid: header.uid,
        gid: header.gid,
        file_start_pos: header.file_start_pos,
    })
}

pub fn get_backup_info(backup_dir: &Path, name: &str, requester_uid: u32, requester_gid: u32) -> FamResult<BackupInfo> {
    let header = read_header(&backup_path(backup_dir, name))?;
    if !permits_read(header.mode, header.uid, header.gid, requester_uid, requester_gid) {
        return Err(FamError::no_permission("requester lacks read permission on backup"));
    }
    Ok(BackupInfo {
        name: name.to_string(),
        mode: header.mode,
        size: header.item_size,
        uid: header.uid,
        gid: header.gid,
        file_start_pos: header.file_start_pos,
    })
}

/// List backup file names under `backup_dir` matching `pattern` as a plain substring
/// filter, one name per line.
pub fn list_backup(backup_dir: &Path, pattern: &str) -> FamResult<String> {
    let mut names = Vec::new();
    let entries = fs::read_dir(backup_dir).map_err(|e| FamError::resource(format!("list_backup: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| FamError::resource(format!("list_backup: {e}")))?;
        if let Some(name) = entry.file_name().to_str() {
            if pattern.is_empty() || name.contains(pattern) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names.join("\n"))
}

pub fn delete_backup(backup_dir: &Path, name: &str) -> FamResult<()> {
    let path = backup_path(backup_dir, name);
    fs::remove_file(&path).map_err(|_| FamError::not_found("backup not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::MIN_REGION_SIZE;

    #[test]
    fn backup_then_restore_round_trips_bytes_and_metadata() {
        let pool = PoolAllocator::new(0);
        pool.create_region(1, MIN_REGION_SIZE as u64).unwrap();
        let src_off = pool.allocate(1, 256).unwrap();
        let src_ptr = pool.get_local_pointer(1, src_off).unwrap();
        for i in 0..256u64 {
            unsafe {
                (src_ptr + i as usize).store::<u8>((i % 200) as u8);
            }
        }

        let dir = tempdir();
        backup(&pool, &dir, "item.bak", 1, src_off, 256, 0, 1000, 1000, 0o640).unwrap();

        let dst_off = pool.allocate(1, 256).unwrap();
        let info = restore(&pool, &dir, "item.bak", 1, dst_off, 1000, 1000).unwrap();
        assert_eq!(info.size, 256);
        assert_eq!(info.uid, 1000);

        let dst_ptr = pool.get_local_pointer(1, dst_off).unwrap();
        for i in 0..256u64 {
            unsafe {
                assert_eq!((dst_ptr + i as usize).load::<u8>(), (i % 200) as u8);
            }
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn restore_rejects_unauthorized_requester() {
        let pool = PoolAllocator::new(0);
        pool.create_region(2, MIN_REGION_SIZE as u64).unwrap();
        let src_off = pool.allocate(2, 128).unwrap();
        let dir = tempdir();
        backup(&pool, &dir, "secret.bak", 2, src_off, 128, 0, 1000, 1000, 0o600).unwrap();

        let dst_off = pool.allocate(2, 128).unwrap();
        let result = restore(&pool, &dir, "secret.bak", 2, dst_off, 2000, 2000);
        assert!(result.is_err());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn list_and_delete_backup_round_trip() {
        let pool = PoolAllocator::new(0);
        pool.create_region(3, MIN_REGION_SIZE as u64).unwrap();
        let off = pool.allocate(3, 64).unwrap();
        let dir = tempdir();
        backup(&pool, &dir, "alpha.bak", 3, off, 64, 0, 0, 0, 0o644).unwrap();
        backup(&pool, &dir, "beta.bak", 3, off, 64, 0, 0, 0, 0o644).unwrap();

        let listing = list_backup(&dir, "").unwrap();
        assert!(listing.contains("alpha.bak"));
        assert!(listing.contains("beta.bak"));

        delete_backup(&dir, "alpha.bak").unwrap();
        let listing = list_backup(&dir, "").unwrap();
        assert!(!listing.contains("alpha.bak"));
        fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("fam-backup-test-{}", std::process::id()));
        dir.push(format!("{:p}", &dir as *const _));
        dir
    }
}
