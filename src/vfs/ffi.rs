//! Registration glue between the in-memory VFS core and SQLite's
//! `sqlite3_vfs` interface.
//!
//! Everything here is a thin adapter: flags are translated, buffers are
//! forwarded, and the replication hook is driven from WAL write outcomes.
//! All semantics live in the safe core.

#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::ffi;

use super::shm::{SHM_NLOCK, SHM_WRITE_LOCK};
use super::{Content, FileKind, FileShared, MemVfs, OpenOptions};

const SECTOR_SIZE: c_int = 512;
const MAX_PATHNAME: c_int = 512;

#[derive(Clone, Copy, PartialEq)]
enum HeldLock {
    None,
    Shared,
    Exclusive,
}

struct FileExt {
    vfs: MemVfs,
    shared: Arc<FileShared>,
    name: String,
    kind: FileKind,
    held: [HeldLock; SHM_NLOCK],
    delete_on_close: bool,
}

/// Layout handed to SQLite: the base `sqlite3_file` must come first.
#[repr(C)]
struct MemFile {
    base: ffi::sqlite3_file,
    ext: MaybeUninit<FileExt>,
}

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 2,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_unlock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: Some(x_shm_map),
    xShmLock: Some(x_shm_lock),
    xShmBarrier: Some(x_shm_barrier),
    xShmUnmap: Some(x_shm_unmap),
    xFetch: None,
    xUnfetch: None,
};

/// Register a [`MemVfs`] with SQLite under the given name. A name can be
/// registered only once per process; a second registration would shadow
/// the first for new connections while old ones keep the original.
pub fn register(name: &str, vfs: MemVfs) -> super::VfsResult<()> {
    static REGISTERED: once_cell::sync::Lazy<parking_lot::Mutex<std::collections::HashSet<String>>> =
        once_cell::sync::Lazy::new(Default::default);
    if !REGISTERED.lock().insert(name.to_string()) {
        return Err(super::VfsError::new(
            ffi::SQLITE_MISUSE,
            format!("vfs {name} is already registered"),
        ));
    }
    let z_name = CString::new(name)
        .map_err(|_| super::VfsError::new(ffi::SQLITE_MISUSE, "invalid vfs name"))?;
    let vfs_box = Box::new(ffi::sqlite3_vfs {
        iVersion: 2,
        szOsFile: std::mem::size_of::<MemFile>() as c_int,
        mxPathname: MAX_PATHNAME,
        pNext: ptr::null_mut(),
        zName: z_name.into_raw() as *const c_char,
        pAppData: Box::into_raw(Box::new(vfs)) as *mut c_void,
        xOpen: Some(x_open),
        xDelete: Some(x_delete),
        xAccess: Some(x_access),
        xFullPathname: Some(x_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(x_randomness),
        xSleep: Some(x_sleep),
        xCurrentTime: Some(x_current_time),
        xGetLastError: Some(x_get_last_error),
        xCurrentTimeInt64: Some(x_current_time_int64),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    });
    let rc = unsafe { ffi::sqlite3_vfs_register(Box::into_raw(vfs_box), 0) };
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(super::VfsError::new(rc, "sqlite3_vfs_register failed"))
    }
}

unsafe fn vfs_of(p_vfs: *mut ffi::sqlite3_vfs) -> &'static MemVfs {
    &*((*p_vfs).pAppData as *const MemVfs)
}

unsafe fn ext_of<'a>(p_file: *mut ffi::sqlite3_file) -> &'a mut FileExt {
    (*(p_file as *mut MemFile)).ext.assume_init_mut()
}

fn kind_of(flags: c_int) -> FileKind {
    if flags & ffi::SQLITE_OPEN_MAIN_DB != 0 {
        FileKind::MainDb
    } else if flags & ffi::SQLITE_OPEN_WAL != 0 {
        FileKind::Wal
    } else if flags & ffi::SQLITE_OPEN_MAIN_JOURNAL != 0 {
        FileKind::MainJournal
    } else {
        FileKind::Other
    }
}

unsafe extern "C" fn x_open(
    p_vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    p_file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let vfs = vfs_of(p_vfs);
    let mut delete_on_close = flags & ffi::SQLITE_OPEN_DELETEONCLOSE != 0;
    let name = if z_name.is_null() {
        delete_on_close = true;
        vfs.temp_name()
    } else {
        match CStr::from_ptr(z_name).to_str() {
            Ok(s) => s.to_string(),
            Err(_) => return ffi::SQLITE_CANTOPEN,
        }
    };
    let kind = kind_of(flags);
    let opts = OpenOptions {
        create: flags & ffi::SQLITE_OPEN_CREATE != 0,
        exclusive: flags & ffi::SQLITE_OPEN_EXCLUSIVE != 0,
    };
    let shared = match vfs.open(&name, kind, opts) {
        Ok(shared) => shared,
        Err(e) => {
            tracing::debug!("vfs open {name}: {e}");
            return e.code;
        }
    };
    let file = &mut *(p_file as *mut MemFile);
    file.base.pMethods = &IO_METHODS;
    file.ext.write(FileExt {
        vfs: vfs.clone(),
        shared,
        name,
        kind,
        held: [HeldLock::None; SHM_NLOCK],
        delete_on_close,
    });
    if !p_out_flags.is_null() {
        *p_out_flags = flags;
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_close(p_file: *mut ffi::sqlite3_file) -> c_int {
    let ext = ext_of(p_file);
    // Drop any shm locks this handle still holds.
    for slot in 0..SHM_NLOCK {
        release_slot(ext, slot);
    }
    ext.shared.release();
    if ext.delete_on_close {
        let _ = ext.vfs.delete(&ext.name);
    }
    ptr::drop_in_place(ext);
    (*(p_file as *mut MemFile)).base.pMethods = ptr::null();
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_read(
    p_file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let ext = ext_of(p_file);
    let slice = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);
    super::rc_of(ext.shared.read_at(offset as u64, slice))
}

unsafe extern "C" fn x_write(
    p_file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let ext = ext_of(p_file);
    let data = std::slice::from_raw_parts(buf as *const u8, amt as usize);
    if ext.kind != FileKind::Wal {
        return super::rc_of(ext.shared.write_at(offset as u64, data));
    }

    let outcome = match ext.shared.write_wal(offset as u64, data) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::debug!("wal write {}: {e}", ext.name);
            return e.code;
        }
    };
    let db_name = ext.name.strip_suffix("-wal").unwrap_or(&ext.name).to_string();
    let replication = ext.vfs.replication();

    if let Some(hook) = &replication {
        if outcome.undone {
            hook.undo(&db_name);
        }
        if outcome.began {
            let rc = hook.begin(&db_name);
            if rc != ffi::SQLITE_OK {
                ext.shared.wal_rollback();
                return rc;
            }
        }
    }

    if let Some(size_after) = outcome.commit {
        match &replication {
            Some(hook) => {
                let (page_size, frames) = ext.shared.wal_tx_frames();
                let rc = hook.frames(&db_name, page_size, frames, size_after, true);
                if rc != ffi::SQLITE_OK {
                    ext.shared.wal_rollback();
                    hook.end(&db_name);
                    return rc;
                }
                // The apply path advanced the committed boundary before the
                // hook returned; this is a no-op unless replication is off.
                ext.shared.wal_commit();
                hook.end(&db_name);
            }
            None => ext.shared.wal_commit(),
        }
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_truncate(
    p_file: *mut ffi::sqlite3_file,
    size: ffi::sqlite3_int64,
) -> c_int {
    let ext = ext_of(p_file);
    super::rc_of(ext.shared.truncate(size as u64))
}

unsafe extern "C" fn x_sync(_p_file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_size(
    p_file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    let ext = ext_of(p_file);
    *p_size = ext.shared.size() as ffi::sqlite3_int64;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_lock(_p_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_unlock(_p_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_check_reserved_lock(
    _p_file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    *p_res_out = 0;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_control(
    p_file: *mut ffi::sqlite3_file,
    op: c_int,
    p_arg: *mut c_void,
) -> c_int {
    let ext = ext_of(p_file);
    if op != ffi::SQLITE_FCNTL_PRAGMA {
        return ffi::SQLITE_NOTFOUND;
    }
    let args = p_arg as *mut *mut c_char;
    let pragma = match CStr::from_ptr(*args.add(1)).to_str() {
        Ok(s) => s.to_ascii_lowercase(),
        Err(_) => return ffi::SQLITE_NOTFOUND,
    };
    let value = *args.add(2);
    let value = if value.is_null() {
        None
    } else {
        CStr::from_ptr(value).to_str().ok().map(|s| s.to_ascii_lowercase())
    };

    match (pragma.as_str(), value) {
        ("page_size", Some(v)) => {
            let requested: u32 = match v.parse() {
                Ok(n) => n,
                Err(_) => return ffi::SQLITE_NOTFOUND,
            };
            match ext.shared.db_page_size() {
                // Changing the page size after the first write is refused.
                Some(current) if current != requested => ffi::SQLITE_IOERR,
                _ => ffi::SQLITE_NOTFOUND,
            }
        }
        ("journal_mode", Some(v)) if v != "wal" => ffi::SQLITE_IOERR,
        _ => ffi::SQLITE_NOTFOUND,
    }
}

unsafe extern "C" fn x_sector_size(_p_file: *mut ffi::sqlite3_file) -> c_int {
    SECTOR_SIZE
}

unsafe extern "C" fn x_device_characteristics(_p_file: *mut ffi::sqlite3_file) -> c_int {
    ffi::SQLITE_IOCAP_SEQUENTIAL
        | ffi::SQLITE_IOCAP_SAFE_APPEND
        | ffi::SQLITE_IOCAP_POWERSAFE_OVERWRITE
}

unsafe extern "C" fn x_shm_map(
    p_file: *mut ffi::sqlite3_file,
    i_region: c_int,
    _sz_region: c_int,
    b_extend: c_int,
    pp: *mut *mut c_void,
) -> c_int {
    let ext = ext_of(p_file);
    let mut shm = ext.shared.shm.lock();
    match shm.map(i_region as usize, b_extend != 0) {
        Some(ptr) => {
            *pp = ptr as *mut c_void;
            ffi::SQLITE_OK
        }
        None => {
            *pp = ptr::null_mut();
            ffi::SQLITE_OK
        }
    }
}

fn release_slot(ext: &mut FileExt, slot: usize) {
    let mut shm = ext.shared.shm.lock();
    match ext.held[slot] {
        HeldLock::Shared => shm.unlock_shared(slot),
        HeldLock::Exclusive => shm.unlock_exclusive(slot, 1),
        HeldLock::None => return,
    }
    ext.held[slot] = HeldLock::None;
    drop(shm);

    // Releasing the WRITE lock with an unresolved transaction means SQLite
    // rolled back above the VFS; discard the uncommitted tail.
    if slot == SHM_WRITE_LOCK && ext.kind == FileKind::MainDb {
        if let Some(wal) = ext.vfs.lookup(&format!("{}-wal", ext.name)) {
            let in_tx = match &*wal.content.lock() {
                Content::Wal(content) => content.in_tx(),
                _ => false,
            };
            if in_tx {
                wal.wal_rollback();
                if let Some(hook) = ext.vfs.replication() {
                    hook.undo(&ext.name);
                    hook.end(&ext.name);
                }
            }
        }
    }
}

unsafe extern "C" fn x_shm_lock(
    p_file: *mut ffi::sqlite3_file,
    ofst: c_int,
    n: c_int,
    flags: c_int,
) -> c_int {
    let ext = ext_of(p_file);
    let (ofst, n) = (ofst as usize, n as usize);
    if flags & ffi::SQLITE_SHM_UNLOCK != 0 {
        for slot in ofst..ofst + n {
            release_slot(ext, slot);
        }
        return ffi::SQLITE_OK;
    }

    let mut shm = ext.shared.shm.lock();
    if flags & ffi::SQLITE_SHM_SHARED != 0 {
        debug_assert_eq!(n, 1);
        if ext.held[ofst] != HeldLock::None {
            return ffi::SQLITE_OK;
        }
        if !shm.lock_shared(ofst) {
            return ffi::SQLITE_BUSY;
        }
        ext.held[ofst] = HeldLock::Shared;
    } else {
        for slot in ofst..ofst + n {
            if ext.held[slot] != HeldLock::None {
                return ffi::SQLITE_BUSY;
            }
        }
        if !shm.lock_exclusive(ofst, n) {
            return ffi::SQLITE_BUSY;
        }
        for slot in ofst..ofst + n {
            ext.held[slot] = HeldLock::Exclusive;
        }
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_shm_barrier(_p_file: *mut ffi::sqlite3_file) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

unsafe extern "C" fn x_shm_unmap(p_file: *mut ffi::sqlite3_file, _delete: c_int) -> c_int {
    // Blocks stay alive with the file content; nothing to do.
    let _ = ext_of(p_file);
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_delete(
    p_vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    let vfs = vfs_of(p_vfs);
    let name = match CStr::from_ptr(z_name).to_str() {
        Ok(s) => s,
        Err(_) => return ffi::SQLITE_IOERR_DELETE,
    };
    super::rc_of(vfs.delete(name))
}

unsafe extern "C" fn x_access(
    p_vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    _flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let vfs = vfs_of(p_vfs);
    let exists = CStr::from_ptr(z_name)
        .to_str()
        .map(|name| vfs.exists(name))
        .unwrap_or(false);
    *p_res_out = exists as c_int;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_full_pathname(
    _p_vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    let len = CStr::from_ptr(z_name).to_bytes_with_nul().len();
    if len > n_out as usize {
        return ffi::SQLITE_CANTOPEN;
    }
    ptr::copy_nonoverlapping(z_name, z_out, len);
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_randomness(
    _p_vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    // Deterministic: replicas must not diverge on anything SQLite derives
    // from VFS randomness. The in-memory WAL never survives a crash, so the
    // anti-stale-frame role of random salts does not apply.
    ptr::write_bytes(z_out, 0, n_byte as usize);
    n_byte
}

unsafe extern "C" fn x_sleep(_p_vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    std::thread::sleep(std::time::Duration::from_micros(microseconds as u64));
    microseconds
}

unsafe extern "C" fn x_current_time(p_vfs: *mut ffi::sqlite3_vfs, p_out: *mut f64) -> c_int {
    let mut ms: ffi::sqlite3_int64 = 0;
    x_current_time_int64(p_vfs, &mut ms);
    *p_out = ms as f64 / 86_400_000.0;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_current_time_int64(
    _p_vfs: *mut ffi::sqlite3_vfs,
    p_out: *mut ffi::sqlite3_int64,
) -> c_int {
    // Milliseconds since the julian epoch, as SQLite expects.
    const UNIX_EPOCH_JULIAN_MS: i64 = 210_866_760_000_000;
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    *p_out = UNIX_EPOCH_JULIAN_MS + unix_ms;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_get_last_error(
    _p_vfs: *mut ffi::sqlite3_vfs,
    _n: c_int,
    _z_out: *mut c_char,
) -> c_int {
    ffi::SQLITE_OK
}
