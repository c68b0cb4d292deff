//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cairn_buffer::PagedFile;
use cairn_common::{CairnError, PageId, PageNo, Result, PAGE_SIZE};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for data files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Handle for an open data file.
struct FileHandle {
    file: File,
    name: String,
    /// Number of page slots the file spans, live or free.
    num_pages: PageNo,
    /// Deleted page numbers available for reuse.
    free_pages: Vec<PageNo>,
}

/// Manages page files under a data directory.
///
/// Files are opened and created by name; each open file gets a file id
/// that identifies its pages in the buffer pool. Page numbers are
/// 1-based, monotonically assigned, and reused after deletion; page 0
/// is the "no page" sentinel.
pub struct DiskManager {
    config: DiskManagerConfig,
    inner: Mutex<DiskManagerInner>,
}

struct DiskManagerInner {
    files: HashMap<u32, FileHandle>,
    by_name: HashMap<String, u32>,
    next_file_id: u32,
}

impl DiskManager {
    /// Creates a disk manager rooted at the configured data directory.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            config,
            inner: Mutex::new(DiskManagerInner {
                files: HashMap::new(),
                by_name: HashMap::new(),
                next_file_id: 0,
            }),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(name)
    }

    /// Returns true if a file with this name exists on disk.
    pub fn exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    /// Returns true if a file with this name is currently open.
    pub fn is_open_named(&self, name: &str) -> bool {
        self.inner.lock().by_name.contains_key(name)
    }

    /// Opens an existing file. Fails with `FileNotFound` if it does
    /// not exist. Reopening an already open file returns its id.
    pub fn open(&self, name: &str) -> Result<u32> {
        if !self.exists(name) {
            return Err(CairnError::FileNotFound {
                name: name.to_string(),
            });
        }
        self.open_handle(name, false)
    }

    /// Creates a new file. Fails if a file with this name already
    /// exists.
    pub fn create(&self, name: &str) -> Result<u32> {
        if self.exists(name) {
            return Err(CairnError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("file {name} already exists"),
            )));
        }
        self.open_handle(name, true)
    }

    /// Creates a new file (or opens it if it already exists) and
    /// returns `(file_id, created)`.
    pub fn open_or_create(&self, name: &str) -> Result<(u32, bool)> {
        let created = !self.exists(name);
        let file_id = self.open_handle(name, true)?;
        Ok((file_id, created))
    }

    fn open_handle(&self, name: &str, create: bool) -> Result<u32> {
        let mut inner = self.inner.lock();

        if let Some(&file_id) = inner.by_name.get(name) {
            return Ok(file_id);
        }

        let path = self.file_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as PageNo;

        let file_id = inner.next_file_id;
        inner.next_file_id += 1;
        inner.files.insert(
            file_id,
            FileHandle {
                file,
                name: name.to_string(),
                num_pages,
                free_pages: Vec::new(),
            },
        );
        inner.by_name.insert(name.to_string(), file_id);

        Ok(file_id)
    }

    /// Closes a file, syncing it first.
    pub fn close(&self, file_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.files.remove(&file_id) {
            inner.by_name.remove(&handle.name);
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Removes a file from disk. The file must not be open.
    pub fn remove(&self, name: &str) -> Result<()> {
        if self.is_open_named(name) {
            return Err(CairnError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("cannot remove open file {name}"),
            )));
        }
        let path = self.file_path(name);
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Returns the number of page slots in a file.
    pub fn num_pages(&self, file_id: u32) -> Result<PageNo> {
        let inner = self.inner.lock();
        let handle = inner.files.get(&file_id).ok_or(CairnError::FileNotFound {
            name: format!("file id {file_id}"),
        })?;
        Ok(handle.num_pages)
    }

    fn with_handle<R>(&self, file_id: u32, f: impl FnOnce(&mut FileHandle) -> Result<R>) -> Result<R> {
        let mut inner = self.inner.lock();
        let handle = inner
            .files
            .get_mut(&file_id)
            .ok_or(CairnError::FileNotFound {
                name: format!("file id {file_id}"),
            })?;
        f(handle)
    }

    fn page_offset(page_no: PageNo) -> u64 {
        (page_no as u64 - 1) * PAGE_SIZE as u64
    }
}

impl PagedFile for DiskManager {
    fn first_page_no(&self, file_id: u32) -> Result<PageNo> {
        self.with_handle(file_id, |handle| {
            if handle.num_pages == 0 {
                return Err(CairnError::InvalidPageNo { file_id, page_no: 0 });
            }
            Ok(1)
        })
    }

    fn allocate_page(&self, file_id: u32) -> Result<PageNo> {
        let fsync = self.config.fsync_enabled;
        self.with_handle(file_id, |handle| {
            let page_no = match handle.free_pages.pop() {
                Some(reused) => reused,
                None => handle.num_pages + 1,
            };

            handle
                .file
                .seek(SeekFrom::Start(Self::page_offset(page_no)))?;
            handle.file.write_all(&[0u8; PAGE_SIZE])?;
            if fsync {
                handle.file.sync_all()?;
            }

            if page_no > handle.num_pages {
                handle.num_pages = page_no;
            }
            Ok(page_no)
        })
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.with_handle(page_id.file_id, |handle| {
            if page_id.page_no == 0 || page_id.page_no > handle.num_pages {
                return Err(CairnError::InvalidPageNo {
                    file_id: page_id.file_id,
                    page_no: page_id.page_no,
                });
            }
            handle
                .file
                .seek(SeekFrom::Start(Self::page_offset(page_id.page_no)))?;
            handle.file.read_exact(buf)?;
            Ok(())
        })
    }

    fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let fsync = self.config.fsync_enabled;
        self.with_handle(page_id.file_id, |handle| {
            if page_id.page_no == 0 || page_id.page_no > handle.num_pages {
                return Err(CairnError::InvalidPageNo {
                    file_id: page_id.file_id,
                    page_no: page_id.page_no,
                });
            }
            handle
                .file
                .seek(SeekFrom::Start(Self::page_offset(page_id.page_no)))?;
            handle.file.write_all(data)?;
            if fsync {
                handle.file.sync_all()?;
            }
            Ok(())
        })
    }

    fn delete_page(&self, page_id: PageId) -> Result<()> {
        self.with_handle(page_id.file_id, |handle| {
            if page_id.page_no == 0
                || page_id.page_no > handle.num_pages
                || handle.free_pages.contains(&page_id.page_no)
            {
                return Err(CairnError::InvalidPageNo {
                    file_id: page_id.file_id,
                    page_no: page_id.page_no,
                });
            }
            handle
                .file
                .seek(SeekFrom::Start(Self::page_offset(page_id.page_no)))?;
            handle.file.write_all(&[0u8; PAGE_SIZE])?;
            handle.free_pages.push(page_id.page_no);
            Ok(())
        })
    }

    fn is_open(&self, file_id: u32) -> bool {
        self.inner.lock().files.contains_key(&file_id)
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        for handle in inner.files.values() {
            let _ = handle.file.sync_all();
        }
    }
}
