use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{QuarryError, Result};
use crate::types::{FileId, PageBuf, PageNum, EXPAND_CHUNK, MAX_PAGE_NUM, PAGE_SIZE};

/// Header page layout: free-list head, highest allocated page, user field.
const HDR_FREE_HEAD: usize = 0;
const HDR_HIGHEST: usize = 8;
const HDR_USER: usize = 16;

/// Options controlling how a [`PagedFile`] is opened.
#[derive(Clone, Debug)]
pub struct PagedFileOptions {
    /// Bytes to preallocate when creating or truncating the file.
    pub initial_size: u64,
    /// Discard any existing contents and start from a fresh header.
    pub truncate: bool,
    /// Open with `O_DIRECT`. Falls back to buffered I/O (with a warning) on
    /// filesystems that reject it.
    pub direct_io: bool,
    /// Fsync after every page write and persist the header after every
    /// allocation or free.
    pub fsync_on_write: bool,
    /// File id used when packing [`crate::types::PageId`]s for this file.
    pub file_id: FileId,
}

impl Default for PagedFileOptions {
    fn default() -> Self {
        Self {
            initial_size: EXPAND_CHUNK,
            truncate: false,
            direct_io: true,
            fsync_on_write: false,
            file_id: 1,
        }
    }
}

/// A block-addressed file of fixed-size pages with an in-file free list.
///
/// Page 0 is the header: bytes `[0,8)` hold the free-list head (0 when the
/// list is empty), `[8,16)` the highest page number ever allocated, and
/// `[16,24)` an uninterpreted user field. Freed pages chain through their
/// first 8 bytes. The header is cached in memory and persisted by
/// [`PagedFile::flush`].
pub struct PagedFile {
    file: File,
    id: FileId,
    header: Box<PageBuf>,
    physical_len: u64,
    fsync_on_write: bool,
}

impl PagedFile {
    /// Opens (or creates) a paged file at `path`.
    ///
    /// A fresh or truncated file gets a zeroed header page and
    /// `initial_size` bytes of preallocation; an existing file has its
    /// header page reloaded.
    pub fn open(path: impl AsRef<Path>, options: PagedFileOptions) -> Result<PagedFile> {
        let path = path.as_ref();
        let file = open_raw(path, options.direct_io)?;
        if options.truncate {
            file.set_len(0)?;
        }
        let on_disk = file.metadata()?.len();
        let mut header = PageBuf::zeroed();
        let fresh = on_disk < PAGE_SIZE as u64;
        if fresh {
            let want = options.initial_size.max(PAGE_SIZE as u64);
            preallocate(&file, 0, want)?;
            file.write_all_at(&header[..], 0)?;
            file.sync_data()?;
        } else {
            read_exact_or_zero(&file, 0, &mut header)?;
            if options.initial_size > on_disk {
                preallocate(&file, on_disk, options.initial_size - on_disk)?;
            }
        }
        let physical_len = file.metadata()?.len().max(options.initial_size);
        debug!(
            path = %path.display(),
            fresh,
            physical_len,
            highest = header.read_u64(HDR_HIGHEST),
            "paged file opened"
        );
        Ok(PagedFile {
            file,
            id: options.file_id,
            header,
            physical_len,
            fsync_on_write: options.fsync_on_write,
        })
    }

    /// File id used for [`crate::types::PageId`] packing.
    pub fn file_id(&self) -> FileId {
        self.id
    }

    /// Head of the in-file free list (0 when empty).
    pub fn free_head(&self) -> u64 {
        self.header.read_u64(HDR_FREE_HEAD)
    }

    /// Highest page number ever allocated; pages `[1, highest]` are the
    /// logical extent of the file.
    pub fn highest_page(&self) -> PageNum {
        self.header.read_u64(HDR_HIGHEST) as PageNum
    }

    /// The header's uninterpreted user field.
    pub fn user_field(&self) -> u64 {
        self.header.read_u64(HDR_USER)
    }

    /// Updates the user field in the cached header. Persisted on the next
    /// [`PagedFile::flush`].
    pub fn set_user_field(&mut self, value: u64) {
        self.header.write_u64(HDR_USER, value);
    }

    /// Reads page `n` into `buf`. Reading a page that was allocated but
    /// never written yields zeroes.
    pub fn read_page(&self, n: PageNum, buf: &mut PageBuf) -> Result<()> {
        self.check_page_num(n)?;
        read_exact_or_zero(&self.file, u64::from(n) * PAGE_SIZE as u64, buf)
    }

    /// Writes page `n` from `buf`, optionally fsyncing.
    pub fn write_page(&self, n: PageNum, buf: &PageBuf) -> Result<()> {
        self.check_page_num(n)?;
        self.file
            .write_all_at(&buf[..], u64::from(n) * PAGE_SIZE as u64)?;
        if self.fsync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Returns a page number that is available for writing. The page's
    /// contents are unspecified: free-list pages carry a stale chain
    /// pointer and extended pages read as zeroes.
    pub fn allocate_page(&mut self) -> Result<PageNum> {
        let head = self.header.read_u64(HDR_FREE_HEAD);
        let page = if head != 0 {
            let mut buf = PageBuf::zeroed();
            read_exact_or_zero(&self.file, head * PAGE_SIZE as u64, &mut buf)?;
            let next = buf.read_u64(0);
            self.header.write_u64(HDR_FREE_HEAD, next);
            head as PageNum
        } else {
            let next = self.header.read_u64(HDR_HIGHEST) + 1;
            if next > u64::from(MAX_PAGE_NUM) {
                return Err(QuarryError::InvalidArgument(
                    "page number space exhausted",
                ));
            }
            if (next + 1) * PAGE_SIZE as u64 > self.physical_len {
                preallocate(&self.file, self.physical_len, EXPAND_CHUNK)?;
                self.physical_len += EXPAND_CHUNK;
            }
            self.header.write_u64(HDR_HIGHEST, next);
            next as PageNum
        };
        if self.fsync_on_write {
            self.flush()?;
        }
        Ok(page)
    }

    /// Returns page `n` to the free list. The page's first 8 bytes are
    /// overwritten with the previous list head.
    pub fn free_page(&mut self, n: PageNum) -> Result<()> {
        self.check_page_num(n)?;
        let mut buf = PageBuf::zeroed();
        buf.write_u64(0, self.header.read_u64(HDR_FREE_HEAD));
        self.write_page(n, &buf)?;
        self.header.write_u64(HDR_FREE_HEAD, u64::from(n));
        if self.fsync_on_write {
            self.flush()?;
        }
        Ok(())
    }

    /// Zeroes page `n` on disk.
    pub fn trunc_page(&self, n: PageNum) -> Result<()> {
        let zero = PageBuf::zeroed();
        self.write_page(n, &zero)
    }

    /// Persists the cached header page and fsyncs the file.
    pub fn flush(&mut self) -> Result<()> {
        self.file.write_all_at(&self.header[..], 0)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn check_page_num(&self, n: PageNum) -> Result<()> {
        if n > MAX_PAGE_NUM {
            return Err(QuarryError::InvalidPageId(u64::from(n)));
        }
        Ok(())
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "failed to flush paged file header on drop");
        }
    }
}

fn open_raw(path: &Path, direct_io: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true);
    if direct_io {
        #[cfg(target_os = "linux")]
        {
            let mut direct = opts.clone();
            direct.custom_flags(libc::O_DIRECT);
            match direct.open(path) {
                Ok(file) => return Ok(file),
                Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                    warn!(
                        path = %path.display(),
                        "filesystem rejected O_DIRECT, falling back to buffered I/O"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(opts.open(path)?)
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, offset: u64, len: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), offset as i64, len as i64) };
    if rc != 0 {
        return Err(std::io::Error::from_raw_os_error(rc).into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, offset: u64, len: u64) -> Result<()> {
    let want = offset + len;
    if file.metadata()?.len() < want {
        file.set_len(want)?;
    }
    Ok(())
}

/// Positioned read of one page. A read that hits EOF before the first byte
/// zero-fills the buffer (preallocated-but-unwritten pages); a partial page
/// is corruption.
fn read_exact_or_zero(file: &File, offset: u64, buf: &mut PageBuf) -> Result<()> {
    let mut done = 0usize;
    while done < PAGE_SIZE {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) if done == 0 => {
                buf.clear();
                return Ok(());
            }
            Ok(0) => {
                return Err(QuarryError::Corruption("short page read"));
            }
            Ok(n) => done += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
