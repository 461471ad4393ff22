//! Files and directories driven from the loop
//!
//! Every blocking filesystem call runs on the loop's worker pool through
//! [`EventLoop::add_work`]; completions come back on the loop thread.
//!
//! Streaming reads use a bounded [`BufferPool`]. Each chunk handed to the read
//! callback borrows one pool buffer; once every clone of a chunk is dropped
//! the buffer returns to the pool and the next read is scheduled. Holding on
//! to chunks therefore throttles the read.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::buffer_pool::{BufferPool, PooledBuffer, ReleaseNotifier};
use crate::data_chunk::DataChunk;
use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::removable::{Removable, RemovalPhase, RemovalState};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OpenState {
    Closed,
    Opening,
    Open,
}

type ChunkCallback = Rc<dyn Fn(&File, DataChunk)>;
type EndCallback = Box<dyn FnOnce(&File, Result<(), Error>)>;

struct ReadStream {
    on_chunk: ChunkCallback,
    on_end: Option<EndCallback>,
    offset: u64,
    in_flight: bool,
}

struct FileInner {
    lp: EventLoop,
    path: RefCell<PathBuf>,
    handle: RefCell<Option<Arc<fs::File>>>,
    state: Cell<OpenState>,
    stream: RefCell<Option<ReadStream>>,
    pool: BufferPool,
    wakeup: Cell<Option<u64>>,
    removal: RemovalState,
}

/// A file opened for asynchronous reading
#[derive(Clone)]
pub struct File {
    inner: Rc<FileInner>,
}

impl File {
    pub fn new(lp: &EventLoop) -> Self {
        let cfg = lp.config();
        Self {
            inner: Rc::new(FileInner {
                lp: lp.clone(),
                path: RefCell::new(PathBuf::new()),
                handle: RefCell::new(None),
                state: Cell::new(OpenState::Closed),
                stream: RefCell::new(None),
                pool: BufferPool::new(cfg.file_read_buffers, cfg.file_read_buffer_size),
                wakeup: Cell::new(None),
                removal: RemovalState::default(),
            }),
        }
    }

    /// Opens `path` read-only; `cb` fires once with the outcome
    pub fn open<F>(&self, path: impl AsRef<Path>, cb: F)
    where
        F: FnOnce(&File, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        let path = path.as_ref().to_path_buf();
        let refusal = if !inner.removal.is_active() {
            Some(Error::canceled())
        } else if inner.state.get() != OpenState::Closed {
            Some(Error::with_message(StatusCode::InvalidArgument, "file already open"))
        } else {
            None
        };
        if let Some(e) = refusal {
            let this = self.clone();
            return inner.lp.post(move |_| cb(&this, Err(e)));
        }

        *inner.path.borrow_mut() = path.clone();
        inner.state.set(OpenState::Opening);
        let this = self.clone();
        inner.lp.add_work(
            move || fs::File::open(&path),
            move |_, result: io::Result<fs::File>| {
                let inner = &this.inner;
                if inner.state.get() != OpenState::Opening {
                    return cb(&this, Err(Error::canceled()));
                }
                match result {
                    Ok(file) => {
                        *inner.handle.borrow_mut() = Some(Arc::new(file));
                        inner.state.set(OpenState::Open);
                        log::debug!("opened {}", inner.path.borrow().display());
                        cb(&this, Ok(()));
                    }
                    Err(e) => {
                        inner.state.set(OpenState::Closed);
                        cb(&this, Err(e.into()));
                    }
                }
            },
        );
    }

    /// Streams the whole file from the start
    ///
    /// `on_chunk` receives every chunk in order, tagged with its offset.
    /// `on_end` fires once: `Ok` at end of file, or the error that stopped
    /// the read. A closed file ends immediately with `FileNotOpen`.
    pub fn read<C, E>(&self, on_chunk: C, on_end: E)
    where
        C: Fn(&File, DataChunk) + 'static,
        E: FnOnce(&File, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        let refusal = if inner.state.get() != OpenState::Open {
            Some(Error::new(StatusCode::FileNotOpen))
        } else if inner.stream.borrow().is_some() {
            Some(Error::with_message(StatusCode::InvalidArgument, "read already in progress"))
        } else {
            None
        };
        if let Some(e) = refusal {
            let this = self.clone();
            return inner.lp.post(move |_| on_end(&this, Err(e)));
        }

        *inner.stream.borrow_mut() = Some(ReadStream {
            on_chunk: Rc::new(on_chunk),
            on_end: Some(Box::new(on_end)),
            offset: 0,
            in_flight: false,
        });
        inner.ensure_wakeup();
        inner.lp.start_keep_alive();
        inner.schedule_next();
    }

    /// Reads up to `len` bytes at `offset`; a short chunk means end of file
    pub fn read_block<F>(&self, offset: u64, len: usize, cb: F)
    where
        F: FnOnce(&File, Result<DataChunk, Error>) + 'static,
    {
        let this = self.clone();
        let Some(handle) = self.inner.open_handle() else {
            return self.inner.lp.post(move |_| cb(&this, Err(Error::new(StatusCode::FileNotOpen))));
        };
        self.inner.lp.add_work(
            move || read_exact_or_eof(&handle, offset, len),
            move |_, result: io::Result<Vec<u8>>| {
                let result = result.map(|buf| DataChunk::with_offset(Bytes::from(buf), offset)).map_err(Error::from);
                cb(&this, result)
            },
        );
    }

    /// Fetches the file's metadata
    pub fn stat<F>(&self, cb: F)
    where
        F: FnOnce(&File, Result<fs::Metadata, Error>) + 'static,
    {
        let this = self.clone();
        let Some(handle) = self.inner.open_handle() else {
            return self.inner.lp.post(move |_| cb(&this, Err(Error::new(StatusCode::FileNotOpen))));
        };
        self.inner.lp.add_work(
            move || handle.metadata(),
            move |_, result: io::Result<fs::Metadata>| cb(&this, result.map_err(Error::from)),
        );
    }

    /// Closes the file; a running read ends with `OperationCanceled`
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.get() == OpenState::Open
    }

    pub fn path(&self) -> PathBuf {
        self.inner.path.borrow().clone()
    }

    /// Read buffers currently held by undropped chunks
    pub fn buffers_in_use(&self) -> usize {
        self.inner.pool.checked_out()
    }
}

fn read_exact_or_eof(file: &fs::File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

impl FileInner {
    fn handle(self: &Rc<Self>) -> File {
        File { inner: Rc::clone(self) }
    }

    fn open_handle(&self) -> Option<Arc<fs::File>> {
        if self.state.get() != OpenState::Open {
            return None;
        }
        self.handle.borrow().clone()
    }

    fn ensure_wakeup(self: &Rc<Self>) {
        if self.wakeup.get().is_some() {
            return;
        }
        let weak: Weak<FileInner> = Rc::downgrade(self);
        let id = self.lp.add_wakeup(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.on_buffer_released();
            }
        });
        self.wakeup.set(Some(id));
    }

    fn on_buffer_released(self: &Rc<Self>) {
        if self.stream.borrow().is_some() {
            self.schedule_next();
        } else {
            self.maybe_finish_removal();
        }
    }

    /// Starts the next chunk read if a buffer is free and none is in flight
    fn schedule_next(self: &Rc<Self>) {
        let offset = {
            let mut stream = self.stream.borrow_mut();
            let Some(stream) = stream.as_mut() else { return };
            if stream.in_flight {
                return;
            }
            stream.offset
        };
        let Some(handle) = self.open_handle() else { return };
        let Some(mut buf) = self.pool.try_acquire() else {
            log::trace!("{}: waiting for a read buffer", self.path.borrow().display());
            return;
        };
        if let Some(stream) = self.stream.borrow_mut().as_mut() {
            stream.in_flight = true;
        }
        let this = Rc::clone(self);
        self.lp.add_work(
            move || {
                let result = handle.read_at(&mut buf, offset);
                (buf, result)
            },
            move |lp, (buf, result): (Vec<u8>, io::Result<usize>)| this.on_chunk_read(lp, buf, offset, result),
        );
    }

    fn on_chunk_read(self: &Rc<Self>, lp: &EventLoop, buf: Vec<u8>, offset: u64, result: io::Result<usize>) {
        let on_chunk = {
            let mut stream = self.stream.borrow_mut();
            let Some(stream) = stream.as_mut() else {
                self.pool.release(buf);
                return;
            };
            stream.in_flight = false;
            if let Ok(n) = result {
                stream.offset = offset + n as u64;
            }
            Rc::clone(&stream.on_chunk)
        };
        match result {
            Ok(0) => {
                self.pool.release(buf);
                self.finish_read(Ok(()));
            }
            Ok(n) => {
                let notifier = self.wakeup.get().map(|wakeup_id| ReleaseNotifier { remote: lp.remote(), wakeup_id });
                let bytes = PooledBuffer::into_bytes(buf, n, self.pool.clone(), notifier);
                log::trace!("{}: read {} bytes at {}", self.path.borrow().display(), n, offset);
                on_chunk(&self.handle(), DataChunk::with_offset(bytes, offset));
                self.schedule_next();
            }
            Err(e) => {
                self.pool.release(buf);
                self.finish_read(Err(e.into()));
            }
        }
    }

    fn finish_read(self: &Rc<Self>, result: Result<(), Error>) {
        let Some(mut stream) = self.stream.borrow_mut().take() else { return };
        self.lp.stop_keep_alive();
        if let Some(cb) = stream.on_end.take() {
            cb(&self.handle(), result);
        }
    }

    fn close(self: &Rc<Self>) {
        if self.state.replace(OpenState::Closed) == OpenState::Closed {
            return;
        }
        self.handle.borrow_mut().take();
        if self.stream.borrow().is_some() {
            let this = Rc::clone(self);
            // The end callback must not run inside the caller's stack
            let stream = self.stream.borrow_mut().take();
            self.lp.stop_keep_alive();
            if let Some(mut stream) = stream {
                if let Some(cb) = stream.on_end.take() {
                    self.lp.post(move |_| cb(&this.handle(), Err(Error::canceled())));
                }
            }
        }
        log::debug!("closed {}", self.path.borrow().display());
    }

    fn maybe_finish_removal(&self) {
        if self.removal.phase() != RemovalPhase::RemovalScheduled || self.pool.checked_out() > 0 {
            return;
        }
        if let Some(id) = self.wakeup.take() {
            self.lp.remove_wakeup(id);
        }
        self.removal.finish();
    }
}

impl Removable for File {
    /// Closes the file; removal completes once every read buffer is back
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        inner.close();
        let inner = Rc::clone(inner);
        self.inner.lp.post(move |_| inner.maybe_finish_removal());
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.inner.path.borrow())
            .field("state", &self.inner.state.get())
            .finish()
    }
}

/// Kind of a directory entry; symbolic links are reported, not followed
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DirectoryEntryType {
    File,
    Dir,
    Link,
    Fifo,
    Socket,
    Char,
    Block,
    Unknown,
}

impl From<fs::FileType> for DirectoryEntryType {
    fn from(ft: fs::FileType) -> Self {
        if ft.is_symlink() {
            DirectoryEntryType::Link
        } else if ft.is_dir() {
            DirectoryEntryType::Dir
        } else if ft.is_file() {
            DirectoryEntryType::File
        } else if ft.is_fifo() {
            DirectoryEntryType::Fifo
        } else if ft.is_socket() {
            DirectoryEntryType::Socket
        } else if ft.is_char_device() {
            DirectoryEntryType::Char
        } else if ft.is_block_device() {
            DirectoryEntryType::Block
        } else {
            DirectoryEntryType::Unknown
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub entry_type: DirectoryEntryType,
}

type SharedReadDir = Arc<Mutex<Option<fs::ReadDir>>>;

struct DirInner {
    lp: EventLoop,
    path: RefCell<PathBuf>,
    handle: RefCell<Option<SharedReadDir>>,
    state: Cell<OpenState>,
    reading: Cell<bool>,
    removal: RemovalState,
}

/// A directory opened for listing
#[derive(Clone)]
pub struct Dir {
    inner: Rc<DirInner>,
}

impl Dir {
    pub fn new(lp: &EventLoop) -> Self {
        Self {
            inner: Rc::new(DirInner {
                lp: lp.clone(),
                path: RefCell::new(PathBuf::new()),
                handle: RefCell::new(None),
                state: Cell::new(OpenState::Closed),
                reading: Cell::new(false),
                removal: RemovalState::default(),
            }),
        }
    }

    /// Opens `path`; fails with `NotADirectory` for anything but a directory
    pub fn open<F>(&self, path: impl AsRef<Path>, cb: F)
    where
        F: FnOnce(&Dir, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        let path = path.as_ref().to_path_buf();
        let refusal = if !inner.removal.is_active() {
            Some(Error::canceled())
        } else if inner.state.get() != OpenState::Closed {
            Some(Error::with_message(StatusCode::InvalidArgument, "directory already open"))
        } else {
            None
        };
        if let Some(e) = refusal {
            let this = self.clone();
            return inner.lp.post(move |_| cb(&this, Err(e)));
        }

        *inner.path.borrow_mut() = path.clone();
        inner.state.set(OpenState::Opening);
        let this = self.clone();
        inner.lp.add_work(
            move || fs::read_dir(&path),
            move |_, result: io::Result<fs::ReadDir>| {
                let inner = &this.inner;
                if inner.state.get() != OpenState::Opening {
                    return cb(&this, Err(Error::canceled()));
                }
                match result {
                    Ok(rd) => {
                        *inner.handle.borrow_mut() = Some(Arc::new(Mutex::new(Some(rd))));
                        inner.state.set(OpenState::Open);
                        cb(&this, Ok(()));
                    }
                    Err(e) => {
                        inner.state.set(OpenState::Closed);
                        cb(&this, Err(e.into()));
                    }
                }
            },
        );
    }

    /// Lists the directory
    ///
    /// `on_entry` fires once per entry (`.` and `..` excluded); `on_end`
    /// fires exactly once afterwards, or with the error that stopped the
    /// listing.
    pub fn read<C, E>(&self, on_entry: C, on_end: E)
    where
        C: Fn(&Dir, DirectoryEntry) + 'static,
        E: FnOnce(&Dir, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        let this = self.clone();
        let handle = match (inner.state.get(), inner.handle.borrow().clone()) {
            (OpenState::Open, Some(handle)) if !inner.reading.get() => handle,
            (OpenState::Open, Some(_)) => {
                let e = Error::with_message(StatusCode::InvalidArgument, "read already in progress");
                return inner.lp.post(move |_| on_end(&this, Err(e)));
            }
            _ => return inner.lp.post(move |_| on_end(&this, Err(Error::new(StatusCode::FileNotOpen)))),
        };
        inner.reading.set(true);
        inner.lp.add_work(
            move || list_entries(&handle),
            move |_, result: io::Result<Vec<DirectoryEntry>>| {
                this.inner.reading.set(false);
                match result {
                    Ok(entries) => {
                        for entry in entries {
                            if !this.is_open() {
                                break;
                            }
                            on_entry(&this, entry);
                        }
                        on_end(&this, Ok(()));
                    }
                    Err(e) => on_end(&this, Err(e.into())),
                }
            },
        );
    }

    pub fn close(&self) {
        let inner = &self.inner;
        if inner.state.replace(OpenState::Closed) != OpenState::Closed {
            inner.handle.borrow_mut().take();
            log::debug!("closed directory {}", inner.path.borrow().display());
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.get() == OpenState::Open
    }

    pub fn path(&self) -> PathBuf {
        self.inner.path.borrow().clone()
    }
}

fn list_entries(handle: &SharedReadDir) -> io::Result<Vec<DirectoryEntry>> {
    let mut guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(rd) = guard.as_mut() else {
        return Ok(Vec::new());
    };
    let mut entries = Vec::new();
    for entry in rd.by_ref() {
        let entry = entry?;
        let entry_type = match entry.file_type() {
            Ok(ft) => DirectoryEntryType::from(ft),
            Err(_) => DirectoryEntryType::Unknown,
        };
        entries.push(DirectoryEntry { name: entry.file_name().to_string_lossy().into_owned(), entry_type });
    }
    Ok(entries)
}

impl Removable for Dir {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        self.close();
        let inner = Rc::clone(inner);
        self.inner.lp.post(move |_| inner.removal.finish());
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl std::fmt::Debug for Dir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dir")
            .field("path", &self.inner.path.borrow())
            .field("state", &self.inner.state.get())
            .finish()
    }
}
