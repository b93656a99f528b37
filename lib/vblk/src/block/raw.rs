// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{metadata, File, OpenOptions};
use std::io::{self, Error, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;

use super::probes;
use super::{
    check_request, BlockDispatcher, BlockError, BlockResult, ByteOffset,
    IoGuard, MAX_BUF, SECTOR_SIZE,
};

/// A file-like resource, possibly remote, which satisfies positional I/O
/// requests of limited size.
#[async_trait::async_trait]
pub trait RemoteFile: Send + Sync + 'static {
    /// Read into `buf` from `off`, returning the number of bytes read
    async fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize>;

    /// Write `buf` at `off`, returning the number of bytes written
    async fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize>;

    async fn sync(&self) -> io::Result<()>;

    /// Size (in bytes) of the resource
    fn size(&self) -> u64;

    /// Largest transfer satisfied by a single request to the resource
    fn max_transfer(&self) -> usize {
        MAX_BUF
    }
}

/// Options for raw file access
#[derive(Default, Copy, Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RawOpts {
    /// Largest transfer issued in a single request to the file
    pub max_transfer: Option<usize>,

    /// Disallow writes (returning errors if attempted)
    pub read_only: Option<bool>,

    /// Force flush requests to be skipped (turned into no-op)
    pub skip_flush: Option<bool>,
}

/// [RemoteFile] atop a host file, serviced from the blocking thread pool.
pub struct FileResource {
    fp: Arc<File>,
    len: u64,
    read_only: bool,
    skip_flush: bool,
    max_transfer: usize,
}

impl FileResource {
    /// Open the file at `path`.
    pub fn open(path: impl AsRef<Path>, opts: RawOpts) -> io::Result<Self> {
        let p: &Path = path.as_ref();

        let meta = metadata(p)?;
        let read_only = match (opts.read_only, meta.permissions().readonly()) {
            (Some(false), true) => Err(Error::new(
                ErrorKind::Other,
                "writeable backend with read-only file not allowed",
            )),
            (Some(ro), false) => Ok(ro),
            (_, file_ro) => Ok(file_ro),
        }?;

        let max_transfer = opts.max_transfer.unwrap_or(MAX_BUF);
        if max_transfer == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "max transfer cannot be 0",
            ));
        }

        let fp = OpenOptions::new().read(true).write(!read_only).open(p)?;
        let len = fp.metadata()?.len();

        Ok(Self {
            fp: Arc::new(fp),
            len,
            read_only,
            skip_flush: opts.skip_flush.unwrap_or(false),
            max_transfer,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

fn join_err(e: tokio::task::JoinError) -> io::Error {
    Error::new(ErrorKind::Other, format!("blocking I/O task failed: {e}"))
}

#[async_trait::async_trait]
impl RemoteFile for FileResource {
    async fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        let fp = self.fp.clone();
        let len = buf.len();
        let data = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut data = vec![0u8; len];
            let mut done = 0;
            while done < len {
                match fp.read_at(&mut data[done..], off + done as u64) {
                    Ok(0) => break,
                    Ok(n) => done += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            data.truncate(done);
            Ok(data)
        })
        .await
        .map_err(join_err)??;

        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize> {
        if self.read_only {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "backend is read-only",
            ));
        }
        let fp = self.fp.clone();
        let data = buf.to_vec();
        tokio::task::spawn_blocking(move || -> io::Result<usize> {
            let mut done = 0;
            while done < data.len() {
                match fp.write_at(&data[done..], off + done as u64) {
                    Ok(0) => break,
                    Ok(n) => done += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(done)
        })
        .await
        .map_err(join_err)?
    }

    async fn sync(&self) -> io::Result<()> {
        if self.skip_flush || self.read_only {
            return Ok(());
        }
        let fp = self.fp.clone();
        tokio::task::spawn_blocking(move || fp.sync_data())
            .await
            .map_err(join_err)?
    }

    fn size(&self) -> u64 {
        self.len
    }

    fn max_transfer(&self) -> usize {
        self.max_transfer
    }
}

fn transfer_result(res: io::Result<usize>, expected: usize) -> BlockResult {
    match res {
        Ok(done) if done == expected => Ok(()),
        Ok(done) => Err(BlockError::ShortTransfer { expected, done }),
        Err(e) => Err(e.into()),
    }
}

/// Dispatcher issuing requests directly against a [RemoteFile].
///
/// Requests larger than the maximum transfer of the file are split into
/// chunks, all issued at once, whose results converge through an [IoGuard]
/// onto a single completion.
pub struct RawBlockDispatcher {
    file: Box<dyn RemoteFile>,
    size: u64,
}

impl RawBlockDispatcher {
    pub fn new(file: Box<dyn RemoteFile>) -> Self {
        // A trailing partial block is not addressable
        let size = file.size() - (file.size() % SECTOR_SIZE as u64);
        Self { file, size }
    }

    fn chunk_size(&self) -> usize {
        self.file.max_transfer().max(1)
    }
}

#[async_trait::async_trait]
impl BlockDispatcher for RawBlockDispatcher {
    async fn sync(&self) -> BlockResult {
        Ok(self.file.sync().await?)
    }

    async fn read_at(&self, buf: &mut [u8], off: ByteOffset) -> BlockResult {
        check_request(off, buf.len(), SECTOR_SIZE, self.size)?;

        let chunk = self.chunk_size();
        let (guard, done) = IoGuard::with_completion();
        let file = &self.file;
        let ops: Vec<_> = buf
            .chunks_mut(chunk)
            .enumerate()
            .map(|(i, data)| {
                let guard = guard.clone();
                let off = off + (i * chunk) as u64;
                async move {
                    let expected = data.len();
                    probes::block_chunk_begin!(|| (off, expected as u64));
                    let res = transfer_result(file.read_at(data, off).await, expected);
                    probes::block_chunk_done!(|| (off, expected as u64, res.is_err() as u8));
                    guard.record(res);
                }
            })
            .collect();
        drop(guard);

        join_all(ops).await;
        done.wait().await
    }

    async fn write_at(&self, buf: &[u8], off: ByteOffset) -> BlockResult {
        check_request(off, buf.len(), SECTOR_SIZE, self.size)?;

        let chunk = self.chunk_size();
        let (guard, done) = IoGuard::with_completion();
        let file = &self.file;
        let ops: Vec<_> = buf
            .chunks(chunk)
            .enumerate()
            .map(|(i, data)| {
                let guard = guard.clone();
                let off = off + (i * chunk) as u64;
                async move {
                    let expected = data.len();
                    probes::block_chunk_begin!(|| (off, expected as u64));
                    let res = transfer_result(file.write_at(data, off).await, expected);
                    probes::block_chunk_done!(|| (off, expected as u64, res.is_err() as u8));
                    guard.record(res);
                }
            })
            .collect();
        drop(guard);

        join_all(ops).await;
        done.wait().await
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn max_transfer(&self) -> usize {
        self.chunk_size()
    }
}
