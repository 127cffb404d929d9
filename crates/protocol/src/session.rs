//! Session capability traits.
//!
//! The secure-channel handshake lives outside this workspace. A connection
//! manager implements [`SessionFactory`] on top of its client library and
//! hands the engines authenticated [`RemoteSession`]s. Keeping the seam as a
//! trait lets every engine be driven by in-memory or directory-backed
//! sessions in tests.

use futures_util::future::BoxFuture;

use crate::error::FerryError;
use crate::sandbox::{NormalizedPath, SandboxBoundary};
use crate::types::RemoteEntry;

/// An open remote file supporting positioned reads and writes.
pub trait RemoteFile: Send {
    /// Reads up to `len` bytes starting at `offset`. A short (or empty) result
    /// means end of file.
    fn read_at(&mut self, offset: u64, len: usize) -> BoxFuture<'_, Result<Vec<u8>, FerryError>>;

    /// Writes all of `data` at `offset`.
    fn write_at<'a>(
        &'a mut self,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(), FerryError>>;

    /// Truncates or extends the file to `len` bytes.
    fn set_len(&mut self, len: u64) -> BoxFuture<'_, Result<(), FerryError>>;

    /// Flushes buffered writes to the remote side.
    fn flush(&mut self) -> BoxFuture<'_, Result<(), FerryError>>;
}

/// One authenticated session.
///
/// Methods take `&mut self`: a session multiplexes commands on one logical
/// stream and must never be used by two operations at once.
pub trait RemoteSession: Send {
    /// Returns the entry at `path`, or `None` if nothing exists there.
    fn stat<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Option<RemoteEntry>, FerryError>>;

    /// Lists the direct children of a directory.
    fn list<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Vec<RemoteEntry>, FerryError>>;

    fn mkdir<'a>(&'a mut self, path: &'a NormalizedPath) -> BoxFuture<'a, Result<(), FerryError>>;

    fn remove_file<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>>;

    /// Removes an empty directory.
    fn remove_dir<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>>;

    fn rename<'a>(
        &'a mut self,
        from: &'a NormalizedPath,
        to: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>>;

    fn open_read<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteFile>, FerryError>>;

    /// Opens for writing, creating the file if missing. With `truncate` the
    /// existing content is discarded.
    fn open_write<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
        truncate: bool,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteFile>, FerryError>>;

    /// Releases the session.
    fn close(&mut self) -> BoxFuture<'_, Result<(), FerryError>>;
}

/// Opens new authenticated sessions against one site.
pub trait SessionFactory: Send + Sync {
    /// Connects and authenticates. Handshake failures surface as
    /// `AUTH_FAILED`, `HOSTKEY_UNKNOWN` or `HOSTKEY_CHANGED`.
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn RemoteSession>, FerryError>>;

    /// The sandbox every session from this factory is confined to.
    fn boundary(&self) -> &SandboxBoundary;
}
