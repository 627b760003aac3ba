//! Lazy directory listing.

use tokio::io::{AsyncRead, AsyncWrite};

use super::entry::{self, DirEntry, V2_BODY_LEN};
use super::{Layout, SyncConn, unexpected_id};
use crate::consts::{FAIL, SYNC_MAX_PATH, sync_id};
use crate::{Error, Result};

/// Forward-only reader over the records of a `LIST`/`LIS2` reply.
///
/// Entries are decoded one at a time as the caller asks for them. The
/// listing includes the `.` and `..` pseudo entries the daemon sends.
/// Dropping the reader before it returns `None` leaves the rest of the
/// listing on the wire and makes the session unusable.
#[derive(Debug)]
pub struct DirReader<'a, S> {
    sync: &'a mut SyncConn<S>,
    layout: Layout,
    done: bool,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> DirReader<'a, S> {
    pub(crate) fn new(sync: &'a mut SyncConn<S>, layout: Layout) -> Self {
        Self {
            sync,
            layout,
            done: false,
        }
    }

    /// Returns the next entry, or `None` once the `DONE` record arrives.
    pub async fn next_entry(&mut self) -> Result<Option<DirEntry>> {
        if self.done {
            return Ok(None);
        }
        let res = self.read_record().await;
        match &res {
            Ok(Some(_)) => {}
            Ok(None) => self.done = true,
            Err(_) => {
                self.done = true;
                self.sync.poison();
            }
        }
        res
    }

    /// Reads every remaining entry.
    pub async fn collect(mut self) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        while let Some(e) = self.next_entry().await? {
            entries.push(e);
        }
        Ok(entries)
    }

    /// Discards the remaining entries so the session can be reused.
    pub async fn drain(mut self) -> Result<()> {
        while self.next_entry().await?.is_some() {}
        Ok(())
    }

    async fn read_record(&mut self) -> Result<Option<DirEntry>> {
        let id = self.sync.read_id().await?;
        match (self.layout, id) {
            (Layout::V1, sync_id::DENT) => {
                let mut body = [0u8; 16];
                self.sync.read_exact(&mut body, "dent record").await?;
                let name = self.read_name(entry::le_u32(&body[12..16])).await?;
                let mut fixed = [0u8; 12];
                fixed.copy_from_slice(&body[..12]);
                Ok(Some(entry::parse_v1(name, &fixed)))
            }
            (Layout::V2, sync_id::DENT_V2) => {
                let mut body = [0u8; V2_BODY_LEN];
                self.sync.read_exact(&mut body, "dent record").await?;
                let namelen = self.sync.read_u32("dent record").await?;
                let name = self.read_name(namelen).await?;
                let st = entry::parse_v2(&body);
                if st.error != 0 {
                    tracing::debug!(name, errno = st.error, "listing entry could not be stat'ed");
                }
                Ok(Some(st.into_entry(name)))
            }
            (Layout::V1, sync_id::DONE) => {
                let mut rest = [0u8; 16];
                self.sync.read_exact(&mut rest, "done record").await?;
                Ok(None)
            }
            (Layout::V2, sync_id::DONE) => {
                let mut rest = [0u8; V2_BODY_LEN + 4];
                self.sync.read_exact(&mut rest, "done record").await?;
                Ok(None)
            }
            (_, FAIL) => {
                let err = self.sync.read_failure("LIST".into()).await?;
                Err(err)
            }
            (Layout::V1, other) => Err(unexpected_id(other, &sync_id::DENT)),
            (Layout::V2, other) => Err(unexpected_id(other, &sync_id::DENT_V2)),
        }
    }

    async fn read_name(&mut self, len: u32) -> Result<String> {
        let len = len as usize;
        if len > SYNC_MAX_PATH {
            return Err(Error::ProtocolViolation(format!(
                "entry name of {len} bytes exceeds {SYNC_MAX_PATH}"
            )));
        }
        let mut name = vec![0u8; len];
        self.sync.read_exact(&mut name, "dent name").await?;
        Ok(String::from_utf8_lossy(&name).into_owned())
    }
}

impl<S> Drop for DirReader<'_, S> {
    fn drop(&mut self) {
        if !self.done {
            self.sync.poisoned = true;
        }
    }
}
