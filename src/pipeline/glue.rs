//! Splicing two live connections into one bidirectional byte pipe.
//!
//! A spliced pair is registered in a [`GlueTable`] under a pair id. Each
//! side holds only that id, never a reference to its partner, and every
//! lookup after the pair is removed fails closed.
//!
//! ```text
//!   local conn ──read──▶ Relay ──▶ peer inbox ──write──▶ peer conn
//!   local conn ◀─write── local inbox ◀── Passthrough ◀──read── peer conn
//! ```
//!
//! Reads on one side are only issued while the partner is writable. A
//! side stops being writable once more than `high_watermark` bytes are
//! queued for it and becomes writable again after draining below
//! `low_watermark`; that transition reissues the partner's deferred read.
//! Each side reads and writes its own connection independently, so a
//! peer that only drains its input while its output is drained still
//! makes progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::future::{self, Either};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinError;

use super::backlog::{DataBacklog, FrameSink};
use crate::config::SpliceConfig;
use crate::connector::Connection;
use crate::error::ProxyError;
use crate::observability::metrics;

/// Key of a spliced pair in the [`GlueTable`].
pub type PairId = u64;

/// Which end of a pair a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The client-facing connection.
    Local,
    /// The upstream connection returned by the connector.
    Peer,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Local => 0,
            Side::Peer => 1,
        }
    }

    pub fn partner(self) -> Side {
        match self {
            Side::Local => Side::Peer,
            Side::Peer => Side::Local,
        }
    }

    /// Metrics label for bytes written towards this side.
    fn direction(self) -> &'static str {
        match self {
            Side::Local => "downstream",
            Side::Peer => "upstream",
        }
    }
}

#[derive(Debug)]
struct SideState {
    writable: bool,
    /// A read was requested while the partner was not writable.
    pending_read: bool,
    /// Bytes handed to this side's writer and not yet flushed.
    queued: usize,
    wake: Arc<Notify>,
}

impl SideState {
    fn new() -> Self {
        Self {
            writable: true,
            pending_read: false,
            queued: 0,
            wake: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug)]
struct PairEntry {
    sides: [SideState; 2],
}

#[derive(Debug)]
struct TableInner {
    pairs: DashMap<PairId, PairEntry>,
    next_id: AtomicU64,
    high_watermark: usize,
    low_watermark: usize,
}

/// Registry of live spliced pairs.
#[derive(Debug, Clone)]
pub struct GlueTable {
    inner: Arc<TableInner>,
}

impl GlueTable {
    pub fn new(high_watermark: usize, low_watermark: usize) -> Self {
        Self {
            inner: Arc::new(TableInner {
                pairs: DashMap::new(),
                next_id: AtomicU64::new(1),
                high_watermark,
                low_watermark,
            }),
        }
    }

    pub fn from_config(config: &SpliceConfig) -> Self {
        Self::new(config.high_watermark, config.low_watermark)
    }

    /// Register a new pair and return its two handles.
    pub fn matched_pair(&self) -> (GlueHandle, GlueHandle) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pairs.insert(
            id,
            PairEntry {
                sides: [SideState::new(), SideState::new()],
            },
        );

        let local = GlueHandle {
            table: self.clone(),
            id,
            side: Side::Local,
        };
        let peer = local.partner();
        (local, peer)
    }

    /// Number of pairs currently spliced.
    pub fn active_pairs(&self) -> usize {
        self.inner.pairs.len()
    }
}

impl Default for GlueTable {
    fn default() -> Self {
        Self::from_config(&SpliceConfig::default())
    }
}

/// One side of a spliced pair.
#[derive(Debug, Clone)]
pub struct GlueHandle {
    table: GlueTable,
    id: PairId,
    side: Side,
}

impl GlueHandle {
    pub fn id(&self) -> PairId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The handle for the other end of the same pair.
    pub fn partner(&self) -> GlueHandle {
        GlueHandle {
            table: self.table.clone(),
            id: self.id,
            side: self.side.partner(),
        }
    }

    /// Whether the pair is still registered.
    pub fn is_active(&self) -> bool {
        self.table.inner.pairs.contains_key(&self.id)
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut PairEntry) -> R) -> Option<R> {
        self.table
            .inner
            .pairs
            .get_mut(&self.id)
            .map(|mut entry| f(entry.value_mut()))
    }

    /// Ask for more input on this side.
    ///
    /// Returns `true` when the partner can take writes and the read may go
    /// ahead. Otherwise the read is deferred until the partner reports it
    /// became writable again. Each side has at most one read outstanding,
    /// so the deferral is a single flag rather than a queue.
    pub fn read(&self) -> bool {
        let me = self.side.index();
        let partner = self.side.partner().index();
        self.with_entry(|entry| {
            if entry.sides[partner].writable {
                true
            } else {
                entry.sides[me].pending_read = true;
                false
            }
        })
        .unwrap_or(false)
    }

    pub fn is_writable(&self) -> bool {
        self.with_entry(|entry| entry.sides[self.side.index()].writable)
            .unwrap_or(false)
    }

    pub fn has_pending_read(&self) -> bool {
        self.with_entry(|entry| entry.sides[self.side.index()].pending_read)
            .unwrap_or(false)
    }

    /// Record a writability change of this side's own connection.
    ///
    /// Returns `true` if it reissued the partner's deferred read.
    pub fn writability_changed(&self, writable: bool) -> bool {
        let side = self.side;
        self.with_entry(|entry| apply_writability(entry, side, writable))
            .unwrap_or(false)
    }

    /// Account for `len` bytes handed to this side's writer.
    pub fn enqueued(&self, len: usize) {
        let side = self.side;
        let high = self.table.inner.high_watermark;
        self.with_entry(|entry| {
            let saturated = {
                let state = &mut entry.sides[side.index()];
                state.queued += len;
                state.writable && state.queued > high
            };
            if saturated {
                apply_writability(entry, side, false);
            }
        });
    }

    /// Account for `len` bytes this side's writer has flushed.
    ///
    /// Returns `true` if draining reissued the partner's deferred read.
    pub fn flushed(&self, len: usize) -> bool {
        let side = self.side;
        let low = self.table.inner.low_watermark;
        self.with_entry(|entry| {
            let recovered = {
                let state = &mut entry.sides[side.index()];
                state.queued = state.queued.saturating_sub(len);
                !state.writable && state.queued <= low
            };
            recovered && apply_writability(entry, side, true)
        })
        .unwrap_or(false)
    }

    fn waker(&self) -> Option<Arc<Notify>> {
        self.with_entry(|entry| Arc::clone(&entry.sides[self.side.index()].wake))
    }

    /// Unregister the pair. Safe to call from either side, any number of times.
    pub fn remove(&self) {
        self.table.inner.pairs.remove(&self.id);
    }
}

fn apply_writability(entry: &mut PairEntry, side: Side, writable: bool) -> bool {
    entry.sides[side.index()].writable = writable;
    if !writable {
        return false;
    }

    let partner = &mut entry.sides[side.partner().index()];
    if partner.pending_read {
        partner.pending_read = false;
        partner.wake.notify_one();
        true
    } else {
        false
    }
}

/// Transform applied to bytes read off one side before they reach the partner.
pub trait Relay: Send + 'static {
    fn relay(&mut self, input: Bytes, out: &mut Vec<Bytes>) -> Result<(), ProxyError>;

    /// Bytes to send back on this side when relaying failed.
    fn failure_reply(&self, _error: &ProxyError) -> Option<Bytes> {
        None
    }
}

/// Forwards bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Relay for Passthrough {
    fn relay(&mut self, input: Bytes, out: &mut Vec<Bytes>) -> Result<(), ProxyError> {
        out.push(input);
        Ok(())
    }
}

#[derive(Debug)]
enum GlueMessage {
    /// Write without flushing.
    Data(Bytes),
    Flush,
    /// Half-close the output.
    WriteEof,
    /// Full close.
    Close,
}

#[derive(Debug)]
struct PartnerGone;

/// Hand-off into the partner side's queue. The only cross-task path.
struct PartnerFeed {
    tx: mpsc::UnboundedSender<GlueMessage>,
    partner: GlueHandle,
}

impl PartnerFeed {
    fn send(&self, message: GlueMessage) -> Result<(), PartnerGone> {
        self.tx.send(message).map_err(|_| PartnerGone)
    }

    fn write(&self, bytes: Bytes) -> Result<(), PartnerGone> {
        if bytes.is_empty() {
            return Ok(());
        }
        let len = bytes.len();
        self.partner.enqueued(len);
        self.send(GlueMessage::Data(bytes))?;
        metrics::record_spliced_bytes(self.partner.side().direction(), len);
        Ok(())
    }

    fn flush(&self) -> Result<(), PartnerGone> {
        self.send(GlueMessage::Flush)
    }

    fn write_eof(&self) {
        let _ = self.send(GlueMessage::WriteEof);
    }

    fn close(&self) {
        let _ = self.send(GlueMessage::Close);
    }
}

impl FrameSink<Bytes> for PartnerFeed {
    type Error = PartnerGone;

    fn on_data(&mut self, frame: Bytes) -> Result<(), PartnerGone> {
        self.write(frame)
    }

    fn on_read_complete(&mut self) -> Result<(), PartnerGone> {
        self.flush()
    }
}

/// How a side's read loop ended.
enum ReadEnd {
    /// The connection reached EOF; the partner was told to half-close.
    Eof,
    /// The pair is gone; nothing more can be delivered.
    PartnerGone,
}

/// How a side's write loop ended.
enum WriteEnd {
    /// Output was shut down after the partner's EOF.
    HalfClosed,
    /// The partner finished; this side must stop as well.
    Closed,
}

struct SideTask<C, R> {
    conn: C,
    handle: GlueHandle,
    inbox: mpsc::UnboundedReceiver<GlueMessage>,
    partner: PartnerFeed,
    relay: R,
    read_buffer_size: usize,
}

impl<C: Connection, R: Relay> SideTask<C, R> {
    /// Drive both directions of this side until it is done.
    ///
    /// Reading and writing run as separate loops: a write blocked on this
    /// connection never holds back a read from it. The only thing a read
    /// waits for is the partner's writability.
    async fn run(self) -> Result<(), ProxyError> {
        let SideTask {
            conn,
            handle,
            mut inbox,
            partner,
            mut relay,
            read_buffer_size,
        } = self;

        let Some(wake) = handle.waker() else {
            return Ok(());
        };

        let (mut reader, writer) = tokio::io::split(conn);
        let mut writer = BufWriter::new(writer);

        let result = {
            let reading = read_loop(
                &mut reader,
                &handle,
                &wake,
                &partner,
                &mut relay,
                read_buffer_size,
            );
            let writing = write_loop(&mut writer, &handle, &mut inbox);
            tokio::pin!(reading, writing);

            let mut read_done = false;
            let mut write_done = false;
            loop {
                tokio::select! {
                    read = &mut reading, if !read_done => match read {
                        Ok(ReadEnd::Eof) if !write_done => read_done = true,
                        Ok(_) => break Ok(()),
                        Err(e) => break Err(e),
                    },
                    write = &mut writing, if !write_done => match write {
                        Ok(WriteEnd::HalfClosed) if !read_done => write_done = true,
                        Ok(_) => break Ok(()),
                        Err(e) => break Err(e),
                    },
                }
            }
        };

        if let Err(error) = &result {
            if let Some(reply) = relay.failure_reply(error) {
                let _ = writer.write_all(&reply).await;
            }
        }
        let _ = writer.flush().await;

        partner.close();
        handle.remove();
        tracing::trace!(pair_id = handle.id(), side = ?handle.side(), "Splice side finished");
        result
    }
}

/// Read this side's connection and feed the partner, one read at a time.
async fn read_loop<T, R>(
    reader: &mut T,
    handle: &GlueHandle,
    wake: &Notify,
    partner: &PartnerFeed,
    relay: &mut R,
    read_buffer_size: usize,
) -> Result<ReadEnd, ProxyError>
where
    T: AsyncRead + Unpin,
    R: Relay,
{
    let mut buf = BytesMut::with_capacity(read_buffer_size);
    let mut frames = Vec::new();

    loop {
        if !handle.read() {
            if !handle.is_active() {
                return Ok(ReadEnd::PartnerGone);
            }
            wake.notified().await;
            continue;
        }

        buf.reserve(read_buffer_size);
        if reader.read_buf(&mut buf).await? == 0 {
            partner.write_eof();
            return Ok(ReadEnd::Eof);
        }

        // Frames produced before a relay error still go out ahead of it.
        let relayed = relay.relay(buf.split().freeze(), &mut frames);
        let delivered = frames
            .drain(..)
            .try_for_each(|frame| partner.write(frame))
            .and_then(|()| partner.flush());
        relayed?;
        if delivered.is_err() {
            return Ok(ReadEnd::PartnerGone);
        }
    }
}

/// Apply the partner's messages to this side's connection.
async fn write_loop<W>(
    writer: &mut W,
    handle: &GlueHandle,
    inbox: &mut mpsc::UnboundedReceiver<GlueMessage>,
) -> Result<WriteEnd, ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let mut unflushed = 0usize;

    loop {
        match inbox.recv().await {
            Some(GlueMessage::Data(bytes)) => {
                unflushed += bytes.len();
                writer.write_all(&bytes).await?;
            }
            Some(GlueMessage::Flush) => {
                writer.flush().await?;
                handle.flushed(std::mem::take(&mut unflushed));
            }
            Some(GlueMessage::WriteEof) => {
                writer.shutdown().await?;
                handle.flushed(std::mem::take(&mut unflushed));
                return Ok(WriteEnd::HalfClosed);
            }
            Some(GlueMessage::Close) | None => {
                let _ = writer.flush().await;
                return Ok(WriteEnd::Closed);
            }
        }
    }
}

/// Splices connections using a shared [`GlueTable`].
#[derive(Debug, Clone)]
pub struct Splice {
    table: GlueTable,
    read_buffer_size: usize,
}

impl Splice {
    pub fn new(table: GlueTable, read_buffer_size: usize) -> Self {
        Self {
            table,
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    pub fn from_config(config: &SpliceConfig) -> Self {
        Self::new(GlueTable::from_config(config), config.read_buffer_size)
    }

    pub fn table(&self) -> &GlueTable {
        &self.table
    }

    /// Pair `local` with `peer` and forward bytes until both directions end.
    ///
    /// Frames in `backlog` were read off `local` before the splice existed;
    /// they reach `peer` before anything read afterwards. Bytes from
    /// `local` go through `local_relay`; bytes from `peer` are forwarded
    /// unchanged. An error on either side force-closes the other.
    pub async fn run<L, P, R>(
        &self,
        local: L,
        peer: P,
        local_relay: R,
        mut backlog: DataBacklog<Bytes>,
    ) -> Result<(), ProxyError>
    where
        L: Connection,
        P: Connection,
        R: Relay,
    {
        let (local_handle, peer_handle) = self.table.matched_pair();
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let mut to_peer = PartnerFeed {
            tx: peer_tx,
            partner: peer_handle.clone(),
        };
        let to_local = PartnerFeed {
            tx: local_tx,
            partner: local_handle.clone(),
        };

        backlog
            .flush(&mut to_peer)
            .map_err(|PartnerGone| ProxyError::Splice("peer side closed early".into()))?;

        tracing::debug!(pair_id = local_handle.id(), "Connections spliced");

        let local_task = tokio::spawn(
            SideTask {
                conn: local,
                handle: local_handle,
                inbox: local_rx,
                partner: to_peer,
                relay: local_relay,
                read_buffer_size: self.read_buffer_size,
            }
            .run(),
        );
        let peer_task = tokio::spawn(
            SideTask {
                conn: peer,
                handle: peer_handle,
                inbox: peer_rx,
                partner: to_local,
                relay: Passthrough,
                read_buffer_size: self.read_buffer_size,
            }
            .run(),
        );

        let (first, remaining) = match future::select(local_task, peer_task).await {
            Either::Left((result, peer_task)) => (joined(result), peer_task),
            Either::Right((result, local_task)) => (joined(result), local_task),
        };

        if first.is_err() {
            remaining.abort();
        }
        let second = match remaining.await {
            Err(e) if e.is_cancelled() => Ok(()),
            other => joined(other),
        };

        first.and(second)
    }
}

fn joined(result: Result<Result<(), ProxyError>, JoinError>) -> Result<(), ProxyError> {
    result.unwrap_or_else(|e| Err(ProxyError::Splice(e.to_string())))
}
