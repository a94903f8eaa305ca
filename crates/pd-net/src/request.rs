//! Collaborator contracts between channel actors and the transport that
//! performs the actual I/O.

use crate::url::ChannelUri;
use pd_core::NetError;
use pd_core::NetResult;
use pd_core::NetStatus;
use pd_ipc::OpenArgs;
use pd_ipc::RedirectRequest;
use pd_ipc::ResponseHead;
use pd_privacy::LoadContext;
use std::fmt;
use std::io;
use std::io::Cursor;
use std::io::Read;

/// Kind of redirect reported by a transport, handed to the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedirectFlags(u32);

impl RedirectFlags {
    pub const TEMPORARY: Self = Self(1);
    pub const PERMANENT: Self = Self(1 << 1);
    pub const INTERNAL: Self = Self(1 << 2);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Bytes made available by a transport. Reading may fail mid-chunk.
pub struct DataChunk {
    pub offset: u64,
    pub count: usize,
    source: Box<dyn Read>,
}

impl DataChunk {
    pub fn from_bytes(offset: u64, bytes: Vec<u8>) -> Self {
        Self {
            offset,
            count: bytes.len(),
            source: Box::new(Cursor::new(bytes)),
        }
    }

    /// Chunk announcing `count` bytes whose read fails with `error`.
    pub fn failing(offset: u64, count: usize, error: NetError) -> Self {
        Self {
            offset,
            count,
            source: Box::new(FailingSource { error }),
        }
    }

    /// Fills `buf` completely or reports the transport error.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> NetStatus {
        self.source.read_exact(buf).map_err(|error| {
            error
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<NetError>())
                .copied()
                .unwrap_or(NetError::ReadFailed)
        })
    }
}

impl fmt::Debug for DataChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChunk")
            .field("offset", &self.offset)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

struct FailingSource {
    error: NetError,
}

impl Read for FailingSource {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::other(self.error))
    }
}

/// Notification pulled from a transport.
#[derive(Debug)]
pub enum RequestEvent {
    Start,
    Data(DataChunk),
    Stop(NetStatus),
    /// The transport parks until it is cancelled or replaced.
    Redirect {
        redirect: RedirectRequest,
        flags: RedirectFlags,
    },
}

/// Read-only view of a request handed to listeners and the event sink.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub uri: &'a ChannelUri,
    pub pending: bool,
    pub status: NetStatus,
    pub head: Option<&'a ResponseHead>,
}

/// The byte-level transport owned by a channel actor.
///
/// Transports never call back into their owner; the owner pulls events
/// with [`NetworkRequest::poll_event`] on its event loop. A suspended
/// transport yields no events until it is resumed.
pub trait NetworkRequest {
    fn uri(&self) -> &ChannelUri;

    fn channel_id(&self) -> u64;

    fn async_open(&mut self) -> NetStatus;

    /// Idempotent; the first error wins. A cancelled request still
    /// reports its stop through `poll_event`.
    fn cancel(&mut self, status: NetError);

    /// Fails with `NotAvailable` when the transfer has already finished.
    fn suspend(&mut self) -> NetStatus;

    fn resume(&mut self) -> NetStatus;

    fn is_pending(&self) -> bool;

    /// Makes `is_pending` report `true` regardless of transfer progress.
    fn force_pending(&mut self, forced: bool);

    fn status(&self) -> NetStatus;

    fn response_head(&self) -> Option<&ResponseHead>;

    fn poll_event(&mut self) -> Option<RequestEvent>;

    fn view(&self) -> RequestView<'_> {
        RequestView {
            uri: self.uri(),
            pending: self.is_pending(),
            status: self.status(),
            head: self.response_head(),
        }
    }
}

/// Consumer of one request's notification stream.
pub trait StreamListener {
    fn on_start_request(&mut self, request: RequestView<'_>) -> NetStatus;

    fn on_data_available(&mut self, request: RequestView<'_>, data: &[u8], offset: u64)
    -> NetStatus;

    fn on_stop_request(&mut self, request: RequestView<'_>, status: NetStatus);
}

/// Builds transports for channel constructors and redirects.
pub trait RequestFactory {
    fn create(
        &self,
        args: &OpenArgs,
        context: Option<&LoadContext>,
    ) -> NetResult<Box<dyn NetworkRequest>>;
}
