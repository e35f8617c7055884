//! Frame plumbing shared by both ends of a connection
//!
//! A connection is split into a reader and a writer. All calls on the
//! connection push frames into one bounded outbound queue that a single
//! writer task drains; a reader task routes inbound frames to the call they
//! name.

use super::session::{Credit, Delivery, Inbound, connection_lost, deliver, send_cancel};
use crate::proto::{CallId, Frame, FrameCodec, Status};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Drains the outbound queue into the socket until every sender is gone
pub(crate) async fn write_frames<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "Failed to write frame");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Failed to close connection writer");
    }
}

/// Routing entry for one open client call
#[derive(Clone)]
pub(crate) struct ClientCall {
    pub(crate) inbound: mpsc::Sender<Inbound>,
    /// Credit the server grants for this call's requests
    pub(crate) credit: Arc<Credit>,
}

impl ClientCall {
    /// Ends the call on this side and wakes anything waiting on it
    fn fail(&self, status: Status) {
        deliver(&self.inbound, Inbound::Failed(status.clone()));
        self.credit.close(status);
    }
}

#[derive(Default)]
struct CallTableInner {
    calls: HashMap<CallId, ClientCall>,
    closed: bool,
}

/// Open client calls on one connection, keyed by call id
///
/// Shared between the dialer, which registers calls, and the reader task,
/// which routes frames to them.
#[derive(Clone, Default)]
pub(crate) struct CallTable {
    inner: Arc<Mutex<CallTableInner>>,
}

impl CallTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, CallTableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, call: CallId, entry: ClientCall) -> Result<(), Status> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(connection_lost());
        }
        inner.calls.insert(call, entry);
        Ok(())
    }

    fn get(&self, call: CallId) -> Option<ClientCall> {
        self.lock().calls.get(&call).cloned()
    }

    pub(crate) fn remove(&self, call: CallId) -> Option<ClientCall> {
        self.lock().calls.remove(&call)
    }

    /// Marks the connection dead and fails every open call
    fn close(&self) {
        let calls = {
            let mut inner = self.lock();
            inner.closed = true;
            std::mem::take(&mut inner.calls)
        };
        for entry in calls.into_values() {
            entry.credit.close(connection_lost());
        }
    }
}

/// Routes server frames to the client calls they belong to
///
/// Never waits on a single call: a call that stops reading runs out of
/// window and only its own traffic stops.
pub(crate) async fn read_responses<R>(
    mut frames: FramedRead<R, FrameCodec>,
    calls: CallTable,
    outbound: mpsc::Sender<Frame>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read frame from server");
                break;
            }
            None => {
                debug!("Server closed connection");
                break;
            }
        };

        match frame {
            Frame::Message { call, payload } => {
                let Some(entry) = calls.get(call) else {
                    debug!(call, "Dropping message for finished call");
                    continue;
                };
                match deliver(&entry.inbound, Inbound::Message(payload)) {
                    Delivery::Queued => {}
                    Delivery::Overrun => {
                        warn!(call, "Server overran call window; cancelling");
                        calls.remove(call);
                        entry.credit.close(Status::resource_exhausted("server overran call window"));
                        send_cancel(&outbound, call);
                    }
                    Delivery::Gone => {
                        calls.remove(call);
                    }
                }
            }
            Frame::Credit { call, count } => {
                let Some(entry) = calls.get(call) else {
                    continue;
                };
                if let Err(status) = entry.credit.grant(count) {
                    warn!(call, error = %status, "Bad credit from server; cancelling");
                    calls.remove(call);
                    entry.fail(status);
                    send_cancel(&outbound, call);
                }
            }
            Frame::Close { call, status } => {
                let Some(entry) = calls.remove(call) else {
                    continue;
                };
                if status.is_ok() {
                    deliver(&entry.inbound, Inbound::End);
                    entry
                        .credit
                        .close(Status::internal("server finished the call"));
                } else {
                    entry.fail(status);
                }
            }
            other => {
                warn!(call = other.call(), "Ignoring unexpected frame from server");
            }
        }
    }

    calls.close();
}
