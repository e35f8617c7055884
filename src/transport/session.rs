//! One open call, seen from either end
//!
//! A [`StreamSession`] pairs a send path and a receive path over the same
//! call. The two paths share nothing but the call id and the connection's
//! outbound queue, so after [`StreamSession::split`] they can live on
//! separate tasks without any locking.
//!
//! Each direction of a call is flow-controlled on its own. The receiving
//! end grants credit for a window of messages and tops it up as its
//! application consumes them; the sending end waits for credit, never the
//! connection. A call whose reader stalls therefore only stalls itself.

use crate::common::{MessageSink, MessageSource};
use crate::proto::{CallId, Frame, Status};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

/// Which end of the call a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// What the connection reader hands to a call
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(serde_json::Value),
    /// Clean end of the peer's direction
    End,
    Failed(Status),
}

/// Per-call inbound queue sized for a window of messages plus one
/// terminal unit
pub(crate) fn inbound_queue(window: u32) -> (mpsc::Sender<Inbound>, mpsc::Receiver<Inbound>) {
    mpsc::channel(window as usize + 1)
}

/// Outcome of handing an inbound unit to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    /// The peer sent past its credit; the call has been failed
    Overrun,
    /// Nobody is reading the call any more
    Gone,
}

/// Queues `inbound` for a call without ever waiting on it
///
/// A message that finds only the terminal slot left means the peer ignored
/// its window. The call is failed in that slot instead.
pub(crate) fn deliver(queue: &mpsc::Sender<Inbound>, inbound: Inbound) -> Delivery {
    if matches!(inbound, Inbound::Message(_)) && queue.capacity() <= 1 {
        let status = Status::resource_exhausted("peer sent past its flow-control window");
        return match queue.try_send(Inbound::Failed(status)) {
            Ok(()) => Delivery::Overrun,
            Err(_) => Delivery::Gone,
        };
    }
    match queue.try_send(inbound) {
        Ok(()) => Delivery::Queued,
        Err(_) => Delivery::Gone,
    }
}

/// Tells the server a client call is abandoned
///
/// Never waits: when the outbound queue is full the cancel is handed to a
/// task instead of being dropped.
pub(crate) fn send_cancel(outbound: &mpsc::Sender<Frame>, call: CallId) {
    match outbound.try_send(Frame::Cancel { call }) {
        Ok(()) => {}
        Err(TrySendError::Full(frame)) => match Handle::try_current() {
            Ok(handle) => {
                let outbound = outbound.clone();
                handle.spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
            Err(_) => debug!(call, "No runtime left to send cancel"),
        },
        Err(TrySendError::Closed(_)) => debug!(call, "Connection closed before cancel"),
    }
}

/// Send credit the peer has granted on one call
#[derive(Debug)]
pub(crate) struct Credit {
    permits: Semaphore,
    closed_with: OnceLock<Status>,
}

impl Credit {
    pub(crate) fn new(initial: u32) -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(initial as usize),
            closed_with: OnceLock::new(),
        })
    }

    pub(crate) fn grant(&self, count: u32) -> Result<(), Status> {
        let available = self.permits.available_permits();
        if available.saturating_add(count as usize) > Semaphore::MAX_PERMITS {
            return Err(Status::invalid_argument("flow-control window overflow"));
        }
        self.permits.add_permits(count as usize);
        Ok(())
    }

    /// Wakes every waiting sender; later sends fail with `status`
    pub(crate) fn close(&self, status: Status) {
        let _ = self.closed_with.set(status);
        self.permits.close();
    }

    async fn take(&self) -> Result<(), Status> {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(self
                .closed_with
                .get()
                .cloned()
                .unwrap_or_else(connection_lost)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecvState {
    Open,
    Ended,
    Failed(Status),
}

/// Send path of a call
pub struct SendHalf<S> {
    call: CallId,
    role: Role,
    outbound: mpsc::Sender<Frame>,
    credit: Arc<Credit>,
    deadline: Option<Instant>,
    half_closed: bool,
    _marker: PhantomData<fn(S)>,
}

/// Receive path of a call
pub struct RecvHalf<R> {
    call: CallId,
    role: Role,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Inbound>,
    deadline: Option<Instant>,
    state: RecvState,
    window: u32,
    consumed: u32,
    _marker: PhantomData<fn() -> R>,
}

/// An open call that sends `S` units and receives `R` units
pub struct StreamSession<S, R> {
    send: SendHalf<S>,
    recv: RecvHalf<R>,
}

fn deadline_status() -> Status {
    Status::deadline_exceeded("call deadline elapsed")
}

pub(crate) fn connection_lost() -> Status {
    Status::unavailable("connection closed")
}

impl<S, R> StreamSession<S, R> {
    /// `window` is the credit this end granted the peer; `credit` is what
    /// the peer grants this end
    pub(crate) fn new(
        call: CallId,
        role: Role,
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Inbound>,
        window: u32,
        credit: Arc<Credit>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            send: SendHalf {
                call,
                role,
                outbound: outbound.clone(),
                credit,
                deadline,
                half_closed: false,
                _marker: PhantomData,
            },
            recv: RecvHalf {
                call,
                role,
                outbound,
                inbound,
                deadline,
                state: RecvState::Open,
                window,
                consumed: 0,
                _marker: PhantomData,
            },
        }
    }

    pub fn call_id(&self) -> CallId {
        self.send.call
    }

    /// Separates the two directions so each can be driven by its own task
    pub fn split(self) -> (SendHalf<S>, RecvHalf<R>) {
        (self.send, self.recv)
    }
}

impl<S: Serialize, R: DeserializeOwned> StreamSession<S, R> {
    pub async fn send(&mut self, item: S) -> Result<(), Status> {
        self.send.send(item).await
    }

    pub async fn receive(&mut self) -> Result<Option<R>, Status> {
        self.recv.receive().await
    }

    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.send.close_send().await
    }
}

impl<S: Serialize> SendHalf<S> {
    pub fn call_id(&self) -> CallId {
        self.call
    }

    /// Sends one unit once the peer has credit for it
    pub async fn send(&mut self, item: S) -> Result<(), Status> {
        if self.half_closed {
            return Err(Status::internal("send after close_send"));
        }
        let payload = serde_json::to_value(item)
            .map_err(|e| Status::internal(format!("failed to encode message: {e}")))?;
        self.push(
            Frame::Message {
                call: self.call,
                payload,
            },
            true,
        )
        .await
    }

    /// Half-closes the send direction
    ///
    /// Only the client end transmits a half-close; a server ends its
    /// direction by finishing the call, so this is a no-op there.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        if self.half_closed {
            return Ok(());
        }
        self.half_closed = true;
        if self.role == Role::Client {
            self.push(Frame::HalfClose { call: self.call }, false).await?;
            debug!(call = self.call, "Half-closed send direction");
        }
        Ok(())
    }

    async fn push(&self, frame: Frame, needs_credit: bool) -> Result<(), Status> {
        let delivery = async {
            if needs_credit {
                self.credit.take().await?;
            }
            self.outbound.send(frame).await.map_err(|_| connection_lost())
        };
        match self.deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(deadline_status());
                }
                timeout_at(deadline, delivery)
                    .await
                    .map_err(|_| deadline_status())?
            }
            None => delivery.await,
        }
    }
}

impl<R: DeserializeOwned> RecvHalf<R> {
    pub fn call_id(&self) -> CallId {
        self.call
    }

    pub async fn receive(&mut self) -> Result<Option<R>, Status> {
        match &self.state {
            RecvState::Open => {}
            RecvState::Ended => return Ok(None),
            RecvState::Failed(status) => return Err(status.clone()),
        }

        let next = match self.deadline {
            Some(deadline) => match timeout_at(deadline, self.inbound.recv()).await {
                Ok(next) => next,
                Err(_) => return Err(self.fail_locally(deadline_status())),
            },
            None => self.inbound.recv().await,
        };

        match next {
            Some(Inbound::Message(payload)) => {
                self.replenish().await;
                match serde_json::from_value(payload) {
                    Ok(item) => Ok(Some(item)),
                    Err(e) => Err(self.fail_locally(Status::invalid_argument(format!(
                        "malformed message: {e}"
                    )))),
                }
            }
            Some(Inbound::End) => {
                self.state = RecvState::Ended;
                debug!(call = self.call, "Peer finished stream");
                Ok(None)
            }
            Some(Inbound::Failed(status)) => {
                self.state = RecvState::Failed(status.clone());
                Err(status)
            }
            None => {
                let status = connection_lost();
                self.state = RecvState::Failed(status.clone());
                Err(status)
            }
        }
    }

    /// Hands consumed credit back to the peer, half a window at a time
    async fn replenish(&mut self) {
        self.consumed += 1;
        if self.consumed < (self.window / 2).max(1) {
            return;
        }
        let count = std::mem::take(&mut self.consumed);
        let _ = self
            .outbound
            .send(Frame::Credit {
                call: self.call,
                count,
            })
            .await;
    }

    /// Fails the call for a reason the peer does not know about yet
    fn fail_locally(&mut self, status: Status) -> Status {
        self.state = RecvState::Failed(status.clone());
        if self.role == Role::Client {
            send_cancel(&self.outbound, self.call);
        }
        status
    }
}

impl<R> Drop for RecvHalf<R> {
    fn drop(&mut self) {
        if self.state == RecvState::Open && self.role == Role::Client {
            send_cancel(&self.outbound, self.call);
        }
    }
}

#[async_trait]
impl<S> MessageSink<S> for SendHalf<S>
where
    S: Serialize + Send + 'static,
{
    async fn send(&mut self, item: S) -> Result<(), Status> {
        SendHalf::send(self, item).await
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        SendHalf::close_send(self).await
    }
}

#[async_trait]
impl<R> MessageSource<R> for RecvHalf<R>
where
    R: DeserializeOwned + Send + 'static,
{
    async fn receive(&mut self) -> Result<Option<R>, Status> {
        RecvHalf::receive(self).await
    }
}
