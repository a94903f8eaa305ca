//! Content-process side of a channel actor.

use pd_core::NetError;
use pd_core::NetStatus;
use pd_ipc::ActorId;
use pd_ipc::ChildMessage;
use pd_ipc::LoadContextSnapshot;
use pd_ipc::OpenArgs;
use pd_ipc::ParentMessage;
use pd_ipc::ResponseHead;
use pd_net::ChannelUri;
use pd_net::RequestView;
use pd_net::StreamListener;
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;
use tracing::warn;

#[derive(Debug)]
enum Queued {
    Data { data: Vec<u8>, offset: u64 },
    Stop(NetStatus),
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Keep,
    /// The child has sent `Delete`; drop it once the outbox is flushed.
    Delete,
}

pub struct ChannelChild {
    id: ActorId,
    uri: ChannelUri,
    listener: Box<dyn StreamListener>,
    head: Option<ResponseHead>,
    status: NetStatus,
    started: bool,
    stopped: bool,
    canceled: bool,
    diverting: bool,
    queued: VecDeque<Queued>,
    outbox: VecDeque<ChildMessage>,
}

impl fmt::Debug for ChannelChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelChild")
            .field("id", &self.id)
            .field("uri", &self.uri.as_str())
            .field("status", &self.status)
            .field("diverting", &self.diverting)
            .finish_non_exhaustive()
    }
}

impl ChannelChild {
    pub fn new(id: ActorId, uri: ChannelUri, listener: Box<dyn StreamListener>) -> Self {
        Self {
            id,
            uri,
            listener,
            head: None,
            status: Ok(()),
            started: false,
            stopped: false,
            canceled: false,
            diverting: false,
            queued: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn uri(&self) -> &ChannelUri {
        &self.uri
    }

    pub fn status(&self) -> NetStatus {
        self.status
    }

    pub fn is_diverting(&self) -> bool {
        self.diverting
    }

    pub fn async_open(&mut self, load_context: LoadContextSnapshot, args: OpenArgs) {
        self.outbox.push_back(ChildMessage::ChannelConstructor {
            actor: self.id,
            load_context,
            args,
        });
    }

    /// Binds this actor to a request the parent registered for a redirect.
    pub fn connect_parent(&mut self, registrar_id: u64) {
        self.outbox.push_back(ChildMessage::ConnectChannel {
            actor: self.id,
            registrar_id,
        });
    }

    pub fn suspend(&mut self) {
        self.outbox
            .push_back(ChildMessage::Suspend { actor: self.id });
    }

    pub fn resume(&mut self) {
        self.outbox.push_back(ChildMessage::Resume { actor: self.id });
    }

    pub fn cancel(&mut self, status: NetError) {
        if self.canceled || self.stopped {
            return;
        }
        self.canceled = true;
        if self.status.is_ok() {
            self.status = Err(status);
        }
        self.outbox.push_back(ChildMessage::Cancel {
            actor: self.id,
            status,
        });
    }

    /// Hands the rest of the response to a listener in the parent.
    pub fn divert_to_parent(&mut self) -> NetStatus {
        if self.diverting {
            return Err(NetError::Unexpected);
        }
        if self.stopped {
            return Err(NetError::NotAvailable);
        }
        self.diverting = true;
        debug!(actor = %self.id, "diverting to parent");
        self.outbox
            .push_back(ChildMessage::DivertToParent { actor: self.id });
        Ok(())
    }

    pub fn take_outbox(&mut self) -> Vec<ChildMessage> {
        self.outbox.drain(..).collect()
    }

    pub fn recv(&mut self, message: ParentMessage) -> ChildOutcome {
        match message {
            ParentMessage::OnStartRequest { status, head, .. } => {
                if self.started {
                    warn!(actor = %self.id, "duplicate start from parent");
                    return ChildOutcome::Keep;
                }
                self.head = Some(head);
                self.deliver_start(status);
            }
            ParentMessage::OnDataAvailable { data, offset, .. } => {
                if self.diverting {
                    self.queued.push_back(Queued::Data { data, offset });
                } else {
                    self.deliver_data(&data, offset);
                }
            }
            ParentMessage::OnStopRequest { status, .. } => {
                if self.diverting {
                    self.queued.push_back(Queued::Stop(status));
                } else {
                    return self.deliver_stop(status);
                }
            }
            ParentMessage::FailedAsyncOpen { status, .. } => {
                debug!(actor = %self.id, status = %status, "open failed in parent");
                self.diverting = false;
                return self.deliver_stop(Err(status));
            }
            ParentMessage::FlushedForDiversion { .. } => {
                // Parent-initiated diversions start here.
                self.diverting = true;
                self.queued.push_back(Queued::Flushed);
            }
            ParentMessage::DivertMessages { .. } => {
                if !self.diverting {
                    warn!(actor = %self.id, "divert messages while not diverting");
                    return ChildOutcome::Keep;
                }
                self.replay_to_parent();
            }
            ParentMessage::DeleteSelf { .. } => {
                if !self.stopped && !self.diverting {
                    self.finish(Err(NetError::Aborted));
                }
                self.outbox.push_back(ChildMessage::Delete { actor: self.id });
                return ChildOutcome::Delete;
            }
            other => {
                warn!(actor = %self.id, message = other.name(), "message not handled by channel child");
            }
        }
        ChildOutcome::Keep
    }

    fn replay_to_parent(&mut self) {
        while let Some(queued) = self.queued.pop_front() {
            let message = match queued {
                Queued::Data { data, offset } => {
                    let count = data.len() as u32;
                    ChildMessage::DivertOnDataAvailable {
                        actor: self.id,
                        data,
                        offset,
                        count,
                    }
                }
                Queued::Stop(status) => ChildMessage::DivertOnStopRequest {
                    actor: self.id,
                    status,
                },
                Queued::Flushed => ChildMessage::DivertComplete { actor: self.id },
            };
            self.outbox.push_back(message);
        }
    }

    fn deliver_start(&mut self, status: NetStatus) {
        self.started = true;
        if status.is_err() && self.status.is_ok() {
            self.status = status;
        }
        let view = view(&self.uri, self.head.as_ref(), self.status, true);
        if let Err(error) = self.listener.on_start_request(view) {
            self.cancel(error);
        }
    }

    fn deliver_data(&mut self, data: &[u8], offset: u64) {
        if self.canceled || self.stopped {
            debug!(actor = %self.id, offset, "data after cancel dropped");
            return;
        }
        let view = view(&self.uri, self.head.as_ref(), self.status, true);
        if let Err(error) = self.listener.on_data_available(view, data, offset) {
            self.cancel(error);
        }
    }

    fn deliver_stop(&mut self, status: NetStatus) -> ChildOutcome {
        if self.stopped {
            warn!(actor = %self.id, "duplicate stop from parent");
            return ChildOutcome::Keep;
        }
        self.finish(status);
        self.outbox.push_back(ChildMessage::Delete { actor: self.id });
        ChildOutcome::Delete
    }

    fn finish(&mut self, status: NetStatus) {
        if !self.started {
            self.deliver_start(status);
        }
        if status.is_err() && self.status.is_ok() {
            self.status = status;
        }
        self.stopped = true;
        let view = view(&self.uri, self.head.as_ref(), self.status, false);
        self.listener.on_stop_request(view, status);
    }
}

fn view<'a>(
    uri: &'a ChannelUri,
    head: Option<&'a ResponseHead>,
    status: NetStatus,
    pending: bool,
) -> RequestView<'a> {
    RequestView {
        uri,
        pending,
        status,
        head,
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelChild;
    use super::ChildOutcome;
    use pd_core::NetError;
    use pd_ipc::ActorId;
    use pd_ipc::ChildMessage;
    use pd_ipc::ParentMessage;
    use pd_ipc::ResponseHead;
    use pd_net::ChannelUri;
    use pd_net::ListenerEvent;
    use pd_net::RecordingListener;

    const ID: ActorId = ActorId(4);

    fn child() -> (ChannelChild, RecordingListener) {
        let uri = ChannelUri::parse("https://example.org/feed.xml");
        let listener = RecordingListener::new();
        let child = ChannelChild::new(
            ID,
            uri.unwrap_or_else(|_| unreachable!()),
            Box::new(listener.clone()),
        );
        (child, listener)
    }

    fn start() -> ParentMessage {
        ParentMessage::OnStartRequest {
            actor: ID,
            status: Ok(()),
            head: ResponseHead::new("https://example.org/feed.xml", "application/xml"),
        }
    }

    fn data(bytes: &[u8], offset: u64) -> ParentMessage {
        ParentMessage::OnDataAvailable {
            actor: ID,
            status: Ok(()),
            data: bytes.to_vec(),
            offset,
            count: bytes.len() as u32,
        }
    }

    #[test]
    fn delivers_stream_and_deletes_after_stop() {
        let (mut child, listener) = child();
        assert_eq!(child.recv(start()), ChildOutcome::Keep);
        assert_eq!(child.recv(data(b"<a/>", 0)), ChildOutcome::Keep);
        let outcome = child.recv(ParentMessage::OnStopRequest {
            actor: ID,
            status: Ok(()),
        });
        assert_eq!(outcome, ChildOutcome::Delete);
        assert_eq!(child.take_outbox(), [ChildMessage::Delete { actor: ID }]);
        assert_eq!(listener.body(), b"<a/>");
        assert_eq!(listener.stops(), 1);
    }

    #[test]
    fn failed_open_becomes_start_and_stop() {
        let (mut child, listener) = child();
        let outcome = child.recv(ParentMessage::FailedAsyncOpen {
            actor: ID,
            status: NetError::PermissionDenied,
        });
        assert_eq!(outcome, ChildOutcome::Delete);
        assert_eq!(
            listener.events(),
            [
                ListenerEvent::Start {
                    pending: true,
                    status: Err(NetError::PermissionDenied),
                    content_type: None,
                },
                ListenerEvent::Stop(Err(NetError::PermissionDenied)),
            ]
        );
        assert_eq!(child.status(), Err(NetError::PermissionDenied));
    }

    #[test]
    fn diversion_replays_buffered_events_behind_barrier() {
        let (mut child, listener) = child();
        child.recv(start());
        assert_eq!(child.divert_to_parent(), Ok(()));
        assert_eq!(child.divert_to_parent(), Err(NetError::Unexpected));
        child.recv(data(b"one", 0));
        child.recv(ParentMessage::OnStopRequest {
            actor: ID,
            status: Ok(()),
        });
        child.recv(ParentMessage::FlushedForDiversion { actor: ID });
        assert_eq!(
            child.take_outbox(),
            [ChildMessage::DivertToParent { actor: ID }]
        );

        child.recv(ParentMessage::DivertMessages { actor: ID });
        assert_eq!(
            child.take_outbox(),
            [
                ChildMessage::DivertOnDataAvailable {
                    actor: ID,
                    data: b"one".to_vec(),
                    offset: 0,
                    count: 3,
                },
                ChildMessage::DivertOnStopRequest {
                    actor: ID,
                    status: Ok(()),
                },
                ChildMessage::DivertComplete { actor: ID },
            ]
        );
        assert_eq!(listener.starts(), 1);
        assert_eq!(listener.stops(), 0);

        assert_eq!(
            child.recv(ParentMessage::DeleteSelf { actor: ID }),
            ChildOutcome::Delete
        );
        assert_eq!(listener.stops(), 0);
    }

    #[test]
    fn delete_self_closes_out_listener_when_not_diverted() {
        let (mut child, listener) = child();
        child.recv(start());
        assert_eq!(
            child.recv(ParentMessage::DeleteSelf { actor: ID }),
            ChildOutcome::Delete
        );
        assert_eq!(listener.last_stop(), Some(Err(NetError::Aborted)));
        assert_eq!(child.take_outbox(), [ChildMessage::Delete { actor: ID }]);
    }

    #[test]
    fn stop_without_start_synthesizes_start() {
        let (mut child, listener) = child();
        child.recv(ParentMessage::OnStopRequest {
            actor: ID,
            status: Err(NetError::Redirected),
        });
        assert_eq!(listener.starts(), 1);
        assert_eq!(listener.last_stop(), Some(Err(NetError::Redirected)));
    }

    #[test]
    fn listener_refusal_cancels_once() {
        let (mut child, listener) = child();
        listener.refuse_data(NetError::Aborted);
        child.recv(start());
        child.recv(data(b"a", 0));
        child.recv(data(b"b", 1));
        assert_eq!(
            child.take_outbox(),
            [ChildMessage::Cancel {
                actor: ID,
                status: NetError::Aborted,
            }]
        );
    }
}
