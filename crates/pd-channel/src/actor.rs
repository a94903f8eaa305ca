//! Parent-side channel actor: owns one network request and relays its
//! notifications to the content process that asked for it.

use crate::ActorKey;
use crate::task::ActorTask;
use crate::task::TaskQueue;
use pd_core::NetError;
use pd_core::NetStatus;
use pd_ipc::ChildMessage;
use pd_ipc::ParentMessage;
use pd_ipc::RedirectRequest;
use pd_ipc::ResponseHead;
use pd_net::DataChunk;
use pd_net::NetworkRequest;
use pd_net::RedirectFlags;
use pd_net::RequestEvent;
use pd_net::StreamListener;
use pd_privacy::LoadContext;
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Constructed,
    Opening,
    Streaming,
    Completed,
    Destroyed,
}

/// Result of pulling one notification from the request.
#[derive(Debug)]
pub enum Pump {
    Idle,
    Delivered,
    /// The request wants to be replaced; the registry decides where.
    Redirect {
        redirect: RedirectRequest,
        flags: RedirectFlags,
    },
}

/// Whether the registry should keep the actor after a message or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorOutcome {
    Keep,
    Release,
}

pub struct ChannelActor {
    pub(crate) key: ActorKey,
    pub(crate) state: ActorState,
    pub(crate) request: Option<Box<dyn NetworkRequest>>,
    pub(crate) load_context: Option<LoadContext>,
    pub(crate) ipc_closed: bool,
    pub(crate) status: NetStatus,
    status_recorded: bool,
    pub(crate) diverting: bool,
    pub(crate) diverted_on_start: bool,
    pub(crate) suspended_for_diversion: bool,
    pub(crate) divert_target: Option<Box<dyn StreamListener>>,
    pub(crate) divert_stop_delivered: bool,
    outbox: VecDeque<ParentMessage>,
    transfer_buffer_bytes: usize,
}

impl fmt::Debug for ChannelActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelActor")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("status", &self.status)
            .field("diverting", &self.diverting)
            .field("ipc_closed", &self.ipc_closed)
            .finish_non_exhaustive()
    }
}

impl ChannelActor {
    pub fn new(key: ActorKey, transfer_buffer_bytes: usize) -> Self {
        Self {
            key,
            state: ActorState::Constructed,
            request: None,
            load_context: None,
            ipc_closed: false,
            status: Ok(()),
            status_recorded: false,
            diverting: false,
            diverted_on_start: false,
            suspended_for_diversion: false,
            divert_target: None,
            divert_stop_delivered: false,
            outbox: VecDeque::new(),
            transfer_buffer_bytes: transfer_buffer_bytes.max(1),
        }
    }

    pub fn key(&self) -> ActorKey {
        self.key
    }

    pub fn state(&self) -> ActorState {
        self.state
    }

    /// Last recorded terminal status.
    pub fn status(&self) -> NetStatus {
        self.status
    }

    pub fn is_diverting(&self) -> bool {
        self.diverting
    }

    pub fn is_suspended_for_diversion(&self) -> bool {
        self.suspended_for_diversion
    }

    pub fn diverted_on_start(&self) -> bool {
        self.diverted_on_start
    }

    pub fn ipc_closed(&self) -> bool {
        self.ipc_closed
    }

    pub fn load_context(&self) -> Option<&LoadContext> {
        self.load_context.as_ref()
    }

    pub fn request(&self) -> Option<&dyn NetworkRequest> {
        self.request.as_deref()
    }

    /// Opens `request` on behalf of the child.
    ///
    /// On failure the child is sent `FailedAsyncOpen` and the actor stays
    /// constructed until the child deletes it.
    pub fn async_open(
        &mut self,
        mut request: Box<dyn NetworkRequest>,
        load_context: Option<LoadContext>,
    ) -> NetStatus {
        if self.state != ActorState::Constructed {
            return Err(NetError::Unexpected);
        }

        if let Err(error) = request.async_open() {
            self.fail_open(error);
            return Err(error);
        }

        debug!(actor = %self.key, uri = %request.uri().as_str(), "channel opened");
        self.load_context = load_context;
        self.request = Some(request);
        self.state = ActorState::Opening;
        Ok(())
    }

    /// Binds a request the parent already opened for a cross-process redirect.
    pub fn connect(
        &mut self,
        request: Box<dyn NetworkRequest>,
        load_context: Option<LoadContext>,
    ) -> NetStatus {
        if self.state != ActorState::Constructed {
            return Err(NetError::Unexpected);
        }
        debug!(actor = %self.key, uri = %request.uri().as_str(), "channel connected");
        self.load_context = load_context;
        self.request = Some(request);
        self.state = ActorState::Opening;
        Ok(())
    }

    pub fn fail_open(&mut self, error: NetError) {
        debug!(actor = %self.key, status = %error, "channel open failed");
        self.record_status(Err(error));
        self.send(ParentMessage::FailedAsyncOpen {
            actor: self.key.actor,
            status: error,
        });
    }

    /// Accepted in any state; only the first status is recorded.
    pub fn cancel(&mut self, status: NetError) {
        self.record_status(Err(status));
        if let Some(request) = self.request.as_mut() {
            request.cancel(status);
        }
    }

    /// Swaps in the request that replaces the current one after an
    /// approved same-process redirect.
    pub fn replace_request(&mut self, mut request: Box<dyn NetworkRequest>) -> NetStatus {
        if let Some(mut old) = self.request.take() {
            old.cancel(NetError::Redirected);
        }

        let opened = request.async_open();
        debug!(
            actor = %self.key,
            uri = %request.uri().as_str(),
            status = ?opened,
            "channel request replaced"
        );
        self.request = Some(request);
        if let Err(error) = opened {
            self.abort_unstarted(error);
        }
        opened
    }

    /// Reports `error` as both start and stop when the request can no
    /// longer produce them itself.
    pub fn abort_unstarted(&mut self, error: NetError) {
        self.record_status(Err(error));
        if self.state == ActorState::Opening {
            self.on_start_request();
        }
        self.on_stop_request(Err(error));
    }

    /// Pulls and delivers one notification.
    pub fn pump(&mut self) -> Pump {
        if self.state == ActorState::Destroyed {
            return Pump::Idle;
        }

        let event = match self.request.as_mut() {
            Some(request) => request.poll_event(),
            None => None,
        };

        match event {
            None => Pump::Idle,
            Some(RequestEvent::Start) => {
                self.on_start_request();
                Pump::Delivered
            }
            Some(RequestEvent::Data(chunk)) => {
                self.on_data_available(chunk);
                Pump::Delivered
            }
            Some(RequestEvent::Stop(status)) => {
                self.on_stop_request(status);
                Pump::Delivered
            }
            Some(RequestEvent::Redirect { redirect, flags }) => Pump::Redirect { redirect, flags },
        }
    }

    /// Handles a message the child addressed to this actor.
    pub fn recv(&mut self, message: ChildMessage, tasks: &mut TaskQueue) -> ActorOutcome {
        match message {
            ChildMessage::Suspend { .. } => {
                if let Some(request) = self.request.as_mut() {
                    if let Err(error) = request.suspend() {
                        debug!(actor = %self.key, status = %error, "suspend ignored");
                    }
                }
            }
            ChildMessage::Resume { .. } => {
                if let Some(request) = self.request.as_mut() {
                    if let Err(error) = request.resume() {
                        debug!(actor = %self.key, status = %error, "resume ignored");
                    }
                }
            }
            ChildMessage::Cancel { status, .. } => self.cancel(status),
            ChildMessage::DivertToParent { .. } => {
                if let Err(error) = self.suspend_for_diversion() {
                    warn!(actor = %self.key, status = %error, "child asked to divert twice");
                }
            }
            ChildMessage::DivertOnDataAvailable { data, offset, .. } => {
                self.recv_divert_on_data(&data, offset, tasks);
            }
            ChildMessage::DivertOnStopRequest { status, .. } => {
                self.recv_divert_on_stop(status, tasks);
            }
            ChildMessage::DivertComplete { .. } => return self.recv_divert_complete(tasks),
            ChildMessage::Delete { .. } => return ActorOutcome::Release,
            other => {
                warn!(actor = %self.key, message = other.name(), "message not handled by channel actor");
            }
        }
        ActorOutcome::Keep
    }

    pub fn run_task(&mut self, task: ActorTask, tasks: &mut TaskQueue) -> ActorOutcome {
        match task {
            ActorTask::StartDiversion => {
                self.start_diversion(tasks);
                ActorOutcome::Keep
            }
            ActorTask::FailDiversion { error, skip_resume } => {
                self.fail_diversion(error, skip_resume)
            }
        }
    }

    /// Messages queued for the child since the last call.
    pub fn take_outbox(&mut self) -> Vec<ParentMessage> {
        self.outbox.drain(..).collect()
    }

    /// The child connection is gone; further sends are dropped.
    pub fn mark_ipc_closed(&mut self) {
        self.ipc_closed = true;
        self.outbox.clear();
    }

    pub(crate) fn send(&mut self, message: ParentMessage) -> bool {
        if self.ipc_closed {
            warn!(actor = %self.key, message = message.name(), "dropping send on closed channel");
            return false;
        }
        self.outbox.push_back(message);
        true
    }

    pub(crate) fn record_status(&mut self, status: NetStatus) {
        if !self.status_recorded {
            self.status = status;
            self.status_recorded = status.is_err();
        }
    }

    fn on_start_request(&mut self) {
        if self.diverting {
            self.divert_start();
            return;
        }

        let Some(request) = self.request.as_ref() else {
            return;
        };
        let head = request
            .response_head()
            .cloned()
            .unwrap_or_else(|| ResponseHead::new(request.uri().as_str(), ""));
        let status = match request.status() {
            Ok(()) => self.status,
            failed => failed,
        };

        self.state = ActorState::Streaming;
        self.send(ParentMessage::OnStartRequest {
            actor: self.key.actor,
            status,
            head,
        });
    }

    fn on_data_available(&mut self, mut chunk: DataChunk) {
        let mut remaining = chunk.count;
        let mut offset = chunk.offset;

        while remaining > 0 {
            let len = remaining.min(self.transfer_buffer_bytes);
            let mut buf = vec![0_u8; len];
            if let Err(error) = chunk.read_exact(&mut buf) {
                warn!(actor = %self.key, status = %error, "read from request failed");
                self.cancel(error);
                return;
            }

            if self.diverting {
                self.divert_data(&buf, offset);
            } else {
                let status = self
                    .request
                    .as_ref()
                    .map_or(self.status, |request| request.status());
                self.send(ParentMessage::OnDataAvailable {
                    actor: self.key.actor,
                    status,
                    data: buf,
                    offset,
                    count: len as u32,
                });
            }

            remaining -= len;
            offset += len as u64;
        }
    }

    fn on_stop_request(&mut self, status: NetStatus) {
        self.state = ActorState::Completed;
        if status.is_err() {
            self.record_status(status);
        } else {
            self.status_recorded = true;
        }

        if self.diverting {
            self.divert_stop(status);
            return;
        }

        debug!(actor = %self.key, status = ?status, "channel stopped");
        self.send(ParentMessage::OnStopRequest {
            actor: self.key.actor,
            status,
        });
    }

    pub(crate) fn post(&self, tasks: &mut TaskQueue, task: ActorTask) {
        tasks.post(self.key, task);
    }
}

#[cfg(test)]
mod tests {
    use super::ActorOutcome;
    use super::ActorState;
    use super::ChannelActor;
    use super::Pump;
    use crate::ActorKey;
    use crate::ProcessId;
    use crate::task::TaskQueue;
    use pd_core::NetError;
    use pd_ipc::ActorId;
    use pd_ipc::ChildMessage;
    use pd_ipc::ParentMessage;
    use pd_net::ChannelUri;
    use pd_net::RequestProbe;
    use pd_net::Script;
    use pd_net::ScriptedRequest;

    const URI: &str = "ftp://files.example.org/pub/readme.txt";

    fn key() -> ActorKey {
        ActorKey::new(ProcessId(1), ActorId(5))
    }

    fn opened(script: Script, buffer: usize) -> (ChannelActor, RequestProbe) {
        let uri = ChannelUri::parse(URI).unwrap_or_else(|_| unreachable!());
        let request = ScriptedRequest::new(uri, 1, script);
        let probe = request.probe();
        let mut actor = ChannelActor::new(key(), buffer);
        assert_eq!(actor.async_open(Box::new(request), None), Ok(()));
        (actor, probe)
    }

    fn pump_all(actor: &mut ChannelActor) {
        while let Pump::Delivered = actor.pump() {}
    }

    fn names(messages: &[ParentMessage]) -> Vec<&'static str> {
        messages.iter().map(ParentMessage::name).collect()
    }

    #[test]
    fn relays_start_data_and_stop_in_order() {
        let script = Script::new("text/plain").data("hello").data("world").stop(Ok(()));
        let (mut actor, _) = opened(script, 64);
        pump_all(&mut actor);
        let outbox = actor.take_outbox();
        assert_eq!(
            names(&outbox),
            ["OnStartRequest", "OnDataAvailable", "OnDataAvailable", "OnStopRequest"]
        );
        match &outbox[2] {
            ParentMessage::OnDataAvailable {
                data, offset, count, ..
            } => {
                assert_eq!(data, b"world");
                assert_eq!(*offset, 5);
                assert_eq!(*count, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(actor.state(), ActorState::Completed);
        assert_eq!(actor.status(), Ok(()));
    }

    #[test]
    fn splits_chunks_by_transfer_buffer() {
        let script = Script::new("text/plain").data("abcdefg").stop(Ok(()));
        let (mut actor, _) = opened(script, 3);
        pump_all(&mut actor);
        let offsets: Vec<(u64, u32)> = actor
            .take_outbox()
            .into_iter()
            .filter_map(|message| match message {
                ParentMessage::OnDataAvailable { offset, count, .. } => Some((offset, count)),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, [(0, 3), (3, 3), (6, 1)]);
    }

    #[test]
    fn read_failure_cancels_request_and_records_status() {
        let script = Script::new("text/plain")
            .data("ok")
            .fail_read(4, NetError::NetReset)
            .stop(Ok(()));
        let (mut actor, probe) = opened(script, 64);
        pump_all(&mut actor);
        assert_eq!(probe.cancels(), [NetError::NetReset]);
        assert_eq!(actor.status(), Err(NetError::NetReset));
        let outbox = actor.take_outbox();
        assert_eq!(
            outbox.last(),
            Some(&ParentMessage::OnStopRequest {
                actor: ActorId(5),
                status: Err(NetError::NetReset),
            })
        );
    }

    #[test]
    fn open_failure_reports_failed_async_open() {
        let uri = ChannelUri::parse(URI).unwrap_or_else(|_| unreachable!());
        let request = ScriptedRequest::new(uri, 1, Script::failing_open(NetError::Offline));
        let mut actor = ChannelActor::new(key(), 64);
        assert_eq!(
            actor.async_open(Box::new(request), None),
            Err(NetError::Offline)
        );
        assert_eq!(actor.state(), ActorState::Constructed);
        assert_eq!(
            actor.take_outbox(),
            [ParentMessage::FailedAsyncOpen {
                actor: ActorId(5),
                status: NetError::Offline,
            }]
        );
        assert!(matches!(actor.pump(), Pump::Idle));
    }

    #[test]
    fn cancel_is_idempotent_and_keeps_first_status() {
        let script = Script::new("text/plain").data("abc").stop(Ok(()));
        let (mut actor, probe) = opened(script, 64);
        let mut tasks = TaskQueue::new();
        let cancel = |status| ChildMessage::Cancel {
            actor: ActorId(5),
            status,
        };
        assert_eq!(actor.recv(cancel(NetError::Aborted), &mut tasks), ActorOutcome::Keep);
        assert_eq!(actor.recv(cancel(NetError::NetReset), &mut tasks), ActorOutcome::Keep);
        pump_all(&mut actor);
        assert_eq!(actor.status(), Err(NetError::Aborted));
        let stops = actor
            .take_outbox()
            .into_iter()
            .filter(|message| matches!(message, ParentMessage::OnStopRequest { .. }))
            .count();
        assert_eq!(stops, 1);
        assert_eq!(probe.cancels().len(), 2);
    }

    #[test]
    fn cancel_after_completion_keeps_recorded_status() {
        let (mut actor, _) = opened(Script::new("text/plain").stop(Ok(())), 64);
        pump_all(&mut actor);
        actor.take_outbox();
        actor.cancel(NetError::Aborted);
        pump_all(&mut actor);
        assert_eq!(actor.status(), Ok(()));
        assert!(actor.take_outbox().is_empty());
    }

    #[test]
    fn suspend_holds_relay_until_resume() {
        let script = Script::new("text/plain").data("abc").stop(Ok(()));
        let (mut actor, probe) = opened(script, 64);
        let mut tasks = TaskQueue::new();
        actor.recv(ChildMessage::Suspend { actor: ActorId(5) }, &mut tasks);
        assert!(matches!(actor.pump(), Pump::Idle));
        actor.recv(ChildMessage::Resume { actor: ActorId(5) }, &mut tasks);
        pump_all(&mut actor);
        assert_eq!(actor.take_outbox().len(), 3);
        actor.recv(ChildMessage::Suspend { actor: ActorId(5) }, &mut tasks);
        assert_eq!(probe.suspends(), 1);
    }

    #[test]
    fn closed_ipc_drops_sends() {
        let (mut actor, _) = opened(Script::new("text/plain").stop(Ok(())), 64);
        actor.mark_ipc_closed();
        pump_all(&mut actor);
        assert!(actor.take_outbox().is_empty());
        assert_eq!(actor.state(), ActorState::Completed);
    }

    #[test]
    fn delete_releases_actor() {
        let (mut actor, _) = opened(Script::new("text/plain").stop(Ok(())), 64);
        let mut tasks = TaskQueue::new();
        assert_eq!(
            actor.recv(ChildMessage::Delete { actor: ActorId(5) }, &mut tasks),
            ActorOutcome::Release
        );
    }
}
