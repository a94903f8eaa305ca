//! Handing a redirected request to its replacement, either under the same
//! channel actor or in another content process.

use pd_channel::ActorKey;
use pd_channel::ChannelActor;
use pd_channel::ProcessId;
use pd_core::NetError;
use pd_core::NetResult;
use pd_core::NetStatus;
use pd_ipc::ChildMessage;
use pd_ipc::LocalIpcEndpoint;
use pd_ipc::RedirectRequest;
use pd_net::ChannelUri;
use pd_net::NetworkRequest;
use pd_net::RedirectFlags;
use pd_net::RequestFactory;
use pd_net::RequestView;
use pd_net::StreamListener;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectDestination {
    SameProcess,
    Process(ProcessId),
}

/// Decides which content process serves a redirect target.
pub trait RedirectPolicy {
    fn destination(&self, origin: ActorKey, redirect: &RedirectRequest) -> RedirectDestination;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SameProcessPolicy;

impl RedirectPolicy for SameProcessPolicy {
    fn destination(&self, _origin: ActorKey, _redirect: &RedirectRequest) -> RedirectDestination {
        RedirectDestination::SameProcess
    }
}

/// Routes redirects to the process that hosts the target's origin.
#[derive(Debug, Clone, Default)]
pub struct OriginIsolationPolicy {
    processes: HashMap<String, ProcessId>,
}

impl OriginIsolationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// `origin` is `scheme://host[:port]` as produced by [`ChannelUri::origin`].
    pub fn assign(&mut self, origin: impl Into<String>, process: ProcessId) {
        self.processes.insert(origin.into(), process);
    }
}

impl RedirectPolicy for OriginIsolationPolicy {
    fn destination(&self, origin: ActorKey, redirect: &RedirectRequest) -> RedirectDestination {
        let Ok(target) = ChannelUri::parse(&redirect.target_uri) else {
            return RedirectDestination::SameProcess;
        };
        match self.processes.get(&target.origin()) {
            Some(process) if *process != origin.process => RedirectDestination::Process(*process),
            _ => RedirectDestination::SameProcess,
        }
    }
}

/// Approves or vetoes a redirect before the replacement request is used.
pub trait ChannelEventSink {
    fn on_redirect(
        &mut self,
        old: RequestView<'_>,
        new: RequestView<'_>,
        flags: RedirectFlags,
    ) -> NetStatus;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveRedirects;

impl ChannelEventSink for ApproveRedirects {
    fn on_redirect(
        &mut self,
        _old: RequestView<'_>,
        _new: RequestView<'_>,
        _flags: RedirectFlags,
    ) -> NetStatus {
        Ok(())
    }
}

/// Supplies the consumer of a channel that arrives through a cross-process
/// redirect.
pub trait ProcessListener {
    fn listener_for(&mut self, redirect: &RedirectRequest) -> NetResult<Box<dyn StreamListener>>;
}

pub struct RedirectCoordinator {
    policy: Box<dyn RedirectPolicy>,
    sink: Box<dyn ChannelEventSink>,
}

impl Default for RedirectCoordinator {
    fn default() -> Self {
        Self {
            policy: Box::new(SameProcessPolicy),
            sink: Box::new(ApproveRedirects),
        }
    }
}

impl RedirectCoordinator {
    pub fn set_policy(&mut self, policy: Box<dyn RedirectPolicy>) {
        self.policy = policy;
    }

    pub fn set_sink(&mut self, sink: Box<dyn ChannelEventSink>) {
        self.sink = sink;
    }

    pub fn destination(&self, origin: ActorKey, redirect: &RedirectRequest) -> RedirectDestination {
        match self.policy.destination(origin, redirect) {
            RedirectDestination::Process(process) if process == origin.process => {
                RedirectDestination::SameProcess
            }
            destination => destination,
        }
    }

    /// Replaces the actor's request. A veto cancels the old request with the
    /// sink's error; it is never reverted to.
    pub fn redirect_same_process(
        &mut self,
        actor: &mut ChannelActor,
        factory: &dyn RequestFactory,
        redirect: &RedirectRequest,
        flags: RedirectFlags,
    ) -> NetStatus {
        let replacement = self.approved_replacement(actor, factory, redirect, flags)?;
        actor.replace_request(replacement)
    }

    /// Creates and opens the request another process will connect to.
    /// The actor keeps its old request until the destination reports back.
    pub fn prepare_cross_process(
        &mut self,
        actor: &mut ChannelActor,
        factory: &dyn RequestFactory,
        redirect: &RedirectRequest,
        flags: RedirectFlags,
    ) -> NetResult<Box<dyn NetworkRequest>> {
        let mut replacement = self.approved_replacement(actor, factory, redirect, flags)?;
        if let Err(error) = replacement.async_open() {
            actor.cancel(error);
            return Err(error);
        }
        Ok(replacement)
    }

    fn approved_replacement(
        &mut self,
        actor: &mut ChannelActor,
        factory: &dyn RequestFactory,
        redirect: &RedirectRequest,
        flags: RedirectFlags,
    ) -> NetResult<Box<dyn NetworkRequest>> {
        let replacement = match factory.create(&redirect.open_args(), actor.load_context()) {
            Ok(request) => request,
            Err(error) => {
                debug!(actor = %actor.key(), status = %error, "redirect target refused");
                actor.cancel(error);
                return Err(error);
            }
        };

        let verdict = match actor.request() {
            Some(old) => self.sink.on_redirect(old.view(), replacement.view(), flags),
            None => Err(NetError::Unexpected),
        };
        if let Err(error) = verdict {
            debug!(actor = %actor.key(), status = %error, "redirect vetoed");
            actor.cancel(error);
            return Err(error);
        }
        Ok(replacement)
    }
}

/// Reports the outcome of accepting a cross-process redirect exactly once,
/// whichever step returns early.
pub(crate) struct FinishGuard {
    endpoint: Rc<LocalIpcEndpoint>,
    registrar_id: u64,
    status: NetStatus,
}

impl FinishGuard {
    pub(crate) fn new(endpoint: Rc<LocalIpcEndpoint>, registrar_id: u64) -> Self {
        Self {
            endpoint,
            registrar_id,
            status: Err(NetError::Failure),
        }
    }

    pub(crate) fn set_status(&mut self, status: NetStatus) {
        self.status = status;
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let message = ChildMessage::CrossProcessRedirectFinished {
            registrar_id: self.registrar_id,
            status: self.status,
        };
        if let Err(error) = self.endpoint.send_child_message(&message) {
            warn!(
                registrar_id = self.registrar_id,
                error = %error,
                "could not report cross-process redirect outcome"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelEventSink;
    use super::OriginIsolationPolicy;
    use super::RedirectCoordinator;
    use super::RedirectDestination;
    use super::RedirectPolicy;
    use pd_channel::ActorKey;
    use pd_channel::ChannelActor;
    use pd_channel::ProcessId;
    use pd_channel::Pump;
    use pd_core::NetError;
    use pd_core::NetStatus;
    use pd_ipc::ActorId;
    use pd_ipc::ParentMessage;
    use pd_ipc::RedirectRequest;
    use pd_ipc::params::LOAD_REPLACE;
    use pd_net::ChannelUri;
    use pd_net::NetworkRequest;
    use pd_net::RedirectFlags;
    use pd_net::RequestView;
    use pd_net::Script;
    use pd_net::ScriptedFactory;
    use pd_net::ScriptedRequest;
    use std::cell::RefCell;
    use std::rc::Rc;

    const FROM: &str = "http://a.example/start";
    const TO: &str = "https://b.example/landing";

    fn redirect() -> RedirectRequest {
        RedirectRequest {
            target_uri: TO.to_owned(),
            new_load_flags: 0,
            load_info: Vec::new(),
            channel_id: 0,
            original_uri: FROM.to_owned(),
            completion_identifier: 1,
        }
    }

    fn redirecting_actor() -> (ChannelActor, RedirectFlags) {
        let uri = ChannelUri::parse(FROM).unwrap_or_else(|_| unreachable!());
        let script = Script::redirect(redirect(), RedirectFlags::PERMANENT);
        let mut actor = ChannelActor::new(ActorKey::new(ProcessId(1), ActorId(1)), 1024);
        let request = Box::new(ScriptedRequest::new(uri, 1, script));
        assert_eq!(actor.async_open(request, None), Ok(()));
        match actor.pump() {
            Pump::Redirect { flags, .. } => (actor, flags),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn pump_all(actor: &mut ChannelActor) -> Vec<ParentMessage> {
        while let Pump::Delivered = actor.pump() {}
        actor.take_outbox()
    }

    struct Veto {
        seen: Rc<RefCell<Vec<(String, String, RedirectFlags)>>>,
    }

    impl ChannelEventSink for Veto {
        fn on_redirect(
            &mut self,
            old: RequestView<'_>,
            new: RequestView<'_>,
            flags: RedirectFlags,
        ) -> NetStatus {
            self.seen.borrow_mut().push((
                old.uri.as_str().to_owned(),
                new.uri.as_str().to_owned(),
                flags,
            ));
            Err(NetError::PermissionDenied)
        }
    }

    #[test]
    fn approved_redirect_swaps_request_under_same_actor() {
        let factory = ScriptedFactory::new();
        factory.serve(TO, Script::new("text/html").data("<p>").stop(Ok(())));
        let (mut actor, flags) = redirecting_actor();
        let mut coordinator = RedirectCoordinator::default();
        let swapped = coordinator.redirect_same_process(&mut actor, &factory, &redirect(), flags);
        assert_eq!(swapped, Ok(()));
        assert_eq!(actor.request().map(|request| request.uri().as_str()), Some(TO));
        assert_eq!(actor.key().actor, ActorId(1));

        let outbox = pump_all(&mut actor);
        let names: Vec<&str> = outbox.iter().map(ParentMessage::name).collect();
        assert_eq!(names, ["OnStartRequest", "OnDataAvailable", "OnStopRequest"]);
        match &outbox[0] {
            ParentMessage::OnStartRequest { head, .. } => assert_eq!(head.final_uri, TO),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn veto_cancels_with_sink_error() {
        let factory = ScriptedFactory::new();
        factory.serve(TO, Script::new("text/html").stop(Ok(())));
        let (mut actor, flags) = redirecting_actor();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut coordinator = RedirectCoordinator::default();
        coordinator.set_sink(Box::new(Veto { seen: seen.clone() }));

        let swapped = coordinator.redirect_same_process(&mut actor, &factory, &redirect(), flags);
        assert_eq!(swapped, Err(NetError::PermissionDenied));
        assert_eq!(
            seen.borrow().as_slice(),
            [(FROM.to_owned(), TO.to_owned(), RedirectFlags::PERMANENT)]
        );
        assert_eq!(actor.request().map(|request| request.uri().as_str()), Some(FROM));

        let outbox = pump_all(&mut actor);
        assert_eq!(
            outbox.last(),
            Some(&ParentMessage::OnStopRequest {
                actor: ActorId(1),
                status: Err(NetError::PermissionDenied),
            })
        );
        assert_eq!(actor.status(), Err(NetError::PermissionDenied));
    }

    #[test]
    fn replacement_open_failure_reaches_child_once() {
        let factory = ScriptedFactory::new();
        let (mut actor, flags) = redirecting_actor();
        let mut coordinator = RedirectCoordinator::default();
        let swapped = coordinator.redirect_same_process(&mut actor, &factory, &redirect(), flags);
        assert_eq!(swapped, Err(NetError::ConnectionRefused));
        let outbox = actor.take_outbox();
        let names: Vec<&str> = outbox.iter().map(ParentMessage::name).collect();
        assert_eq!(names, ["OnStartRequest", "OnStopRequest"]);
        assert!(pump_all(&mut actor).is_empty());
    }

    #[test]
    fn replacement_carries_load_replace() {
        let open = redirect().open_args();
        assert_eq!(open.load_flags & LOAD_REPLACE, LOAD_REPLACE);
        assert_eq!(open.uri, TO);
    }

    #[test]
    fn origin_isolation_routes_foreign_origins() {
        let mut policy = OriginIsolationPolicy::new();
        policy.assign("https://b.example", ProcessId(2));
        let origin = ActorKey::new(ProcessId(1), ActorId(1));
        assert_eq!(
            policy.destination(origin, &redirect()),
            RedirectDestination::Process(ProcessId(2))
        );

        let local = ActorKey::new(ProcessId(2), ActorId(1));
        assert_eq!(
            policy.destination(local, &redirect()),
            RedirectDestination::SameProcess
        );
    }
}
