//! Content-process registry: allocates channel ids, routes parent messages
//! to channel children, and accepts channels redirected from other processes.

use crate::NeckoRegistry;
use crate::redirect::FinishGuard;
use crate::redirect::ProcessListener;
use pd_channel::ChannelChild;
use pd_channel::ChildOutcome;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::NetError;
use pd_core::NetStatus;
use pd_ipc::ActorId;
use pd_ipc::CrossProcessRedirectArgs;
use pd_ipc::LoadContextSnapshot;
use pd_ipc::LocalIpcEndpoint;
use pd_ipc::OpenArgs;
use pd_ipc::ParentMessage;
use pd_ipc::ProcessRole;
use pd_ipc::RedirectRequest;
use pd_net::ChannelUri;
use pd_net::StreamListener;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

pub struct NeckoChild {
    endpoint: Rc<LocalIpcEndpoint>,
    channels: BTreeMap<ActorId, ChannelChild>,
    next_actor: u32,
    /// Non-zero channel ids of live channels.
    channel_ids: BTreeMap<u64, ActorId>,
    process_listener: Option<Box<dyn ProcessListener>>,
}

impl fmt::Debug for NeckoChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeckoChild")
            .field("channels", &self.channels.len())
            .field("channel_ids", &self.channel_ids)
            .finish_non_exhaustive()
    }
}

impl NeckoChild {
    pub fn new(endpoint: LocalIpcEndpoint) -> BrowserResult<Self> {
        if endpoint.role() != ProcessRole::Child {
            return Err(BrowserError::new(
                "necko.role_mismatch",
                "child registry requires a child endpoint",
            ));
        }
        Ok(Self {
            endpoint: Rc::new(endpoint),
            channels: BTreeMap::new(),
            next_actor: 0,
            channel_ids: BTreeMap::new(),
            process_listener: None,
        })
    }

    /// Installs the hook that supplies listeners for channels redirected
    /// into this process.
    pub fn set_process_listener(&mut self, listener: Box<dyn ProcessListener>) {
        self.process_listener = Some(listener);
    }

    /// Starts a channel; the parent sees its constructor on the next turn.
    pub fn open(
        &mut self,
        args: OpenArgs,
        load_context: LoadContextSnapshot,
        listener: Box<dyn StreamListener>,
    ) -> BrowserResult<ActorId> {
        let uri = ChannelUri::parse(&args.uri)?;
        let id = self.allocate_id()?;
        if !self.bind_channel_id(args.channel_id, id) {
            return Err(BrowserError::new(
                "necko.channel_id_duplicate",
                format!("channel id {} is already in use", args.channel_id),
            ));
        }

        let mut channel = ChannelChild::new(id, uri, listener);
        debug!(actor = %id, uri = %args.uri, "channel opening");
        channel.async_open(load_context, args);
        self.channels.insert(id, channel);
        Ok(id)
    }

    pub fn channel(&self, id: ActorId) -> Option<&ChannelChild> {
        self.channels.get(&id)
    }

    pub fn suspend(&mut self, id: ActorId) -> BrowserResult<()> {
        self.channel_mut(id)?.suspend();
        Ok(())
    }

    pub fn resume(&mut self, id: ActorId) -> BrowserResult<()> {
        self.channel_mut(id)?.resume();
        Ok(())
    }

    pub fn cancel(&mut self, id: ActorId, status: NetError) -> BrowserResult<()> {
        self.channel_mut(id)?.cancel(status);
        Ok(())
    }

    /// Asks the parent to take over the rest of the response.
    pub fn divert_to_parent(&mut self, id: ActorId) -> BrowserResult<()> {
        self.channel_mut(id)?.divert_to_parent()?;
        Ok(())
    }

    /// Receives every queued parent message, then sends what the channels
    /// queued in response.
    pub fn turn(&mut self) -> BrowserResult<usize> {
        let mut progress = 0;
        while let Some(message) = self.endpoint.try_recv_parent_message()? {
            progress += 1;
            self.dispatch(message)?;
        }

        for channel in self.channels.values_mut() {
            for message in channel.take_outbox() {
                self.endpoint.send_child_message(&message)?;
                progress += 1;
            }
        }
        Ok(progress)
    }

    fn dispatch(&mut self, message: ParentMessage) -> BrowserResult<()> {
        let message = match message {
            ParentMessage::CrossProcessRedirect(args) => {
                self.accept_cross_process(args);
                return Ok(());
            }
            other => other,
        };

        let id = message.actor();
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!(actor = %id, message = message.name(), "message for unknown channel dropped");
            return Ok(());
        };
        if channel.recv(message) == ChildOutcome::Delete {
            if let Some(mut channel) = self.channels.remove(&id) {
                for message in channel.take_outbox() {
                    self.endpoint.send_child_message(&message)?;
                }
            }
            self.channel_ids.retain(|_, owner| *owner != id);
            debug!(actor = %id, "channel deleted");
        }
        Ok(())
    }

    fn accept_cross_process(&mut self, args: CrossProcessRedirectArgs) {
        let mut finish = FinishGuard::new(Rc::clone(&self.endpoint), args.registrar_id);
        let status = self.connect_redirect(&args.redirect, args.registrar_id);
        debug!(
            registrar_id = args.registrar_id,
            uri = %args.redirect.target_uri,
            status = ?status,
            "cross-process redirect accepted"
        );
        finish.set_status(status);
    }

    fn connect_redirect(&mut self, redirect: &RedirectRequest, registrar_id: u64) -> NetStatus {
        let uri = ChannelUri::parse(&redirect.target_uri).map_err(|_| NetError::MalformedUri)?;
        let listener = match self.process_listener.as_mut() {
            Some(hook) => hook.listener_for(redirect)?,
            None => return Err(NetError::NotAvailable),
        };

        let id = self.allocate_id().map_err(|_| NetError::Failure)?;
        if !self.bind_channel_id(redirect.channel_id, id) {
            return Err(NetError::InvalidArg);
        }

        let mut channel = ChannelChild::new(id, uri, listener);
        channel.connect_parent(registrar_id);
        for message in channel.take_outbox() {
            if self.endpoint.send_child_message(&message).is_err() {
                self.channel_ids.retain(|_, owner| *owner != id);
                return Err(NetError::IpcClosed);
            }
        }
        self.channels.insert(id, channel);
        Ok(())
    }

    fn channel_mut(&mut self, id: ActorId) -> BrowserResult<&mut ChannelChild> {
        self.channels.get_mut(&id).ok_or_else(|| {
            BrowserError::new("necko.actor_unknown", format!("{id} is not open"))
        })
    }

    fn allocate_id(&mut self) -> BrowserResult<ActorId> {
        self.next_actor = self.next_actor.checked_add(1).ok_or_else(|| {
            BrowserError::new("necko.actor_ids_exhausted", "no actor ids left")
        })?;
        Ok(ActorId(self.next_actor))
    }

    /// `false` when another live channel already uses `channel_id`.
    fn bind_channel_id(&mut self, channel_id: u64, id: ActorId) -> bool {
        if channel_id == 0 {
            return true;
        }
        if self.channel_ids.contains_key(&channel_id) {
            return false;
        }
        self.channel_ids.insert(channel_id, id);
        true
    }
}

impl NeckoRegistry for NeckoChild {
    fn role(&self) -> ProcessRole {
        ProcessRole::Child
    }

    fn actor_count(&self) -> usize {
        self.channels.len()
    }

    fn turn(&mut self) -> BrowserResult<usize> {
        NeckoChild::turn(self)
    }
}

#[cfg(test)]
mod tests {
    use super::NeckoChild;
    use crate::redirect::ProcessListener;
    use pd_core::NetError;
    use pd_core::NetResult;
    use pd_ipc::ActorId;
    use pd_ipc::ChannelConfig;
    use pd_ipc::ChildMessage;
    use pd_ipc::CrossProcessRedirectArgs;
    use pd_ipc::LoadContextSnapshot;
    use pd_ipc::LocalIpcEndpoint;
    use pd_ipc::OpenArgs;
    use pd_ipc::ParentMessage;
    use pd_ipc::ProcessRole;
    use pd_ipc::RedirectRequest;
    use pd_ipc::local_channel_pair;
    use pd_net::RecordingListener;
    use pd_net::StreamListener;

    fn registry() -> (NeckoChild, LocalIpcEndpoint) {
        let parent = ChannelConfig::hardened(ProcessRole::Parent).unwrap_or_else(|_| unreachable!());
        let child = ChannelConfig::hardened(ProcessRole::Child).unwrap_or_else(|_| unreachable!());
        let (parent, child) = local_channel_pair(parent, child).unwrap_or_else(|_| unreachable!());
        let registry = NeckoChild::new(child).unwrap_or_else(|_| unreachable!());
        (registry, parent)
    }

    fn drain(parent: &LocalIpcEndpoint) -> Vec<ChildMessage> {
        let mut seen = Vec::new();
        while let Ok(Some(message)) = parent.try_recv_child_message() {
            seen.push(message);
        }
        seen
    }

    fn redirect(channel_id: u64) -> ParentMessage {
        ParentMessage::CrossProcessRedirect(CrossProcessRedirectArgs {
            registrar_id: 7,
            redirect: RedirectRequest {
                target_uri: "https://b.example/".to_owned(),
                new_load_flags: 0,
                load_info: Vec::new(),
                channel_id,
                original_uri: "https://a.example/".to_owned(),
                completion_identifier: 1,
            },
        })
    }

    struct Accept(RecordingListener);

    impl ProcessListener for Accept {
        fn listener_for(&mut self, _redirect: &RedirectRequest) -> NetResult<Box<dyn StreamListener>> {
            Ok(Box::new(self.0.clone()))
        }
    }

    #[test]
    fn open_queues_constructor_until_turn() {
        let (mut registry, parent) = registry();
        let id = registry.open(
            OpenArgs::get("https://a.example/"),
            LoadContextSnapshot::null(),
            Box::new(RecordingListener::new()),
        );
        assert_eq!(id, Ok(ActorId(1)));
        assert!(drain(&parent).is_empty());
        assert_eq!(registry.turn(), Ok(1));
        let sent = drain(&parent);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name(), "ChannelConstructor");
    }

    #[test]
    fn malformed_uri_and_duplicate_channel_id_are_refused() {
        let (mut registry, _parent) = registry();
        let refused = registry.open(
            OpenArgs::get("not a uri"),
            LoadContextSnapshot::null(),
            Box::new(RecordingListener::new()),
        );
        assert!(refused.is_err());

        let args = OpenArgs {
            channel_id: 9,
            ..OpenArgs::get("https://a.example/")
        };
        let first = registry.open(
            args.clone(),
            LoadContextSnapshot::null(),
            Box::new(RecordingListener::new()),
        );
        assert!(first.is_ok());
        let second = registry.open(args, LoadContextSnapshot::null(), Box::new(RecordingListener::new()));
        match second {
            Ok(_) => panic!("duplicate channel id accepted"),
            Err(error) => assert_eq!(error.code, "necko.channel_id_duplicate"),
        }
    }

    #[test]
    fn redirect_without_hook_reports_failure_once() {
        let (mut registry, parent) = registry();
        assert!(parent.send_parent_message(&redirect(0)).is_ok());
        assert_eq!(registry.turn(), Ok(1));
        assert_eq!(
            drain(&parent),
            [ChildMessage::CrossProcessRedirectFinished {
                registrar_id: 7,
                status: Err(NetError::NotAvailable),
            }]
        );
    }

    #[test]
    fn accepted_redirect_connects_before_finishing() {
        let (mut registry, parent) = registry();
        registry.set_process_listener(Box::new(Accept(RecordingListener::new())));
        assert!(parent.send_parent_message(&redirect(0)).is_ok());
        assert!(registry.turn().is_ok());
        assert_eq!(
            drain(&parent),
            [
                ChildMessage::ConnectChannel {
                    actor: ActorId(1),
                    registrar_id: 7,
                },
                ChildMessage::CrossProcessRedirectFinished {
                    registrar_id: 7,
                    status: Ok(()),
                },
            ]
        );
        assert!(registry.channel(ActorId(1)).is_some());
    }

    #[test]
    fn channel_id_collision_fails_redirect() {
        let (mut registry, parent) = registry();
        registry.set_process_listener(Box::new(Accept(RecordingListener::new())));
        let args = OpenArgs {
            channel_id: 42,
            ..OpenArgs::get("https://a.example/")
        };
        let opened = registry.open(args, LoadContextSnapshot::null(), Box::new(RecordingListener::new()));
        assert!(opened.is_ok());
        assert!(registry.turn().is_ok());
        drain(&parent);

        assert!(parent.send_parent_message(&redirect(42)).is_ok());
        assert!(registry.turn().is_ok());
        assert_eq!(
            drain(&parent),
            [ChildMessage::CrossProcessRedirectFinished {
                registrar_id: 7,
                status: Err(NetError::InvalidArg),
            }]
        );
    }

    #[test]
    fn delete_frees_channel_id() {
        let (mut registry, parent) = registry();
        let args = OpenArgs {
            channel_id: 5,
            ..OpenArgs::get("https://a.example/")
        };
        let id = registry
            .open(args.clone(), LoadContextSnapshot::null(), Box::new(RecordingListener::new()))
            .unwrap_or_else(|_| unreachable!());
        assert!(registry.turn().is_ok());
        assert!(parent
            .send_parent_message(&ParentMessage::FailedAsyncOpen {
                actor: id,
                status: NetError::Offline,
            })
            .is_ok());
        assert!(registry.turn().is_ok());
        assert!(registry.channel(id).is_none());
        assert!(registry
            .open(args, LoadContextSnapshot::null(), Box::new(RecordingListener::new()))
            .is_ok());
    }
}
