//! Parent-side registry: owns every channel actor of every connected
//! content process and drives them one event-loop turn at a time.

use crate::NeckoRegistry;
use crate::config::NeckoConfig;
use crate::redirect::ChannelEventSink;
use crate::redirect::RedirectCoordinator;
use crate::redirect::RedirectDestination;
use crate::redirect::RedirectPolicy;
use crate::registrar::RedirectRegistrar;
use crate::registrar::RegistrarError;
use crate::registrar::abandon;
use pd_channel::ActorKey;
use pd_channel::ActorOutcome;
use pd_channel::ChannelActor;
use pd_channel::Handoff;
use pd_channel::PostedTask;
use pd_channel::ProcessId;
use pd_channel::Pump;
use pd_channel::TaskQueue;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::NetError;
use pd_core::NetStatus;
use pd_ipc::ActorId;
use pd_ipc::ChildMessage;
use pd_ipc::CrossProcessRedirectArgs;
use pd_ipc::LoadContextSnapshot;
use pd_ipc::LocalIpcEndpoint;
use pd_ipc::OpenArgs;
use pd_ipc::ParentMessage;
use pd_ipc::ProcessRole;
use pd_ipc::RedirectRequest;
use pd_net::RedirectFlags;
use pd_net::RequestFactory;
use pd_net::StreamListener;
use pd_privacy::LoadContext;
use pd_security::BrowsingContext;
use pd_security::SecurityPolicy;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use tracing::error;
use tracing::warn;

const PEER_DISCONNECTED: &str = "ipc.peer_disconnected";

struct ContentProcess {
    endpoint: LocalIpcEndpoint,
    browsing_contexts: Vec<BrowsingContext>,
}

pub struct NeckoParent {
    config: NeckoConfig,
    security: SecurityPolicy,
    factory: Box<dyn RequestFactory>,
    coordinator: RedirectCoordinator,
    next_process: u32,
    processes: BTreeMap<ProcessId, ContentProcess>,
    actors: BTreeMap<ActorKey, ChannelActor>,
    tasks: TaskQueue,
    handoffs: Vec<Handoff>,
    registrar: RedirectRegistrar,
}

impl fmt::Debug for NeckoParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeckoParent")
            .field("processes", &self.processes.len())
            .field("actors", &self.actors.len())
            .field("tasks", &self.tasks.len())
            .field("handoffs", &self.handoffs.len())
            .field("registrar", &self.registrar.len())
            .finish_non_exhaustive()
    }
}

impl NeckoParent {
    pub fn new(config: NeckoConfig, factory: Box<dyn RequestFactory>) -> BrowserResult<Self> {
        config.validate()?;
        if config.channel.role != ProcessRole::Parent {
            return Err(BrowserError::new(
                "necko.role_mismatch",
                "parent registry requires a parent channel config",
            ));
        }

        Ok(Self {
            security: config.security_policy(),
            config,
            factory,
            coordinator: RedirectCoordinator::default(),
            next_process: 0,
            processes: BTreeMap::new(),
            actors: BTreeMap::new(),
            tasks: TaskQueue::new(),
            handoffs: Vec::new(),
            registrar: RedirectRegistrar::new(),
        })
    }

    pub fn config(&self) -> &NeckoConfig {
        &self.config
    }

    /// Accepts the parent end of a content process connection.
    pub fn add_content_process(&mut self, endpoint: LocalIpcEndpoint) -> BrowserResult<ProcessId> {
        if endpoint.role() != ProcessRole::Parent {
            return Err(BrowserError::new(
                "necko.role_mismatch",
                "content process must be attached through a parent endpoint",
            ));
        }

        self.next_process = self.next_process.checked_add(1).ok_or_else(|| {
            BrowserError::new("necko.process_ids_exhausted", "no process ids left")
        })?;
        let process = ProcessId(self.next_process);
        self.processes.insert(
            process,
            ContentProcess {
                endpoint,
                browsing_contexts: Vec::new(),
            },
        );
        debug!(process = %process, "content process attached");
        Ok(process)
    }

    /// Records a browsing context the process hosts; channel contexts are
    /// validated against these.
    pub fn add_browsing_context(
        &mut self,
        process: ProcessId,
        context: BrowsingContext,
    ) -> BrowserResult<()> {
        let entry = self
            .processes
            .get_mut(&process)
            .ok_or_else(|| unknown_process(process))?;
        entry.browsing_contexts.push(context);
        Ok(())
    }

    /// Destroys every actor of `process`. Diverted requests that still
    /// produce data keep running as handoffs.
    pub fn remove_content_process(&mut self, process: ProcessId) -> BrowserResult<()> {
        if !self.processes.contains_key(&process) {
            return Err(unknown_process(process));
        }
        self.teardown(process);
        Ok(())
    }

    pub fn has_process(&self, process: ProcessId) -> bool {
        self.processes.contains_key(&process)
    }

    pub fn set_redirect_policy(&mut self, policy: Box<dyn RedirectPolicy>) {
        self.coordinator.set_policy(policy);
    }

    pub fn set_event_sink(&mut self, sink: Box<dyn ChannelEventSink>) {
        self.coordinator.set_sink(sink);
    }

    pub fn actor(&self, key: ActorKey) -> Option<&ChannelActor> {
        self.actors.get(&key)
    }

    pub fn handoff_count(&self) -> usize {
        self.handoffs.len()
    }

    /// Cross-process redirects still waiting for their destination.
    pub fn pending_redirects(&self) -> usize {
        self.registrar.len()
    }

    pub fn suspend_for_diversion(&mut self, key: ActorKey) -> NetStatus {
        self.actors
            .get_mut(&key)
            .ok_or(NetError::NotAvailable)?
            .suspend_for_diversion()
    }

    pub fn divert_to(&mut self, key: ActorKey, listener: Box<dyn StreamListener>) -> NetStatus {
        let actor = self.actors.get_mut(&key).ok_or(NetError::NotAvailable)?;
        actor.divert_to(listener, &mut self.tasks)
    }

    /// One event-loop turn: incoming messages, then the tasks posted before
    /// this turn's tasks started, then one notification per actor and per
    /// handoff, then outgoing messages.
    ///
    /// A child that forges a load context or breaks the constructor protocol
    /// is disconnected and reported as `necko.child_compromised`.
    pub fn turn(&mut self) -> BrowserResult<usize> {
        let mut progress = 0;
        let mut compromised = None;

        let processes: Vec<ProcessId> = self.processes.keys().copied().collect();
        for process in processes {
            match self.drain_process(process) {
                Ok(received) => progress += received,
                Err(error) => {
                    progress += 1;
                    if compromised.is_none() {
                        compromised = Some(error);
                    }
                }
            }
        }

        progress += self.run_tasks();
        progress += self.pump_actors();
        progress += self.pump_handoffs();
        progress += self.flush_outboxes();

        match compromised {
            Some(error) => Err(error),
            None => Ok(progress),
        }
    }

    fn drain_process(&mut self, process: ProcessId) -> BrowserResult<usize> {
        let mut received = 0;
        loop {
            let Some(entry) = self.processes.get(&process) else {
                return Ok(received);
            };
            let message = match entry.endpoint.try_recv_child_message() {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(received),
                Err(error) if error.code == PEER_DISCONNECTED => {
                    debug!(process = %process, "content process disconnected");
                    self.teardown(process);
                    return Ok(received + 1);
                }
                Err(error) => return Err(self.compromise(process, error)),
            };

            received += 1;
            if let Err(error) = self.dispatch(process, message) {
                return Err(self.compromise(process, error));
            }
        }
    }

    fn dispatch(&mut self, process: ProcessId, message: ChildMessage) -> BrowserResult<()> {
        match message {
            ChildMessage::ChannelConstructor {
                actor,
                load_context,
                args,
            } => self.construct(process, actor, load_context, args),
            ChildMessage::ConnectChannel {
                actor,
                registrar_id,
            } => self.connect(process, actor, registrar_id),
            ChildMessage::CrossProcessRedirectFinished {
                registrar_id,
                status,
            } => self.finish_cross_process(process, registrar_id, status),
            other => {
                let key = ActorKey::new(process, other.actor());
                let Some(actor) = self.actors.get_mut(&key) else {
                    debug!(actor = %key, message = other.name(), "message for unknown actor dropped");
                    return Ok(());
                };
                if actor.recv(other, &mut self.tasks) == ActorOutcome::Release {
                    self.release(key);
                }
                Ok(())
            }
        }
    }

    fn construct(
        &mut self,
        process: ProcessId,
        id: ActorId,
        snapshot: LoadContextSnapshot,
        args: OpenArgs,
    ) -> BrowserResult<()> {
        let key = self.vacant_key(process, id)?;
        let owned = self
            .processes
            .get(&process)
            .map_or(&[][..], |entry| entry.browsing_contexts.as_slice());
        let validated = self.security.validate_app_info(&snapshot, owned)?;

        let mut actor = ChannelActor::new(key, self.config.transfer_buffer_bytes);
        let created =
            LoadContext::from_snapshot(&snapshot, validated.app_id, validated.in_browser_element)
                .and_then(|context| {
                    let request = self.factory.create(&args, context.as_ref())?;
                    Ok((request, context))
                });
        match created {
            Ok((request, context)) => {
                // The actor reports a failed open to the child itself.
                if let Err(error) = actor.async_open(request, context) {
                    debug!(actor = %key, status = %error, "async open failed");
                }
            }
            Err(error) => actor.fail_open(error),
        }
        self.actors.insert(key, actor);
        Ok(())
    }

    fn connect(&mut self, process: ProcessId, id: ActorId, registrar_id: u64) -> BrowserResult<()> {
        let key = self.vacant_key(process, id)?;
        let (request, context) = self
            .registrar
            .claim(registrar_id, process)
            .map_err(|error| registrar_violation("connect", registrar_id, error))?;

        let mut actor = ChannelActor::new(key, self.config.transfer_buffer_bytes);
        if let Err(error) = actor.connect(request, context) {
            actor.fail_open(error);
        }
        self.actors.insert(key, actor);
        Ok(())
    }

    fn finish_cross_process(
        &mut self,
        process: ProcessId,
        registrar_id: u64,
        status: NetStatus,
    ) -> BrowserResult<()> {
        let mut entry = self
            .registrar
            .finish(registrar_id, process)
            .map_err(|error| registrar_violation("finish", registrar_id, error))?;

        let unclaimed = entry.take_request();
        let status = match status {
            Ok(()) if unclaimed.is_some() => Err(NetError::Unexpected),
            status => status,
        };
        if let Some(mut request) = unclaimed {
            request.cancel(status.err().unwrap_or(NetError::Aborted));
        }

        debug!(
            origin = %entry.origin,
            destination = %process,
            registrar_id,
            status = ?status,
            "cross-process redirect finished"
        );
        match self.actors.get_mut(&entry.origin) {
            Some(origin) => origin.cancel(status.err().unwrap_or(NetError::Redirected)),
            None => debug!(origin = %entry.origin, "redirect origin already gone"),
        }
        Ok(())
    }

    fn vacant_key(&self, process: ProcessId, id: ActorId) -> BrowserResult<ActorKey> {
        let key = ActorKey::new(process, id);
        if self.actors.contains_key(&key) {
            return Err(BrowserError::new(
                "necko.actor_duplicate",
                format!("{key} is already constructed"),
            ));
        }
        Ok(key)
    }

    fn run_tasks(&mut self) -> usize {
        let posted = self.tasks.take_turn();
        let ran = posted.len();
        for PostedTask { actor: key, task } in posted {
            let Some(actor) = self.actors.get_mut(&key) else {
                debug!(actor = %key, task = ?task, "task for released actor dropped");
                continue;
            };
            if actor.run_task(task, &mut self.tasks) == ActorOutcome::Release {
                self.release(key);
            }
        }
        ran
    }

    fn pump_actors(&mut self) -> usize {
        let mut delivered = 0;
        let keys: Vec<ActorKey> = self.actors.keys().copied().collect();
        for key in keys {
            let Some(actor) = self.actors.get_mut(&key) else {
                continue;
            };
            match actor.pump() {
                Pump::Idle => {}
                Pump::Delivered => delivered += 1,
                Pump::Redirect { redirect, flags } => {
                    delivered += 1;
                    self.redirect(key, redirect, flags);
                }
            }
        }
        delivered
    }

    fn redirect(&mut self, key: ActorKey, redirect: RedirectRequest, flags: RedirectFlags) {
        let destination = self.coordinator.destination(key, &redirect);
        let Some(actor) = self.actors.get_mut(&key) else {
            return;
        };

        let target = match destination {
            RedirectDestination::SameProcess => {
                let swapped = self.coordinator.redirect_same_process(
                    actor,
                    self.factory.as_ref(),
                    &redirect,
                    flags,
                );
                if let Err(error) = swapped {
                    debug!(actor = %key, status = %error, "same-process redirect failed");
                }
                return;
            }
            RedirectDestination::Process(target) => target,
        };

        let Some(destination) = self.processes.get(&target) else {
            warn!(actor = %key, destination = %target, "redirect to unknown process");
            actor.cancel(NetError::NotAvailable);
            return;
        };
        let Ok(request) = self.coordinator.prepare_cross_process(
            actor,
            self.factory.as_ref(),
            &redirect,
            flags,
        ) else {
            return;
        };

        let registrar_id =
            self.registrar
                .register(key, target, request, actor.load_context().cloned());
        let message = ParentMessage::CrossProcessRedirect(CrossProcessRedirectArgs {
            registrar_id,
            redirect,
        });
        match destination.endpoint.send_parent_message(&message) {
            Ok(()) => {
                debug!(actor = %key, destination = %target, registrar_id, "cross-process redirect sent");
            }
            Err(error) => {
                warn!(actor = %key, destination = %target, error = %error, "cross-process redirect not delivered");
                if let Ok(entry) = self.registrar.finish(registrar_id, target) {
                    abandon(entry, NetError::Aborted);
                }
                actor.cancel(NetError::Aborted);
            }
        }
    }

    fn pump_handoffs(&mut self) -> usize {
        let mut delivered = 0;
        for handoff in &mut self.handoffs {
            if handoff.pump() {
                delivered += 1;
            }
        }
        self.handoffs.retain(|handoff| {
            if handoff.is_finished() {
                debug!(actor = %handoff.key(), "handoff finished");
            }
            !handoff.is_finished()
        });
        delivered
    }

    fn flush_outboxes(&mut self) -> usize {
        let mut sent = 0;
        for actor in self.actors.values_mut() {
            sent += send_outbox(&self.processes, actor);
        }
        sent
    }

    fn release(&mut self, key: ActorKey) {
        let Some(mut actor) = self.actors.remove(&key) else {
            return;
        };
        send_outbox(&self.processes, &mut actor);
        self.tasks.forget(key);
        debug!(actor = %key, "actor released");
        if let Some(handoff) = actor.release() {
            self.handoffs.push(handoff);
        }
    }

    fn teardown(&mut self, process: ProcessId) {
        self.processes.remove(&process);

        let keys: Vec<ActorKey> = self
            .actors
            .keys()
            .filter(|key| key.process == process)
            .copied()
            .collect();
        for key in keys {
            if let Some(actor) = self.actors.remove(&key) {
                self.tasks.forget(key);
                if let Some(handoff) = actor.release() {
                    self.handoffs.push(handoff);
                }
            }
        }

        for entry in self.registrar.drain_destination(process) {
            if let Some(origin) = self.actors.get_mut(&entry.origin) {
                origin.cancel(NetError::Aborted);
            }
            abandon(entry, NetError::Aborted);
        }
        debug!(process = %process, "content process torn down");
    }

    fn compromise(&mut self, process: ProcessId, cause: BrowserError) -> BrowserError {
        error!(process = %process, code = cause.code, error = %cause, "content process compromised");
        self.teardown(process);
        BrowserError::new(
            "necko.child_compromised",
            format!("{process} disconnected: {cause}"),
        )
    }
}

impl NeckoRegistry for NeckoParent {
    fn role(&self) -> ProcessRole {
        ProcessRole::Parent
    }

    fn actor_count(&self) -> usize {
        self.actors.len()
    }

    fn turn(&mut self) -> BrowserResult<usize> {
        NeckoParent::turn(self)
    }
}

fn send_outbox(processes: &BTreeMap<ProcessId, ContentProcess>, actor: &mut ChannelActor) -> usize {
    let outbox = actor.take_outbox();
    if outbox.is_empty() {
        return 0;
    }

    let key = actor.key();
    let Some(process) = processes.get(&key.process) else {
        actor.mark_ipc_closed();
        return 0;
    };

    let mut sent = 0;
    for message in outbox {
        if let Err(error) = process.endpoint.send_parent_message(&message) {
            warn!(actor = %key, message = message.name(), error = %error, "send to child failed");
            actor.mark_ipc_closed();
            break;
        }
        sent += 1;
    }
    sent
}

fn unknown_process(process: ProcessId) -> BrowserError {
    BrowserError::new(
        "necko.process_unknown",
        format!("{process} is not attached"),
    )
}

fn registrar_violation(step: &str, registrar_id: u64, error: RegistrarError) -> BrowserError {
    BrowserError::new(
        "necko.registrar_violation",
        format!("{step} for redirect {registrar_id} refused: {error:?}"),
    )
}
