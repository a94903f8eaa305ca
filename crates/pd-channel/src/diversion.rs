//! Diversion: re-homing the consumer of an in-flight response from the
//! child to a listener in the parent.
//!
//! The order is fixed: `suspend_for_diversion`, `divert_to`, then the
//! posted `StartDiversion`, after which the child replays what it buffered
//! as `DivertOnDataAvailable`/`DivertOnStopRequest` and ends with
//! `DivertComplete`. Any step taken out of order posts `FailDiversion`,
//! which still hands the listener one start and one stop.

use crate::ActorKey;
use crate::actor::ActorOutcome;
use crate::actor::ActorState;
use crate::actor::ChannelActor;
use crate::task::ActorTask;
use crate::task::TaskQueue;
use pd_core::NetError;
use pd_core::NetStatus;
use pd_ipc::ParentMessage;
use pd_net::NetworkRequest;
use pd_net::RequestEvent;
use pd_net::StreamListener;
use std::fmt;
use tracing::debug;
use tracing::warn;

impl ChannelActor {
    /// Stops relaying to the child. A request that already finished cannot
    /// be suspended; diversion proceeds anyway and no resume is owed.
    pub fn suspend_for_diversion(&mut self) -> NetStatus {
        if self.diverting {
            return Err(NetError::Unexpected);
        }
        let Some(request) = self.request.as_mut() else {
            return Err(NetError::Unexpected);
        };

        self.suspended_for_diversion = match request.suspend() {
            Ok(()) => true,
            Err(error) => {
                debug!(actor = %self.key, status = %error, "request not suspended for diversion");
                false
            }
        };
        self.diverting = true;
        debug!(
            actor = %self.key,
            suspended = self.suspended_for_diversion,
            "diversion armed"
        );
        Ok(())
    }

    /// Designates the listener that receives the rest of the response.
    ///
    /// Only one listener per actor: a second call is refused with
    /// `Unexpected` and leaves the first diversion untouched.
    pub fn divert_to(
        &mut self,
        listener: Box<dyn StreamListener>,
        tasks: &mut TaskQueue,
    ) -> NetStatus {
        if self.divert_target.is_some() {
            warn!(actor = %self.key, "second divert_to refused");
            return Err(NetError::Unexpected);
        }
        self.divert_target = Some(listener);

        if !self.diverting {
            warn!(actor = %self.key, "divert_to without suspend_for_diversion");
            self.post(
                tasks,
                ActorTask::FailDiversion {
                    error: NetError::Unexpected,
                    skip_resume: true,
                },
            );
            return Ok(());
        }

        self.send(ParentMessage::FlushedForDiversion {
            actor: self.key.actor,
        });
        self.post(tasks, ActorTask::StartDiversion);
        Ok(())
    }

    pub(crate) fn start_diversion(&mut self, tasks: &mut TaskQueue) {
        if !self.diverting {
            return;
        }

        let (Some(request), Some(target)) = (self.request.as_mut(), self.divert_target.as_mut())
        else {
            self.post(
                tasks,
                ActorTask::FailDiversion {
                    error: NetError::Unexpected,
                    skip_resume: true,
                },
            );
            return;
        };

        // Held until the replayed stop arrives.
        request.force_pending(true);

        if !self.diverted_on_start {
            let started = target.on_start_request(request.view());
            self.diverted_on_start = true;
            if let Err(error) = started {
                warn!(actor = %self.key, status = %error, "divert listener refused start");
                self.post(
                    tasks,
                    ActorTask::FailDiversion {
                        error,
                        skip_resume: false,
                    },
                );
                return;
            }
        }

        let sent = self.send(ParentMessage::DivertMessages {
            actor: self.key.actor,
        });
        if !sent {
            self.post(
                tasks,
                ActorTask::FailDiversion {
                    error: NetError::Unexpected,
                    skip_resume: true,
                },
            );
        }
    }

    pub(crate) fn recv_divert_on_data(&mut self, data: &[u8], offset: u64, tasks: &mut TaskQueue) {
        if !self.diverting {
            self.reject_divert_message("DivertOnDataAvailable", tasks);
            return;
        }
        if self.status.is_err() {
            debug!(actor = %self.key, offset, "dropping diverted data after failure");
            return;
        }
        self.divert_data(data, offset);
    }

    pub(crate) fn recv_divert_on_stop(&mut self, status: NetStatus, tasks: &mut TaskQueue) {
        if !self.diverting {
            self.reject_divert_message("DivertOnStopRequest", tasks);
            return;
        }
        if let Some(request) = self.request.as_mut() {
            request.force_pending(false);
        }
        self.divert_stop(status);
    }

    pub(crate) fn recv_divert_complete(&mut self, tasks: &mut TaskQueue) -> ActorOutcome {
        if !self.diverting {
            self.reject_divert_message("DivertComplete", tasks);
            return ActorOutcome::Keep;
        }

        if self.suspended_for_diversion {
            self.suspended_for_diversion = false;
            let resumed = match self.request.as_mut() {
                Some(request) => request.resume(),
                None => Err(NetError::Unexpected),
            };
            if let Err(error) = resumed {
                warn!(actor = %self.key, status = %error, "resume after diversion failed");
                self.post(
                    tasks,
                    ActorTask::FailDiversion {
                        error: NetError::Unexpected,
                        skip_resume: true,
                    },
                );
                return ActorOutcome::Keep;
            }
        }

        debug!(actor = %self.key, "diversion complete");
        self.send(ParentMessage::DeleteSelf {
            actor: self.key.actor,
        });
        ActorOutcome::Release
    }

    /// Cancels the request and makes sure the divert listener, if any, sees
    /// exactly one start and one stop. Always releases the actor.
    pub(crate) fn fail_diversion(&mut self, error: NetError, skip_resume: bool) -> ActorOutcome {
        warn!(actor = %self.key, status = %error, skip_resume, "diversion failed");
        self.abandon_diversion(error, skip_resume);
        self.send(ParentMessage::DeleteSelf {
            actor: self.key.actor,
        });
        ActorOutcome::Release
    }

    fn abandon_diversion(&mut self, error: NetError, skip_resume: bool) {
        self.record_status(Err(error));

        if let Some(request) = self.request.as_mut() {
            request.cancel(error);
            request.force_pending(false);
            let pending = request.is_pending();

            let resumes = self.suspended_for_diversion && !skip_resume;
            let will_stop_itself = pending && (resumes || !self.suspended_for_diversion);
            if resumes {
                if let Err(resume_error) = request.resume() {
                    debug!(actor = %self.key, status = %resume_error, "resume on failure ignored");
                }
            }
            self.suspended_for_diversion = false;

            if let Some(target) = self.divert_target.as_mut() {
                if !self.diverted_on_start {
                    request.force_pending(true);
                    if let Err(start_error) = target.on_start_request(request.view()) {
                        debug!(actor = %self.key, status = %start_error, "listener refused start");
                    }
                    request.force_pending(false);
                    self.diverted_on_start = true;
                }
                if !will_stop_itself && !self.divert_stop_delivered {
                    target.on_stop_request(request.view(), Err(error));
                    self.divert_stop_delivered = true;
                }
            }
        }
    }

    /// Tears the actor down. A request that is still producing data for a
    /// divert listener outlives the actor as a [`Handoff`].
    pub fn release(mut self) -> Option<Handoff> {
        self.state = ActorState::Destroyed;
        // Nobody is left to send DivertComplete, so the request would stay
        // suspended under the handoff.
        if self.suspended_for_diversion
            && self.divert_target.is_some()
            && !self.divert_stop_delivered
        {
            warn!(actor = %self.key, "released mid-diversion");
            self.abandon_diversion(NetError::Aborted, false);
        }
        self.mark_ipc_closed();

        let mut request = self.request.take()?;
        let Some(mut listener) = self.divert_target.take() else {
            if request.is_pending() {
                request.cancel(NetError::Aborted);
            }
            return None;
        };

        request.force_pending(false);
        if self.divert_stop_delivered {
            if request.is_pending() {
                request.cancel(NetError::Aborted);
            }
            return None;
        }

        if request.is_pending() {
            debug!(actor = %self.key, "handing request off to divert listener");
            return Some(Handoff {
                key: self.key,
                request,
                listener,
                start_delivered: self.diverted_on_start,
                stop_delivered: false,
            });
        }

        // Finished and nobody will report it: close the listener out.
        if !self.diverted_on_start {
            request.force_pending(true);
            if let Err(error) = listener.on_start_request(request.view()) {
                debug!(actor = %self.key, status = %error, "listener refused start");
            }
            request.force_pending(false);
        }
        let status = match self.status {
            Err(error) => Err(error),
            Ok(()) => Err(NetError::Aborted),
        };
        listener.on_stop_request(request.view(), status);
        None
    }

    pub(crate) fn divert_start(&mut self) {
        if self.diverted_on_start {
            debug!(actor = %self.key, "start already delivered to divert listener");
            return;
        }
        let (Some(request), Some(target)) = (self.request.as_mut(), self.divert_target.as_mut())
        else {
            warn!(actor = %self.key, "start while diverting without a listener dropped");
            return;
        };
        self.diverted_on_start = true;
        if let Err(error) = target.on_start_request(request.view()) {
            request.cancel(error);
        }
    }

    pub(crate) fn divert_data(&mut self, data: &[u8], offset: u64) {
        let (Some(request), Some(target)) = (self.request.as_mut(), self.divert_target.as_mut())
        else {
            warn!(actor = %self.key, offset, "data while diverting without a listener dropped");
            return;
        };
        if let Err(error) = target.on_data_available(request.view(), data, offset) {
            debug!(actor = %self.key, status = %error, "divert listener refused data");
            request.cancel(error);
            self.record_status(Err(error));
        }
    }

    pub(crate) fn divert_stop(&mut self, status: NetStatus) {
        if self.divert_stop_delivered {
            debug!(actor = %self.key, "stop already delivered to divert listener");
            return;
        }
        let (Some(request), Some(target)) = (self.request.as_mut(), self.divert_target.as_mut())
        else {
            warn!(actor = %self.key, "stop while diverting without a listener dropped");
            return;
        };
        target.on_stop_request(request.view(), status);
        self.divert_stop_delivered = true;
    }

    fn reject_divert_message(&mut self, message: &'static str, tasks: &mut TaskQueue) {
        warn!(actor = %self.key, message, "divert message while not diverting");
        self.post(
            tasks,
            ActorTask::FailDiversion {
                error: NetError::Unexpected,
                skip_resume: true,
            },
        );
    }
}

/// A diverted request that outlived its actor, pumped by the registry
/// until the listener has seen its stop.
pub struct Handoff {
    key: ActorKey,
    request: Box<dyn NetworkRequest>,
    listener: Box<dyn StreamListener>,
    start_delivered: bool,
    stop_delivered: bool,
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("key", &self.key)
            .field("start_delivered", &self.start_delivered)
            .field("stop_delivered", &self.stop_delivered)
            .finish_non_exhaustive()
    }
}

impl Handoff {
    pub fn key(&self) -> ActorKey {
        self.key
    }

    pub fn is_finished(&self) -> bool {
        self.stop_delivered
    }

    /// Delivers one notification; `false` when nothing was ready.
    pub fn pump(&mut self) -> bool {
        if self.stop_delivered {
            return false;
        }
        let Some(event) = self.request.poll_event() else {
            return false;
        };

        match event {
            RequestEvent::Start => self.ensure_started(),
            RequestEvent::Data(mut chunk) => {
                self.ensure_started();
                let mut buf = vec![0_u8; chunk.count];
                let delivered = chunk.read_exact(&mut buf).and_then(|()| {
                    self.listener
                        .on_data_available(self.request.view(), &buf, chunk.offset)
                });
                if let Err(error) = delivered {
                    debug!(actor = %self.key, status = %error, "handoff data failed");
                    self.request.cancel(error);
                }
            }
            RequestEvent::Stop(status) => {
                self.ensure_started();
                self.listener.on_stop_request(self.request.view(), status);
                self.stop_delivered = true;
            }
            RequestEvent::Redirect { .. } => {
                warn!(actor = %self.key, "redirect of a diverted request refused");
                self.request.cancel(NetError::Redirected);
            }
        }
        true
    }

    fn ensure_started(&mut self) {
        if self.start_delivered {
            return;
        }
        self.start_delivered = true;
        if let Err(error) = self.listener.on_start_request(self.request.view()) {
            self.request.cancel(error);
        }
    }
}
