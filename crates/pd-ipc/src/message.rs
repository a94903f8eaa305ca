//! Typed child-to-parent and parent-to-child channel messages.

use crate::ActorId;
use crate::load_context::LoadContextSnapshot;
use crate::params::CrossProcessRedirectArgs;
use crate::params::OpenArgs;
use crate::params::RedirectRequest;
use crate::params::ResponseHead;
use crate::wire;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::NetError;
use pd_core::NetStatus;

const CHILD_TAG_CHANNEL_CONSTRUCTOR: u8 = 1;
const CHILD_TAG_CONNECT_CHANNEL: u8 = 2;
const CHILD_TAG_SUSPEND: u8 = 3;
const CHILD_TAG_RESUME: u8 = 4;
const CHILD_TAG_CANCEL: u8 = 5;
const CHILD_TAG_DIVERT_TO_PARENT: u8 = 6;
const CHILD_TAG_DIVERT_ON_DATA_AVAILABLE: u8 = 7;
const CHILD_TAG_DIVERT_ON_STOP_REQUEST: u8 = 8;
const CHILD_TAG_DIVERT_COMPLETE: u8 = 9;
const CHILD_TAG_DELETE: u8 = 10;
const CHILD_TAG_CROSS_PROCESS_REDIRECT_FINISHED: u8 = 11;

const PARENT_TAG_ON_START_REQUEST: u8 = 1;
const PARENT_TAG_ON_DATA_AVAILABLE: u8 = 2;
const PARENT_TAG_ON_STOP_REQUEST: u8 = 3;
const PARENT_TAG_FAILED_ASYNC_OPEN: u8 = 4;
const PARENT_TAG_FLUSHED_FOR_DIVERSION: u8 = 5;
const PARENT_TAG_DIVERT_MESSAGES: u8 = 6;
const PARENT_TAG_DELETE_SELF: u8 = 7;
const PARENT_TAG_CROSS_PROCESS_REDIRECT: u8 = 8;

/// Messages sent by a content process to the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildMessage {
    ChannelConstructor {
        actor: ActorId,
        load_context: LoadContextSnapshot,
        args: OpenArgs,
    },
    /// Binds a new actor to a request the parent registered for a
    /// cross-process redirect.
    ConnectChannel {
        actor: ActorId,
        registrar_id: u64,
    },
    Suspend {
        actor: ActorId,
    },
    Resume {
        actor: ActorId,
    },
    Cancel {
        actor: ActorId,
        status: NetError,
    },
    DivertToParent {
        actor: ActorId,
    },
    DivertOnDataAvailable {
        actor: ActorId,
        data: Vec<u8>,
        offset: u64,
        count: u32,
    },
    DivertOnStopRequest {
        actor: ActorId,
        status: NetStatus,
    },
    DivertComplete {
        actor: ActorId,
    },
    Delete {
        actor: ActorId,
    },
    CrossProcessRedirectFinished {
        registrar_id: u64,
        status: NetStatus,
    },
}

impl ChildMessage {
    /// Actor the message is routed to; `ActorId::MANAGER` for manager-level messages.
    pub fn actor(&self) -> ActorId {
        match self {
            Self::ChannelConstructor { actor, .. }
            | Self::ConnectChannel { actor, .. }
            | Self::Suspend { actor }
            | Self::Resume { actor }
            | Self::Cancel { actor, .. }
            | Self::DivertToParent { actor }
            | Self::DivertOnDataAvailable { actor, .. }
            | Self::DivertOnStopRequest { actor, .. }
            | Self::DivertComplete { actor }
            | Self::Delete { actor } => *actor,
            Self::CrossProcessRedirectFinished { .. } => ActorId::MANAGER,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChannelConstructor { .. } => "ChannelConstructor",
            Self::ConnectChannel { .. } => "ConnectChannel",
            Self::Suspend { .. } => "Suspend",
            Self::Resume { .. } => "Resume",
            Self::Cancel { .. } => "Cancel",
            Self::DivertToParent { .. } => "DivertToParent",
            Self::DivertOnDataAvailable { .. } => "DivertOnDataAvailable",
            Self::DivertOnStopRequest { .. } => "DivertOnStopRequest",
            Self::DivertComplete { .. } => "DivertComplete",
            Self::Delete { .. } => "Delete",
            Self::CrossProcessRedirectFinished { .. } => "CrossProcessRedirectFinished",
        }
    }
}

/// Messages sent by the parent to a content process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentMessage {
    OnStartRequest {
        actor: ActorId,
        status: NetStatus,
        head: ResponseHead,
    },
    OnDataAvailable {
        actor: ActorId,
        status: NetStatus,
        data: Vec<u8>,
        offset: u64,
        count: u32,
    },
    OnStopRequest {
        actor: ActorId,
        status: NetStatus,
    },
    FailedAsyncOpen {
        actor: ActorId,
        status: NetError,
    },
    FlushedForDiversion {
        actor: ActorId,
    },
    DivertMessages {
        actor: ActorId,
    },
    DeleteSelf {
        actor: ActorId,
    },
    CrossProcessRedirect(CrossProcessRedirectArgs),
}

impl ParentMessage {
    pub fn actor(&self) -> ActorId {
        match self {
            Self::OnStartRequest { actor, .. }
            | Self::OnDataAvailable { actor, .. }
            | Self::OnStopRequest { actor, .. }
            | Self::FailedAsyncOpen { actor, .. }
            | Self::FlushedForDiversion { actor }
            | Self::DivertMessages { actor }
            | Self::DeleteSelf { actor } => *actor,
            Self::CrossProcessRedirect(_) => ActorId::MANAGER,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OnStartRequest { .. } => "OnStartRequest",
            Self::OnDataAvailable { .. } => "OnDataAvailable",
            Self::OnStopRequest { .. } => "OnStopRequest",
            Self::FailedAsyncOpen { .. } => "FailedAsyncOpen",
            Self::FlushedForDiversion { .. } => "FlushedForDiversion",
            Self::DivertMessages { .. } => "DivertMessages",
            Self::DeleteSelf { .. } => "DeleteSelf",
            Self::CrossProcessRedirect(_) => "CrossProcessRedirect",
        }
    }
}

pub(crate) fn encode_child_payload(message: &ChildMessage) -> BrowserResult<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    match message {
        ChildMessage::ChannelConstructor {
            actor,
            load_context,
            args,
        } => {
            out.push(CHILD_TAG_CHANNEL_CONSTRUCTOR);
            wire::put_u32(&mut out, actor.0);
            load_context.encode_into(&mut out);
            args.encode_into(&mut out)?;
        }
        ChildMessage::ConnectChannel {
            actor,
            registrar_id,
        } => {
            out.push(CHILD_TAG_CONNECT_CHANNEL);
            wire::put_u32(&mut out, actor.0);
            wire::put_u64(&mut out, *registrar_id);
        }
        ChildMessage::Suspend { actor } => push_actor(&mut out, CHILD_TAG_SUSPEND, *actor),
        ChildMessage::Resume { actor } => push_actor(&mut out, CHILD_TAG_RESUME, *actor),
        ChildMessage::Cancel { actor, status } => {
            push_actor(&mut out, CHILD_TAG_CANCEL, *actor);
            wire::put_error(&mut out, *status);
        }
        ChildMessage::DivertToParent { actor } => {
            push_actor(&mut out, CHILD_TAG_DIVERT_TO_PARENT, *actor);
        }
        ChildMessage::DivertOnDataAvailable {
            actor,
            data,
            offset,
            count,
        } => {
            push_actor(&mut out, CHILD_TAG_DIVERT_ON_DATA_AVAILABLE, *actor);
            wire::put_bytes(&mut out, "data", data)?;
            wire::put_u64(&mut out, *offset);
            wire::put_u32(&mut out, *count);
        }
        ChildMessage::DivertOnStopRequest { actor, status } => {
            push_actor(&mut out, CHILD_TAG_DIVERT_ON_STOP_REQUEST, *actor);
            wire::put_status(&mut out, *status);
        }
        ChildMessage::DivertComplete { actor } => {
            push_actor(&mut out, CHILD_TAG_DIVERT_COMPLETE, *actor);
        }
        ChildMessage::Delete { actor } => push_actor(&mut out, CHILD_TAG_DELETE, *actor),
        ChildMessage::CrossProcessRedirectFinished {
            registrar_id,
            status,
        } => {
            out.push(CHILD_TAG_CROSS_PROCESS_REDIRECT_FINISHED);
            wire::put_u64(&mut out, *registrar_id);
            wire::put_status(&mut out, *status);
        }
    }
    Ok(out)
}

pub(crate) fn decode_child_payload(payload: &[u8]) -> BrowserResult<ChildMessage> {
    let mut offset = 0_usize;
    let tag = read_tag(payload, &mut offset)?;
    let message = match tag {
        CHILD_TAG_CHANNEL_CONSTRUCTOR => ChildMessage::ChannelConstructor {
            actor: read_actor(payload, &mut offset)?,
            load_context: LoadContextSnapshot::decode_from(payload, &mut offset)?,
            args: OpenArgs::decode_from(payload, &mut offset)?,
        },
        CHILD_TAG_CONNECT_CHANNEL => ChildMessage::ConnectChannel {
            actor: read_actor(payload, &mut offset)?,
            registrar_id: wire::read_u64(payload, &mut offset, "registrar_id")?,
        },
        CHILD_TAG_SUSPEND => ChildMessage::Suspend {
            actor: read_actor(payload, &mut offset)?,
        },
        CHILD_TAG_RESUME => ChildMessage::Resume {
            actor: read_actor(payload, &mut offset)?,
        },
        CHILD_TAG_CANCEL => ChildMessage::Cancel {
            actor: read_actor(payload, &mut offset)?,
            status: wire::read_error(payload, &mut offset, "status")?,
        },
        CHILD_TAG_DIVERT_TO_PARENT => ChildMessage::DivertToParent {
            actor: read_actor(payload, &mut offset)?,
        },
        CHILD_TAG_DIVERT_ON_DATA_AVAILABLE => {
            let actor = read_actor(payload, &mut offset)?;
            let data = wire::read_bytes(payload, &mut offset, "data")?;
            let data_offset = wire::read_u64(payload, &mut offset, "offset")?;
            let count = read_count(payload, &mut offset, data.len())?;
            ChildMessage::DivertOnDataAvailable {
                actor,
                data,
                offset: data_offset,
                count,
            }
        }
        CHILD_TAG_DIVERT_ON_STOP_REQUEST => ChildMessage::DivertOnStopRequest {
            actor: read_actor(payload, &mut offset)?,
            status: wire::read_status(payload, &mut offset, "status")?,
        },
        CHILD_TAG_DIVERT_COMPLETE => ChildMessage::DivertComplete {
            actor: read_actor(payload, &mut offset)?,
        },
        CHILD_TAG_DELETE => ChildMessage::Delete {
            actor: read_actor(payload, &mut offset)?,
        },
        CHILD_TAG_CROSS_PROCESS_REDIRECT_FINISHED => ChildMessage::CrossProcessRedirectFinished {
            registrar_id: wire::read_u64(payload, &mut offset, "registrar_id")?,
            status: wire::read_status(payload, &mut offset, "status")?,
        },
        other => return Err(unknown_tag(other)),
    };

    wire::expect_consumed(payload, offset)?;
    Ok(message)
}

pub(crate) fn encode_parent_payload(message: &ParentMessage) -> BrowserResult<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    match message {
        ParentMessage::OnStartRequest {
            actor,
            status,
            head,
        } => {
            push_actor(&mut out, PARENT_TAG_ON_START_REQUEST, *actor);
            wire::put_status(&mut out, *status);
            head.encode_into(&mut out)?;
        }
        ParentMessage::OnDataAvailable {
            actor,
            status,
            data,
            offset,
            count,
        } => {
            push_actor(&mut out, PARENT_TAG_ON_DATA_AVAILABLE, *actor);
            wire::put_status(&mut out, *status);
            wire::put_bytes(&mut out, "data", data)?;
            wire::put_u64(&mut out, *offset);
            wire::put_u32(&mut out, *count);
        }
        ParentMessage::OnStopRequest { actor, status } => {
            push_actor(&mut out, PARENT_TAG_ON_STOP_REQUEST, *actor);
            wire::put_status(&mut out, *status);
        }
        ParentMessage::FailedAsyncOpen { actor, status } => {
            push_actor(&mut out, PARENT_TAG_FAILED_ASYNC_OPEN, *actor);
            wire::put_error(&mut out, *status);
        }
        ParentMessage::FlushedForDiversion { actor } => {
            push_actor(&mut out, PARENT_TAG_FLUSHED_FOR_DIVERSION, *actor);
        }
        ParentMessage::DivertMessages { actor } => {
            push_actor(&mut out, PARENT_TAG_DIVERT_MESSAGES, *actor);
        }
        ParentMessage::DeleteSelf { actor } => {
            push_actor(&mut out, PARENT_TAG_DELETE_SELF, *actor);
        }
        ParentMessage::CrossProcessRedirect(args) => {
            out.push(PARENT_TAG_CROSS_PROCESS_REDIRECT);
            wire::put_u64(&mut out, args.registrar_id);
            args.redirect.encode_into(&mut out)?;
        }
    }
    Ok(out)
}

pub(crate) fn decode_parent_payload(payload: &[u8]) -> BrowserResult<ParentMessage> {
    let mut offset = 0_usize;
    let tag = read_tag(payload, &mut offset)?;
    let message = match tag {
        PARENT_TAG_ON_START_REQUEST => ParentMessage::OnStartRequest {
            actor: read_actor(payload, &mut offset)?,
            status: wire::read_status(payload, &mut offset, "status")?,
            head: ResponseHead::decode_from(payload, &mut offset)?,
        },
        PARENT_TAG_ON_DATA_AVAILABLE => {
            let actor = read_actor(payload, &mut offset)?;
            let status = wire::read_status(payload, &mut offset, "status")?;
            let data = wire::read_bytes(payload, &mut offset, "data")?;
            let data_offset = wire::read_u64(payload, &mut offset, "offset")?;
            let count = read_count(payload, &mut offset, data.len())?;
            ParentMessage::OnDataAvailable {
                actor,
                status,
                data,
                offset: data_offset,
                count,
            }
        }
        PARENT_TAG_ON_STOP_REQUEST => ParentMessage::OnStopRequest {
            actor: read_actor(payload, &mut offset)?,
            status: wire::read_status(payload, &mut offset, "status")?,
        },
        PARENT_TAG_FAILED_ASYNC_OPEN => ParentMessage::FailedAsyncOpen {
            actor: read_actor(payload, &mut offset)?,
            status: wire::read_error(payload, &mut offset, "status")?,
        },
        PARENT_TAG_FLUSHED_FOR_DIVERSION => ParentMessage::FlushedForDiversion {
            actor: read_actor(payload, &mut offset)?,
        },
        PARENT_TAG_DIVERT_MESSAGES => ParentMessage::DivertMessages {
            actor: read_actor(payload, &mut offset)?,
        },
        PARENT_TAG_DELETE_SELF => ParentMessage::DeleteSelf {
            actor: read_actor(payload, &mut offset)?,
        },
        PARENT_TAG_CROSS_PROCESS_REDIRECT => {
            let registrar_id = wire::read_u64(payload, &mut offset, "registrar_id")?;
            let redirect = RedirectRequest::decode_from(payload, &mut offset)?;
            ParentMessage::CrossProcessRedirect(CrossProcessRedirectArgs {
                registrar_id,
                redirect,
            })
        }
        other => return Err(unknown_tag(other)),
    };

    wire::expect_consumed(payload, offset)?;
    Ok(message)
}

fn push_actor(out: &mut Vec<u8>, tag: u8, actor: ActorId) {
    out.push(tag);
    wire::put_u32(out, actor.0);
}

fn read_tag(payload: &[u8], offset: &mut usize) -> BrowserResult<u8> {
    if payload.is_empty() {
        return Err(BrowserError::new(
            "ipc.message_empty",
            "typed IPC payload is empty",
        ));
    }
    wire::read_u8(payload, offset, "tag")
}

fn read_actor(payload: &[u8], offset: &mut usize) -> BrowserResult<ActorId> {
    let raw = wire::read_u32(payload, offset, "actor")?;
    if raw == ActorId::MANAGER.0 {
        return Err(BrowserError::new(
            "ipc.message_actor_invalid",
            "channel message addressed to the reserved manager actor id",
        ));
    }
    Ok(ActorId(raw))
}

fn read_count(payload: &[u8], offset: &mut usize, data_len: usize) -> BrowserResult<u32> {
    let count = wire::read_u32(payload, offset, "count")?;
    if count as usize != data_len {
        return Err(BrowserError::new(
            "ipc.message_field_invalid",
            format!("data count {count} does not match {data_len} carried bytes"),
        ));
    }
    Ok(count)
}

fn unknown_tag(tag: u8) -> BrowserError {
    BrowserError::new(
        "ipc.message_tag_unknown",
        format!("unknown typed IPC message tag `{tag}`"),
    )
}
