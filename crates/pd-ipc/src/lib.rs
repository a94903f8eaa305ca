//! Process messaging for the network channel actors: roles, framing, and
//! the typed parent/child message surface.

pub mod load_context;
pub mod message;
pub mod params;
mod wire;

use pd_core::BrowserError;
use pd_core::BrowserResult;
use std::fmt;
use std::sync::mpsc;
use std::time::Duration;

pub use load_context::LoadContextSnapshot;
pub use message::ChildMessage;
pub use message::ParentMessage;
pub use params::CrossProcessRedirectArgs;
pub use params::OpenArgs;
pub use params::RedirectRequest;
pub use params::ResponseHead;

const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;
const HARD_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
const FRAME_PREFIX_BYTES: usize = 4;

/// Which side of the necko actor pair a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Privileged process that owns sockets and security decisions.
    Parent,
    /// Content process issuing requests through channel actors.
    Child,
}

impl ProcessRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
        }
    }

    pub fn from_role_name(value: &str) -> Option<Self> {
        match value {
            "parent" => Some(Self::Parent),
            "child" => Some(Self::Child),
            _ => None,
        }
    }
}

/// Identifier of one channel actor, unique within its process connection.
///
/// Ids are chosen by the child when it sends a constructor; `0` is reserved
/// for manager-level messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId(pub u32);

impl ActorId {
    pub const MANAGER: Self = Self(0);

    pub fn is_manager(self) -> bool {
        self == Self::MANAGER
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

/// Defines how processes communicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub role: ProcessRole,
    pub max_message_bytes: usize,
}

impl ChannelConfig {
    pub fn hardened(role: ProcessRole) -> BrowserResult<Self> {
        let config = Self {
            role,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BrowserResult<()> {
        if self.max_message_bytes == 0 {
            return Err(BrowserError::new(
                "ipc.max_message_bytes_invalid",
                "channel max_message_bytes must be greater than zero",
            ));
        }

        if self.max_message_bytes > HARD_MAX_MESSAGE_BYTES {
            return Err(BrowserError::new(
                "ipc.max_message_bytes_too_large",
                "channel max_message_bytes exceeds hard limit (16 MiB)",
            ));
        }

        Ok(())
    }
}

/// In-memory endpoint that applies framing and message-size checks.
#[derive(Debug)]
pub struct LocalIpcEndpoint {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    config: ChannelConfig,
}

impl LocalIpcEndpoint {
    pub fn role(&self) -> ProcessRole {
        self.config.role
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn send(&self, payload: &[u8]) -> BrowserResult<()> {
        let frame = encode_frame(payload, self.config.max_message_bytes)?;
        self.tx.send(frame).map_err(|error| {
            BrowserError::new(
                "ipc.send_failed",
                format!(
                    "failed to send message from {} endpoint: {error}",
                    self.config.role.as_str()
                ),
            )
        })
    }

    pub fn recv_timeout(&self, timeout: Duration) -> BrowserResult<Vec<u8>> {
        let frame = self.rx.recv_timeout(timeout).map_err(|error| {
            BrowserError::new(
                "ipc.recv_failed",
                format!(
                    "failed to receive message for {} endpoint: {error}",
                    self.config.role.as_str()
                ),
            )
        })?;
        decode_frame(&frame, self.config.max_message_bytes)
    }

    /// Returns the next queued payload without blocking.
    pub fn try_recv(&self) -> BrowserResult<Option<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(frame) => decode_frame(&frame, self.config.max_message_bytes).map(Some),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(BrowserError::new(
                "ipc.peer_disconnected",
                format!(
                    "peer of {} endpoint has disconnected",
                    self.config.role.as_str()
                ),
            )),
        }
    }

    /// Sends a child-to-parent message. Only valid on a child endpoint.
    pub fn send_child_message(&self, message: &ChildMessage) -> BrowserResult<()> {
        self.expect_role(ProcessRole::Child)?;
        self.send(&message::encode_child_payload(message)?)
    }

    /// Sends a parent-to-child message. Only valid on a parent endpoint.
    pub fn send_parent_message(&self, message: &ParentMessage) -> BrowserResult<()> {
        self.expect_role(ProcessRole::Parent)?;
        self.send(&message::encode_parent_payload(message)?)
    }

    /// Receives the next child message queued for this parent endpoint.
    pub fn try_recv_child_message(&self) -> BrowserResult<Option<ChildMessage>> {
        self.expect_role(ProcessRole::Parent)?;
        match self.try_recv()? {
            Some(payload) => message::decode_child_payload(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Receives the next parent message queued for this child endpoint.
    pub fn try_recv_parent_message(&self) -> BrowserResult<Option<ParentMessage>> {
        self.expect_role(ProcessRole::Child)?;
        match self.try_recv()? {
            Some(payload) => message::decode_parent_payload(&payload).map(Some),
            None => Ok(None),
        }
    }

    fn expect_role(&self, role: ProcessRole) -> BrowserResult<()> {
        if self.config.role != role {
            return Err(BrowserError::new(
                "ipc.role_mismatch",
                format!(
                    "{} endpoint cannot carry {} messages",
                    self.config.role.as_str(),
                    role.as_str()
                ),
            ));
        }
        Ok(())
    }
}

/// Creates a connected parent/child pair of in-memory endpoints.
pub fn local_channel_pair(
    parent: ChannelConfig,
    child: ChannelConfig,
) -> BrowserResult<(LocalIpcEndpoint, LocalIpcEndpoint)> {
    parent.validate()?;
    child.validate()?;

    if parent.role != ProcessRole::Parent || child.role != ProcessRole::Child {
        return Err(BrowserError::new(
            "ipc.pair_roles_invalid",
            "local channel pair requires one parent and one child endpoint",
        ));
    }

    let (parent_to_child_tx, parent_to_child_rx) = mpsc::channel();
    let (child_to_parent_tx, child_to_parent_rx) = mpsc::channel();

    Ok((
        LocalIpcEndpoint {
            tx: parent_to_child_tx,
            rx: child_to_parent_rx,
            config: parent,
        },
        LocalIpcEndpoint {
            tx: child_to_parent_tx,
            rx: parent_to_child_rx,
            config: child,
        },
    ))
}

/// Encodes a payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8], max_message_bytes: usize) -> BrowserResult<Vec<u8>> {
    if payload.len() > max_message_bytes {
        return Err(BrowserError::new(
            "ipc.message_too_large",
            format!(
                "payload exceeds max_message_bytes ({} > {})",
                payload.len(),
                max_message_bytes
            ),
        ));
    }

    let len_u32 = u32::try_from(payload.len()).map_err(|_| {
        BrowserError::new(
            "ipc.message_too_large",
            "payload length does not fit in 32-bit frame prefix",
        )
    })?;

    let mut out = Vec::with_capacity(FRAME_PREFIX_BYTES + payload.len());
    out.extend_from_slice(&len_u32.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decodes a length-prefixed frame and validates payload size.
pub fn decode_frame(frame: &[u8], max_message_bytes: usize) -> BrowserResult<Vec<u8>> {
    if frame.len() < FRAME_PREFIX_BYTES {
        return Err(BrowserError::new(
            "ipc.frame_too_short",
            "frame is shorter than the 4-byte length prefix",
        ));
    }

    let mut len_bytes = [0_u8; FRAME_PREFIX_BYTES];
    len_bytes.copy_from_slice(&frame[..FRAME_PREFIX_BYTES]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;
    if payload_len > max_message_bytes {
        return Err(BrowserError::new(
            "ipc.message_too_large",
            format!(
                "decoded payload exceeds max_message_bytes ({} > {})",
                payload_len, max_message_bytes
            ),
        ));
    }

    let expected = FRAME_PREFIX_BYTES + payload_len;
    if frame.len() != expected {
        return Err(BrowserError::new(
            "ipc.frame_length_mismatch",
            format!(
                "frame length mismatch: expected {expected} bytes, got {}",
                frame.len()
            ),
        ));
    }

    Ok(frame[FRAME_PREFIX_BYTES..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::ActorId;
    use super::ChannelConfig;
    use super::ChildMessage;
    use super::ParentMessage;
    use super::ProcessRole;
    use super::decode_frame;
    use super::encode_frame;
    use super::local_channel_pair;
    use pd_core::NetError;

    fn pair() -> (super::LocalIpcEndpoint, super::LocalIpcEndpoint) {
        let parent = ChannelConfig::hardened(ProcessRole::Parent);
        let child = ChannelConfig::hardened(ProcessRole::Child);
        let pair = local_channel_pair(
            parent.unwrap_or_else(|_| unreachable!()),
            child.unwrap_or_else(|_| unreachable!()),
        );
        assert!(pair.is_ok());
        pair.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn role_roundtrip_from_str() {
        assert_eq!(
            ProcessRole::from_role_name("child"),
            Some(ProcessRole::Child)
        );
        assert_eq!(ProcessRole::Parent.as_str(), "parent");
        assert_eq!(ProcessRole::from_role_name("renderer"), None);
    }

    #[test]
    fn frame_roundtrip() {
        let encoded = encode_frame(b"hello", 64);
        assert!(encoded.is_ok());
        let encoded = encoded.unwrap_or_else(|_| unreachable!());
        let decoded = decode_frame(&encoded, 64);
        assert_eq!(decoded, Ok(b"hello".to_vec()));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let encoded = encode_frame(&[0_u8; 65], 64);
        assert!(encoded.is_err());
        if let Err(error) = encoded {
            assert_eq!(error.code, "ipc.message_too_large");
        }
    }

    #[test]
    fn pair_requires_parent_and_child() {
        let left = ChannelConfig::hardened(ProcessRole::Child);
        let right = ChannelConfig::hardened(ProcessRole::Child);
        let pair = local_channel_pair(
            left.unwrap_or_else(|_| unreachable!()),
            right.unwrap_or_else(|_| unreachable!()),
        );
        assert!(pair.is_err());
    }

    #[test]
    fn typed_messages_cross_the_pair() {
        let (parent, child) = pair();

        let sent = child.send_child_message(&ChildMessage::Cancel {
            actor: ActorId(3),
            status: NetError::Aborted,
        });
        assert!(sent.is_ok());
        let received = parent.try_recv_child_message();
        assert_eq!(
            received,
            Ok(Some(ChildMessage::Cancel {
                actor: ActorId(3),
                status: NetError::Aborted,
            }))
        );

        let sent = parent.send_parent_message(&ParentMessage::DeleteSelf { actor: ActorId(3) });
        assert!(sent.is_ok());
        assert_eq!(
            child.try_recv_parent_message(),
            Ok(Some(ParentMessage::DeleteSelf { actor: ActorId(3) }))
        );
        assert_eq!(child.try_recv_parent_message(), Ok(None));
    }

    #[test]
    fn endpoint_refuses_messages_for_the_wrong_side() {
        let (parent, _child) = pair();
        let sent = parent.send_child_message(&ChildMessage::Suspend { actor: ActorId(1) });
        assert!(sent.is_err());
        if let Err(error) = sent {
            assert_eq!(error.code, "ipc.role_mismatch");
        }
    }

    #[test]
    fn dropped_peer_is_reported() {
        let (parent, child) = pair();
        drop(child);
        let received = parent.try_recv();
        assert!(received.is_err());
        if let Err(error) = received {
            assert_eq!(error.code, "ipc.peer_disconnected");
        }
        assert!(
            parent
                .send_parent_message(&ParentMessage::DeleteSelf { actor: ActorId(1) })
                .is_err()
        );
    }
}
