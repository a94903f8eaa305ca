//! Argument structures carried inside channel messages.

use crate::wire;
use pd_core::BrowserResult;

/// Load flag set on a channel that replaces another one after a redirect.
pub const LOAD_REPLACE: u32 = 1 << 19;

/// Arguments of a child-initiated channel open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenArgs {
    pub uri: String,
    pub start_pos: u64,
    pub entity_id: String,
    pub load_flags: u32,
    pub channel_id: u64,
    pub upload: Vec<u8>,
    pub load_info: Vec<u8>,
}

impl OpenArgs {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) -> BrowserResult<()> {
        wire::put_string(out, "open.uri", &self.uri)?;
        wire::put_u64(out, self.start_pos);
        wire::put_string(out, "open.entity_id", &self.entity_id)?;
        wire::put_u32(out, self.load_flags);
        wire::put_u64(out, self.channel_id);
        wire::put_bytes(out, "open.upload", &self.upload)?;
        wire::put_bytes(out, "open.load_info", &self.load_info)
    }

    pub(crate) fn decode_from(payload: &[u8], offset: &mut usize) -> BrowserResult<Self> {
        Ok(Self {
            uri: wire::read_string(payload, offset, "open.uri")?,
            start_pos: wire::read_u64(payload, offset, "open.start_pos")?,
            entity_id: wire::read_string(payload, offset, "open.entity_id")?,
            load_flags: wire::read_u32(payload, offset, "open.load_flags")?,
            channel_id: wire::read_u64(payload, offset, "open.channel_id")?,
            upload: wire::read_bytes(payload, offset, "open.upload")?,
            load_info: wire::read_bytes(payload, offset, "open.load_info")?,
        })
    }
}

/// Response metadata forwarded with `OnStartRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// `-1` when the length is unknown.
    pub content_length: i64,
    pub content_type: String,
    /// Seconds since the Unix epoch.
    pub last_modified: Option<u64>,
    /// Resumability token.
    pub entity_id: String,
    pub final_uri: String,
}

impl ResponseHead {
    pub fn new(final_uri: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            content_length: -1,
            content_type: content_type.into(),
            last_modified: None,
            entity_id: String::new(),
            final_uri: final_uri.into(),
        }
    }

    pub fn with_content_length(mut self, content_length: i64) -> Self {
        self.content_length = content_length;
        self
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = entity_id.into();
        self
    }

    pub fn with_last_modified(mut self, seconds: u64) -> Self {
        self.last_modified = Some(seconds);
        self
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) -> BrowserResult<()> {
        wire::put_i64(out, self.content_length);
        wire::put_string(out, "head.content_type", &self.content_type)?;
        wire::put_optional_u64(out, self.last_modified);
        wire::put_string(out, "head.entity_id", &self.entity_id)?;
        wire::put_string(out, "head.final_uri", &self.final_uri)
    }

    pub(crate) fn decode_from(payload: &[u8], offset: &mut usize) -> BrowserResult<Self> {
        Ok(Self {
            content_length: wire::read_i64(payload, offset, "head.content_length")?,
            content_type: wire::read_string(payload, offset, "head.content_type")?,
            last_modified: wire::read_optional_u64(payload, offset, "head.last_modified")?,
            entity_id: wire::read_string(payload, offset, "head.entity_id")?,
            final_uri: wire::read_string(payload, offset, "head.final_uri")?,
        })
    }
}

/// A redirect that has been decided and must be handed to a new request.
///
/// Consumed exactly once by the redirect coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRequest {
    pub target_uri: String,
    pub new_load_flags: u32,
    pub load_info: Vec<u8>,
    pub channel_id: u64,
    pub original_uri: String,
    pub completion_identifier: u64,
}

impl RedirectRequest {
    /// Open arguments for the request that replaces the redirected one.
    pub fn open_args(&self) -> OpenArgs {
        OpenArgs {
            uri: self.target_uri.clone(),
            load_flags: self.new_load_flags | LOAD_REPLACE,
            channel_id: self.channel_id,
            load_info: self.load_info.clone(),
            ..OpenArgs::default()
        }
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) -> BrowserResult<()> {
        wire::put_string(out, "redirect.target_uri", &self.target_uri)?;
        wire::put_u32(out, self.new_load_flags);
        wire::put_bytes(out, "redirect.load_info", &self.load_info)?;
        wire::put_u64(out, self.channel_id);
        wire::put_string(out, "redirect.original_uri", &self.original_uri)?;
        wire::put_u64(out, self.completion_identifier);
        Ok(())
    }

    pub(crate) fn decode_from(payload: &[u8], offset: &mut usize) -> BrowserResult<Self> {
        Ok(Self {
            target_uri: wire::read_string(payload, offset, "redirect.target_uri")?,
            new_load_flags: wire::read_u32(payload, offset, "redirect.new_load_flags")?,
            load_info: wire::read_bytes(payload, offset, "redirect.load_info")?,
            channel_id: wire::read_u64(payload, offset, "redirect.channel_id")?,
            original_uri: wire::read_string(payload, offset, "redirect.original_uri")?,
            completion_identifier: wire::read_u64(
                payload,
                offset,
                "redirect.completion_identifier",
            )?,
        })
    }
}

/// Parent request asking another content process to take over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossProcessRedirectArgs {
    pub registrar_id: u64,
    pub redirect: RedirectRequest,
}
