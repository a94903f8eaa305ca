//! Serializable copy of a request's security and privacy context.

use crate::wire;
use pd_core::BrowserResult;

/// App id of a context that is neither an app nor inside one.
pub const NO_APP_ID: u32 = 0;
/// App id the child could not determine; never trusted by the parent.
pub const UNKNOWN_APP_ID: u32 = u32::MAX;

/// Load context captured once in the child and carried to the parent.
///
/// The value is immutable: it is copied across the process boundary and the
/// parent only reads it while building its own context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadContextSnapshot {
    has_value: bool,
    is_content: bool,
    private_bit_valid: bool,
    use_private_browsing: bool,
    use_remote_tabs: bool,
    app_id: u32,
    is_in_browser_element: bool,
}

impl LoadContextSnapshot {
    /// Snapshot of a request created without any load context.
    pub const fn null() -> Self {
        Self {
            has_value: false,
            is_content: false,
            private_bit_valid: false,
            use_private_browsing: false,
            use_remote_tabs: false,
            app_id: NO_APP_ID,
            is_in_browser_element: false,
        }
    }

    /// Snapshot of a content docshell with a known private-browsing bit.
    pub const fn content(app_id: u32, is_in_browser_element: bool, private: bool) -> Self {
        Self {
            has_value: true,
            is_content: true,
            private_bit_valid: true,
            use_private_browsing: private,
            use_remote_tabs: false,
            app_id,
            is_in_browser_element,
        }
    }

    /// Builds a snapshot from every wire field, in wire order.
    pub const fn from_fields(
        has_value: bool,
        is_content: bool,
        private_bit_valid: bool,
        use_private_browsing: bool,
        use_remote_tabs: bool,
        app_id: u32,
        is_in_browser_element: bool,
    ) -> Self {
        Self {
            has_value,
            is_content,
            private_bit_valid,
            use_private_browsing,
            use_remote_tabs,
            app_id,
            is_in_browser_element,
        }
    }

    pub const fn with_remote_tabs(self, use_remote_tabs: bool) -> Self {
        Self {
            use_remote_tabs,
            ..self
        }
    }

    pub fn has_value(&self) -> bool {
        self.has_value
    }

    pub fn is_content(&self) -> bool {
        self.is_content
    }

    pub fn private_bit_valid(&self) -> bool {
        self.private_bit_valid
    }

    pub fn use_private_browsing(&self) -> bool {
        self.use_private_browsing
    }

    pub fn use_remote_tabs(&self) -> bool {
        self.use_remote_tabs
    }

    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    pub fn is_in_browser_element(&self) -> bool {
        self.is_in_browser_element
    }

    /// Appends the snapshot in its fixed wire order.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        wire::put_bool(out, self.has_value);
        wire::put_bool(out, self.is_content);
        wire::put_bool(out, self.private_bit_valid);
        wire::put_bool(out, self.use_private_browsing);
        wire::put_bool(out, self.use_remote_tabs);
        wire::put_u32(out, self.app_id);
        wire::put_bool(out, self.is_in_browser_element);
    }

    pub fn decode_from(payload: &[u8], offset: &mut usize) -> BrowserResult<Self> {
        let has_value = wire::read_bool(payload, offset, "load_context.has_value")?;
        let is_content = wire::read_bool(payload, offset, "load_context.is_content")?;
        let private_bit_valid = wire::read_bool(payload, offset, "load_context.private_bit_valid")?;
        let use_private_browsing =
            wire::read_bool(payload, offset, "load_context.use_private_browsing")?;
        let use_remote_tabs = wire::read_bool(payload, offset, "load_context.use_remote_tabs")?;
        let app_id = wire::read_u32(payload, offset, "load_context.app_id")?;
        let is_in_browser_element =
            wire::read_bool(payload, offset, "load_context.is_in_browser_element")?;

        Ok(Self::from_fields(
            has_value,
            is_content,
            private_bit_valid,
            use_private_browsing,
            use_remote_tabs,
            app_id,
            is_in_browser_element,
        ))
    }
}

impl Default for LoadContextSnapshot {
    fn default() -> Self {
        Self::null()
    }
}

#[cfg(test)]
mod tests {
    use super::LoadContextSnapshot;

    #[test]
    fn wire_layout_follows_field_order() {
        let snapshot = LoadContextSnapshot::from_fields(true, false, true, true, false, 7, true);
        let mut out = Vec::new();
        snapshot.encode_into(&mut out);
        assert_eq!(out, vec![1, 0, 1, 1, 0, 0, 0, 0, 7, 1]);
    }

    #[test]
    fn decode_rejects_non_boolean_flags() {
        let payload = [1, 2, 1, 1, 0, 0, 0, 0, 7, 1];
        let mut offset = 0;
        let decoded = LoadContextSnapshot::decode_from(&payload, &mut offset);
        assert!(decoded.is_err());
        if let Err(error) = decoded {
            assert_eq!(error.code, "ipc.message_field_invalid");
        }
    }

    #[test]
    fn decode_reads_back_every_field() {
        let snapshot = LoadContextSnapshot::content(42, true, true).with_remote_tabs(true);
        let mut out = Vec::new();
        snapshot.encode_into(&mut out);

        let mut offset = 0;
        let decoded = LoadContextSnapshot::decode_from(&out, &mut offset);
        assert_eq!(decoded, Ok(snapshot));
        assert_eq!(offset, out.len());
    }

    #[test]
    fn null_snapshot_has_no_value() {
        let snapshot = LoadContextSnapshot::default();
        assert!(!snapshot.has_value());
        assert_eq!(snapshot.app_id(), super::NO_APP_ID);
    }
}
