//! Parent-side privacy context rebuilt from a child's load context snapshot.

use pd_core::NetError;
use pd_core::NetResult;
use pd_ipc::LoadContextSnapshot;

/// Private browsing id used for all private-mode loads.
pub const PRIVATE_BROWSING_ID: u32 = 1;

/// Isolation key for cookies, cache and connections of one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginAttributes {
    pub app_id: u32,
    pub in_browser_element: bool,
    pub private_browsing_id: u32,
}

impl OriginAttributes {
    pub fn is_private(&self) -> bool {
        self.private_browsing_id != 0
    }

    /// Stable suffix used to partition per-origin state.
    pub fn partition_suffix(&self) -> String {
        let mut suffix = String::new();
        if self.app_id != 0 {
            suffix.push_str(&format!("^appId={}", self.app_id));
        }
        if self.in_browser_element {
            suffix.push_str("^inBrowser=1");
        }
        if self.private_browsing_id != 0 {
            suffix.push_str(&format!("^privateBrowsingId={}", self.private_browsing_id));
        }
        suffix
    }
}

/// Load context owned by the parent for one channel.
///
/// Built once from a snapshot whose app identity was already validated
/// against the sending process; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadContext {
    origin: OriginAttributes,
    is_content: bool,
    use_remote_tabs: bool,
}

impl LoadContext {
    /// Returns `Ok(None)` when the child created the request without a context.
    ///
    /// `app_id` and `in_browser_element` are the validated values, which may
    /// differ from what the snapshot claimed when validation is disabled.
    pub fn from_snapshot(
        snapshot: &LoadContextSnapshot,
        app_id: u32,
        in_browser_element: bool,
    ) -> NetResult<Option<Self>> {
        if !snapshot.has_value() {
            return Ok(None);
        }

        if snapshot.use_private_browsing() && !snapshot.private_bit_valid() {
            return Err(NetError::InvalidArg);
        }

        let private_browsing_id = if snapshot.use_private_browsing() {
            PRIVATE_BROWSING_ID
        } else {
            0
        };

        Ok(Some(Self {
            origin: OriginAttributes {
                app_id,
                in_browser_element,
                private_browsing_id,
            },
            is_content: snapshot.is_content(),
            use_remote_tabs: snapshot.use_remote_tabs(),
        }))
    }

    pub fn origin_attributes(&self) -> OriginAttributes {
        self.origin
    }

    pub fn is_content(&self) -> bool {
        self.is_content
    }

    pub fn use_remote_tabs(&self) -> bool {
        self.use_remote_tabs
    }

    pub fn use_private_browsing(&self) -> bool {
        self.origin.is_private()
    }
}

#[cfg(test)]
mod tests {
    use super::LoadContext;
    use super::PRIVATE_BROWSING_ID;
    use pd_core::NetError;
    use pd_ipc::LoadContextSnapshot;

    #[test]
    fn null_snapshot_builds_no_context() {
        let built = LoadContext::from_snapshot(&LoadContextSnapshot::null(), 0, false);
        assert_eq!(built, Ok(None));
    }

    #[test]
    fn private_snapshot_sets_private_browsing_id() {
        let snapshot = LoadContextSnapshot::content(7, true, true);
        let built = LoadContext::from_snapshot(&snapshot, 7, true);
        let context = match built {
            Ok(Some(context)) => context,
            other => panic!("unexpected {other:?}"),
        };
        assert!(context.use_private_browsing());
        assert_eq!(
            context.origin_attributes().private_browsing_id,
            PRIVATE_BROWSING_ID
        );
        assert_eq!(
            context.origin_attributes().partition_suffix(),
            "^appId=7^inBrowser=1^privateBrowsingId=1"
        );
    }

    #[test]
    fn private_claim_without_valid_bit_is_rejected() {
        let snapshot = LoadContextSnapshot::from_fields(true, true, false, true, false, 0, false);
        let built = LoadContext::from_snapshot(&snapshot, 0, false);
        assert_eq!(built, Err(NetError::InvalidArg));
    }

    #[test]
    fn validated_identity_overrides_the_claim() {
        let snapshot = LoadContextSnapshot::content(9, true, false);
        let built = LoadContext::from_snapshot(&snapshot, 3, false);
        let context = match built {
            Ok(Some(context)) => context,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(context.origin_attributes().app_id, 3);
        assert!(!context.origin_attributes().in_browser_element);
        assert_eq!(context.origin_attributes().partition_suffix(), "^appId=3");
    }
}
