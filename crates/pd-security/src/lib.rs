//! Security policy for channel construction and load-context validation.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_ipc::LoadContextSnapshot;
use pd_ipc::load_context::NO_APP_ID;
use pd_ipc::load_context::UNKNOWN_APP_ID;

/// Central security policy for the parent-side actor registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// When disabled, load-context claims from children are trusted verbatim.
    pub ipc_security: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self { ipc_security: true }
    }
}

impl SecurityPolicy {
    /// Policy for in-process test harnesses that have no browsing contexts.
    pub fn trusting() -> Self {
        Self {
            ipc_security: false,
        }
    }

    /// Validates the app identity a child claims for a new channel.
    ///
    /// `owned` lists the browsing contexts the requesting process actually
    /// hosts. An error means the child forged its claim.
    pub fn validate_app_info(
        &self,
        snapshot: &LoadContextSnapshot,
        owned: &[BrowsingContext],
    ) -> BrowserResult<ValidatedAppInfo> {
        if !self.ipc_security {
            return Ok(claimed_app_info(snapshot));
        }

        if !snapshot.has_value() {
            return Err(BrowserError::new(
                "security.context_null",
                "load context from child is null",
            ));
        }

        validate_claim(
            snapshot.app_id(),
            snapshot.is_in_browser_element(),
            owned,
        )
    }
}

/// One browsing context (tab or frame) hosted by a content process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowsingContext {
    pub app_id: u32,
    pub is_browser_element: bool,
}

impl BrowsingContext {
    pub fn new(app_id: u32, is_browser_element: bool) -> Self {
        Self {
            app_id,
            is_browser_element,
        }
    }

    /// A non-browser context satisfies any claim for its app; a browser
    /// element only satisfies a claim that is itself in-browser.
    ///
    /// So `(7, false)` does accept an in-browser claim for app 7. This is
    /// deliberate; see "Context validation" in DESIGN.md.
    pub fn satisfies(&self, app_id: u32, in_browser_element: bool) -> bool {
        self.app_id != UNKNOWN_APP_ID
            && self.app_id == app_id
            && (!self.is_browser_element || in_browser_element)
    }
}

/// App identity accepted for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedAppInfo {
    pub app_id: u32,
    pub in_browser_element: bool,
}

/// Matches a claimed `(app_id, in_browser_element)` pair against the owned contexts.
pub fn validate_claim(
    app_id: u32,
    in_browser_element: bool,
    owned: &[BrowsingContext],
) -> BrowserResult<ValidatedAppInfo> {
    if owned
        .iter()
        .any(|context| context.satisfies(app_id, in_browser_element))
    {
        return Ok(ValidatedAppInfo {
            app_id,
            in_browser_element,
        });
    }

    if owned.is_empty() {
        return Err(BrowserError::new(
            "security.no_browsers",
            "content process does not host any browsing contexts",
        ));
    }

    Err(BrowserError::new(
        "security.no_permission",
        format!(
            "content process does not have permission for app {app_id} (in_browser={in_browser_element})"
        ),
    ))
}

fn claimed_app_info(snapshot: &LoadContextSnapshot) -> ValidatedAppInfo {
    if snapshot.has_value() {
        ValidatedAppInfo {
            app_id: snapshot.app_id(),
            in_browser_element: snapshot.is_in_browser_element(),
        }
    } else {
        ValidatedAppInfo {
            app_id: NO_APP_ID,
            in_browser_element: false,
        }
    }
}
