//! Per-process registries of network channel actors.
//!
//! The parent registry validates the load context each child claims,
//! allocates a [`pd_channel::ChannelActor`] per channel, and coordinates
//! redirects; the child registry owns the matching channel children.
//! Both are driven by explicit event-loop turns.

pub mod child;
pub mod config;
pub mod parent;
pub mod redirect;
pub mod registrar;


use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_ipc::ProcessRole;

pub use child::NeckoChild;
pub use config::NeckoConfig;
pub use parent::NeckoParent;
pub use redirect::ApproveRedirects;
pub use redirect::ChannelEventSink;
pub use redirect::OriginIsolationPolicy;
pub use redirect::ProcessListener;
pub use redirect::RedirectCoordinator;
pub use redirect::RedirectDestination;
pub use redirect::RedirectPolicy;
pub use redirect::SameProcessPolicy;
pub use registrar::RedirectRegistrar;

const MAX_IDLE_TURNS: usize = 10_000;

/// One side of the necko actor pair.
pub trait NeckoRegistry {
    fn role(&self) -> ProcessRole;

    /// Live actors owned by this registry.
    fn actor_count(&self) -> usize;

    /// Runs one event-loop turn and reports how much work it did.
    fn turn(&mut self) -> BrowserResult<usize>;

    /// Turns until a turn does no work. Only meaningful when the peer is
    /// quiet too.
    fn run_until_idle(&mut self) -> BrowserResult<usize> {
        let mut total = 0;
        for _ in 0..MAX_IDLE_TURNS {
            let progress = self.turn()?;
            if progress == 0 {
                return Ok(total);
            }
            total += progress;
        }
        Err(BrowserError::new(
            "necko.not_idle",
            format!(
                "{} registry still busy after {MAX_IDLE_TURNS} turns",
                self.role().as_str()
            ),
        ))
    }
}
