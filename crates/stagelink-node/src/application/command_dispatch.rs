//! Dispatch of incoming peer commands to the presentation display service.
//!
//! The command channel hands every `peer-command` frame to
//! [`CommandDispatcher::dispatch`].  Commands are best-effort: a display
//! failure or an unusable URL is logged and reported, never propagated back
//! into the channel (a master must not be able to wedge the follower's
//! reconciliation loop with a bad command).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use stagelink_core::{PairedMaster, PeerCommand, ResolvedEndpoint};

use crate::application::resolve_url::resolve_command_url;

/// The window-management surface commands are dispatched to.
///
/// The node ships a logging implementation; a deployment substitutes the
/// adapter for its actual presentation windows.  Implementations report
/// failures as strings; the dispatcher logs them and moves on.
#[async_trait]
pub trait DisplayService: Send + Sync {
    /// Shows the presentation served at `url` in the main window.
    async fn open_window(&self, url: &str, fullscreen: bool) -> Result<(), String>;

    /// Closes the presentation window and any additional-screen windows.
    async fn close_window(&self) -> Result<(), String>;

    /// Mirrors `url` onto the configured additional screens.
    async fn open_additional_screens(&self, url: &str) -> Result<(), String>;

    /// Returns the additional screens to their default idle content.
    async fn show_default_screens(&self) -> Result<(), String>;
}

/// Local display behaviour, read from the `[display]` configuration section.
#[derive(Debug, Clone)]
pub struct DisplayPolicy {
    /// When `true`, `close-presentation` loads idle content instead of
    /// closing windows.
    pub keep_screens_open: bool,
    /// Whether commands are mirrored onto additional screens.
    pub use_additional_screens: bool,
    /// What the main window shows when a presentation is closed in
    /// keep-screens-open mode.
    pub idle_url: String,
    pub fullscreen: bool,
}

impl Default for DisplayPolicy {
    fn default() -> Self {
        Self {
            keep_screens_open: false,
            use_additional_screens: false,
            idle_url: "about:blank".to_string(),
            fullscreen: true,
        }
    }
}

/// Turns parsed peer commands into display service calls.
pub struct CommandDispatcher {
    display: Arc<dyn DisplayService>,
    policy: DisplayPolicy,
}

impl CommandDispatcher {
    pub fn new(display: Arc<dyn DisplayService>, policy: DisplayPolicy) -> Self {
        Self { display, policy }
    }

    /// Executes one command from `master`, resolving presentation URLs
    /// against `endpoint` (the address the command channel actually used).
    pub async fn dispatch(
        &self,
        command: PeerCommand,
        master: &PairedMaster,
        endpoint: Option<&ResolvedEndpoint>,
    ) {
        match command {
            PeerCommand::OpenPresentation { url } => {
                let target = match resolve_command_url(master, endpoint, &url) {
                    Ok(resolved) => {
                        if resolved.decision.enabled {
                            info!(
                                "rewrote presentation url from {} toward {} ({})",
                                url,
                                resolved.url,
                                resolved.decision.reason.as_str()
                            );
                        } else {
                            debug!(
                                "presentation url kept as-is ({})",
                                resolved.decision.reason.as_str()
                            );
                        }
                        resolved.url
                    }
                    Err(e) => {
                        warn!("using presentation url from {} unresolved: {e}", master.name);
                        url
                    }
                };

                if let Err(e) = self.display.open_window(&target, self.policy.fullscreen).await {
                    warn!("failed to open presentation window: {e}");
                }
                if self.policy.use_additional_screens {
                    if let Err(e) = self.display.open_additional_screens(&target).await {
                        warn!("failed to open additional screens: {e}");
                    }
                }
            }
            PeerCommand::ClosePresentation => {
                if self.policy.keep_screens_open {
                    // Keep the windows up, swap in the idle content.
                    if let Err(e) = self
                        .display
                        .open_window(&self.policy.idle_url, self.policy.fullscreen)
                        .await
                    {
                        warn!("failed to show idle content: {e}");
                    }
                    if self.policy.use_additional_screens {
                        if let Err(e) = self.display.show_default_screens().await {
                            warn!("failed to reset additional screens: {e}");
                        }
                    }
                } else if let Err(e) = self.display.close_window().await {
                    warn!("failed to close presentation window: {e}");
                }
            }
            PeerCommand::Unknown { kind } => {
                // Forward-compatible no-op.
                debug!("ignoring unknown peer command type {kind:?} from {}", master.name);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
