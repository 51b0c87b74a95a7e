//! Logging [`DisplayService`] for headless deployments.
//!
//! The node binary does not render anything itself; embedders supply a
//! real windowing implementation.  This adapter records what the window
//! layer *would* do, which is also what the integration tests assert on.

use async_trait::async_trait;
use tracing::info;

use crate::application::command_dispatch::DisplayService;

/// Display adapter that logs every window operation and reports success.
#[derive(Debug, Default)]
pub struct LogDisplay;

#[async_trait]
impl DisplayService for LogDisplay {
    async fn open_window(&self, url: &str, fullscreen: bool) -> Result<(), String> {
        info!("display: open presentation window url={url} fullscreen={fullscreen}");
        Ok(())
    }

    async fn close_window(&self) -> Result<(), String> {
        info!("display: close presentation window");
        Ok(())
    }

    async fn open_additional_screens(&self, url: &str) -> Result<(), String> {
        info!("display: mirror presentation onto additional screens url={url}");
        Ok(())
    }

    async fn show_default_screens(&self) -> Result<(), String> {
        info!("display: restore additional screens to default content");
        Ok(())
    }
}
