//! Settings loop: persists what the supervisor learns about the host.
//!
//! After every capability check the supervisor sends one internal message
//! carrying the resolved music directory and whether it is reachable locally.
//! This loop is its only consumer; the message is never relayed to clients.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;

use crate::api::Response;
use crate::config::StateStore;
use crate::error::{EngineError, Result};
use crate::job_queue::JobQueue;

/// State key holding the resolved music directory
pub const MUSIC_DIRECTORY_VALUE: &str = "music_directory_value";
/// State key holding the library feature flag
pub const FEAT_LIBRARY: &str = "feat_library";

const WAIT: Duration = Duration::from_millis(250);

pub struct SettingsLoop {
    store: StateStore,
    internal: Arc<JobQueue<Response>>,
}

impl SettingsLoop {
    pub fn new(store: StateStore, internal: Arc<JobQueue<Response>>) -> Self {
        Self { store, internal }
    }

    pub fn run(&self, stop: impl Fn() -> bool) {
        debug!("Settings loop started");
        while !stop() {
            if let Some(message) = self.internal.shift(WAIT) {
                if let Err(e) = self.handle(&message) {
                    warn!("Can not apply internal message: {e}");
                }
            }
        }
        for message in self.internal.drain() {
            if let Err(e) = self.handle(&message) {
                warn!("Can not apply internal message: {e}");
            }
        }
        debug!("Settings loop stopped");
    }

    /// Apply one internal message
    pub fn handle(&self, message: &Response) -> Result<()> {
        let body = message.json()?;
        match body["method"].as_str() {
            Some("bootstrap") => self.apply_bootstrap(&body["params"]),
            other => Err(EngineError::Validation(format!(
                "unexpected internal message {other:?}"
            ))),
        }
    }

    fn apply_bootstrap(&self, params: &Value) -> Result<()> {
        let music_directory = params["musicDirectory"].as_str().unwrap_or("none");
        let feat_library = params["featLibrary"].as_bool().unwrap_or(false);
        self.store.write(MUSIC_DIRECTORY_VALUE, music_directory)?;
        self.store.write(FEAT_LIBRARY, &feat_library.to_string())?;
        info!("Music directory is {music_directory}, library access {feat_library}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Notification;
    use tempfile::TempDir;

    fn create_test_loop() -> (TempDir, SettingsLoop, Arc<JobQueue<Response>>) {
        let dir = TempDir::new().unwrap();
        let internal = Arc::new(JobQueue::new("internal"));
        let settings = SettingsLoop::new(StateStore::new(dir.path()), Arc::clone(&internal));
        (dir, settings, internal)
    }

    #[test]
    fn test_bootstrap_is_persisted() {
        let (_dir, settings, _internal) = create_test_loop();
        let message = Notification::Bootstrap {
            music_directory: Some("/srv/music".to_string()),
            feat_library: true,
        }
        .into_response();
        settings.handle(&message).unwrap();
        assert_eq!(
            settings.store.read_string(MUSIC_DIRECTORY_VALUE, "").unwrap(),
            "/srv/music"
        );
        assert!(settings.store.read_bool(FEAT_LIBRARY, false).unwrap());
    }

    #[test]
    fn test_missing_directory_stored_as_none() {
        let (_dir, settings, _internal) = create_test_loop();
        let message = Notification::Bootstrap {
            music_directory: None,
            feat_library: false,
        }
        .into_response();
        settings.handle(&message).unwrap();
        assert_eq!(
            settings.store.read_string(MUSIC_DIRECTORY_VALUE, "").unwrap(),
            "none"
        );
    }

    #[test]
    fn test_other_messages_rejected() {
        let (_dir, settings, _internal) = create_test_loop();
        let message = Notification::UpdateOptions.into_response();
        assert!(matches!(
            settings.handle(&message),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_run_drains_queue_on_stop() {
        let (_dir, settings, internal) = create_test_loop();
        internal.push(
            Notification::Bootstrap {
                music_directory: Some("/music".to_string()),
                feat_library: false,
            }
            .into_response(),
        );
        settings.run(|| true);
        assert!(internal.is_empty());
        assert_eq!(
            settings.store.read_string(MUSIC_DIRECTORY_VALUE, "").unwrap(),
            "/music"
        );
    }
}
