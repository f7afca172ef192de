//! Completion notification hook.
//!
//! Delivery (e-mail in production) is an external collaborator; the core
//! only guarantees the hook fires exactly once per completed processing,
//! from the join winner's cleanup.

use quarry_protocol::UploadRecord;
use std::sync::Mutex;

pub trait Notifier: Send + Sync {
    fn processing_completed(&self, upload: &UploadRecord);
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn processing_completed(&self, _upload: &UploadRecord) {}
}

/// Records notifications for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notified.lock().expect("notifier lock poisoned").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn processing_completed(&self, upload: &UploadRecord) {
        self.notified
            .lock()
            .expect("notifier lock poisoned")
            .push(upload.upload_id.to_string());
    }
}
