//! Speech model abstraction.
//!
//! The integrated executor calls a `SpeechModel` directly on a blocking
//! thread; everything above the executor only sees text or an error.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Failure reported by a speech model. Always terminal for the input that
/// produced it.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ModelFailure {
    pub message: String,
}

impl ModelFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A speech-to-text model. Implementations are expected to block; callers
/// run them on dedicated threads.
pub trait SpeechModel: Send + Sync {
    /// Transcribe mono f32 samples.
    fn transcribe(&self, samples: &[f32]) -> Result<String, ModelFailure>;

    /// Transcribe an audio file on disk.
    fn transcribe_file(&self, path: &Path) -> Result<String, ModelFailure> {
        let _ = path;
        Err(ModelFailure::new("file transcription not supported"))
    }

    /// Model name for logging.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Allow Arc-wrapped models to be used directly.
impl<T: SpeechModel + ?Sized> SpeechModel for std::sync::Arc<T> {
    fn transcribe(&self, samples: &[f32]) -> Result<String, ModelFailure> {
        (**self).transcribe(samples)
    }

    fn transcribe_file(&self, path: &Path) -> Result<String, ModelFailure> {
        (**self).transcribe_file(path)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Mock model for testing.
pub struct MockModel {
    responses: Mutex<Vec<Result<String, ModelFailure>>>,
    default_response: String,
    delay: Option<Duration>,
    call_count: AtomicU64,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            default_response: "mock transcription".to_string(),
            delay: None,
            call_count: AtomicU64::new(0),
        }
    }

    /// Queue a successful response. Responses are consumed in order; once
    /// exhausted the default response is returned.
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push(Ok(text.into()));
        self
    }

    /// Queue a failure.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push(Err(ModelFailure::new(message)));
        self
    }

    /// Sleep this long on every call, simulating inference time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> Result<String, ModelFailure> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut responses = self.responses.lock().expect("mock lock poisoned");
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            responses.remove(0)
        }
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechModel for MockModel {
    fn transcribe(&self, _samples: &[f32]) -> Result<String, ModelFailure> {
        self.next_response()
    }

    fn transcribe_file(&self, _path: &Path) -> Result<String, ModelFailure> {
        self.next_response()
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_returns_scripted_responses_in_order() {
        let model = MockModel::new()
            .with_response("first")
            .with_failure("boom")
            .with_response("third");

        assert_eq!(model.transcribe(&[]).unwrap(), "first");
        assert!(model.transcribe(&[]).is_err());
        assert_eq!(model.transcribe(&[]).unwrap(), "third");
        // Exhausted: falls back to the default.
        assert_eq!(model.transcribe(&[]).unwrap(), "mock transcription");
        assert_eq!(model.call_count(), 4);
    }

    #[test]
    fn arc_wrapped_model_is_a_model() {
        let model = std::sync::Arc::new(MockModel::new().with_response("via arc"));
        assert_eq!(model.transcribe(&[]).unwrap(), "via arc");
        assert_eq!(model.name(), "mock");
    }
}
