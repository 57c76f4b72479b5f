//! Speech-to-text (STT) processing

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::samples_to_wav;
use crate::config::VoiceConfig;
use crate::{Error, Result};

/// Turns one utterance into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe mono samples
    ///
    /// # Errors
    ///
    /// Returns `Stt` if transcription fails
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String>;
}

/// Response from an OpenAI-compatible transcription endpoint
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcribes via `POST {base_url}/audio/transcriptions`
///
/// Works with local Whisper servers (faster-whisper-server, whisper.cpp)
/// as well as hosted APIs.
pub struct HttpTranscriber {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl HttpTranscriber {
    /// Create a transcriber from voice configuration
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &VoiceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.transcribe_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.stt_base_url.trim_end_matches('/').to_string(),
            model: config.stt_model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
        let audio = samples_to_wav(samples, sample_rate)?;
        tracing::debug!(audio_bytes = audio.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("response_format", "json");

        let mut request = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            Error::Stt(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Stt(format!("transcription API error {status}: {body}")));
        }

        let result: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| Error::Stt(format!("malformed transcription response: {e}")))?;

        let text = result.text.trim().to_string();
        tracing::info!(transcript = %text, "transcription complete");
        Ok(text)
    }
}
