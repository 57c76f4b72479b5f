//! Text-to-speech (TTS) processing

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{Pcm, decode_audio};
use crate::config::VoiceConfig;
use crate::{Error, Result};

/// Turns reply text into audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` to mono PCM
    ///
    /// # Errors
    ///
    /// Returns `Tts` if synthesis or decoding fails
    async fn synthesize(&self, text: &str) -> Result<Pcm>;
}

/// Synthesizes via `POST {base_url}/audio/speech`
///
/// Works with local servers such as Kokoro-FastAPI or openedai-speech as
/// well as hosted APIs. WAV is requested; MP3 responses are also decoded.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    voice: String,
    speed: f32,
    api_key: Option<SecretString>,
}

impl HttpSynthesizer {
    /// Create a synthesizer from voice configuration
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
            base_url: config.tts_base_url.trim_end_matches('/').to_string(),
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
            speed: config.tts_speed,
            api_key: config.api_key.clone(),
        })
    }
}

#[derive(serde::Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'a str,
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Pcm> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "wav",
        };

        let mut builder = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Tts(format!("speech request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("speech API error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Tts(format!("speech body: {e}")))?;
        tracing::debug!(audio_bytes = audio.len(), chars = text.len(), "speech synthesized");

        decode_audio(&audio).map_err(|e| Error::Tts(e.to_string()))
    }
}
