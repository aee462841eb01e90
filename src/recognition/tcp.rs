//! TCP recognizer backend
//!
//! Wire protocol: one JSON handshake line describing the speaker, then
//! raw PCM16-LE frames client to server, newline-delimited JSON
//! hypothesis events server to client. Multiple recognizer processes
//! can be configured; streams are assigned round-robin.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::PcmFrame;
use crate::config::RecognitionConfig;
use crate::error::RecognitionError;
use crate::protocol::SpeakerInfo;
use crate::recognition::backend::{RecognizerBackend, RecognizerConnection, RecognizerSink};
use crate::recognition::RecognitionEvent;

/// Depth of the event channel between the reader task and the session.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Serialize)]
struct Handshake<'a> {
    speaker_id: &'a str,
    language: &'a str,
    sample_rate: u32,
    format: &'static str,
}

/// Round-robin TCP backend.
pub struct TcpRecognizer {
    servers: Vec<String>,
    connect_timeout: std::time::Duration,
    next_server: AtomicUsize,
}

impl TcpRecognizer {
    pub fn new(config: &RecognitionConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            connect_timeout: config.connect_timeout(),
            next_server: AtomicUsize::new(0),
        }
    }

    fn pick_server(&self) -> Result<&str, RecognitionError> {
        if self.servers.is_empty() {
            return Err(RecognitionError::ConnectFailed(
                "no recognizer servers configured".into(),
            ));
        }
        let index = self.next_server.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        Ok(&self.servers[index])
    }
}

#[async_trait]
impl RecognizerBackend for TcpRecognizer {
    async fn open_stream(
        &self,
        speaker: &SpeakerInfo,
        sample_rate: u32,
    ) -> Result<RecognizerConnection, RecognitionError> {
        let addr = self.pick_server()?.to_string();
        debug!(speaker = %speaker.speaker_id, %addr, "connecting to recognizer");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RecognitionError::Timeout)?
            .map_err(|e| RecognitionError::ConnectFailed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| RecognitionError::ConnectFailed(format!("{addr}: {e}")))?;

        let (read_half, mut write_half) = stream.into_split();

        let hello = Handshake {
            speaker_id: &speaker.speaker_id,
            language: speaker.source_language.as_str(),
            sample_rate,
            format: "pcm_s16le",
        };
        let mut line = serde_json::to_string(&hello)
            .map_err(|e| RecognitionError::Handshake(e.to_string()))?;
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RecognitionError::Handshake(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let speaker_id = speaker.speaker_id.clone();
        tokio::spawn(read_events(read_half, tx, speaker_id));

        info!(speaker = %speaker.speaker_id, %addr, "recognizer stream open");
        Ok(RecognizerConnection {
            sink: Box::new(TcpSink { write_half }),
            events: rx,
        })
    }
}

struct TcpSink {
    write_half: OwnedWriteHalf,
}

#[async_trait]
impl RecognizerSink for TcpSink {
    async fn send_audio(&mut self, frame: &PcmFrame) -> Result<(), RecognitionError> {
        let bytes = frame.to_le_bytes();
        self.write_half
            .write_all(&bytes)
            .await
            .map_err(|_| RecognitionError::StreamClosed)?;
        self.write_half
            .flush()
            .await
            .map_err(|_| RecognitionError::StreamClosed)?;
        Ok(())
    }

    async fn finish(&mut self) {
        // FIN tells the recognizer no more audio is coming
        let _ = self.write_half.shutdown().await;
    }
}

async fn read_events(
    read_half: OwnedReadHalf,
    tx: mpsc::Sender<RecognitionEvent>,
    speaker_id: String,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(speaker = %speaker_id, "recognizer closed the stream");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RecognitionEvent>(trimmed) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(speaker = %speaker_id, error = %e, line = trimmed, "unparseable recognizer event");
                    }
                }
            }
            Err(e) => {
                warn!(speaker = %speaker_id, error = %e, "recognizer read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::protocol::LanguageCode;

    fn speaker() -> SpeakerInfo {
        SpeakerInfo {
            speaker_id: "s1".into(),
            speaker_name: "Ana".into(),
            source_language: LanguageCode::new("es"),
        }
    }

    #[tokio::test]
    async fn handshake_audio_and_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);

            let mut hello = String::new();
            reader.read_line(&mut hello).await.unwrap();
            let hello: serde_json::Value = serde_json::from_str(&hello).unwrap();
            assert_eq!(hello["speaker_id"], "s1");
            assert_eq!(hello["language"], "es");
            assert_eq!(hello["sample_rate"], 16_000);
            assert_eq!(hello["format"], "pcm_s16le");

            // Two PCM16 samples
            let mut pcm = [0u8; 4];
            reader.read_exact(&mut pcm).await.unwrap();
            assert_eq!(pcm, [0x01, 0x00, 0xFE, 0xFF]);

            write_half
                .write_all(b"{\"type\":\"interim\",\"text\":\"ho\",\"confidence\":0.7}\n")
                .await
                .unwrap();
            write_half
                .write_all(b"not json\n{\"type\":\"final\",\"text\":\"hola\"}\n")
                .await
                .unwrap();
        });

        let config = RecognitionConfig {
            servers: vec![addr.to_string()],
            ..RecognitionConfig::default()
        };
        let backend = TcpRecognizer::new(&config);
        let mut conn = backend.open_stream(&speaker(), 16_000).await.unwrap();

        let frame = PcmFrame {
            samples: vec![1, -2],
            sample_rate: 16_000,
            captured_at: chrono::Utc::now(),
        };
        conn.sink.send_audio(&frame).await.unwrap();

        let first = conn.events.recv().await.unwrap();
        assert_eq!(first.text(), "ho");
        assert!(!first.is_final());

        // The garbage line is skipped, not fatal
        let second = conn.events.recv().await.unwrap();
        assert_eq!(second.text(), "hola");
        assert!(second.is_final());

        server.await.unwrap();
        // Server side done; channel must close
        assert!(conn.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn streams_are_assigned_round_robin() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();

        let accept_a = tokio::spawn(async move { a.accept().await.map(|_| ()).is_ok() });
        let accept_b = tokio::spawn(async move { b.accept().await.map(|_| ()).is_ok() });

        let config = RecognitionConfig {
            servers: vec![addr_a.to_string(), addr_b.to_string()],
            ..RecognitionConfig::default()
        };
        let backend = TcpRecognizer::new(&config);
        let _first = backend.open_stream(&speaker(), 16_000).await.unwrap();
        let _second = backend.open_stream(&speaker(), 16_000).await.unwrap();

        assert!(accept_a.await.unwrap());
        assert!(accept_b.await.unwrap());
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let config = RecognitionConfig {
            // Reserved port that nothing listens on
            servers: vec!["127.0.0.1:1".to_string()],
            connect_timeout_ms: 500,
            ..RecognitionConfig::default()
        };
        let backend = TcpRecognizer::new(&config);
        let err = backend.open_stream(&speaker(), 16_000).await.unwrap_err();
        assert!(matches!(
            err,
            RecognitionError::ConnectFailed(_) | RecognitionError::Timeout
        ));
    }
}
