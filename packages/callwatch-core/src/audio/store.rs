//! Per-call rolling PCM buffers with WAV materialization.
//!
//! Each call gets an append-only ring of immutable chunks bounded by
//! wall-clock seconds. Eviction is FIFO on the chunk list after every append.
//! A best-effort disk mirror under `<audio_dir>/<call_id>/` survives process
//! restarts; correctness never depends on it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::audio::wav::create_wav_header;
use crate::utils::{atomic_write, millis_to_rfc3339, now_millis};

/// Sample width in bytes; the store only holds S16LE PCM.
const SAMPLE_WIDTH: u32 = 2;

/// One immutable chunk of PCM audio.
#[derive(Debug, Clone)]
struct AudioChunk {
    id: String,
    pcm: Bytes,
    duration_s: f64,
    received_at: u64,
}

/// Rolling buffer for a single call.
#[derive(Debug)]
struct CallBuffer {
    sample_rate: u32,
    channels: u16,
    chunks: VecDeque<AudioChunk>,
    total_duration_s: f64,
    updated_at: u64,
}

impl CallBuffer {
    fn new(sample_rate: u32, channels: u16, now_ms: u64) -> Self {
        Self {
            sample_rate,
            channels,
            chunks: VecDeque::new(),
            total_duration_s: 0.0,
            updated_at: now_ms,
        }
    }
}

/// Metadata snapshot of a call's rolling buffer.
#[derive(Debug, Clone, Serialize)]
pub struct AudioSnapshot {
    pub available: bool,
    pub duration_s: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_width: u32,
    pub chunk_count: usize,
    pub updated_at: Option<String>,
    pub last_chunk_id: Option<String>,
    pub window_seconds: u32,
}

impl AudioSnapshot {
    fn empty(window_seconds: u32) -> Self {
        Self {
            available: false,
            duration_s: 0.0,
            sample_rate: 0,
            channels: 0,
            sample_width: 0,
            chunk_count: 0,
            updated_at: None,
            last_chunk_id: None,
            window_seconds,
        }
    }
}

/// Chunk metadata persisted in the disk mirror's `state.json`.
#[derive(Debug, Serialize, Deserialize)]
struct MirrorChunk {
    id: String,
    duration_s: f64,
    received_at: u64,
}

/// Buffer metadata persisted in the disk mirror's `state.json`.
#[derive(Debug, Serialize, Deserialize)]
struct MirrorState {
    sample_rate: u32,
    channels: u16,
    updated_at: u64,
    chunks: Vec<MirrorChunk>,
}

/// In-memory rolling audio store shared across the ingest API and workers.
pub struct LiveAudioStore {
    buffers: DashMap<String, CallBuffer>,
    /// Global sequence for chunk id allocation.
    next_seq: AtomicU64,
    window_seconds: u32,
    /// Mirror directory; `None` disables persistence entirely.
    audio_dir: Option<PathBuf>,
}

impl LiveAudioStore {
    /// Creates a store with the given rolling window and optional disk mirror.
    pub fn new(window_seconds: u32, audio_dir: Option<PathBuf>) -> Self {
        Self {
            buffers: DashMap::new(),
            next_seq: AtomicU64::new(1),
            window_seconds,
            audio_dir,
        }
    }

    /// Appends a PCM chunk for a call and returns its chunk id.
    ///
    /// A sample-rate or channel-count change closes the existing buffer and
    /// starts a new one; media format changes are legal only at chunk
    /// boundaries, so this is the safe interpretation of a mismatch.
    pub fn append(
        &self,
        call_id: &str,
        pcm: Bytes,
        sample_rate: u32,
        channels: u16,
    ) -> String {
        let now_ms = now_millis();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let chunk_id = format!("{}_{}", now_ms, seq);

        let bytes_per_second = sample_rate as f64 * channels as f64 * SAMPLE_WIDTH as f64;
        let duration_s = if bytes_per_second > 0.0 {
            pcm.len() as f64 / bytes_per_second
        } else {
            0.0
        };

        let chunk = AudioChunk {
            id: chunk_id.clone(),
            pcm,
            duration_s,
            received_at: now_ms,
        };

        let mut entry = self
            .buffers
            .entry(call_id.to_string())
            .or_insert_with(|| self.recover_or_create(call_id, sample_rate, channels, now_ms));

        let buffer = entry.value_mut();
        if buffer.sample_rate != sample_rate || buffer.channels != channels {
            log::info!(
                "[AudioStore] Format change for {}: {}Hz/{}ch -> {}Hz/{}ch, restarting buffer",
                call_id,
                buffer.sample_rate,
                buffer.channels,
                sample_rate,
                channels
            );
            *buffer = CallBuffer::new(sample_rate, channels, now_ms);
            self.clear_mirror(call_id);
        }

        let mut evicted = Vec::new();
        buffer.total_duration_s += chunk.duration_s;
        buffer.updated_at = now_ms;
        buffer.chunks.push_back(chunk.clone());

        // FIFO eviction: keep total duration within the window. The newest
        // chunk always stays, so the bound is window + one chunk's worth.
        while buffer.total_duration_s > self.window_seconds as f64 && buffer.chunks.len() > 1 {
            if let Some(old) = buffer.chunks.pop_front() {
                buffer.total_duration_s -= old.duration_s;
                evicted.push(old.id);
            }
        }

        self.mirror_append(call_id, buffer, &chunk, &evicted);

        chunk_id
    }

    /// Returns buffer metadata for a call, or an empty snapshot.
    #[must_use]
    pub fn snapshot(&self, call_id: &str) -> AudioSnapshot {
        match self.buffers.get(call_id) {
            Some(buffer) if !buffer.chunks.is_empty() => AudioSnapshot {
                available: true,
                duration_s: buffer.total_duration_s,
                sample_rate: buffer.sample_rate,
                channels: buffer.channels,
                sample_width: SAMPLE_WIDTH,
                chunk_count: buffer.chunks.len(),
                updated_at: Some(millis_to_rfc3339(buffer.updated_at)),
                last_chunk_id: buffer.chunks.back().map(|c| c.id.clone()),
                window_seconds: self.window_seconds,
            },
            _ => AudioSnapshot::empty(self.window_seconds),
        }
    }

    /// Renders the rolling window as a complete WAV file.
    ///
    /// Returns `None` when the call has no buffered audio; callers fall back
    /// to an external recording.
    #[must_use]
    pub fn render_wav(&self, call_id: &str) -> Option<Bytes> {
        let buffer = self.buffers.get(call_id)?;
        if buffer.chunks.is_empty() {
            return None;
        }
        let data_len: usize = buffer.chunks.iter().map(|c| c.pcm.len()).sum();
        let header = create_wav_header(buffer.sample_rate, buffer.channels, data_len as u32);
        let mut wav = Vec::with_capacity(44 + data_len);
        wav.extend_from_slice(&header);
        for chunk in &buffer.chunks {
            wav.extend_from_slice(&chunk.pcm);
        }
        Some(Bytes::from(wav))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Disk mirror (best-effort)
    // ─────────────────────────────────────────────────────────────────────

    fn call_dir(&self, call_id: &str) -> Option<PathBuf> {
        // Guard against path traversal through upstream-controlled ids.
        let safe: String = call_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.audio_dir.as_ref().map(|dir| dir.join(safe))
    }

    /// Rebuilds a buffer from the disk mirror, or creates a fresh one.
    fn recover_or_create(
        &self,
        call_id: &str,
        sample_rate: u32,
        channels: u16,
        now_ms: u64,
    ) -> CallBuffer {
        let Some(dir) = self.call_dir(call_id) else {
            return CallBuffer::new(sample_rate, channels, now_ms);
        };
        match Self::load_mirror(&dir) {
            Some(buffer) if buffer.sample_rate == sample_rate && buffer.channels == channels => {
                log::info!(
                    "[AudioStore] Recovered {} chunk(s) for {} from mirror",
                    buffer.chunks.len(),
                    call_id
                );
                buffer
            }
            _ => CallBuffer::new(sample_rate, channels, now_ms),
        }
    }

    fn load_mirror(dir: &Path) -> Option<CallBuffer> {
        let raw = std::fs::read_to_string(dir.join("state.json")).ok()?;
        let state: MirrorState = serde_json::from_str(&raw).ok()?;
        let mut chunks = VecDeque::with_capacity(state.chunks.len());
        let mut total = 0.0;
        for meta in state.chunks {
            let pcm = std::fs::read(dir.join(format!("{}.pcm", meta.id))).ok()?;
            total += meta.duration_s;
            chunks.push_back(AudioChunk {
                id: meta.id,
                pcm: Bytes::from(pcm),
                duration_s: meta.duration_s,
                received_at: meta.received_at,
            });
        }
        Some(CallBuffer {
            sample_rate: state.sample_rate,
            channels: state.channels,
            chunks,
            total_duration_s: total,
            updated_at: state.updated_at,
        })
    }

    fn mirror_append(
        &self,
        call_id: &str,
        buffer: &CallBuffer,
        chunk: &AudioChunk,
        evicted: &[String],
    ) {
        let Some(dir) = self.call_dir(call_id) else {
            return;
        };
        let state = MirrorState {
            sample_rate: buffer.sample_rate,
            channels: buffer.channels,
            updated_at: buffer.updated_at,
            chunks: buffer
                .chunks
                .iter()
                .map(|c| MirrorChunk {
                    id: c.id.clone(),
                    duration_s: c.duration_s,
                    received_at: c.received_at,
                })
                .collect(),
        };
        let result = std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::write(dir.join(format!("{}.pcm", chunk.id)), &chunk.pcm))
            .and_then(|_| {
                atomic_write(
                    &dir.join("state.json"),
                    serde_json::to_string(&state).unwrap_or_default().as_bytes(),
                )
            });
        if let Err(e) = result {
            log::warn!("[AudioStore] Mirror write failed for {}: {}", call_id, e);
            return;
        }
        for id in evicted {
            let _ = std::fs::remove_file(dir.join(format!("{}.pcm", id)));
        }
    }

    fn clear_mirror(&self, call_id: &str) {
        if let Some(dir) = self.call_dir(call_id) {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of_ms(ms: u32, sample_rate: u32, channels: u16) -> Bytes {
        let len = (sample_rate as usize * channels as usize * 2 * ms as usize) / 1000;
        Bytes::from(vec![0u8; len])
    }

    #[test]
    fn append_returns_monotonic_chunk_ids() {
        let store = LiveAudioStore::new(300, None);
        let a = store.append("RT-1", pcm_of_ms(100, 8000, 1), 8000, 1);
        let b = store.append("RT-1", pcm_of_ms(100, 8000, 1), 8000, 1);
        let seq_a: u64 = a.rsplit('_').next().unwrap().parse().unwrap();
        let seq_b: u64 = b.rsplit('_').next().unwrap().parse().unwrap();
        assert!(seq_b > seq_a);
    }

    #[test]
    fn rotation_keeps_duration_within_window() {
        // Window 1s, six 400ms chunks: duration must land in [1.0, 1.4]
        // and at most 3 chunks survive.
        let store = LiveAudioStore::new(1, None);
        for _ in 0..6 {
            store.append("RT-1", pcm_of_ms(400, 16_000, 1), 16_000, 1);
        }
        let snap = store.snapshot("RT-1");
        assert!(snap.available);
        assert!(
            (1.0..=1.4).contains(&snap.duration_s),
            "duration {} outside window bound",
            snap.duration_s
        );
        assert!(snap.chunk_count <= 3, "chunk_count {}", snap.chunk_count);
    }

    #[test]
    fn snapshot_for_unknown_call_is_empty() {
        let store = LiveAudioStore::new(300, None);
        let snap = store.snapshot("nope");
        assert!(!snap.available);
        assert_eq!(snap.chunk_count, 0);
        assert_eq!(snap.sample_rate, 0);
        assert_eq!(snap.window_seconds, 300);
    }

    #[test]
    fn format_change_restarts_buffer() {
        let store = LiveAudioStore::new(300, None);
        store.append("RT-1", pcm_of_ms(200, 8000, 1), 8000, 1);
        store.append("RT-1", pcm_of_ms(200, 16_000, 1), 16_000, 1);
        let snap = store.snapshot("RT-1");
        assert_eq!(snap.sample_rate, 16_000);
        assert_eq!(snap.chunk_count, 1);
    }

    #[test]
    fn rendered_wav_length_matches_chunks() {
        let store = LiveAudioStore::new(300, None);
        store.append("RT-1", pcm_of_ms(100, 8000, 1), 8000, 1);
        store.append("RT-1", pcm_of_ms(150, 8000, 1), 8000, 1);
        let expected_data = pcm_of_ms(100, 8000, 1).len() + pcm_of_ms(150, 8000, 1).len();
        let wav = store.render_wav("RT-1").unwrap();
        assert_eq!(wav.len(), 44 + expected_data);
        let declared =
            u32::from_le_bytes(wav[40..44].try_into().unwrap()) as usize;
        assert_eq!(declared, expected_data);
    }

    #[test]
    fn render_wav_missing_call_is_none() {
        let store = LiveAudioStore::new(300, None);
        assert!(store.render_wav("nope").is_none());
    }

    #[test]
    fn mirror_persists_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = pcm_of_ms(200, 8000, 1);
        {
            let store = LiveAudioStore::new(300, Some(dir.path().to_path_buf()));
            store.append("RT-9", chunk.clone(), 8000, 1);
        }
        // A new store instance recovers the mirrored chunk on first append.
        let store = LiveAudioStore::new(300, Some(dir.path().to_path_buf()));
        store.append("RT-9", chunk.clone(), 8000, 1);
        let snap = store.snapshot("RT-9");
        assert_eq!(snap.chunk_count, 2);
    }
}
