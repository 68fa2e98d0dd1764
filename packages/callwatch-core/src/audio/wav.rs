use bytes::{BufMut, Bytes, BytesMut};

/// Generates a canonical 44-byte WAVE header for a finite LPCM payload.
///
/// @param sample_rate - Typically 8000 or 16000 for telephony media.
/// @param channels - 1 (mono) or 2 (stereo).
/// @param data_len - Exact byte length of the PCM payload that follows.
pub fn create_wav_header(sample_rate: u32, channels: u16, data_len: u32) -> Bytes {
    const BITS_PER_SAMPLE: u16 = 16;

    let mut header = BytesMut::with_capacity(44);

    let bytes_per_sample = BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * channels as u32 * bytes_per_sample as u32;
    let block_align = channels * bytes_per_sample;

    // RIFF header
    header.put_slice(b"RIFF");
    header.put_u32_le(36 + data_len); // Remaining file size
    header.put_slice(b"WAVE");

    // fmt chunk
    header.put_slice(b"fmt ");
    header.put_u32_le(16); // Chunk size
    header.put_u16_le(1); // Audio format (PCM)
    header.put_u16_le(channels);
    header.put_u32_le(sample_rate);
    header.put_u32_le(byte_rate);
    header.put_u16_le(block_align);
    header.put_u16_le(BITS_PER_SAMPLE);

    // data chunk
    header.put_slice(b"data");
    header.put_u32_le(data_len);

    header.freeze()
}

/// Strips a RIFF/WAVE container down to its PCM payload.
///
/// Returns the bytes following the `data` chunk header when the buffer is a
/// well-formed WAV, or the input unchanged when it isn't (raw PCM callers
/// sometimes label payloads "wav" without a container).
#[must_use]
pub fn strip_wav_header(payload: &[u8]) -> &[u8] {
    if payload.len() < 12 || &payload[0..4] != b"RIFF" || &payload[8..12] != b"WAVE" {
        return payload;
    }

    // Walk chunks until `data`; chunk sizes are little-endian u32.
    let mut offset = 12;
    while offset + 8 <= payload.len() {
        let chunk_id = &payload[offset..offset + 4];
        let chunk_len = u32::from_le_bytes([
            payload[offset + 4],
            payload[offset + 5],
            payload[offset + 6],
            payload[offset + 7],
        ]) as usize;
        if chunk_id == b"data" {
            let start = offset + 8;
            let end = (start + chunk_len).min(payload.len());
            return &payload[start..end];
        }
        offset += 8 + chunk_len + (chunk_len & 1);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_exactly_44_bytes_with_accurate_sizes() {
        let header = create_wav_header(16_000, 1, 3200);
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(header[4..8].try_into().unwrap()), 3236);
        assert_eq!(&header[8..12], b"WAVE");
        // fmt tag 1 = PCM
        assert_eq!(u16::from_le_bytes(header[20..22].try_into().unwrap()), 1);
        assert_eq!(
            u32::from_le_bytes(header[24..28].try_into().unwrap()),
            16_000
        );
        assert_eq!(
            u32::from_le_bytes(header[40..44].try_into().unwrap()),
            3200
        );
    }

    #[test]
    fn strip_round_trips_generated_header() {
        let pcm: Vec<u8> = (0u8..=255).collect();
        let mut wav = create_wav_header(8000, 1, pcm.len() as u32).to_vec();
        wav.extend_from_slice(&pcm);
        assert_eq!(strip_wav_header(&wav), pcm.as_slice());
    }

    #[test]
    fn strip_leaves_raw_pcm_untouched() {
        let raw = vec![1u8, 2, 3, 4];
        assert_eq!(strip_wav_header(&raw), raw.as_slice());
    }

    #[test]
    fn strip_skips_non_data_chunks() {
        // RIFF + LIST chunk before data
        let pcm = [9u8, 8, 7, 6];
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(4 + 8 + 4 + 8 + 4u32).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"LIST");
        wav.extend_from_slice(&4u32.to_le_bytes());
        wav.extend_from_slice(b"INFO");
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&4u32.to_le_bytes());
        wav.extend_from_slice(&pcm);
        assert_eq!(strip_wav_header(&wav), pcm.as_slice());
    }
}
