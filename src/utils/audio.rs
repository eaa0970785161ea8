use anyhow::{anyhow, Result};
use std::ops::Range;
use std::time::Duration;

/// Sample layout used when a silence has no real segment to copy from:
/// 24 kHz mono 16-bit PCM, what Kokoro and Orpheus emit.
const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Concatenates stream-based encodings (MP3) byte for byte.
pub fn merge_binary(segments: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(segments.iter().map(|s| s.len()).sum());
    for segment in segments {
        out.extend_from_slice(segment);
    }
    out
}

struct WavInfo {
    fmt: Vec<u8>,
    data: Range<usize>,
}

impl WavInfo {
    fn byte_rate(&self) -> Option<u32> {
        self.fmt
            .get(8..12)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .filter(|rate| *rate > 0)
    }

    fn block_align(&self) -> usize {
        self.fmt
            .get(12..14)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .filter(|align| *align > 0)
            .unwrap_or(1)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    if bytes.get(0..4) != Some(b"RIFF".as_slice()) {
        return Err(anyhow!("Not a RIFF file"));
    }
    if bytes.get(8..12) != Some(b"WAVE".as_slice()) {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = read_u32(bytes, pos + 4).unwrap_or(0) as usize;
        let body = pos + 8;
        if id == b"fmt " {
            let end = body + size;
            fmt = Some(
                bytes
                    .get(body..end)
                    .ok_or_else(|| anyhow!("Truncated fmt chunk"))?
                    .to_vec(),
            );
        } else if id == b"data" {
            // Streamed WAVs carry a placeholder size; trust the buffer instead.
            let end = body.saturating_add(size).min(bytes.len());
            return Ok(WavInfo {
                fmt: fmt.ok_or_else(|| anyhow!("Missing fmt chunk before data"))?,
                data: body..end,
            });
        }
        // Chunks are word aligned.
        pos = body.saturating_add(size + (size & 1));
    }
    Err(anyhow!("Missing data chunk"))
}

fn write_wav(fmt: &[u8], data_len: usize, out: &mut Vec<u8>) {
    let riff_size = 4 + 8 + fmt.len() + 8 + data_len;
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(riff_size as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&(fmt.len() as u32).to_le_bytes());
    out.extend_from_slice(fmt);
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
}

/// Merges WAV buffers by concatenating their data chunks under one header.
/// All inputs must share the same `fmt` chunk.
pub fn merge_wav(segments: &[&[u8]]) -> Result<Vec<u8>> {
    let Some(first) = segments.first() else {
        return Ok(Vec::new());
    };
    let base = scan_wav(first)?;
    let mut infos = Vec::with_capacity(segments.len());
    infos.push(base.data.clone());
    for (i, segment) in segments.iter().enumerate().skip(1) {
        let info = scan_wav(segment).map_err(|e| anyhow!("Failed to parse WAV segment {}: {}", i, e))?;
        if info.fmt != base.fmt {
            return Err(anyhow!(
                "WAV format mismatch in segment {}. All segments must have same sample rate/channels.",
                i
            ));
        }
        infos.push(info.data);
    }

    let total: usize = infos.iter().map(|r| r.len()).sum();
    if total > u32::MAX as usize - 64 {
        return Err(anyhow!("Merged audio exceeds the 4 GiB WAV limit"));
    }
    let mut out = Vec::with_capacity(total + 64);
    write_wav(&base.fmt, total, &mut out);
    for (segment, range) in segments.iter().zip(infos) {
        out.extend_from_slice(&segment[range]);
    }
    Ok(out)
}

/// PCM silence with the same layout as `reference`, or the default layout
/// when there is no usable reference.
pub fn silence_like(reference: Option<&[u8]>, duration: Duration) -> Vec<u8> {
    let fmt = reference
        .and_then(|r| scan_wav(r).ok())
        .map(|info| info.fmt)
        .unwrap_or_else(default_fmt);
    let info = WavInfo { fmt, data: 0..0 };
    let byte_rate = info.byte_rate().unwrap_or(DEFAULT_SAMPLE_RATE * 2) as f64;
    let align = info.block_align();
    let len = (byte_rate * duration.as_secs_f64()).round() as usize;
    let len = len - len % align;

    let mut out = Vec::with_capacity(len + 64);
    write_wav(&info.fmt, len, &mut out);
    out.resize(out.len() + len, 0);
    out
}

fn default_fmt() -> Vec<u8> {
    let mut fmt = Vec::with_capacity(16);
    fmt.extend_from_slice(&1u16.to_le_bytes()); // PCM
    fmt.extend_from_slice(&1u16.to_le_bytes()); // mono
    fmt.extend_from_slice(&DEFAULT_SAMPLE_RATE.to_le_bytes());
    fmt.extend_from_slice(&(DEFAULT_SAMPLE_RATE * 2).to_le_bytes());
    fmt.extend_from_slice(&2u16.to_le_bytes());
    fmt.extend_from_slice(&16u16.to_le_bytes());
    fmt
}

/// Playing time of a WAV buffer, from its data size and byte rate.
pub fn wav_duration(bytes: &[u8]) -> Option<Duration> {
    let info = scan_wav(bytes).ok()?;
    let rate = info.byte_rate()?;
    Some(Duration::from_secs_f64(info.data.len() as f64 / rate as f64))
}

/// Speaking time of `text` at `words_per_minute`.
pub fn estimate_duration(text: &str, words_per_minute: u32) -> Duration {
    let words = text.split_whitespace().count() as f64;
    Duration::from_secs_f64(words * 60.0 / words_per_minute.max(1) as f64)
}

#[cfg(test)]
pub(crate) fn dummy_wav(size: u32, sample_rate: u32) -> Vec<u8> {
    let mut fmt = default_fmt();
    fmt[4..8].copy_from_slice(&sample_rate.to_le_bytes());
    fmt[8..12].copy_from_slice(&(sample_rate * 2).to_le_bytes());
    let mut buf = Vec::new();
    write_wav(&fmt, size as usize, &mut buf);
    buf.extend((0..size).map(|i| (i % 251) as u8));
    buf
}

/// WAV in the default layout carrying `pcm` verbatim.
#[cfg(test)]
pub(crate) fn wav_from_pcm(pcm: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_wav(&default_fmt(), pcm.len(), &mut buf);
    buf.extend_from_slice(pcm);
    buf
}

/// Data chunk of a WAV buffer.
#[cfg(test)]
pub(crate) fn pcm_of(wav: &[u8]) -> Option<&[u8]> {
    scan_wav(wav).ok().map(|info| &wav[info.data])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_wav() -> Result<()> {
        let a = dummy_wav(10, 24_000);
        let b = dummy_wav(20, 24_000);
        let merged = merge_wav(&[&a, &b])?;

        let info = scan_wav(&merged)?;
        assert_eq!(info.data.len(), 30);
        assert_eq!(info.fmt.len(), 16);
        assert_eq!(&merged[info.data.start..info.data.start + 10], &a[44..]);
        assert_eq!(&merged[info.data.start + 10..], &b[44..]);
        Ok(())
    }

    #[test]
    fn test_merge_wav_rejects_mismatched_formats() {
        let a = dummy_wav(10, 24_000);
        let b = dummy_wav(10, 44_100);
        assert!(merge_wav(&[&a, &b]).is_err());
        assert!(merge_wav(&[&a, b"not audio"]).is_err());
    }

    #[test]
    fn test_merge_binary() {
        assert_eq!(merge_binary(&[b"Hello", b"World"]), b"HelloWorld");
    }

    #[test]
    fn test_streamed_wav_size_placeholder() {
        let mut wav = dummy_wav(8, 24_000);
        wav[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(scan_wav(&wav).unwrap().data.len(), 8);
    }

    #[test]
    fn test_silence_and_duration() {
        let reference = dummy_wav(100, 24_000);
        let silence = silence_like(Some(&reference), Duration::from_millis(500));
        assert_eq!(wav_duration(&silence), Some(Duration::from_millis(500)));
        assert!(merge_wav(&[&reference, &silence]).is_ok());

        let fallback = silence_like(None, Duration::from_secs(1));
        assert_eq!(wav_duration(&fallback), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_estimate_duration() {
        let text = vec!["word"; 300].join(" ");
        assert_eq!(estimate_duration(&text, 150), Duration::from_secs(120));
    }
}
