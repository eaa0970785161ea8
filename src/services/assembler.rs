use anyhow::anyhow;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::cancel::CancelToken;
use crate::core::config::{AudioConfig, AudioFormat, SpanFailurePolicy};
use crate::core::error::{AudiobookError, SynthesisError};
use crate::core::io::Storage;
use crate::core::state::{AudioSegment, ChapterSpans, TextSpan};
use crate::services::text::preprocess::is_only_punctuation;
use crate::services::tts::retry::SynthesisRetryEngine;
use crate::utils::audio;

/// What a chapter's cached chunks were synthesized from.
#[derive(Serialize)]
struct ChunkManifest<'a> {
    format: AudioFormat,
    spans: &'a [TextSpan],
}

#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub audio_path: String,
    pub transcript_path: Option<String>,
    pub chapters: usize,
    pub spans: usize,
    /// Spans replaced by silence after exhausting their retries.
    pub substituted: usize,
    /// Measured from the WAV headers where possible.
    pub duration: Duration,
    /// Word count over the speaking rate.
    pub estimated_duration: Duration,
}

/// Turns segmented chapters into one audio file. Chapters run one after
/// another; the spans of a chapter are synthesized concurrently but always
/// land in document order.
pub struct AudiobookAssembler {
    engine: Arc<SynthesisRetryEngine>,
    storage: Arc<dyn Storage>,
    format: AudioFormat,
    concurrency: usize,
    on_span_failure: SpanFailurePolicy,
    silence: Duration,
    words_per_minute: u32,
    cancel: CancelToken,
    show_progress: bool,
    cache_dir: Option<String>,
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

impl AudiobookAssembler {
    pub fn new(
        engine: Arc<SynthesisRetryEngine>,
        storage: Arc<dyn Storage>,
        config: &AudioConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            engine,
            storage,
            format: config.format,
            concurrency: config.concurrency.max(1),
            on_span_failure: config.on_span_failure,
            silence: Duration::from_millis(config.silence_ms),
            words_per_minute: config.words_per_minute.max(1),
            cancel,
            show_progress: true,
            cache_dir: None,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Keeps synthesized spans under `dir` so an interrupted run resumes
    /// without paying for them again.
    pub fn with_cache_dir(mut self, dir: impl Into<String>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    fn chapter_dir(&self, chapter: usize) -> Option<String> {
        self.cache_dir.as_ref().map(|dir| {
            Path::new(dir)
                .join(format!("chapter_{:03}", chapter))
                .to_string_lossy()
                .to_string()
        })
    }

    fn chunk_path(&self, chapter: usize, span: usize) -> Option<String> {
        self.chapter_dir(chapter).map(|dir| {
            Path::new(&dir)
                .join(format!("span_{:04}.{}", span, self.format.extension()))
                .to_string_lossy()
                .to_string()
        })
    }

    /// Chunks are only valid for the spans they were synthesized from.
    /// `spans.json` records those spans; when it differs from `chapter` the
    /// chapter's chunks are discarded. Returns whether chunks may be used.
    async fn prepare_chunks(&self, chapter_index: usize, chapter: &ChapterSpans) -> bool {
        let Some(dir) = self.chapter_dir(chapter_index) else {
            return false;
        };
        let manifest_path = format!("{}/spans.json", dir);
        let manifest = match serde_json::to_vec(&ChunkManifest {
            format: self.format,
            spans: &chapter.spans,
        }) {
            Ok(json) => json,
            Err(e) => {
                warn!("Chunk cache disabled for chapter {}: {}", chapter_index + 1, e);
                return false;
            }
        };

        if let Ok(true) = self.storage.exists(&manifest_path).await {
            if let Ok(existing) = self.storage.read(&manifest_path).await {
                if existing == manifest {
                    return true;
                }
            }
        }
        info!("Discarding stale chunks for chapter {}", chapter_index + 1);
        let refreshed = match self.storage.delete(&dir).await {
            Ok(()) => self.storage.write(&manifest_path, &manifest).await,
            Err(e) => Err(e),
        };
        match refreshed {
            Ok(()) => true,
            Err(e) => {
                warn!("Chunk cache disabled for chapter {}: {}", chapter_index + 1, e);
                false
            }
        }
    }

    async fn synthesize_span(
        &self,
        chunk: Option<String>,
        index: usize,
        span: &TextSpan,
    ) -> Result<AudioSegment, SynthesisError> {
        if let Some(path) = &chunk {
            if let Ok(true) = self.storage.exists(path).await {
                if let Ok(bytes) = self.storage.read(path).await {
                    let duration = audio::wav_duration(&bytes)
                        .unwrap_or_else(|| audio::estimate_duration(&span.content, self.words_per_minute));
                    return Ok(AudioSegment {
                        span_index: index,
                        bytes,
                        duration,
                        placeholder: false,
                    });
                }
            }
        }
        let segment = self.engine.synthesize(index, span).await?;
        if let Some(path) = &chunk {
            if let Err(e) = self.storage.write(path, &segment.bytes).await {
                warn!("Could not cache span {}: {}", index, e);
            }
        }
        Ok(segment)
    }

    /// Synthesizes the speakable spans of one chapter. The result has one
    /// entry per speakable span, in span order, tagged with the span's index
    /// in the chapter.
    pub async fn synthesize_chapter(
        &self,
        chapter_index: usize,
        chapter: &ChapterSpans,
    ) -> Vec<(usize, Result<AudioSegment, SynthesisError>)> {
        let use_chunks = self.prepare_chunks(chapter_index, chapter).await;
        let jobs: Vec<(usize, &TextSpan)> = chapter
            .spans
            .iter()
            .enumerate()
            .filter(|(_, span)| !is_only_punctuation(&span.content))
            .collect();

        let pb = progress_bar(jobs.len(), self.show_progress);
        let results: Vec<(usize, Result<AudioSegment, SynthesisError>)> =
            futures_util::stream::iter(jobs.iter().enumerate())
                .map(|(slot, (index, span))| {
                    let pb = pb.clone();
                    let chunk = if use_chunks {
                        self.chunk_path(chapter_index, *index)
                    } else {
                        None
                    };
                    async move {
                        let result = self.synthesize_span(chunk, *index, span).await;
                        pb.inc(1);
                        (slot, result)
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        pb.finish_and_clear();

        let mut slots: Vec<Option<Result<AudioSegment, SynthesisError>>> =
            (0..jobs.len()).map(|_| None).collect();
        for (slot, result) in results {
            slots[slot] = Some(result);
        }
        jobs.iter()
            .zip(slots)
            .map(|((index, _), s)| (*index, s.unwrap_or(Err(SynthesisError::Cancelled))))
            .collect()
    }

    /// Produces the final audio file (and transcript when given) through the
    /// storage backend. Nothing is written unless every chapter completed.
    pub async fn assemble(
        &self,
        chapters: &[ChapterSpans],
        output_path: &str,
        transcript: Option<&str>,
    ) -> Result<AssemblyReport, AudiobookError> {
        let mut pieces: Vec<AudioSegment> = Vec::new();
        let mut estimated = Duration::ZERO;
        let mut substituted = 0;
        let mut spans = 0;

        for (ci, chapter) in chapters.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(AudiobookError::Cancelled);
            }
            info!(
                "Synthesizing chapter {}/{}: {} ({} spans)",
                ci + 1,
                chapters.len(),
                if chapter.title.is_empty() { "(untitled)" } else { chapter.title.as_str() },
                chapter.spans.len()
            );
            for span in &chapter.spans {
                estimated += audio::estimate_duration(&span.content, self.words_per_minute);
            }

            for (index, result) in self.synthesize_chapter(ci, chapter).await {
                spans += 1;
                match result {
                    Ok(segment) => pieces.push(segment),
                    Err(SynthesisError::Cancelled) => return Err(AudiobookError::Cancelled),
                    Err(e) => match self.on_span_failure {
                        SpanFailurePolicy::AbortChapter => {
                            return Err(AudiobookError::ChapterAborted {
                                chapter: ci + 1,
                                source: e,
                            })
                        }
                        SpanFailurePolicy::Silence => {
                            warn!(
                                "Chapter {}: substituting silence for span {} ({})",
                                ci + 1,
                                index,
                                e
                            );
                            substituted += 1;
                            pieces.push(AudioSegment {
                                span_index: index,
                                bytes: Vec::new(),
                                duration: self.silence,
                                placeholder: true,
                            });
                        }
                    },
                }
            }
        }

        if pieces.iter().all(|p| p.placeholder) {
            return Err(AudiobookError::NoAudio);
        }
        let reference = pieces.iter().find(|p| !p.placeholder).map(|p| p.bytes.clone());
        for piece in pieces.iter_mut().filter(|p| p.placeholder) {
            piece.bytes = audio::silence_like(reference.as_deref(), self.silence);
        }

        let buffers: Vec<&[u8]> = pieces.iter().map(|p| p.bytes.as_slice()).collect();
        let merged = match self.format {
            AudioFormat::Wav => audio::merge_wav(&buffers)?,
            AudioFormat::Mp3 => audio::merge_binary(&buffers),
        };
        let duration = match self.format {
            AudioFormat::Wav => audio::wav_duration(&merged),
            AudioFormat::Mp3 => None,
        }
        .unwrap_or_else(|| pieces.iter().map(|p| p.duration).sum());

        self.storage.write(output_path, &merged).await?;
        let transcript_path = match transcript {
            Some(text) => {
                let path = Path::new(output_path)
                    .with_extension("txt")
                    .to_string_lossy()
                    .to_string();
                if path == output_path {
                    return Err(AudiobookError::Storage(anyhow!(
                        "transcript would overwrite {}",
                        output_path
                    )));
                }
                self.storage.write(&path, text.as_bytes()).await?;
                Some(path)
            }
            None => None,
        };
        if let Some(dir) = &self.cache_dir {
            if let Err(e) = self.storage.delete(dir).await {
                warn!("Could not remove chunk cache {}: {}", dir, e);
            }
        }
        info!(
            "Wrote {} ({} spans, {} substituted, {:.1} min)",
            output_path,
            spans,
            substituted,
            duration.as_secs_f64() / 60.0
        );

        Ok(AssemblyReport {
            audio_path: output_path.to_string(),
            transcript_path,
            chapters: chapters.len(),
            spans,
            substituted,
            duration,
            estimated_duration: estimated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RetryConfig;
    use crate::core::io::NativeStorage;
    use crate::core::state::SpanKind;
    use crate::services::tts::SpeechSynthesizer;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers with a WAV whose samples are the span text, after a random
    /// delay. Texts listed in `broken` always fail.
    struct SlowSynth {
        broken: Vec<String>,
        calls: Arc<Mutex<usize>>,
    }

    impl SlowSynth {
        fn new(broken: &[&str]) -> Self {
            Self {
                broken: broken.iter().map(|s| s.to_string()).collect(),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for SlowSynth {
        async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Vec<u8>, SynthesisError> {
            *self.calls.lock().unwrap() += 1;
            let delay = rand::random_range(0..15);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.broken.iter().any(|b| b == text) {
                return Err(SynthesisError::Rejected("content filter".to_string()));
            }
            Ok(audio::wav_from_pcm(text.as_bytes()))
        }
    }

    fn span(text: &str) -> TextSpan {
        TextSpan {
            content: text.to_string(),
            kind: SpanKind::Narration,
            voice_id: "af_heart".to_string(),
        }
    }

    fn chapters(n: usize, spans_per_chapter: usize) -> Vec<ChapterSpans> {
        (0..n)
            .map(|c| ChapterSpans {
                title: format!("Chapter {}", c + 1),
                spans: (0..spans_per_chapter).map(|s| span(&format!("c{}s{:02};", c, s))).collect(),
            })
            .collect()
    }

    fn config(policy: SpanFailurePolicy) -> AudioConfig {
        AudioConfig {
            concurrency: 8,
            on_span_failure: policy,
            silence_ms: 10,
            retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
            },
            ..AudioConfig::default()
        }
    }

    fn assembler(synth: Arc<SlowSynth>, config: &AudioConfig, cancel: CancelToken) -> AudiobookAssembler {
        let engine = Arc::new(SynthesisRetryEngine::new(synth, config, cancel.clone()));
        AudiobookAssembler::new(engine, Arc::new(NativeStorage::new()), config, cancel).with_progress(false)
    }

    #[tokio::test]
    async fn test_output_follows_document_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("book.wav").to_string_lossy().to_string();
        let input = chapters(3, 12);
        let expected: String = input
            .iter()
            .flat_map(|c| c.spans.iter().map(|s| s.content.clone()))
            .collect();

        for _ in 0..3 {
            let synth = Arc::new(SlowSynth::new(&[]));
            let report = assembler(synth, &config(SpanFailurePolicy::Silence), CancelToken::new())
                .assemble(&input, &out, Some("transcript"))
                .await?;
            assert_eq!(report.spans, 36);
            assert_eq!(report.substituted, 0);

            let merged = std::fs::read(&out)?;
            assert_eq!(audio::pcm_of(&merged).unwrap(), expected.as_bytes());
        }
        assert_eq!(std::fs::read_to_string(dir.path().join("book.txt"))?, "transcript");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_span_becomes_silence() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("book.wav").to_string_lossy().to_string();
        let synth = Arc::new(SlowSynth::new(&["c0s01;"]));
        let report = assembler(synth, &config(SpanFailurePolicy::Silence), CancelToken::new())
            .assemble(&chapters(1, 3), &out, None)
            .await?;
        assert_eq!(report.substituted, 1);
        assert!(report.transcript_path.is_none());

        let merged = std::fs::read(&out)?;
        let pcm = audio::pcm_of(&merged).unwrap();
        // 10 ms of 24 kHz 16-bit mono silence sits between the two spans.
        assert_eq!(pcm.len(), 6 + 480 + 6);
        assert_eq!(&pcm[..6], b"c0s00;");
        assert!(pcm[6..486].iter().all(|b| *b == 0));
        assert_eq!(&pcm[486..], b"c0s02;");
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_policy_fails_without_writing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("book.wav").to_string_lossy().to_string();
        let synth = Arc::new(SlowSynth::new(&["c1s00;"]));
        let result = assembler(synth, &config(SpanFailurePolicy::AbortChapter), CancelToken::new())
            .assemble(&chapters(2, 2), &out, None)
            .await;
        assert!(matches!(result, Err(AudiobookError::ChapterAborted { chapter: 2, .. })));
        assert!(!dir.path().join("book.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_punctuation_only_spans_are_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("book.wav").to_string_lossy().to_string();
        let synth = Arc::new(SlowSynth::new(&[]));
        let input = vec![ChapterSpans {
            title: String::new(),
            spans: vec![span("Hello."), span("..."), span("\"!\"")],
        }];
        let report = assembler(synth.clone(), &config(SpanFailurePolicy::Silence), CancelToken::new())
            .assemble(&input, &out, None)
            .await?;
        assert_eq!(report.spans, 1);
        assert_eq!(*synth.calls.lock().unwrap(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_run_writes_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("book.wav").to_string_lossy().to_string();
        let synth = Arc::new(SlowSynth::new(&[]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = assembler(synth.clone(), &config(SpanFailurePolicy::Silence), cancel)
            .assemble(&chapters(2, 2), &out, None)
            .await;
        assert!(matches!(result, Err(AudiobookError::Cancelled)));
        assert_eq!(*synth.calls.lock().unwrap(), 0);
        assert!(!dir.path().join("book.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_all_spans_failing_is_no_audio() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("book.wav").to_string_lossy().to_string();
        let synth = Arc::new(SlowSynth::new(&["c0s00;"]));
        let result = assembler(synth, &config(SpanFailurePolicy::Silence), CancelToken::new())
            .assemble(&chapters(1, 1), &out, None)
            .await;
        assert!(matches!(result, Err(AudiobookError::NoAudio)));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_span_keeps_its_chapter_index() {
        let synth = Arc::new(SlowSynth::new(&["broken"]));
        let chapter = ChapterSpans {
            title: String::new(),
            spans: vec![span("Hello."), span("..."), span("broken"), span("Bye.")],
        };
        let results = assembler(synth, &config(SpanFailurePolicy::Silence), CancelToken::new())
            .synthesize_chapter(0, &chapter)
            .await;
        let indices: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 2, 3]);
        assert!(results[1].1.is_err());
        assert_eq!(results[2].1.as_ref().unwrap().span_index, 3);
    }

    fn voiced(mut input: Vec<ChapterSpans>, voice: &str) -> Vec<ChapterSpans> {
        for span in input.iter_mut().flat_map(|c| c.spans.iter_mut()) {
            span.voice_id = voice.to_string();
        }
        input
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_from_chunks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("book.wav").to_string_lossy().to_string();
        let cache = dir.path().join("chunks").to_string_lossy().to_string();
        let config = config(SpanFailurePolicy::AbortChapter);

        let first = Arc::new(SlowSynth::new(&["c0s03;"]));
        let result = assembler(first.clone(), &config, CancelToken::new())
            .with_cache_dir(cache.clone())
            .assemble(&chapters(1, 4), &out, None)
            .await;
        assert!(result.is_err());
        assert_eq!(*first.calls.lock().unwrap(), 4);

        let second = Arc::new(SlowSynth::new(&[]));
        assembler(second.clone(), &config, CancelToken::new())
            .with_cache_dir(cache.clone())
            .assemble(&chapters(1, 4), &out, None)
            .await?;
        assert_eq!(*second.calls.lock().unwrap(), 1);
        assert!(!Path::new(&cache).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_chunks_for_other_voices_are_discarded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("book.wav").to_string_lossy().to_string();
        let cache = dir.path().join("chunks").to_string_lossy().to_string();
        let config = config(SpanFailurePolicy::AbortChapter);

        let first = Arc::new(SlowSynth::new(&["c0s03;"]));
        let _ = assembler(first, &config, CancelToken::new())
            .with_cache_dir(cache.clone())
            .assemble(&chapters(1, 4), &out, None)
            .await;

        let second = Arc::new(SlowSynth::new(&[]));
        assembler(second.clone(), &config, CancelToken::new())
            .with_cache_dir(cache)
            .assemble(&voiced(chapters(1, 4), "am_puck"), &out, None)
            .await?;
        assert_eq!(*second.calls.lock().unwrap(), 4);
        Ok(())
    }
}
