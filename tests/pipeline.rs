use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use topic2audiobook::core::cancel::CancelToken;
use topic2audiobook::core::config::Config;
use topic2audiobook::core::error::SynthesisError;
use topic2audiobook::core::io::NativeStorage;
use topic2audiobook::services::llm::LlmClient;
use topic2audiobook::services::pipeline::AudiobookPipeline;
use topic2audiobook::services::tts::SpeechSynthesizer;
use topic2audiobook::services::voice_map::{Gender, VoiceMap};
use topic2audiobook::utils::audio;

/// Answers planning, writing and evaluation prompts with canned replies.
#[derive(Debug, Default)]
struct ScriptedLlm {
    calls: Mutex<usize>,
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, _system: &str, user: &str) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        if user.starts_with("## TASK") {
            Ok(r#"{"chapters": [
                {"number": 1, "title": "What atoms are", "summary": "Basics", "topics": ["size"]},
                {"number": 2, "title": "Inside the atom", "summary": "Parts", "topics": ["nucleus"]}
            ]}"#
            .to_string())
        } else if user.starts_with("## EVALUATION") {
            Ok(r#"{"overall_score": 85, "strengths": ["clear"], "weaknesses": []}"#.to_string())
        } else {
            Ok("Atoms are tiny. Everything around you is made of them.\n\n\
                \"How small?\" asked the student. Smaller than light can show.\n\n\
                Confidence: 80"
                .to_string())
        }
    }
}

#[derive(Default)]
struct SilentSynth {
    calls: Mutex<Vec<String>>,
    voices: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynthesizer for SilentSynth {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, SynthesisError> {
        self.calls.lock().unwrap().push(text.to_string());
        self.voices.lock().unwrap().push(voice_id.to_string());
        Ok(audio::silence_like(None, Duration::from_millis(100)))
    }
}

fn config(root: &Path) -> Config {
    let yaml = format!(
        "language: en\n\
         output_folder: {out}\n\
         build_folder: {build}\n\
         unattended: true\n\
         llm:\n  provider: openai\n  openai:\n    api_key: k\n    model: m\n\
         audio:\n  engine: kokoro\n  retry:\n    base_delay_ms: 1\n    max_delay_ms: 2\n",
        out = root.join("output").display(),
        build = root.join("build").display(),
    );
    serde_yaml_ng::from_str(&yaml).unwrap()
}

fn pipeline(root: &Path, llm: Arc<ScriptedLlm>, synth: Arc<SilentSynth>) -> AudiobookPipeline {
    AudiobookPipeline::new(
        config(root),
        llm,
        synth,
        VoiceMap::builtin(),
        Arc::new(NativeStorage::new()),
        CancelToken::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_topic_to_audiobook() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let llm = Arc::new(ScriptedLlm::default());
    let synth = Arc::new(SilentSynth::default());

    let result = pipeline(dir.path(), llm.clone(), synth.clone()).run("Atoms").await?;

    assert!(!result.degraded);
    assert_eq!(result.aggregate_score, 85.0);
    assert_eq!(result.report.chapters, 2);
    assert_eq!(result.report.substituted, 0);

    let audio_path = dir.path().join("output").join("atoms.wav");
    assert_eq!(Path::new(&result.report.audio_path), audio_path);
    let bytes = std::fs::read(&audio_path)?;
    let spans = synth.calls.lock().unwrap().len();
    assert_eq!(spans, result.report.spans);
    let seconds = audio::wav_duration(&bytes).unwrap().as_secs_f64();
    assert_eq!((seconds * 10.0).round() as usize, spans);

    let transcript = std::fs::read_to_string(dir.path().join("output").join("atoms.txt"))?;
    assert!(transcript.starts_with("Chapter 1\nWhat atoms are\n\n"));
    assert!(transcript.contains("Chapter 2\nInside the atom"));
    assert!(!transcript.contains("Confidence"));

    let spoken = synth.calls.lock().unwrap().clone();
    assert!(spoken.iter().any(|s| s == "\"How small?\""));
    assert!(spoken.iter().all(|s| !s.starts_with("Chapter")));
    Ok(())
}

#[tokio::test]
async fn test_second_run_reuses_generated_chapters() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let llm = Arc::new(ScriptedLlm::default());
    let synth = Arc::new(SilentSynth::default());
    pipeline(dir.path(), llm.clone(), synth.clone()).run("Atoms").await?;
    let llm_calls = *llm.calls.lock().unwrap();
    let synth_calls = synth.calls.lock().unwrap().len();
    assert!(llm_calls >= 5);
    assert!(!dir.path().join("build").join("atoms").join("chunks").exists());

    let result = pipeline(dir.path(), llm.clone(), synth.clone()).run("Atoms").await?;
    assert!(!result.degraded);
    assert_eq!(*llm.calls.lock().unwrap(), llm_calls);
    assert_eq!(synth.calls.lock().unwrap().len(), synth_calls * 2);
    assert!(dir.path().join("output").join("atoms.wav").exists());
    Ok(())
}

#[tokio::test]
async fn test_voice_change_between_runs_resynthesizes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let llm = Arc::new(ScriptedLlm::default());

    let female = Arc::new(SilentSynth::default());
    pipeline(dir.path(), llm.clone(), female.clone()).run("Atoms").await?;
    assert!(female.voices.lock().unwrap().iter().any(|v| v == "af_heart"));

    let mut config = config(dir.path());
    config.audio.narrator_gender = Gender::Male;
    let male = Arc::new(SilentSynth::default());
    let result = AudiobookPipeline::new(
        config,
        llm,
        male.clone(),
        VoiceMap::builtin(),
        Arc::new(NativeStorage::new()),
        CancelToken::new(),
    )?
    .run("Atoms")
    .await?;

    let voices = male.voices.lock().unwrap().clone();
    assert_eq!(voices.len(), result.report.spans);
    assert!(voices.iter().any(|v| v == "am_puck"));
    assert!(voices.iter().all(|v| v != "af_heart"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_engine_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.audio.engine = "piper".to_string();
    let result = AudiobookPipeline::new(
        config,
        Arc::new(ScriptedLlm::default()),
        Arc::new(SilentSynth::default()),
        VoiceMap::builtin(),
        Arc::new(NativeStorage::new()),
        CancelToken::new(),
    );
    assert!(result.is_err());
}
