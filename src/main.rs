use anyhow::{anyhow, Result};
use log::{info, warn};
use std::sync::Arc;

use topic2audiobook::core::cancel::CancelToken;
use topic2audiobook::core::config::Config;
use topic2audiobook::core::io::NativeStorage;
use topic2audiobook::services::llm::{create_llm, LlmClient};
use topic2audiobook::services::pipeline::AudiobookPipeline;
use topic2audiobook::services::tts::create_speech_client;
use topic2audiobook::services::voice_map::VoiceMap;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let topic = read_topic(&config)?;

    let voice_map = match &config.audio.voice_map {
        Some(path) => VoiceMap::load(path)?,
        None => VoiceMap::builtin(),
    };
    let (narrator, _) = voice_map.voices_for(&config.audio.engine, config.audio.narrator_gender)?;

    let llm: Arc<dyn LlmClient> = Arc::from(create_llm(&config.llm)?);
    let speech = create_speech_client(&config.audio)?;
    speech.check_health(&narrator).await?;

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight requests");
            on_signal.cancel();
        }
    });

    let unattended = config.unattended;
    let pipeline = AudiobookPipeline::new(
        config,
        llm,
        Arc::new(speech),
        voice_map,
        Arc::new(NativeStorage::new()),
        cancel,
    )?;

    let outcome = pipeline.generate(&topic).await?;
    if outcome.is_degraded() {
        let score = outcome.book().aggregate_score;
        warn!("Quality gate not reached (aggregate {:.1})", score);
        if !unattended {
            let proceed = inquire::Confirm::new("Chapters are below the quality threshold. Synthesize anyway?")
                .with_default(true)
                .prompt()?;
            if !proceed {
                info!("Chapters kept in the build folder; rerun to synthesize them");
                return Ok(());
            }
        }
    }

    let result = pipeline.produce(outcome).await?;
    let report = &result.report;
    println!("Audiobook: {}", report.audio_path);
    if let Some(transcript) = &report.transcript_path {
        println!("Transcript: {}", transcript);
    }
    println!(
        "{} chapters, {} spans ({} replaced by silence), {:.1} min (estimated {:.1} min)",
        report.chapters,
        report.spans,
        report.substituted,
        report.duration.as_secs_f64() / 60.0,
        report.estimated_duration.as_secs_f64() / 60.0
    );
    println!(
        "Quality: {:.1} after {} round(s){}",
        result.aggregate_score,
        result.rounds,
        if result.degraded { ", below threshold" } else { "" }
    );
    Ok(())
}

/// Topic from the command line, or asked for when running interactively.
fn read_topic(config: &Config) -> Result<String> {
    let topic = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let topic = topic.trim().to_string();
    if !topic.is_empty() {
        return Ok(topic);
    }
    if config.unattended {
        return Err(anyhow!("No topic given. Usage: topic2audiobook <topic>"));
    }
    let topic = inquire::Text::new("Topic:").prompt()?;
    let topic = topic.trim().to_string();
    if topic.is_empty() {
        return Err(anyhow!("Topic must not be empty"));
    }
    Ok(topic)
}
