pub mod agents;
pub mod assembler;
pub mod formatter;
pub mod language;
pub mod llm;
pub mod pipeline;
pub mod text;
pub mod tts;
pub mod voice_map;
pub mod workflow;
