pub mod preprocess;
pub mod segmenter;
