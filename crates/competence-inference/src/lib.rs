//! # competence-inference
//!
//! Model collaborators for the competence matcher.
//!
//! This crate provides:
//! - Ollama backend for embeddings and chat generation (feature `ollama`)
//! - Zero-shot NLI sidecar client
//! - Alignment checks built on NLI
//! - Semantic segmentation and match reasoning over the chat model
//! - Deterministic mock backends (feature `mock`)
//!
//! # Example
//!
//! ```rust,no_run
//! use competence_inference::OllamaBackend;
//! use competence_core::EmbeddingBackend;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = OllamaBackend::from_env();
//!     let texts = vec!["TIG welding".to_string()];
//!     let embeddings = backend.embed_texts(&texts).await.unwrap();
//! }
//! ```

pub mod alignment;
pub mod nli;
pub mod prompts;
pub mod reasoner;
pub mod segmenter;

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use alignment::{AlignmentAnalyzer, BidirectionalNli, CheckOutcome, NliLabel, NLI_LABELS};
pub use nli::NliSidecarBackend;
pub use reasoner::Reasoner;
pub use segmenter::{parse_segments, Segmenter};

#[cfg(feature = "ollama")]
pub use ollama::OllamaBackend;
