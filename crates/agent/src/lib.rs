//! Agent runtime for a support assistant whose replies are quality-gated,
//! whose history stays bounded, and whose sensitive actions wait for a human.
//!
//! A turn runs through a fixed pipeline owned by [`runtime::AgentRuntime`]:
//!
//! 1. **Recovery** (`context`) - replay persisted history into an empty buffer
//! 2. **Retrieval** (`retrieval`) - surface relevant summaries from past sessions
//! 3. **Compaction** (`context`) - fold old messages into a generated summary
//! 4. **Model call** under the **quality gate** (`quality`)
//! 5. **Tool calls** (`tools`, `guardrails`) or a **suspension** (`suspension`)
//! 6. **Persistence** to the turn store
//!
//! Turns for one session are serialized through its handle in the
//! [`registry::SessionRegistry`]. A session with an unresolved suspension
//! accepts no new turns until a decision is submitted.

pub mod bootstrap;
pub mod context;
pub mod guardrails;
pub mod llm;
pub mod prompts;
pub mod quality;
pub mod registry;
pub mod retrieval;
pub mod runtime;
pub mod suspension;
pub mod tokens;
pub mod tools;

pub use runtime::{AgentRuntime, Collaborators, ResumeOutcome, TurnOutcome};
