//! Grounded answer generation.
//!
//! Retrieved passages are numbered from 1 in result order. That number is the
//! citation key: the model writes `[Source N]` markers and
//! [`SynthesizedAnswer::citations`] maps each key back to its chunk.

use crate::error::GenerationError;
use crate::models::{ChatMessage, ChatRole, Chunk, SearchResult};
use crate::traits::Generator;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const ANSWER_TEMPERATURE: f32 = 0.2;
pub const SUGGESTION_TEMPERATURE: f32 = 0.8;
pub const DEFAULT_HISTORY_TURNS: usize = 4;

pub const NO_SOURCES_MESSAGE: &str =
    "No sources are selected, so there is nothing to ground an answer in. Enable at least one source and ask again.";
pub const NOT_FOUND_MESSAGE: &str =
    "The selected sources do not contain information relevant to this question.";

static CITATION_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[source[:\s]*(\d+)\]").expect("citation marker pattern is valid")
});

const GROUNDED_INSTRUCTIONS: &str = "You answer questions using only the numbered source excerpts supplied by the user.
Rules:
- Use only facts stated in the excerpts. Do not use outside knowledge.
- After every factual claim, cite the excerpt it comes from as [Source N], where N is the excerpt number.
- If excerpts contradict each other, say so and cite both sides.
- If the excerpts do not contain enough information to answer, say so plainly instead of guessing.
- Earlier conversation turns are for continuity only. They are not sources and must never be cited.";

const NO_CONTEXT_INSTRUCTIONS: &str = "The user's enabled sources were searched and contain no passages relevant to the question.
Tell the user plainly that the selected sources do not contain this information.
Do not answer from general knowledge, do not invent details and do not include any citation markers.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// 1-based position of the passage in the context block.
    pub index: usize,
    pub chunk_id: String,
    pub source_id: String,
    pub source_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedAnswer {
    pub answer_text: String,
    pub cited_results: Vec<SearchResult>,
    pub citations: Vec<Citation>,
    /// False when no passage backed the answer.
    pub grounded: bool,
}

impl SynthesizedAnswer {
    pub fn no_sources() -> Self {
        Self::ungrounded(NO_SOURCES_MESSAGE.to_string())
    }

    fn ungrounded(answer_text: String) -> Self {
        Self {
            answer_text,
            cited_results: Vec::new(),
            citations: Vec::new(),
            grounded: false,
        }
    }

    pub fn citation(&self, index: usize) -> Option<&Citation> {
        index
            .checked_sub(1)
            .and_then(|position| self.citations.get(position))
    }

    /// Citation keys present in the answer text, in order of first use.
    /// Markers pointing outside the citation table are ignored.
    pub fn referenced_indices(&self) -> Vec<usize> {
        let mut seen = HashSet::new();
        citation_markers(&self.answer_text)
            .into_iter()
            .filter(|index| (1..=self.citations.len()).contains(index))
            .filter(|index| seen.insert(*index))
            .collect()
    }
}

pub struct AnswerSynthesizer {
    generator: Arc<dyn Generator>,
    history_turns: usize,
    answer_temperature: f32,
    suggestion_temperature: f32,
}

impl AnswerSynthesizer {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            history_turns: DEFAULT_HISTORY_TURNS,
            answer_temperature: ANSWER_TEMPERATURE,
            suggestion_temperature: SUGGESTION_TEMPERATURE,
        }
    }

    pub fn with_history_turns(mut self, history_turns: usize) -> Self {
        self.history_turns = history_turns;
        self
    }

    pub fn with_temperatures(mut self, answer: f32, suggestion: f32) -> Self {
        self.answer_temperature = answer;
        self.suggestion_temperature = suggestion;
        self
    }

    pub async fn synthesize(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        history: &[ChatMessage],
    ) -> Result<SynthesizedAnswer, GenerationError> {
        if results.is_empty() {
            return self.answer_without_context(query, history).await;
        }

        let mut messages = vec![ChatMessage::system(GROUNDED_INSTRUCTIONS)];
        messages.extend(self.recent_history(history));
        messages.push(ChatMessage::user(format!(
            "Source excerpts:\n\n{}\n\nQuestion: {query}",
            build_context_block(&results)
        )));

        let answer_text = self
            .generator
            .generate(&messages, self.answer_temperature)
            .await?;

        let citations = results
            .iter()
            .enumerate()
            .map(|(position, result)| Citation {
                index: position + 1,
                chunk_id: result.chunk.id.clone(),
                source_id: result.chunk.source_id.clone(),
                source_name: result.chunk.source_name.clone(),
            })
            .collect();

        debug!(passages = results.len(), "synthesized grounded answer");
        Ok(SynthesizedAnswer {
            answer_text,
            cited_results: results,
            citations,
            grounded: true,
        })
    }

    /// Asks for follow-up questions about `chunks`, one per line.
    pub async fn suggest_questions(
        &self,
        chunks: &[Chunk],
        count: usize,
    ) -> Result<Vec<String>, GenerationError> {
        if chunks.is_empty() || count == 0 {
            return Ok(Vec::new());
        }

        let excerpts = chunks
            .iter()
            .map(|chunk| format!("{}: {}", chunk.source_name, chunk.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages = [
            ChatMessage::system(format!(
                "Suggest {count} short, distinct questions a reader could ask about the excerpts. \
                 Write one question per line with no numbering."
            )),
            ChatMessage::user(excerpts),
        ];

        let reply = self
            .generator
            .generate(&messages, self.suggestion_temperature)
            .await?;
        Ok(reply
            .lines()
            .map(|line| {
                line.trim()
                    .trim_start_matches(|ch: char| {
                        ch.is_ascii_digit() || matches!(ch, '-' | '*' | '.' | ')')
                    })
                    .trim()
            })
            .filter(|line| !line.is_empty())
            .take(count)
            .map(str::to_string)
            .collect())
    }

    async fn answer_without_context(
        &self,
        query: &str,
        history: &[ChatMessage],
    ) -> Result<SynthesizedAnswer, GenerationError> {
        let mut messages = vec![ChatMessage::system(NO_CONTEXT_INSTRUCTIONS)];
        messages.extend(self.recent_history(history));
        messages.push(ChatMessage::user(query));

        let reply = self
            .generator
            .generate(&messages, self.answer_temperature)
            .await?;
        let cleaned = strip_citation_markers(&reply);
        let answer_text = if cleaned.is_empty() {
            NOT_FOUND_MESSAGE.to_string()
        } else {
            cleaned
        };
        Ok(SynthesizedAnswer::ungrounded(answer_text))
    }

    fn recent_history(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let turns = history
            .iter()
            .filter(|message| message.role != ChatRole::System)
            .collect::<Vec<_>>();
        turns[turns.len().saturating_sub(self.history_turns)..]
            .iter()
            .map(|message| (*message).clone())
            .collect()
    }
}

/// Numbered excerpt list handed to the model.
pub fn build_context_block(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(position, result)| {
            format!(
                "[Source {}] {} (relevance {:.2})\n{}",
                position + 1,
                result.chunk.source_name,
                result.score,
                result.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn citation_markers(text: &str) -> Vec<usize> {
    CITATION_MARKER
        .captures_iter(text)
        .filter_map(|capture| capture.get(1))
        .filter_map(|number| number.as_str().parse().ok())
        .collect()
}

fn strip_citation_markers(text: &str) -> String {
    CITATION_MARKER.replace_all(text, "").trim().to_string()
}
