//! Query refinement: condense a conversational prompt into a search key

use std::sync::Arc;

use tracing::{debug, warn};

use crate::embedding::TokenCounter;
use crate::generation::TextGenerator;

const REFINE_SYSTEM_PROMPT: &str = "You turn a developer's message to a coding agent into a \
short search query for a memory database. Keep only the technical intent: components, \
errors, technologies, and the action requested. Drop greetings, pleasantries, and filler. \
Answer with the query alone, at most 20 words, no quotes or explanation.";

/// Reduces noisy prompts to compact search queries.
///
/// Never blocks the pipeline: any generator failure returns the prompt as-is.
pub struct QueryRefiner {
    generator: Option<Arc<dyn TextGenerator>>,
    tokens: Option<TokenCounter>,
    max_prompt_tokens: usize,
}

impl QueryRefiner {
    pub fn new(generator: Arc<dyn TextGenerator>, max_prompt_tokens: usize) -> Self {
        let tokens = match TokenCounter::for_gpt() {
            Ok(counter) => Some(counter),
            Err(e) => {
                warn!(error = %e, "Tokenizer unavailable, prompts will be clipped by length");
                None
            }
        };

        Self {
            generator: Some(generator),
            tokens,
            max_prompt_tokens,
        }
    }

    /// A refiner that returns every prompt unchanged
    pub fn passthrough() -> Self {
        Self {
            generator: None,
            tokens: None,
            max_prompt_tokens: 0,
        }
    }

    pub fn refine_enabled(&self) -> bool {
        self.generator.is_some()
    }

    /// Condense `raw_prompt` into a search query
    pub async fn refine(&self, raw_prompt: &str) -> String {
        let Some(generator) = &self.generator else {
            return raw_prompt.to_string();
        };
        if raw_prompt.trim().is_empty() {
            return raw_prompt.to_string();
        }

        let clipped = self.clip(raw_prompt);
        match generator.complete(REFINE_SYSTEM_PROMPT, &clipped).await {
            Ok(completion) => {
                let query = clean_completion(&completion);
                if query.is_empty() {
                    warn!(model = generator.model_name(), "Refiner returned an empty query");
                    return raw_prompt.to_string();
                }
                debug!(query = %query, "Refined search query");
                query
            }
            Err(e) => {
                warn!(
                    error = %e,
                    model = generator.model_name(),
                    "Query refinement failed, using raw prompt"
                );
                raw_prompt.to_string()
            }
        }
    }

    fn clip(&self, prompt: &str) -> String {
        match &self.tokens {
            Some(counter) => counter.truncate(prompt, self.max_prompt_tokens),
            None => prompt.chars().take(self.max_prompt_tokens * 4).collect(),
        }
    }
}

/// Trim whitespace and one layer of wrapping quotes
fn clean_completion(completion: &str) -> String {
    let trimmed = completion.trim();
    let unquoted = ['"', '\'', '`']
        .iter()
        .find_map(|q| {
            trimmed
                .strip_prefix(*q)
                .and_then(|s| s.strip_suffix(*q))
        })
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedGenerator;

    #[tokio::test]
    async fn returns_condensed_query() {
        let generator = Arc::new(ScriptedGenerator::replying(
            "  \"optimize user authentication database queries\"\n",
        ));
        let refiner = QueryRefiner::new(generator.clone(), 2000);

        let prompt =
            "Hi there! Hope you're well. Could you make our auth DB queries faster? Thanks!";
        let query = refiner.refine(prompt).await;

        assert_eq!(query, "optimize user authentication database queries");
        assert_eq!(generator.prompts().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_raw_prompt_on_failure() {
        let refiner = QueryRefiner::new(Arc::new(ScriptedGenerator::failing("timeout")), 2000);
        assert_eq!(refiner.refine("fix the flaky test").await, "fix the flaky test");
    }

    #[tokio::test]
    async fn falls_back_on_empty_completion() {
        let refiner = QueryRefiner::new(Arc::new(ScriptedGenerator::replying("  \"\" ")), 2000);
        assert_eq!(refiner.refine("fix the flaky test").await, "fix the flaky test");
    }

    #[tokio::test]
    async fn blank_prompt_skips_generator() {
        let generator = Arc::new(ScriptedGenerator::replying("anything"));
        let refiner = QueryRefiner::new(generator.clone(), 2000);

        assert_eq!(refiner.refine("   ").await, "   ");
        assert!(generator.prompts().is_empty());
    }

    #[tokio::test]
    async fn long_prompts_are_clipped_before_sending() {
        let generator = Arc::new(ScriptedGenerator::replying("query"));
        let refiner = QueryRefiner::new(generator.clone(), 10);

        refiner.refine(&"refactor the payment service ".repeat(100)).await;

        let sent = &generator.prompts()[0];
        assert!(sent.len() < 200);
    }

    #[test]
    fn passthrough_is_identity() {
        let refiner = QueryRefiner::passthrough();
        assert!(!refiner.refine_enabled());
        assert_eq!(
            tokio_test::block_on(refiner.refine("Hello! fix the build")),
            "Hello! fix the build"
        );
    }
}
