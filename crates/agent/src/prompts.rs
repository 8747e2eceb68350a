use serde::Serialize;
use tera::{Context, Tera};

use steward_core::config::TargetLanguage;
use steward_core::domain::message::Message;
use steward_core::domain::summary::RetrievedContext;

const SUMMARY_TEMPLATE: &str = "summary.txt";
const RETRY_TEMPLATE: &str = "retry_directive.txt";
const CONTEXT_TEMPLATE: &str = "retrieved_context.txt";

const SUMMARY_SOURCE: &str = "\
Summarize the conversation below into a compact digest that a support agent can rely on later.
Preserve:
1. the user's main questions and needs, including anything still unresolved;
2. the operations that were executed and their results;
3. key identifying data such as order numbers, amounts, dates and tracking numbers.
Keep it under 300 words. Do not invent facts.

Conversation:
{% for line in lines %}{{ line.role }}: {{ line.content }}
{% endfor %}";

const RETRY_SOURCE: &str = "\
[Quality correction, attempt {{ attempt }}]
The previous answer scored {{ score }}/1.0 and violated: {{ issues }}.
1. Answer the question directly and avoid filler phrases.
2. {{ language_rule }}
3. Never reveal phone numbers, card numbers or other private data.
4. Make sure the answer is complete.";

const CONTEXT_SOURCE: &str = "\
Relevant earlier conversation summaries:
{% for item in items %}- [{{ item.provenance }}, relevance {{ item.score }}] {{ item.text }}
{% endfor %}";

#[derive(Serialize)]
struct TranscriptLine<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ContextItem<'a> {
    provenance: &'static str,
    score: String,
    text: &'a str,
}

/// Renders the fixed prompt fragments the pipeline sends to models.
pub struct PromptRenderer {
    tera: Tera,
}

impl PromptRenderer {
    pub fn new() -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.add_raw_template(SUMMARY_TEMPLATE, SUMMARY_SOURCE)?;
        tera.add_raw_template(RETRY_TEMPLATE, RETRY_SOURCE)?;
        tera.add_raw_template(CONTEXT_TEMPLATE, CONTEXT_SOURCE)?;
        Ok(Self { tera })
    }

    pub fn summary_prompt(&self, messages: &[Message]) -> Result<String, tera::Error> {
        let lines: Vec<TranscriptLine<'_>> = messages
            .iter()
            .map(|message| TranscriptLine {
                role: message.role.as_str(),
                content: message.content.as_str(),
            })
            .collect();
        let mut context = Context::new();
        context.insert("lines", &lines);
        self.tera.render(SUMMARY_TEMPLATE, &context)
    }

    pub fn retry_directive(
        &self,
        attempt: u32,
        previous_score: f64,
        issues: &[String],
        language: TargetLanguage,
    ) -> Result<String, tera::Error> {
        let issues = if issues.is_empty() { "none".to_string() } else { issues.join(", ") };
        let language_rule = match language {
            TargetLanguage::Zh => "Reply in Chinese, professional and concise.",
            TargetLanguage::En => "Reply in English, professional and concise.",
            TargetLanguage::Any => "Reply in the user's language, professional and concise.",
        };
        let mut context = Context::new();
        context.insert("attempt", &attempt);
        context.insert("score", &format!("{previous_score:.2}"));
        context.insert("issues", &issues);
        context.insert("language_rule", language_rule);
        self.tera.render(RETRY_TEMPLATE, &context)
    }

    /// Empty input renders to an empty string so callers can skip the section.
    pub fn retrieved_context(&self, items: &[RetrievedContext]) -> Result<String, tera::Error> {
        if items.is_empty() {
            return Ok(String::new());
        }
        let items: Vec<ContextItem<'_>> = items
            .iter()
            .map(|item| ContextItem {
                provenance: item.provenance.label(),
                score: format!("{:.2}", item.score),
                text: item.text.as_str(),
            })
            .collect();
        let mut context = Context::new();
        context.insert("items", &items);
        self.tera.render(CONTEXT_TEMPLATE, &context)
    }
}
