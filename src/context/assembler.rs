//! Context assembler: transcript, lead profile and reference snippets in one
//! bounded prompt payload.
//!
//! The full transcript and every non-empty profile field are always included.
//! Snippets at or above the auto-include priority are embedded verbatim; the
//! rest are listed by title so the generator can ask for them. If embedding
//! would exceed the character budget, embedded snippets are dropped lowest
//! priority first. The transcript is never truncated.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::context::resources::{ResourceDoc, rank};
use crate::context::templates::StageTemplates;
use crate::conversation::Lead;
use crate::stage::FunnelStage;
use crate::transcript::{TranscriptEntry, TranscriptRole};

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Hard cap on system + user prompt characters.
    pub budget_chars: usize,
    /// Snippets with at least this priority are embedded verbatim.
    pub auto_include_priority: i32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            budget_chars: 12_000,
            auto_include_priority: 7,
        }
    }
}

/// Everything the assembler needs about one conversation.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    pub transcript: &'a [TranscriptEntry],
    pub lead: &'a Lead,
    pub stage: FunnelStage,
    /// Reviewer feedback carried into a regeneration.
    pub guidance: Option<&'a str>,
}

/// A snippet listed by title only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestItem {
    pub id: String,
    pub title: String,
    pub category: String,
    pub priority: i32,
}

impl From<&ResourceDoc> for ManifestItem {
    fn from(doc: &ResourceDoc) -> Self {
        Self {
            id: doc.id.clone(),
            title: doc.title.clone(),
            category: doc.category.clone(),
            priority: doc.priority,
        }
    }
}

/// A fully assembled, budget-checked generation context.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub stage: FunnelStage,
    pub system_prompt: String,
    pub profile: Vec<(String, String)>,
    pub transcript: Vec<TranscriptEntry>,
    /// Last operator message before the lead's newest reply.
    pub triggering_message: Option<String>,
    /// True when the newest lead message is the first one they ever sent.
    pub is_first_reply: bool,
    pub guidance: Option<String>,
    pub embedded: Vec<ResourceDoc>,
    pub manifest: Vec<ManifestItem>,
    /// Ids of auto-include snippets dropped to stay within budget.
    pub dropped_for_budget: Vec<String>,
    deferred: Vec<ResourceDoc>,
    budget_chars: usize,
}

pub struct ContextAssembler {
    templates: Arc<StageTemplates>,
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(templates: Arc<StageTemplates>, config: AssemblerConfig) -> Self {
        Self { templates, config }
    }

    /// Build the context. Deterministic for equal inputs.
    pub fn assemble(&self, input: AssemblyInput<'_>, resources: Vec<ResourceDoc>) -> AssembledContext {
        let mut resources: Vec<ResourceDoc> = resources.into_iter().filter(|d| d.is_active).collect();
        resources.sort_by(rank);

        let (auto, deferred): (Vec<ResourceDoc>, Vec<ResourceDoc>) = resources
            .into_iter()
            .partition(|d| d.priority >= self.config.auto_include_priority);

        let template = self.templates.get(input.stage);
        let system_prompt = format!(
            "{}\n\nStage: {}\n{}\nKeep the reply under {} words.\n\n\
             Respond with JSON only: {{\"reply\": \"the message to send\", \
             \"requested_resources\": [exact titles from 'Available on request', if any are needed]}}",
            self.templates.base_prompt(),
            input.stage,
            template.instructions,
            template.max_reply_words,
        );

        let mut context = AssembledContext {
            stage: input.stage,
            system_prompt,
            profile: input
                .lead
                .profile_fields()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            transcript: input.transcript.to_vec(),
            triggering_message: triggering_message(input.transcript),
            is_first_reply: is_first_reply(input.transcript),
            guidance: input
                .guidance
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string),
            embedded: Vec::new(),
            manifest: Vec::new(),
            dropped_for_budget: Vec::new(),
            deferred: Vec::new(),
            budget_chars: self.config.budget_chars,
        };
        context.place(auto, deferred);
        context
    }
}

impl AssembledContext {
    /// The user-turn payload.
    pub fn render_user(&self) -> String {
        let mut out = String::new();

        if !self.profile.is_empty() {
            out.push_str("## Lead profile\n");
            for (label, value) in &self.profile {
                let _ = writeln!(out, "{label}: {value}");
            }
            out.push('\n');
        }

        out.push_str("## Conversation\n");
        for entry in &self.transcript {
            let who = match entry.role {
                TranscriptRole::Lead => "LEAD",
                TranscriptRole::Operator => "OPERATOR",
            };
            let _ = writeln!(out, "[{}] {who}: {}", entry.timestamp.format("%Y-%m-%d %H:%M"), entry.text);
        }
        if self.is_first_reply {
            out.push_str("(This is the lead's first reply.)\n");
        }
        if let Some(trigger) = &self.triggering_message {
            let _ = writeln!(out, "\n## Message they replied to\n{trigger}");
        }

        if !self.embedded.is_empty() {
            out.push_str("\n## Reference material\n");
            for doc in &self.embedded {
                out.push_str(&render_snippet(doc));
            }
        }

        if !self.manifest.is_empty() {
            out.push_str("\n## Available on request\n");
            for item in &self.manifest {
                out.push_str(&render_manifest_line(&item.title, &item.category));
            }
        }

        if let Some(guidance) = &self.guidance {
            let _ = writeln!(out, "\n## Reviewer guidance for this draft\n{guidance}");
        }

        out
    }

    /// Characters the model will receive.
    pub fn rendered_len(&self) -> usize {
        self.system_prompt.len() + self.render_user().len()
    }

    /// A follow-up context with the requested manifest titles embedded.
    ///
    /// Returns `None` when none of the titles name a listed snippet.
    pub fn with_requested(&self, titles: &[String]) -> Option<AssembledContext> {
        let wanted: Vec<String> = titles.iter().map(|t| t.trim().to_lowercase()).collect();
        let (requested, rest): (Vec<ResourceDoc>, Vec<ResourceDoc>) = self
            .deferred
            .iter()
            .cloned()
            .partition(|d| wanted.contains(&d.title.trim().to_lowercase()));
        if requested.is_empty() {
            return None;
        }

        let mut candidates = self.embedded.clone();
        candidates.extend(requested);
        candidates.sort_by(rank);

        let mut next = self.clone();
        next.dropped_for_budget.clear();
        next.place(candidates, rest);
        Some(next)
    }

    /// Embed `candidates` (ranked) within budget; everything else goes to the manifest.
    fn place(&mut self, mut candidates: Vec<ResourceDoc>, mut deferred: Vec<ResourceDoc>) {
        // Upper bound: every snippet listed in the manifest, none embedded.
        self.embedded.clear();
        self.manifest = deferred.iter().chain(candidates.iter()).map(ManifestItem::from).collect();
        let base = self.rendered_len();

        let mut total = base + candidates.iter().map(|d| render_snippet(d).len()).sum::<usize>();
        while total > self.budget_chars {
            let Some(dropped) = candidates.pop() else { break };
            total -= render_snippet(&dropped).len();
            self.dropped_for_budget.push(dropped.id.clone());
            deferred.push(dropped);
        }

        if !self.dropped_for_budget.is_empty() {
            warn!(
                stage = %self.stage,
                dropped = self.dropped_for_budget.len(),
                budget = self.budget_chars,
                "Reference snippets dropped to fit context budget"
            );
        }
        if base > self.budget_chars {
            warn!(
                chars = base,
                budget = self.budget_chars,
                "Transcript and profile alone exceed the context budget"
            );
        }

        deferred.sort_by(rank);
        self.manifest = deferred.iter().map(ManifestItem::from).collect();
        self.embedded = candidates;
        self.deferred = deferred;
    }
}

fn render_snippet(doc: &ResourceDoc) -> String {
    format!("### {} ({})\n{}\n\n", doc.title, doc.category, doc.content)
}

fn render_manifest_line(title: &str, category: &str) -> String {
    format!("- {title} ({category})\n")
}

fn triggering_message(transcript: &[TranscriptEntry]) -> Option<String> {
    let last_lead = transcript.iter().rposition(|e| e.role == TranscriptRole::Lead)?;
    transcript[..last_lead]
        .iter()
        .rev()
        .find(|e| e.role == TranscriptRole::Operator)
        .map(|e| e.text.clone())
}

fn is_first_reply(transcript: &[TranscriptEntry]) -> bool {
    transcript.last().is_some_and(|e| e.role == TranscriptRole::Lead)
        && transcript.iter().filter(|e| e.role == TranscriptRole::Lead).count() == 1
}
