use super::{timestamp, AgentContext};
use crate::prompts::{with_feedback, ResearchSection, RESEARCH_SYSTEM_PROMPT};
use anyhow::Context;
use deal_core::{StageEmitter, StageInput, StepExecutor};
use serde_json::{json, Value};
use tracing::info;

/// Public research report: company, competitors, market
#[derive(Debug, Clone)]
pub struct ResearchAgent {
    agent: AgentContext,
}

impl ResearchAgent {
    /// Create the agent
    pub fn new(agent: AgentContext) -> Self {
        Self { agent }
    }
}

impl StepExecutor for ResearchAgent {
    fn execute(&self, input: StageInput, emitter: &dyn StageEmitter) -> anyhow::Result<Value> {
        let ctx = &input.context;
        let total = ResearchSection::ALL.len();
        let mut sections = Vec::with_capacity(total);

        for (i, section) in ResearchSection::ALL.iter().enumerate() {
            if emitter.is_cancelled() {
                anyhow::bail!("research cancelled before {}", section.title());
            }

            let percent = (i * 100 / total) as u8;
            emitter.progress(percent, &format!("Researching {}...", section.title()));
            info!(company = %ctx.company_name, section = section.title(), "Researching section");

            if i > 0 {
                emitter.emit("\n\n".to_string());
            }
            emitter.emit(format!("<h2>{}</h2>\n", section.title()));

            let user = with_feedback(section.prompt(ctx), input.feedback.as_deref());
            let request = self.agent.request(RESEARCH_SYSTEM_PROMPT, &user);
            let content = self
                .agent
                .stream_text(emitter, request)
                .with_context(|| format!("{} failed", section.title()))?;

            sections.push(json!({
                "title": section.title(),
                "content": content,
                "model": self.agent.model(),
                "timestamp": timestamp(),
            }));
        }

        emitter.progress(100, "Research report complete");

        Ok(json!({
            "company_name": ctx.company_name,
            "website": ctx.website,
            "sector": ctx.sector,
            "region": ctx.region,
            "hq_location": ctx.headquarters(),
            "model": self.agent.model(),
            "generated_at": timestamp(),
            "sections": sections,
        }))
    }
}
