use super::{timestamp, AgentContext};
use crate::prompts::{
    build_memo_prompt, render_data_room, render_research, render_risks, with_feedback,
    MEMO_SYSTEM_PROMPT,
};
use deal_core::{StageEmitter, StageInput, StepExecutor};
use deal_protocol::StageName;
use serde_json::{json, Value};

const RESEARCH_SECTION_LIMIT: usize = 15_000;
const DATA_ROOM_LIMIT: usize = 20_000;
const RISK_LIMIT: usize = 15_000;

/// Investment Committee memo drafted from every upstream output
#[derive(Debug, Clone)]
pub struct MemoAgent {
    agent: AgentContext,
}

impl MemoAgent {
    /// Create the agent
    pub fn new(agent: AgentContext) -> Self {
        Self { agent }
    }
}

fn build_context(input: &StageInput) -> String {
    let ctx = &input.context;
    let mut context = String::new();
    context.push_str(&format!("Company: {}\n", ctx.company_name));
    context.push_str(&format!("Sector: {}\n", ctx.sector));
    context.push_str(&format!("Region: {}\n", ctx.region));
    context.push_str(&format!("Website: {}\n", ctx.website));
    context.push_str(&"=".repeat(60));
    context.push('\n');

    if let Some(research) = input
        .prior(StageName::Research)
        .and_then(|r| render_research(r, RESEARCH_SECTION_LIMIT))
    {
        context.push_str("\n## DEEP RESEARCH (Public Intelligence)\n");
        context.push_str(&research);
    }
    if let Some(data_room) = input
        .prior(StageName::Extraction)
        .and_then(|d| render_data_room(d, DATA_ROOM_LIMIT))
    {
        context.push_str("\n\n## DATA ROOM (Private Intelligence)\n");
        context.push_str(&data_room);
    }
    if let Some(risks) = input
        .prior(StageName::RiskScan)
        .and_then(|r| render_risks(r, RISK_LIMIT))
    {
        context.push_str("\n\n## RISK ANALYSIS\n");
        context.push_str(&risks);
    }

    context
}

impl StepExecutor for MemoAgent {
    fn execute(&self, input: StageInput, emitter: &dyn StageEmitter) -> anyhow::Result<Value> {
        let company = &input.context.company_name;

        emitter.progress(10, "Preparing context from all agent outputs...");
        let context = build_context(&input);

        emitter.progress(30, "Drafting Executive Summary...");
        let user = with_feedback(build_memo_prompt(company, &context), input.feedback.as_deref());
        emitter.progress(
            40,
            &format!("Sending {} chars to the model for memo drafting...", context.len()),
        );

        let memo = self
            .agent
            .stream_text(emitter, self.agent.request(MEMO_SYSTEM_PROMPT, &user))?;

        emitter.progress(90, "Finalizing IC memo...");

        Ok(json!({
            "company_name": company,
            "generated_at": timestamp(),
            "memo_content": memo,
            "sources_used": {
                "deep_research": input.prior(StageName::Research).is_some(),
                "data_room": input.prior(StageName::Extraction).is_some(),
                "risk_scanner": input.prior(StageName::RiskScan).is_some(),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memo_draws_on_every_upstream_output() {
        let backend = ScriptedBackend::new(["<h2>Executive Summary</h2>"]);
        let emitter = Arc::new(RecordingEmitter::default());
        let mut stage_input = input(StageName::Memo);
        stage_input.prior_outputs.insert(
            StageName::Extraction,
            json!({"qualitative_analysis": {"content": "Two founders"}}),
        );
        stage_input.prior_outputs.insert(
            StageName::RiskScan,
            json!({"risk_analysis": {"content": "{\"top_risks\": [\"churn\"]}"}}),
        );

        let value = run(
            Arc::new(MemoAgent::new(agent(backend.clone()))),
            stage_input,
            emitter.clone(),
        )
        .await
        .expect("memo");

        assert_eq!(value["memo_content"], "<h2>Executive Summary</h2>");
        assert_eq!(
            value["sources_used"],
            json!({"deep_research": false, "data_room": true, "risk_scanner": true})
        );
        assert_eq!(emitter.percents(), vec![10, 30, 40, 90]);
        assert_eq!(emitter.text(), "<h2>Executive Summary</h2>");

        let prompt = &backend.user_prompts()[0];
        assert!(prompt.contains("Sector: Fintech"));
        assert!(prompt.contains("### Qualitative Analysis\nTwo founders"));
        assert!(prompt.contains("## RISK ANALYSIS\n{\"top_risks\": [\"churn\"]}"));
        assert!(!prompt.contains("DEEP RESEARCH"));
    }
}
