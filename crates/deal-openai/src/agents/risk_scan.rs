use super::{timestamp, AgentContext};
use crate::json::parse_json_object;
use crate::prompts::{
    build_risk_prompt, render_data_room, render_research, with_feedback, RISK_SYSTEM_PROMPT,
};
use deal_core::{StageEmitter, StageInput, StepExecutor};
use deal_protocol::StageName;
use serde_json::{json, Value};
use tracing::{info, warn};

const RESEARCH_SECTION_LIMIT: usize = 10_000;
const DATA_ROOM_LIMIT: usize = 15_000;
const RISK_LISTS: [&str; 3] = ["top_risks", "open_questions", "data_quality_issues"];

/// Risk scan across public research and data-room findings
#[derive(Debug, Clone)]
pub struct RiskScanAgent {
    agent: AgentContext,
}

impl RiskScanAgent {
    /// Create the agent
    pub fn new(agent: AgentContext) -> Self {
        Self { agent }
    }
}

fn build_context(input: &StageInput) -> String {
    let mut context = format!("Company: {}\n{}\n", input.context.company_name, "=".repeat(60));

    if let Some(research) = input
        .prior(StageName::Research)
        .and_then(|r| render_research(r, RESEARCH_SECTION_LIMIT))
    {
        context.push_str("\n## PUBLIC INTELLIGENCE (Deep Research)\n");
        context.push_str(&research);
    }

    if let Some(data_room) = input
        .prior(StageName::Extraction)
        .and_then(|d| render_data_room(d, DATA_ROOM_LIMIT))
    {
        context.push_str("\n\n## PRIVATE INTELLIGENCE (Data Room)\n");
        context.push_str(&data_room);
    }

    context
}

/// Parsed risk lists, or empty lists plus an error marker
fn structure(content: &str) -> Value {
    match parse_json_object(content) {
        Some(mut data) => {
            for key in RISK_LISTS {
                if !data.get(key).is_some_and(Value::is_array) {
                    data[key] = json!([]);
                }
            }
            data
        }
        None => json!({
            "top_risks": [],
            "open_questions": [],
            "data_quality_issues": [],
            "error": "Failed to parse risk analysis",
        }),
    }
}

impl StepExecutor for RiskScanAgent {
    fn execute(&self, input: StageInput, emitter: &dyn StageEmitter) -> anyhow::Result<Value> {
        let company = &input.context.company_name;

        emitter.progress(10, "Preparing context from all sources...");
        let context = build_context(&input);

        emitter.progress(30, "Analyzing for quantitative anomalies...");
        let user = with_feedback(build_risk_prompt(company, &context), input.feedback.as_deref());
        emitter.progress(
            40,
            &format!("Sending {} chars to the model for risk analysis...", context.len()),
        );

        let request = self.agent.request(RISK_SYSTEM_PROMPT, &user).json();
        let content = self.agent.stream_text(emitter, request)?;
        emitter.progress(70, &format!("Received {} chars from the model", content.len()));

        let structured = structure(&content);
        if structured.get("error").is_some() {
            warn!(company = %company, "Risk analysis reply is not JSON");
        } else {
            let risks = structured["top_risks"].as_array().map_or(0, Vec::len);
            emitter.progress(75, &format!("Identified {} risks", risks));
            info!(company = %company, risks, "Risk scan parsed");
        }

        emitter.progress(80, "Validating risks and generating DD checklist...");

        Ok(json!({
            "company_name": company,
            "generated_at": timestamp(),
            "risk_analysis": {
                "content": content,
                "structured_data": structured,
                "generated_at": timestamp(),
            },
            "sources_analyzed": {
                "deep_research": input.prior(StageName::Research).is_some(),
                "data_room": input.prior(StageName::Extraction).is_some(),
            },
        }))
    }
}
