use super::{timestamp, AgentContext};
use crate::json::parse_json_object;
use crate::prompts::{
    build_qualitative_prompt, build_quantitative_prompt, render_documents, truncate,
    with_feedback, QUALITATIVE_SYSTEM_PROMPT, QUANTITATIVE_SYSTEM_PROMPT,
};
use deal_core::{StageEmitter, StageInput, StepExecutor};
use deal_protocol::DocumentKind;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Per-document character cap for the qualitative pass
const DOCUMENT_LIMIT: usize = 50_000;
/// Cap on non-spreadsheet text sent to the quantitative pass
const TEXT_TABLE_LIMIT: usize = 30_000;

/// Data-room extraction: qualitative analysis and quantitative data
#[derive(Debug, Clone)]
pub struct ExtractionAgent {
    agent: AgentContext,
}

impl ExtractionAgent {
    /// Create the agent
    pub fn new(agent: AgentContext) -> Self {
        Self { agent }
    }

    fn qualitative(
        &self,
        input: &StageInput,
        emitter: &dyn StageEmitter,
    ) -> anyhow::Result<Value> {
        let company = &input.context.company_name;
        emitter.progress(30, "Analyzing qualitative information...");

        let documents = render_documents(input.documents.iter(), DOCUMENT_LIMIT);
        let user = with_feedback(
            build_qualitative_prompt(company, &documents),
            input.feedback.as_deref(),
        );
        emitter.progress(35, &format!("Sending {} chars to the model...", documents.len()));

        emitter.emit("<h2>Qualitative Analysis</h2>\n".to_string());
        let content = self
            .agent
            .stream_text(emitter, self.agent.request(QUALITATIVE_SYSTEM_PROMPT, &user))?;
        emitter.progress(50, &format!("Received {} chars from the model", content.len()));

        Ok(json!({
            "content": content,
            "generated_at": timestamp(),
        }))
    }

    fn quantitative(
        &self,
        input: &StageInput,
        emitter: &dyn StageEmitter,
    ) -> anyhow::Result<Value> {
        let company = &input.context.company_name;
        emitter.progress(60, "Extracting financial data and metrics...");

        let (sheets, text): (Vec<_>, Vec<_>) = input
            .documents
            .iter()
            .partition(|d| d.kind == Some(DocumentKind::Excel));

        let mut context = String::new();
        if !sheets.is_empty() {
            context.push_str("Spreadsheet Data:\n");
            context.push_str(&render_documents(sheets.iter().copied(), DOCUMENT_LIMIT));
        }
        if !text.is_empty() {
            let joined = text
                .iter()
                .map(|d| d.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            context.push_str("\n\nDocument Content (may contain financial tables):\n");
            context.push_str(&truncate(&joined, TEXT_TABLE_LIMIT));
        }

        let user = with_feedback(
            build_quantitative_prompt(company, &context),
            input.feedback.as_deref(),
        );
        emitter.progress(65, &format!("Sending {} chars to the model...", context.len()));

        emitter.emit("\n\n<h2>Quantitative Data</h2>\n".to_string());
        let request = self
            .agent
            .request(QUANTITATIVE_SYSTEM_PROMPT, &user)
            .json();
        let content = self.agent.stream_text(emitter, request)?;
        emitter.progress(75, &format!("Received {} chars from the model", content.len()));

        let structured = match parse_json_object(&content) {
            Some(mut data) => {
                for key in ["metrics", "tables"] {
                    if !data.get(key).is_some_and(Value::is_array) {
                        data[key] = json!([]);
                    }
                }
                data
            }
            None => {
                warn!(company = %company, "Quantitative reply is not JSON, keeping raw content only");
                json!({ "metrics": [], "tables": [] })
            }
        };

        Ok(json!({
            "content": content,
            "structured_data": structured,
            "spreadsheets": sheets.iter().map(|d| d.filename.as_str()).collect::<Vec<_>>(),
            "generated_at": timestamp(),
        }))
    }
}

impl StepExecutor for ExtractionAgent {
    fn execute(&self, input: StageInput, emitter: &dyn StageEmitter) -> anyhow::Result<Value> {
        let files = input.documents.len();
        if files == 0 {
            anyhow::bail!("no data-room documents supplied");
        }

        emitter.progress(10, &format!("Extracting content from {} files...", files));
        let documents: Vec<Value> = input
            .documents
            .iter()
            .map(|d| json!({ "filename": d.filename, "kind": d.kind, "size": d.size() }))
            .collect();
        emitter.progress(25, &format!("Successfully extracted {} files", files));

        let qualitative = self.qualitative(&input, emitter)?;
        emitter.progress(55, "Qualitative analysis complete");

        if emitter.is_cancelled() {
            anyhow::bail!("extraction cancelled");
        }

        let quantitative = self.quantitative(&input, emitter)?;
        emitter.progress(80, "Quantitative extraction complete");

        info!(company = %input.context.company_name, files, "Data room processed");

        Ok(json!({
            "company_name": input.context.company_name,
            "generated_at": timestamp(),
            "files_processed": files,
            "documents": documents,
            "qualitative_analysis": qualitative,
            "quantitative_data": quantitative,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use deal_protocol::StageName;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_extraction_structures_quantitative_json() {
        let backend = ScriptedBackend::new([
            "Founders: two [Source: deck.pdf, page 1]",
            r#"{"metrics": [{"metric": "Revenue 2024", "value": "$5M"}]}"#,
        ]);
        let emitter = Arc::new(RecordingEmitter::default());

        let value = run(
            Arc::new(ExtractionAgent::new(agent(backend.clone()))),
            input(StageName::Extraction),
            emitter.clone(),
        )
        .await
        .expect("extraction");

        assert_eq!(value["files_processed"], 2);
        assert_eq!(value["documents"][1]["kind"], "excel");
        assert_eq!(
            value["qualitative_analysis"]["content"],
            "Founders: two [Source: deck.pdf, page 1]"
        );
        let structured = &value["quantitative_data"]["structured_data"];
        assert_eq!(structured["metrics"][0]["value"], "$5M");
        assert_eq!(structured["tables"], json!([]));
        assert_eq!(value["quantitative_data"]["spreadsheets"], json!(["financials.xlsx"]));
        assert_eq!(
            emitter.percents(),
            vec![10, 25, 30, 35, 50, 55, 60, 65, 75, 80]
        );

        let requests = backend.requests.lock().expect("lock");
        assert!(requests[0].response_format.is_none());
        assert!(requests[1].response_format.is_some());
        assert!(requests[1].messages[1].content.contains("Revenue 2024 | $5M"));
    }

    #[tokio::test]
    async fn test_extraction_degrades_on_unparseable_quantitative_reply() {
        let backend = ScriptedBackend::new(["qualitative", "sorry, no tables here"]);
        let value = run(
            Arc::new(ExtractionAgent::new(agent(backend))),
            input(StageName::Extraction),
            Arc::new(RecordingEmitter::default()),
        )
        .await
        .expect("extraction");

        assert_eq!(
            value["quantitative_data"]["structured_data"],
            json!({ "metrics": [], "tables": [] })
        );
        assert_eq!(value["quantitative_data"]["content"], "sorry, no tables here");
    }

    #[tokio::test]
    async fn test_extraction_requires_documents() {
        let mut stage_input = input(StageName::Extraction);
        stage_input.documents = Arc::new(Vec::new());
        let result = run(
            Arc::new(ExtractionAgent::new(agent(ScriptedBackend::new(["unused"])))),
            stage_input,
            Arc::new(RecordingEmitter::default()),
        )
        .await;
        assert!(result.is_err());
    }
}
