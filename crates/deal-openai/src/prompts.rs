//! Prompt templates and context rendering for the stage agents

use deal_protocol::{DataRoomDocument, DealContext, DocumentKind};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Shared formatting rules for HTML report sections
const HTML_FORMAT_RULES: &str = r#"FORMATTING INSTRUCTIONS - VERY IMPORTANT:
- Format your response as clean HTML suitable for web display
- Use <h3> for major headings
- Use <h4> for subheadings
- Use <p> for paragraphs with clear spacing
- Use <strong> for emphasis (NOT asterisks or markdown)
- Use <ul> and <li> for bullet lists
- Use <a href="URL" target="_blank">[Source]</a> for citations
- DO NOT use markdown syntax (**, ##, -, etc.)
- DO NOT return JSON or raw text
- Return ONLY well-formatted HTML content
"#;

/// System prompt for public research sections
pub const RESEARCH_SYSTEM_PROMPT: &str = r#"You are an expert investment analyst with deep knowledge of market research and due diligence for a VC/PE firm.

Rules:
- Use current, factual information and cite sources for every claim
- Be balanced: acknowledge both strengths and weaknesses
- Focus on what matters for the investment decision
"#;

/// System prompt for qualitative data-room analysis
pub const QUALITATIVE_SYSTEM_PROMPT: &str = r#"You are an expert investment analyst extracting information from confidential deal documents.

CRITICAL RULES - MUST FOLLOW:
1. ONLY extract information that is EXPLICITLY stated in the documents
2. If information is not found, write "N/A" or "Data not available in documents"
3. NEVER make up, infer, estimate, or hallucinate ANY numbers or facts
4. ALWAYS cite the EXACT source (filename, page/slide number) for EVERY claim
5. If you're uncertain about ANY information, mark it as "Unclear from documents"
6. Quote exact text from documents when citing key claims

Your analysis will be used for high-stakes investment decisions. Accuracy is paramount.
"#;

/// System prompt for quantitative data-room extraction
pub const QUANTITATIVE_SYSTEM_PROMPT: &str = r#"You are an expert financial analyst extracting quantitative data from deal documents.

CRITICAL RULES - ABSOLUTE REQUIREMENTS:
1. ONLY extract numbers that are EXPLICITLY visible in the documents
2. If a metric is not found, write "N/A" - DO NOT estimate or calculate
3. NEVER calculate, derive, infer, or make up ANY numbers
4. ALWAYS cite the EXACT source (filename, sheet name, row for spreadsheets, page for PDFs)
5. Preserve EXACT numbers - copy them character-by-character, don't round
6. If units (USD, millions, %) are unclear or missing, state "Units unclear"
7. If you see conflicting numbers in different documents, note ALL versions with sources

When in doubt, mark as "N/A" or "Unclear" rather than guessing.
"#;

/// System prompt for the risk scan
pub const RISK_SYSTEM_PROMPT: &str = r#"You are an expert investment risk analyst conducting due diligence for a VC/PE firm.

Your role is to identify material risks, anomalies, and red flags that could impact investment decisions.

CRITICAL RULES:
1. ONLY flag risks that have EVIDENCE in the provided documents
2. Do NOT make up or infer risks without supporting data
3. Every risk must be cited to specific sources
4. Distinguish between VALIDATED risks (evidence exists) and OPEN QUESTIONS (needs further DD)
5. Be specific - vague concerns are not helpful
"#;

/// System prompt for the IC memo
pub const MEMO_SYSTEM_PROMPT: &str = r#"You are an expert investment analyst drafting Investment Committee (IC) memos for a VC/PE firm.

Your role is to synthesize all available intelligence into a professional, actionable IC memo.

CRITICAL REQUIREMENTS:
1. Every factual claim MUST be cited (source: document name, page, or "Public research")
2. Write in professional, investment-grade prose
3. Be balanced - highlight both opportunities AND risks
4. Make a clear recommendation (Proceed to DD / Pass / Hold)
5. Use specific numbers and data points (with citations)
6. Flag any data gaps or inconsistencies
"#;

/// Memo sections, in order
pub const MEMO_SECTIONS: [&str; 13] = [
    "Executive Summary",
    "Company Overview",
    "Deal Snapshot",
    "Market Overview",
    "Competition & MOAT",
    "Team",
    "Product & Value Proposition",
    "Business Model & Unit Economics",
    "Financial Performance",
    "Investment Highlights",
    "Investment Risks & Mitigants",
    "Recommendation & Next Steps",
    "Appendix Notes",
];

/// Sections of the public research report, company first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchSection {
    /// Company, team, momentum and risk signals
    CompanyOverview,
    /// Competitive landscape and moat
    CompetitorOverview,
    /// Market size, dynamics, drivers
    MarketOverview,
}

impl ResearchSection {
    /// Report order
    pub const ALL: [ResearchSection; 3] = [
        ResearchSection::CompanyOverview,
        ResearchSection::CompetitorOverview,
        ResearchSection::MarketOverview,
    ];

    /// Section heading
    pub fn title(&self) -> &'static str {
        match self {
            ResearchSection::CompanyOverview => "Company Overview",
            ResearchSection::CompetitorOverview => "Competitor Overview",
            ResearchSection::MarketOverview => "Market Overview",
        }
    }

    /// User prompt for this section
    pub fn prompt(&self, context: &DealContext) -> String {
        match self {
            ResearchSection::CompanyOverview => build_company_overview_prompt(context),
            ResearchSection::CompetitorOverview => build_competitor_overview_prompt(context),
            ResearchSection::MarketOverview => build_market_overview_prompt(context),
        }
    }
}

fn build_company_overview_prompt(ctx: &DealContext) -> String {
    let company = &ctx.company_name;
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Research {} ({}) in the {} sector, headquartered in {}.\n\n",
        company,
        ctx.website,
        ctx.sector,
        ctx.headquarters()
    ));
    prompt.push_str("COMPANY OVERVIEW:\n");
    prompt.push_str(&format!(
        "1. What core problem does {} solve, and for whom?\n",
        company
    ));
    prompt.push_str("2. What is the product/service offering and value proposition?\n");
    prompt.push_str(
        "3. What public evidence exists of product-market fit (traction, scale, retention, notable customers)?\n\n",
    );
    prompt.push_str("TEAM OVERVIEW:\n");
    prompt.push_str("1. Who are the founders and what are their backgrounds and track records?\n");
    prompt.push_str("2. Who are the key executives, advisors and board members?\n");
    prompt.push_str(
        "3. Any red flags: leadership turnover, founder conflicts, governance issues?\n\n",
    );
    prompt.push_str("MOMENTUM & RISK SIGNALS (last 12-24 months):\n");
    prompt.push_str(
        "For each material event give the date, headline, a one-line description, impact (positive/negative/neutral) and source.\n",
    );
    prompt.push_str(
        "Look for funding rounds, partnerships, launches, customer wins as well as layoffs, departures, lawsuits and regulatory issues.\n\n",
    );
    prompt.push_str(HTML_FORMAT_RULES);
    prompt.push_str("Use <h3> for Company Overview, Team Overview and Momentum & Risk Signals.\n");
    prompt
}

fn build_competitor_overview_prompt(ctx: &DealContext) -> String {
    let company = &ctx.company_name;
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Research {} and the {} competitive landscape in {}.\n\n",
        company, ctx.sector, ctx.region
    ));
    prompt.push_str("1. Identification & Scope:\n");
    prompt.push_str(&format!(
        "   - Who are {}'s closest competitors and substitutes in {}?\n",
        company, ctx.region
    ));
    prompt.push_str("   - Who are the global leaders in this space, and why are they comparable?\n");
    prompt.push_str("2. Competitive Positioning & Differentiation:\n");
    prompt.push_str(&format!(
        "   - How is {} positioned on scale, strategy and business model?\n",
        company
    ));
    prompt.push_str("   - What is its unique value proposition?\n");
    prompt.push_str("3. MOAT Analysis:\n");
    prompt.push_str(
        "   - Data assets, brand, switching costs, network effects, licenses, partnerships, IP\n",
    );
    prompt.push_str("   - How durable are these advantages and what evidence supports them?\n\n");
    prompt.push_str("Compare against at least 3-5 direct competitors with specific data points.\n\n");
    prompt.push_str(HTML_FORMAT_RULES);
    prompt
}

fn build_market_overview_prompt(ctx: &DealContext) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Research the {} market in {} to provide market context for evaluating {}.\n\n",
        ctx.sector, ctx.region, ctx.company_name
    ));
    prompt.push_str("1. Market Size & Growth: current size and CAGR, with sources\n");
    prompt.push_str(
        "2. Market Dynamics & Structure: winner-takes-most or room for many? Network effects, scale economies, data moats?\n",
    );
    prompt.push_str("3. Key Market Drivers & Risks: tailwinds, headwinds, and how they affect the company\n");
    prompt.push_str(
        "4. Investment Opportunity: can a leader reach $100M+ revenue and a $1B+ valuation? Why now?\n\n",
    );
    prompt.push_str("Skip generic business model descriptions; focus on market dynamics.\n\n");
    prompt.push_str(HTML_FORMAT_RULES);
    prompt
}

/// Build the qualitative data-room analysis prompt
pub fn build_qualitative_prompt(company: &str, documents: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Analyze the following deal pack documents for {} and extract information for these sections.\n\n",
        company
    ));
    prompt.push_str(
        "REMEMBER: If information is not explicitly in the documents, write \"N/A\" or \"Data not available\".\n\n",
    );
    prompt.push_str("Documents:\n");
    prompt.push_str(documents);
    prompt.push_str("\n\nExtract and analyze the following (cite sources):\n\n");

    let sections = [
        ("Company Overview", "founding team, product, monetization model, key traction/KPIs"),
        ("Deal Snapshot", "current investors and ownership, round size and valuation, use of funds"),
        ("Market Overview", "TAM/SAM/SOM and growth, main drivers, key risks"),
        ("Competition & MOAT", "closest competitors, differentiation, evidence of advantage"),
        ("Team Overview", "founders and executives, relevant experience, red flags"),
        ("Product & Value Propositions", "customer pain point, value propositions, validation"),
        ("Business Model & Monetization", "revenue model, key metrics, scalability"),
        ("Unit Economics & Retention", "contribution margin, operating leverage, path to profitability"),
    ];
    for (i, (title, items)) in sections.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. {}: {}\n   [Cite: filename, page/slide number]\n",
            i + 1,
            title,
            items
        ));
    }

    prompt.push_str("\nFormat as a structured document with clear sections. ");
    prompt.push_str("Include [N/A] for any information not found. ");
    prompt.push_str("Cite as [Source: filename, page X].\n");
    prompt
}

/// Build the quantitative extraction prompt
pub fn build_quantitative_prompt(company: &str, documents: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Extract ALL quantitative financial data for {} from the provided documents.\n\n",
        company
    ));
    prompt.push_str("Documents:\n");
    prompt.push_str(documents);
    prompt.push_str("\n\nEXTRACT individual metrics (KPIs, financials) and tables ");
    prompt.push_str("(Cap Table, P&L, Balance Sheet, Unit Economics, ...). ");
    prompt.push_str("Cite the exact source for each item.\n\n");
    prompt.push_str("RESPOND WITH JSON:\n");
    prompt.push_str(
        r#"{
  "metrics": [
    {"metric": "Total Revenue 2024", "value": "$5M", "period": "2024", "source": "financials.xlsx, Sheet1"}
  ],
  "tables": [
    {
      "title": "Cap Table",
      "columns": ["Shareholder", "Shares", "Ownership %", "Round"],
      "rows": [["Founder A", "1000000", "45%", "Seed"]],
      "source": "captable.xlsx, Captable sheet"
    }
  ]
}"#,
    );
    prompt.push_str("\n\nRULES:\n");
    prompt.push_str("- Extract ONLY data that exists in the documents above\n");
    prompt.push_str("- If you cannot find quantitative data, return: {\"metrics\": [], \"tables\": []}\n");
    prompt.push_str("- Copy numbers exactly as shown\n");
    prompt
}

/// Build the risk scan prompt
pub fn build_risk_prompt(company: &str, context: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Analyze the following intelligence for {} and identify material risks.\n\n",
        company
    ));
    prompt.push_str(context);
    prompt.push_str("\n\nScan for risks across these categories:\n");
    prompt.push_str("1. Market & Competition Risk\n");
    prompt.push_str("2. Customer & Revenue Risk\n");
    prompt.push_str("3. Business Model & Monetization\n");
    prompt.push_str("4. Financial Risks (burn, runway, working capital)\n");
    prompt.push_str("5. Team & Governance\n");
    prompt.push_str("6. Legal & Regulatory\n\n");
    prompt.push_str("Return a JSON structure:\n");
    prompt.push_str(
        r#"{
  "top_risks": [
    {"category": "...", "risk": "...", "severity": "High|Medium|Low", "evidence": "...", "source": "...", "potential_impact": "...", "mitigant": "..."}
  ],
  "open_questions": [
    {"category": "...", "question": "...", "context": "...", "priority": "High|Medium|Low", "suggested_dd": "..."}
  ],
  "data_quality_issues": [
    {"issue": "...", "description": "...", "sources": "...", "recommendation": "..."}
  ]
}"#,
    );
    prompt.push_str("\n\nREQUIREMENTS:\n");
    prompt.push_str("- Include 5-10 top risks, prioritized by severity and potential impact\n");
    prompt.push_str("- Include 5-10 open questions for further DD\n");
    prompt.push_str("- Flag any data inconsistencies or quality issues\n");
    prompt.push_str("- If no risks are found in a category, omit it\n");
    prompt
}

/// Build the IC memo prompt
pub fn build_memo_prompt(company: &str, context: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Draft a comprehensive Investment Committee memo for {}.\n\n",
        company
    ));
    prompt.push_str("Use ALL available intelligence below to create a complete, well-cited IC memo.\n\n");
    prompt.push_str(context);
    prompt.push_str("\n\nREQUIRED SECTIONS (in order):\n");
    for (i, section) in MEMO_SECTIONS.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, section));
    }
    prompt.push_str("\nMark N/A where data is unavailable. ");
    prompt.push_str("End with a clear recommendation: Proceed to DD / Pass / Hold.\n\n");
    prompt.push_str("FORMAT AS HTML:\n");
    prompt.push_str("- Use <h2> for section headers and <h3> for subsections\n");
    prompt.push_str("- Use <p>, <strong>, <ul> and <li>\n");
    prompt.push_str("- Cite with <em>[Source: document name, specific location]</em>\n");
    prompt.push_str("- DO NOT use markdown syntax\n");
    prompt
}

/// Append reviewer feedback to a user prompt
pub fn with_feedback(prompt: String, feedback: Option<&str>) -> String {
    match feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(feedback) => format!(
            "{}\n\nREVIEWER FEEDBACK ON THE PREVIOUS DRAFT:\n{}\n\nRevise your answer to address this feedback.\n",
            prompt, feedback
        ),
        None => prompt,
    }
}

fn html_tag() -> Option<&'static Regex> {
    static HTML_TAG: OnceLock<Option<Regex>> = OnceLock::new();
    HTML_TAG.get_or_init(|| Regex::new(r"<[^<]+?>").ok()).as_ref()
}

/// Remove HTML tags
pub fn strip_html(text: &str) -> String {
    match html_tag() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Cut `text` to at most `limit` characters, noting the original size
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!(
            "{}\n\n[... content truncated, {} total chars ...]",
            &text[..cut],
            text.chars().count()
        ),
        None => text.to_string(),
    }
}

fn divider(label: &str) -> String {
    let rule = "=".repeat(60);
    format!("\n{rule}\n{label}\n{rule}\n")
}

fn kind_label(kind: Option<DocumentKind>) -> &'static str {
    match kind {
        Some(DocumentKind::Pdf) => "PDF",
        Some(DocumentKind::Excel) => "Excel",
        Some(DocumentKind::PowerPoint) => "PowerPoint",
        Some(DocumentKind::Word) => "Word Document",
        None => "Document",
    }
}

/// Render documents as one context block, each cut to `limit` characters
pub fn render_documents<'a>(
    documents: impl IntoIterator<Item = &'a DataRoomDocument>,
    limit: usize,
) -> String {
    let mut out = String::new();
    for doc in documents {
        out.push_str(&divider(&format!("{}: {}", kind_label(doc.kind), doc.filename)));
        out.push_str(&truncate(&doc.content, limit));
        out.push('\n');
    }
    out
}

fn text_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Render a research output as plain text sections
pub fn render_research(research: &Value, limit: usize) -> Option<String> {
    let sections = research.get("sections")?.as_array()?;
    let mut out = String::new();
    for section in sections {
        let title = text_at(section, &["title"]).unwrap_or("Section");
        let content = text_at(section, &["content"]).unwrap_or_default();
        out.push_str(&format!("\n### {}\n", title));
        out.push_str(&truncate(&strip_html(content), limit));
        out.push('\n');
    }
    Some(out)
}

/// Render an extraction output's qualitative and quantitative parts
pub fn render_data_room(extraction: &Value, limit: usize) -> Option<String> {
    let qualitative = text_at(extraction, &["qualitative_analysis", "content"]);
    let quantitative = text_at(extraction, &["quantitative_data", "content"]);
    if qualitative.is_none() && quantitative.is_none() {
        return None;
    }

    let mut out = String::new();
    if let Some(text) = qualitative {
        out.push_str("\n### Qualitative Analysis\n");
        out.push_str(&truncate(text, limit));
        out.push('\n');
    }
    if let Some(text) = quantitative {
        out.push_str("\n### Quantitative Data\n");
        out.push_str(&truncate(text, limit));
        out.push('\n');
    }
    Some(out)
}

/// Render a risk scan output
pub fn render_risks(risk_scan: &Value, limit: usize) -> Option<String> {
    text_at(risk_scan, &["risk_analysis", "content"]).map(|text| truncate(text, limit))
}
