//! Lenient JSON recovery from model output.

use serde_json::Value;

/// Parse the first JSON object found in `input`.
///
/// Accepts bare JSON, a ```json fenced block, or an object embedded in prose.
pub fn parse_json_object(input: &str) -> Option<Value> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(input.trim()) {
        return Some(value);
    }
    let candidate = extract_json_object(input)?;
    match serde_json::from_str::<Value>(&candidate) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Text of the first balanced `{...}` object, preferring a fenced block
pub fn extract_json_object(input: &str) -> Option<String> {
    if let Some(fenced) = extract_fenced_json(input) {
        return Some(fenced);
    }

    let mut in_string = false;
    let mut escape = false;
    let mut depth = 0usize;
    let mut start_idx: Option<usize> = None;

    for (idx, ch) in input.char_indices() {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start_idx = Some(idx);
                }
                depth = depth.saturating_add(1);
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = start_idx {
                        return Some(input[start..=idx].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    None
}

fn extract_fenced_json(input: &str) -> Option<String> {
    let fence_start = input.find("```json")?;
    let after = &input[fence_start + "```json".len()..];
    let fence_end = after.find("```")?;
    let candidate = after[..fence_end].trim();
    if candidate.is_empty() {
        None
    } else {
        Some(candidate.to_string())
    }
}
