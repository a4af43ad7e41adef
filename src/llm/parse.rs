//! Helpers for pulling structured JSON out of model output.

/// Model output with formatting wrappers removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub body: String,
    /// True when the model wrapped its answer in a markdown fence or prose.
    pub was_wrapped: bool,
}

/// Strip markdown code fences and surrounding prose from a JSON object answer.
pub fn unwrap_json_object(raw: &str) -> Unwrapped {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Unwrapped {
            body: trimmed.to_string(),
            was_wrapped: false,
        };
    }

    if let Some(inner) = fenced_block(trimmed) {
        return Unwrapped {
            body: inner.to_string(),
            was_wrapped: true,
        };
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return Unwrapped {
            body: trimmed[start..=end].to_string(),
            was_wrapped: true,
        };
    }

    Unwrapped {
        body: trimmed.to_string(),
        was_wrapped: false,
    }
}

/// Contents of the first ``` fence, with an optional language tag dropped.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let end = after.find("```")?;
    let inner = &after[..end];
    // Drop a language tag like `json` on the opening line.
    let inner = match inner.find('\n') {
        Some(nl) if !inner[..nl].trim_start().starts_with('{') => &inner[nl + 1..],
        _ => inner,
    };
    Some(inner.trim())
}
