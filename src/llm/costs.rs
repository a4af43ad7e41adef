//! Per-token pricing for known models.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD per token for a model, matched by prefix.
pub fn model_cost(model: &str) -> Option<(Decimal, Decimal)> {
    let table: &[(&str, Decimal, Decimal)] = &[
        ("claude-opus-4", dec!(0.000015), dec!(0.000075)),
        ("claude-sonnet-4", dec!(0.000003), dec!(0.000015)),
        ("claude-3-5-sonnet", dec!(0.000003), dec!(0.000015)),
        ("claude-3-5-haiku", dec!(0.0000008), dec!(0.000004)),
        ("gpt-4o-mini", dec!(0.00000015), dec!(0.0000006)),
        ("gpt-4o", dec!(0.0000025), dec!(0.00001)),
        ("deepseek-chat", dec!(0.00000027), dec!(0.0000011)),
    ];

    table
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, input, output)| (*input, *output))
}

/// Fallback pricing for unknown models (priced like a mid-tier model).
pub fn default_cost() -> (Decimal, Decimal) {
    (dec!(0.000003), dec!(0.000015))
}
