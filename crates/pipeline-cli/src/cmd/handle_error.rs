use crate::output::print_json;
use anyhow::Context;
use pipeline_core::error::should_retry;
use pipeline_core::retry::{ErrorDisposition, ErrorHandler};
use pipeline_core::{Config, ErrorCode};

/// Invoked by sibling pipeline steps with the numeric code they just failed
/// with. Attempts local recovery and reports what the step should do next.
pub fn run(
    config: &Config,
    code: u8,
    message: &str,
    operation: &str,
    auto_recover: bool,
    json: bool,
) -> anyhow::Result<()> {
    let known = ErrorCode::from_code(code).unwrap_or(ErrorCode::GeneralError);
    let retryable = should_retry(code);

    let handler = ErrorHandler::new(config);
    let disposition = handler
        .handle(known, message, operation, auto_recover)
        .context("error handling failed")?;

    if json {
        let outcome = match &disposition {
            ErrorDisposition::Recovered => serde_json::json!({
                "outcome": "recovered",
            }),
            ErrorDisposition::Degraded {
                reason,
                disabled_features,
            } => serde_json::json!({
                "outcome": "degraded",
                "reason": reason,
                "disabled_features": disabled_features,
            }),
            ErrorDisposition::Remediate { code, suggestion } => serde_json::json!({
                "outcome": "remediate",
                "code": code,
                "suggestion": suggestion,
            }),
        };
        let mut value = outcome;
        value["error_code"] = serde_json::json!(known);
        value["retryable"] = serde_json::json!(retryable);
        return print_json(&value);
    }

    match disposition {
        ErrorDisposition::Recovered => {
            println!("Recovered — safe to retry '{operation}'");
        }
        ErrorDisposition::Degraded {
            reason,
            disabled_features,
        } => {
            println!("Entered degraded mode: {reason}");
            if !disabled_features.is_empty() {
                println!("Disabled features: {}", disabled_features.join(", "));
            }
        }
        ErrorDisposition::Remediate { code, suggestion } => {
            println!("No automatic recovery for {code}");
            println!("Suggestion: {suggestion}");
            if retryable {
                println!("This kind is safe to retry with backoff");
            }
        }
    }
    Ok(())
}
