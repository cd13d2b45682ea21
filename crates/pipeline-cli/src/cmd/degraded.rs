use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use pipeline_core::state::StateStore;
use pipeline_core::Config;

#[derive(Subcommand)]
pub enum DegradedSubcommand {
    /// Persist the degraded-mode flag with a reason
    Enable {
        #[arg(required = true)]
        reason: Vec<String>,
        /// Feature to disable while degraded (repeatable)
        #[arg(long = "disable-feature")]
        features: Vec<String>,
    },
    /// Clear the degraded-mode flag
    Disable,
    /// Show the current degraded-mode block
    Show,
}

pub fn run(config: &Config, subcmd: DegradedSubcommand, json: bool) -> anyhow::Result<()> {
    let store = StateStore::new(config);

    match subcmd {
        DegradedSubcommand::Enable { reason, features } => {
            let reason = reason.join(" ");
            store
                .enable_degraded_mode(&reason, &features)
                .context("failed to enable degraded mode")?;
            if json {
                print_json(&serde_json::json!({
                    "degraded": true,
                    "reason": reason,
                    "disabled_features": features,
                }))?;
            } else {
                println!("Degraded mode enabled: {reason}");
            }
            Ok(())
        }
        DegradedSubcommand::Disable => {
            store
                .disable_degraded_mode()
                .context("failed to disable degraded mode")?;
            if json {
                print_json(&serde_json::json!({ "degraded": false }))?;
            } else {
                println!("Degraded mode disabled");
            }
            Ok(())
        }
        DegradedSubcommand::Show => {
            let doc = store.read().context("failed to read state")?;
            if json {
                return print_json(&doc.degraded_mode);
            }
            match &doc.degraded_mode {
                Some(degraded) if degraded.enabled => {
                    println!("Degraded since {}", degraded.timestamp);
                    println!("Reason: {}", degraded.reason);
                    if !degraded.disabled_features.is_empty() {
                        println!("Disabled features: {}", degraded.disabled_features.join(", "));
                    }
                }
                _ => println!("Not degraded"),
            }
            Ok(())
        }
    }
}
