//! Payload injection sweep

use tokio::sync::watch;
use tokio::time::Instant;

use super::catalog::FuzzSelection;
use super::{
    decode_hex, finish, recover, rejection, stop_requested, CampaignError, CampaignOutcome,
    CampaignReport, CampaignStats, Recovery, ValidationError,
};
use crate::ble::gatt::CommandSpec;
use crate::event_log::EventKind;
use crate::session::{PayloadOutcome, SessionController};

/// What a fuzz run sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuzzTarget {
    /// One or all catalog categories.
    Catalog(FuzzSelection),
    /// A single user-supplied hex payload.
    Custom(String),
}

/// A named batch of payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadGroup {
    pub category: String,
    pub payloads: Vec<CommandSpec>,
}

impl FuzzTarget {
    /// Resolve into payload groups. Custom hex is decoded here, so a bad
    /// payload fails before anything touches the transport.
    pub fn plan(&self) -> Result<Vec<PayloadGroup>, ValidationError> {
        match self {
            FuzzTarget::Catalog(selection) => Ok(selection
                .categories()
                .into_iter()
                .map(|category| PayloadGroup {
                    category: category.name().to_string(),
                    payloads: category.payloads(),
                })
                .collect()),
            FuzzTarget::Custom(input) => {
                let payload = decode_hex(input)?;
                Ok(vec![PayloadGroup {
                    category: "custom".to_string(),
                    payloads: vec![CommandSpec::new("CustomPayload", payload, "user supplied")],
                }])
            }
        }
    }

    /// Mode label for reports.
    pub fn mode(&self) -> &str {
        match self {
            FuzzTarget::Catalog(selection) => selection.name(),
            FuzzTarget::Custom(_) => "custom",
        }
    }
}

/// Run the sweep.
///
/// A crash signal (or a link found already down) costs one cool-down and
/// one reconnect; if that reconnect fails the campaign aborts with the
/// counts gathered so far. Write errors on a live link only fail their own
/// step.
pub async fn run_fuzz(
    controller: &mut SessionController,
    target: &FuzzTarget,
    stop: &watch::Receiver<bool>,
) -> Result<CampaignReport, CampaignError> {
    let plan = match target.plan() {
        Ok(plan) => plan,
        Err(e) => {
            let input = match target {
                FuzzTarget::Custom(input) => input.as_str(),
                FuzzTarget::Catalog(selection) => selection.name(),
            };
            controller.record(rejection(input, &e));
            return Err(e.into());
        }
    };

    controller.connect().await?;

    let started = Instant::now();
    let baseline = controller.anomalies_emitted();
    let total: usize = plan.iter().map(|g| g.payloads.len()).sum();
    log::info!(
        "[*] Fuzzing {}: {} payloads, {:.1}s settle delay",
        target.mode(),
        total,
        controller.config().settle_delay().as_secs_f64()
    );

    let mut stats = CampaignStats::default();
    for group in &plan {
        log::info!("=== CATEGORY: {} ===", group.category.to_uppercase());

        for spec in &group.payloads {
            if stop_requested(stop) {
                controller.record(EventKind::StopRequested {
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                });
                let after_steps = stats.steps;
                return Ok(finish(
                    controller,
                    CampaignOutcome::Aborted { after_steps },
                    stats,
                    baseline,
                    Some("stop requested".to_string()),
                )
                .await);
            }

            stats.steps += 1;
            let outcome = controller.send_payload(spec).await;
            if outcome.was_sent() {
                stats.payloads_sent += 1;
            }

            match outcome {
                PayloadOutcome::Delivered | PayloadOutcome::TransportError(_) => {}
                PayloadOutcome::DeviceUnresponsive | PayloadOutcome::LinkDown => {
                    if outcome == PayloadOutcome::DeviceUnresponsive {
                        stats.crashes_detected += 1;
                        log::warn!("[!] {} may have triggered a firmware fault", spec.id);
                    }
                    let reason = match recover(controller, stop).await {
                        Recovery::Reconnected => continue,
                        Recovery::Stopped => {
                            controller.record(EventKind::StopRequested {
                                elapsed_seconds: started.elapsed().as_secs_f64(),
                            });
                            "stop requested".to_string()
                        }
                        Recovery::Failed => format!("reconnect failed after {}", spec.id),
                    };
                    let after_steps = stats.steps;
                    return Ok(finish(
                        controller,
                        CampaignOutcome::Aborted { after_steps },
                        stats,
                        baseline,
                        Some(reason),
                    )
                    .await);
                }
            }
        }

        controller.record(EventKind::CategoryCompleted {
            category: group.category.clone(),
            payloads: group.payloads.len(),
        });
        stats.categories_completed.push(group.category.clone());
    }

    Ok(finish(controller, CampaignOutcome::Completed, stats, baseline, None).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::catalog::FuzzCategory;

    #[test]
    fn test_plan_for_single_category() {
        let target = FuzzTarget::Catalog(FuzzSelection::Single(FuzzCategory::XssPayloads));
        let plan = target.plan().unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].category, "xss-payloads");
        assert_eq!(plan[0].payloads.len(), 3);
        assert_eq!(target.mode(), "xss-payloads");
    }

    #[test]
    fn test_plan_for_full_sweep() {
        let plan = FuzzTarget::Catalog(FuzzSelection::Full).plan().unwrap();
        let total: usize = plan.iter().map(|g| g.payloads.len()).sum();
        assert_eq!(plan.len(), 8);
        assert_eq!(total, 42);
    }

    #[test]
    fn test_custom_plan() {
        let plan = FuzzTarget::Custom("41 41 41 41".into()).plan().unwrap();
        assert_eq!(plan[0].payloads[0].id, "CustomPayload");
        assert_eq!(plan[0].payloads[0].payload, vec![0x41; 4]);

        assert!(FuzzTarget::Custom("ZZ".into()).plan().is_err());
    }
}
