//! Connection hijacking by monopolization

use tokio::sync::watch;

use super::{finish, CampaignError, CampaignOutcome, CampaignReport, CampaignStats};
use crate::session::{LoopExit, SessionController, SessionDuration};

/// Parameters of a hold run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldParams {
    pub duration: SessionDuration,
    pub keep_alive: bool,
    pub aggressive: bool,
}

/// Connect and keep the peer's only connection slot for `params.duration`.
///
/// Running out the duration or being stopped both count as completion.
/// Losing the link with aggressive mode off aborts the run.
pub async fn run_hold(
    controller: &mut SessionController,
    params: HoldParams,
    stop: &mut watch::Receiver<bool>,
) -> Result<CampaignReport, CampaignError> {
    controller.connect().await?;
    let baseline = controller.anomalies_emitted();

    let held = controller
        .maintain_connection(params.duration, params.keep_alive, params.aggressive, stop)
        .await;
    log::debug!(
        "Hold loop ended: {:?} after {:.1}s ({} reconnect attempts)",
        held.exit,
        held.elapsed.as_secs_f64(),
        held.reconnect_attempts
    );

    let (outcome, reason) = match held.exit {
        LoopExit::DurationElapsed | LoopExit::Stopped => (CampaignOutcome::Completed, None),
        LoopExit::LinkLost => (
            CampaignOutcome::Aborted { after_steps: 0 },
            Some("link lost with aggressive reconnection disabled".to_string()),
        ),
    };
    Ok(finish(controller, outcome, CampaignStats::default(), baseline, reason).await)
}
