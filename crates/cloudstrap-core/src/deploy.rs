use crate::queue::{DeploymentQueue, QueueConfig, QueueReport};
use crate::units::{UnitContext, UnitRegistry};
use crate::CoreError;
use std::time::Duration;
use tracing::info;

/// Deploy every registered unit and wire its relations, then wait for both
/// backlogs to drain.
///
/// Units are enqueued for setup in deploy order and for relation wiring in the
/// same order right after; relation attempts against peers that are not yet
/// deployed simply requeue. The queue is shut down before returning, whether
/// it settled or not.
pub fn run_deployment(
    registry: &UnitRegistry,
    ctx: UnitContext,
    config: QueueConfig,
    timeout: Option<Duration>,
) -> Result<QueueReport, CoreError> {
    let units = registry.deploy_order();
    info!("deploying {} unit(s)", units.len());

    let progress = ctx.progress.clone();
    let mut queue = DeploymentQueue::new(ctx, config);
    queue.start()?;
    for unit in &units {
        queue.enqueue_setup(unit.clone());
    }
    for unit in &units {
        queue.enqueue_relation(unit.clone());
    }

    let settled = queue.wait_until_settled(timeout);
    let report = queue.shutdown();
    settled?;

    if report.is_clean() {
        progress.info_message("All services deployed and related.");
    } else {
        progress.info_message(&format!(
            "{} unit operation(s) could not complete, see log for details.",
            report.stuck.len()
        ));
    }
    Ok(report)
}
