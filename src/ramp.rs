//! Voltage ramp planning.
//!
//! Pure functions producing the intermediate setpoints of a ramp. They never
//! sleep or touch hardware; the command worker applies the steps.
//!
//! - [`ramp_up`] uses an ease-out curve: large steps first, small steps near
//!   the target.
//! - [`ramp_down`] uses an ease-in curve: small steps first.
//!
//! Every plan ends exactly on the target and never overshoots it.

use crate::hardware::framed_codec::round3;

const MILLIVOLT: f64 = 0.001;

/// Plan an upward ramp from `start` to `target` in `steps` steps.
///
/// Returns `[target]` when there is nothing to ramp (`target <= start`) or
/// `steps` is zero.
pub fn ramp_up(start: f64, target: f64, steps: u32) -> Vec<f64> {
    if target <= start || steps == 0 {
        return vec![target];
    }

    let range = target - start;
    let mut plan: Vec<f64> = (1..=steps)
        .map(|i| {
            let progress = f64::from(i) / f64::from(steps);
            let eased = 1.0 - (1.0 - progress).powi(2);
            round3(start + range * eased).min(target)
        })
        .collect();

    finish_on_target(&mut plan, target);

    // Drop a penultimate step that is indistinguishable from the target
    let len = plan.len();
    if len > 1 && (plan[len - 2] - plan[len - 1]).abs() < MILLIVOLT {
        plan.remove(len - 2);
    }

    plan
}

/// Plan a downward ramp from `start` to `target` in `steps` steps.
///
/// Returns `[target]` when there is nothing to ramp (`target >= start`) or
/// `steps` is zero.
pub fn ramp_down(start: f64, target: f64, steps: u32) -> Vec<f64> {
    if target >= start || steps == 0 {
        return vec![target];
    }

    let range = start - target;
    let mut plan: Vec<f64> = (1..=steps)
        .map(|i| {
            let progress = f64::from(i) / f64::from(steps);
            round3(start - range * progress.powi(2)).max(target)
        })
        .collect();

    finish_on_target(&mut plan, target);
    plan
}

/// Make the last element exactly `target`: replace it when it is within a
/// millivolt, append otherwise.
fn finish_on_target(plan: &mut Vec<f64>, target: f64) {
    match plan.last_mut() {
        Some(last) if *last == target => {}
        Some(last) if (*last - target).abs() <= MILLIVOLT => *last = target,
        _ => plan.push(target),
    }
}
