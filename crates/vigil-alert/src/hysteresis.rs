use vigil_common::types::AlertRule;

/// State change decided for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Trigger,
    Clear,
}

/// Decides whether a rule flips given its aggregated value.
///
/// Triggering needs a value strictly above the threshold; clearing needs a
/// value at or below it. A rule that is already triggered and still above
/// the threshold yields [`Transition::None`].
///
/// # Examples
///
/// ```
/// use vigil_alert::hysteresis::{evaluate, Transition};
///
/// assert_eq!(evaluate(false, 80.0, 80.0), Transition::None);
/// assert_eq!(evaluate(false, 80.0, 80.1), Transition::Trigger);
/// assert_eq!(evaluate(true, 80.0, 95.0), Transition::None);
/// assert_eq!(evaluate(true, 80.0, 80.0), Transition::Clear);
/// ```
pub fn evaluate(triggered: bool, threshold: f64, value: f64) -> Transition {
    match (triggered, value > threshold) {
        (false, true) => Transition::Trigger,
        (true, false) => Transition::Clear,
        _ => Transition::None,
    }
}

pub fn evaluate_rule(rule: &AlertRule, value: f64) -> Transition {
    evaluate(rule.triggered, rule.threshold, value)
}
