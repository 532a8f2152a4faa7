//! Bolus wizard arithmetic
//!
//! Reproduces the pump's own recommendation math so recomputed values match the
//! device to the hundredth of a unit. Two details matter for that:
//! carb and correction amounts are truncated (not rounded) to two decimals, and
//! the glucose difference is taken in single precision before dividing.

use crate::records::WizardRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    /// Toward zero
    Truncate,
    /// Half away from zero
    Nearest,
    /// Toward positive infinity
    Up,
}

/// Round `value` to `decimals` places using the given mode
pub fn round_to(value: f64, decimals: u32, mode: RoundMode) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let rounded = match mode {
        RoundMode::Truncate => scaled.trunc(),
        RoundMode::Nearest => scaled.round(),
        RoundMode::Up => scaled.ceil(),
    };
    rounded / factor
}

fn trunc2(value: f64) -> f64 {
    round_to(value, 2, RoundMode::Truncate)
}

/// Clamp to zero, then round to the 0.05 U delivery increment with halves going up
pub fn round_and_not_negative(value: f64) -> f64 {
    if !(value > 0.0) {
        return 0.0;
    }
    let steps = (value * 20.0 - 0.5).ceil();
    if steps <= 0.0 {
        0.0
    } else {
        steps / 20.0
    }
}

pub fn carb_recommendation(carbs: f64, carb_ratio: f64) -> f64 {
    if carb_ratio <= 0.0 {
        return 0.0;
    }
    trunc2(carbs / carb_ratio)
}

pub fn correction_recommendation(bg: f64, target: f64, isf: f64, bg_delta: f64) -> f64 {
    if (bg - target).abs() < bg_delta || isf <= 0.0 {
        return 0.0;
    }
    let difference = (bg - target) as f32;
    trunc2(difference as f64 / isf)
}

/// What the user entered into the wizard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardTrigger {
    Bg,
    Carb,
    Both,
}

/// Wizard recommendation split into its components
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct Recommendation {
    pub carb: f64,
    pub correction: f64,
    pub net: f64,
}

/// Recompute the wizard's recommendation from its recorded inputs
pub fn recommend(wizard: &WizardRecord) -> Recommendation {
    let trigger = match (wizard.bg_input, wizard.carb_input) {
        (Some(_), Some(_)) => WizardTrigger::Both,
        (Some(_), None) => WizardTrigger::Bg,
        (None, _) => WizardTrigger::Carb,
    };

    let carb = wizard
        .carb_input
        .map(|carbs| carb_recommendation(carbs, wizard.carb_ratio))
        .unwrap_or(0.0);
    let correction = wizard
        .bg_input
        .map(|bg| {
            correction_recommendation(bg, wizard.bg_target, wizard.insulin_sensitivity, wizard.bg_delta)
        })
        .unwrap_or(0.0);

    let net = net_recommendation(
        trigger,
        carb,
        correction,
        wizard.bg_input.map(|bg| bg > wizard.bg_target),
        wizard.insulin_on_board,
        wizard.iob_enabled,
        wizard.correction_added,
    );

    Recommendation {
        carb,
        correction,
        net,
    }
}

/// Combine carb and correction components into the deliverable amount
///
/// With insulin on board enabled, IOB reduces the correction when glucose is
/// above target and the carb component otherwise. It never reduces both.
pub fn net_recommendation(
    trigger: WizardTrigger,
    carb: f64,
    correction: f64,
    above_target: Option<bool>,
    insulin_on_board: f64,
    iob_enabled: bool,
    correction_added: bool,
) -> f64 {
    let (carb, correction) = match (iob_enabled, above_target) {
        (true, Some(true)) => (carb, correction - insulin_on_board),
        (true, Some(false)) => (carb - insulin_on_board, correction),
        _ => (carb, correction),
    };

    let net = match trigger {
        WizardTrigger::Bg => correction,
        WizardTrigger::Carb => carb,
        WizardTrigger::Both => {
            if correction_added {
                carb + correction
            } else {
                carb
            }
        }
    };
    round_and_not_negative(net)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn wizard() -> WizardRecord {
        WizardRecord {
            carb_input: Some(40.0),
            bg_input: Some(250.0),
            carb_ratio: 10.0,
            insulin_sensitivity: 50.0,
            bg_target: 120.0,
            bg_delta: 15.0,
            insulin_on_board: 0.0,
            iob_enabled: false,
            correction_added: true,
            sync_counter: 1,
        }
    }

    #[test]
    fn test_reference_recommendation() {
        let rec = recommend(&wizard());
        assert!(close(rec.carb, 4.0));
        assert!(close(rec.correction, 2.6));
        assert!(close(rec.net, 6.6));
    }

    #[test]
    fn test_truncation_of_reference_quotients() {
        // 130 / 50, 40 / 10 and -60 / 50 land on exact hundredths after scaling
        assert!(close(correction_recommendation(250.0, 120.0, 50.0, 15.0), 2.6));
        assert!(close(carb_recommendation(40.0, 10.0), 4.0));
        assert!(close(correction_recommendation(60.0, 120.0, 50.0, 15.0), -1.2));
        assert!(close(carb_recommendation(33.0, 10.0), 3.3));
    }

    #[test]
    fn test_carb_is_truncated() {
        // 45 / 14 = 3.214..., truncated rather than rounded
        assert!(close(carb_recommendation(45.0, 14.0), 3.21));
        assert!(close(carb_recommendation(47.0, 15.0), 3.13));
        assert_eq!(carb_recommendation(30.0, 0.0), 0.0);
    }

    #[test]
    fn test_correction_inside_delta_is_zero() {
        assert_eq!(correction_recommendation(130.0, 120.0, 50.0, 15.0), 0.0);
        assert_eq!(correction_recommendation(106.0, 120.0, 50.0, 15.0), 0.0);
        assert!(close(correction_recommendation(100.0, 120.0, 50.0, 15.0), -0.4));
    }

    #[test]
    fn test_correction_uses_single_precision_difference() {
        let bg = 7.3;
        let target = 5.5;
        let expected = round_to(((bg - target) as f32) as f64 / 1.2, 2, RoundMode::Truncate);
        assert!(close(correction_recommendation(bg, target, 1.2, 0.5), expected));
    }

    #[test]
    fn test_round_and_not_negative() {
        assert_eq!(round_and_not_negative(-1.3), 0.0);
        assert_eq!(round_and_not_negative(0.0), 0.0);
        assert!(close(round_and_not_negative(6.6), 6.6));
        assert!(close(round_and_not_negative(1.23), 1.25));
        assert!(close(round_and_not_negative(1.26), 1.25));
        assert!(close(round_and_not_negative(1.28), 1.3));
        assert_eq!(round_and_not_negative(f64::NAN), 0.0);
    }

    #[test]
    fn test_round_and_not_negative_yields_delivery_increments() {
        let mut value = -2.0;
        while value < 12.0 {
            let rounded = round_and_not_negative(value);
            assert!(rounded >= 0.0);
            let steps = rounded * 20.0;
            assert!((steps - steps.round()).abs() < 1e-9, "{} -> {}", value, rounded);
            value += 0.013;
        }
    }

    #[test]
    fn test_iob_reduces_correction_above_target() {
        let mut input = wizard();
        input.iob_enabled = true;
        input.insulin_on_board = 1.0;
        let rec = recommend(&input);
        assert!(close(rec.correction, 2.6));
        assert!(close(rec.net, 5.6));
    }

    #[test]
    fn test_iob_reduces_carbs_below_target() {
        let mut input = wizard();
        input.bg_input = Some(90.0);
        input.iob_enabled = true;
        input.insulin_on_board = 0.5;
        let rec = recommend(&input);
        // correction (90 - 120) / 50 = -0.6, carbs 4.0 - 0.5
        assert!(close(rec.correction, -0.6));
        assert!(close(rec.net, 2.9));
    }

    #[test]
    fn test_correction_not_added() {
        let mut input = wizard();
        input.correction_added = false;
        assert!(close(recommend(&input).net, 4.0));
    }

    #[test]
    fn test_bg_only_trigger() {
        let mut input = wizard();
        input.carb_input = None;
        let rec = recommend(&input);
        assert_eq!(rec.carb, 0.0);
        assert!(close(rec.net, 2.6));
    }

    #[test]
    fn test_round_to_modes() {
        assert!(close(round_to(1.239, 2, RoundMode::Truncate), 1.23));
        assert!(close(round_to(-1.239, 2, RoundMode::Truncate), -1.23));
        assert!(close(round_to(1.235, 1, RoundMode::Nearest), 1.2));
        assert!(close(round_to(1.21, 1, RoundMode::Up), 1.3));
    }
}
