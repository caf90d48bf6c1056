/// Kelly sizing for a fixed-odds wager on round survival.
///
///   f* = (b·p − q) / b
/// where
///   b  = net odds (profit per unit staked on a win)
///   p  = probability the round survives to the target tick
///   q  = 1 − p
///
/// Profiles apply a fractional multiplier on top of f* and then a hard
/// bankroll-fraction cap.

/// Full Kelly fraction. `0.0` when there is no edge.
pub fn kelly_fraction(win_prob: f64, net_odds: f64) -> f64 {
    if net_odds <= 0.0 || !win_prob.is_finite() {
        return 0.0;
    }
    let p = win_prob.clamp(0.0, 1.0);
    let q = 1.0 - p;
    let f = (net_odds * p - q) / net_odds;
    if f <= 0.0 {
        return 0.0;
    }
    f.min(1.0)
}

/// Fractional Kelly stake as a fraction of bankroll.
pub fn kelly_stake(win_prob: f64, net_odds: f64, multiplier: f64) -> f64 {
    debug_assert!(
        (0.0..=1.0).contains(&multiplier),
        "kelly multiplier out of range"
    );
    (kelly_fraction(win_prob, net_odds) * multiplier).clamp(0.0, 1.0)
}

/// Expected profit per unit staked.
pub fn expected_value(win_prob: f64, net_odds: f64) -> f64 {
    win_prob * net_odds - (1.0 - win_prob)
}

/// `p·ln(1 + f·b) + q·ln(1 − f)` for staking fraction `f` of bankroll.
pub fn expected_log_growth(win_prob: f64, net_odds: f64, fraction: f64) -> f64 {
    if fraction <= 0.0 {
        return 0.0;
    }
    if fraction >= 1.0 {
        return f64::NEG_INFINITY;
    }
    let p = win_prob.clamp(0.0, 1.0);
    p * (1.0 + fraction * net_odds).ln() + (1.0 - p) * (1.0 - fraction).ln()
}
