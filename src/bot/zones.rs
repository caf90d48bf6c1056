//! Risk zones over the survival probability at the decision horizon.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::kelly;
use super::patterns::PatternFlags;

/// Zones ordered from most to least conservative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneName {
    Critical,
    Danger,
    Caution,
    Favorable,
    Prime,
}

impl ZoneName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneName::Critical => "critical",
            ZoneName::Danger => "danger",
            ZoneName::Caution => "caution",
            ZoneName::Favorable => "favorable",
            ZoneName::Prime => "prime",
        }
    }

    /// One step more conservative, saturating at `Critical`.
    pub fn more_conservative(self) -> ZoneName {
        match self {
            ZoneName::Critical | ZoneName::Danger => ZoneName::Critical,
            ZoneName::Caution => ZoneName::Danger,
            ZoneName::Favorable => ZoneName::Caution,
            ZoneName::Prime => ZoneName::Favorable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    Exit,
    Avoid,
    Hold,
    Selective,
    Press,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskZone {
    pub name: ZoneName,
    /// Exclusive, except for the first zone which includes 0
    pub lower: f64,
    /// Inclusive
    pub upper: f64,
    /// Per unit staked on survival at the zone's midpoint probability
    pub expected_value: f64,
    pub posture: Posture,
}

#[derive(Debug, Error, PartialEq)]
pub enum ZoneTableError {
    #[error("zone table is empty")]
    Empty,
    #[error("zone table must start at 0.0, starts at {0}")]
    BadStart(f64),
    #[error("zone table must end at 1.0, ends at {0}")]
    BadEnd(f64),
    #[error("zone {0:?} does not begin where the previous zone ends")]
    Gap(ZoneName),
    #[error("zone {0:?} has an empty or inverted range")]
    Inverted(ZoneName),
    #[error("zone {0:?} is out of conservative-first order")]
    OutOfOrder(ZoneName),
}

/// `(name, lower, upper, posture)`
pub const STANDARD_ZONES: [(ZoneName, f64, f64, Posture); 5] = [
    (ZoneName::Critical, 0.0, 0.50, Posture::Exit),
    (ZoneName::Danger, 0.50, 0.65, Posture::Avoid),
    (ZoneName::Caution, 0.65, 0.80, Posture::Hold),
    (ZoneName::Favorable, 0.80, 0.90, Posture::Selective),
    (ZoneName::Prime, 0.90, 1.0, Posture::Press),
];

#[derive(Debug, Clone)]
pub struct ZoneTable {
    zones: Vec<RiskZone>,
}

impl ZoneTable {
    pub fn standard(payout_odds: f64) -> Result<Self, ZoneTableError> {
        Self::from_bounds(&STANDARD_ZONES, payout_odds)
    }

    /// Validates contiguous coverage of [0, 1] and precomputes each zone's EV.
    pub fn from_bounds(
        bounds: &[(ZoneName, f64, f64, Posture)],
        payout_odds: f64,
    ) -> Result<Self, ZoneTableError> {
        let (first, last) = match (bounds.first(), bounds.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(ZoneTableError::Empty),
        };
        if first.1 != 0.0 {
            return Err(ZoneTableError::BadStart(first.1));
        }
        if last.2 != 1.0 {
            return Err(ZoneTableError::BadEnd(last.2));
        }
        let mut zones = Vec::with_capacity(bounds.len());
        let mut prev: Option<&(ZoneName, f64, f64, Posture)> = None;
        for b in bounds {
            let (name, lower, upper, posture) = *b;
            if !(lower < upper) {
                return Err(ZoneTableError::Inverted(name));
            }
            if let Some(p) = prev {
                if p.2 != lower {
                    return Err(ZoneTableError::Gap(name));
                }
                if p.0 >= name {
                    return Err(ZoneTableError::OutOfOrder(name));
                }
            }
            let mid = (lower + upper) / 2.0;
            zones.push(RiskZone {
                name,
                lower,
                upper,
                expected_value: kelly::expected_value(mid, payout_odds),
                posture,
            });
            prev = Some(b);
        }
        Ok(ZoneTable { zones })
    }

    /// Boundary values belong to the lower zone. Non-finite input maps to the
    /// most conservative zone.
    pub fn lookup(&self, probability: f64) -> &RiskZone {
        let p = if probability.is_finite() {
            probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.zones
            .iter()
            .find(|z| p <= z.upper)
            .unwrap_or(&self.zones[self.zones.len() - 1])
    }

    pub fn get(&self, name: ZoneName) -> &RiskZone {
        self.zones
            .iter()
            .find(|z| z.name == name)
            .unwrap_or(&self.zones[0])
    }

    /// Distance of `probability` from the nearest edge of its base zone,
    /// normalized to [0, 1] by the zone's half-width.
    pub fn margin(&self, probability: f64) -> f64 {
        let z = self.lookup(probability);
        let half = (z.upper - z.lower) / 2.0;
        if half <= 0.0 {
            return 0.0;
        }
        let d = (probability - z.lower).min(z.upper - probability);
        (d / half).clamp(0.0, 1.0)
    }
}

/// Optional cross-round input: rounds are independent unless this is enabled.
#[derive(Debug, Clone, Copy)]
pub struct PriorPeakHeuristic {
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct RiskZoneClassifier {
    table: ZoneTable,
    prior_peak: Option<PriorPeakHeuristic>,
}

impl RiskZoneClassifier {
    pub fn new(table: ZoneTable, prior_peak: Option<PriorPeakHeuristic>) -> Self {
        RiskZoneClassifier { table, prior_peak }
    }

    pub fn table(&self) -> &ZoneTable {
        &self.table
    }

    /// Pattern flags and the prior-peak heuristic can only lower the zone.
    pub fn classify(
        &self,
        survival_probability: f64,
        flags: &PatternFlags,
        prior_peak: Option<f64>,
    ) -> &RiskZone {
        let mut name = self.table.lookup(survival_probability).name;
        if flags.volatility_spike.is_some() {
            name = name.min(ZoneName::Danger);
        }
        if flags.early_termination.is_some() || flags.stagnation.is_some() {
            name = name.min(ZoneName::Caution);
        }
        if flags.rebound.is_some() {
            name = name.min(ZoneName::Favorable);
        }
        if let (Some(h), Some(peak)) = (self.prior_peak, prior_peak) {
            if peak > h.threshold {
                name = name.more_conservative();
            }
        }
        self.table.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::patterns::{Rebound, VolatilitySpike};
    use approx::assert_relative_eq;

    fn classifier() -> RiskZoneClassifier {
        RiskZoneClassifier::new(ZoneTable::standard(1.0).unwrap(), None)
    }

    #[test]
    fn boundaries_resolve_to_the_lower_zone() {
        let t = ZoneTable::standard(1.0).unwrap();
        assert_eq!(t.lookup(0.0).name, ZoneName::Critical);
        assert_eq!(t.lookup(0.5).name, ZoneName::Critical);
        assert_eq!(t.lookup(0.5000001).name, ZoneName::Danger);
        assert_eq!(t.lookup(0.8).name, ZoneName::Caution);
        assert_eq!(t.lookup(0.95).name, ZoneName::Prime);
        assert_eq!(t.lookup(1.0).name, ZoneName::Prime);
        assert_eq!(t.lookup(f64::NAN).name, ZoneName::Critical);
    }

    #[test]
    fn zone_ev_uses_midpoint_and_odds() {
        let t = ZoneTable::standard(1.0).unwrap();
        // midpoint 0.95 at even odds: 0.95 - 0.05
        assert_relative_eq!(t.get(ZoneName::Prime).expected_value, 0.9, epsilon = 1e-12);
        assert!(t.get(ZoneName::Critical).expected_value < 0.0);
    }

    #[test]
    fn table_must_cover_unit_interval() {
        let mut gap = STANDARD_ZONES;
        gap[2].1 = 0.66;
        assert_eq!(
            ZoneTable::from_bounds(&gap, 1.0).unwrap_err(),
            ZoneTableError::Gap(ZoneName::Caution)
        );
        let mut short = STANDARD_ZONES;
        short[4].2 = 0.99;
        assert_eq!(
            ZoneTable::from_bounds(&short, 1.0).unwrap_err(),
            ZoneTableError::BadEnd(0.99)
        );
        assert_eq!(
            ZoneTable::from_bounds(&[], 1.0).unwrap_err(),
            ZoneTableError::Empty
        );
    }

    #[test]
    fn flags_only_move_toward_conservative() {
        let c = classifier();
        let spike = PatternFlags {
            volatility_spike: Some(VolatilitySpike {
                trailing: 0.3,
                baseline: 0.05,
                ratio: 6.0,
            }),
            ..Default::default()
        };
        assert_eq!(c.classify(0.97, &spike, None).name, ZoneName::Danger);
        // already below the cap: unchanged
        assert_eq!(c.classify(0.2, &spike, None).name, ZoneName::Critical);

        let rebound = PatternFlags {
            rebound: Some(Rebound {
                local_min: 1.0,
                price: 1.3,
                recovery: 0.3,
            }),
            ..Default::default()
        };
        for p in [0.1, 0.55, 0.7, 0.85, 0.95] {
            let plain = c.classify(p, &PatternFlags::default(), None).name;
            let flagged = c.classify(p, &rebound, None).name;
            assert!(flagged <= plain);
        }
    }

    #[test]
    fn prior_peak_heuristic_is_opt_in() {
        let off = classifier();
        let on = RiskZoneClassifier::new(
            ZoneTable::standard(1.0).unwrap(),
            Some(PriorPeakHeuristic { threshold: 10.0 }),
        );
        let none = PatternFlags::default();
        assert_eq!(off.classify(0.95, &none, Some(50.0)).name, ZoneName::Prime);
        assert_eq!(on.classify(0.95, &none, Some(50.0)).name, ZoneName::Favorable);
        assert_eq!(on.classify(0.95, &none, Some(2.0)).name, ZoneName::Prime);
    }

    #[test]
    fn margin_peaks_mid_zone() {
        let t = ZoneTable::standard(1.0).unwrap();
        assert_relative_eq!(t.margin(0.95), 1.0, epsilon = 1e-9);
        assert_relative_eq!(t.margin(0.9), 0.0, epsilon = 1e-9);
        assert_relative_eq!(t.margin(0.25), 1.0, epsilon = 1e-9);
    }
}
