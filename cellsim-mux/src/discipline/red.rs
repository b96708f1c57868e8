//! Random early detection and its fair-share variant, DFBA.
//!
//! Both judge an arriving item (or the first cell of a frame) against an
//! occupancy measure `X`: below `low_threshold` the drop probability is
//! `p_start`, at or above `high_threshold` every decision drops, and in
//! between the probability grows with `X`. DFBA additionally spares
//! connections holding at most their weighted share `X * w_i / W` of the
//! buffer, where `W` sums the weights of backlogged connections.

use std::collections::BTreeMap;

use cellsim_core::{ConfigError, ConnectionId, DataItem, Queue, SimResult};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{
    Admission, AdmissionContext, Discipline, DropReason, ServiceContext, require_at_least,
    require_probability,
};
use crate::connection::ConnectionState;

/// How the occupancy measure follows the queue length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Averaging {
    /// Current queue length
    Instantaneous,
    /// `avg = avg * (1 - weight) + occupancy * weight`, updated on every arrival
    Exponential {
        /// Weight of the newest sample, in `(0, 1]`
        weight: f64,
    },
}

/// Granularity of drop decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionScope {
    /// Every item is judged on its own
    PerItem,
    /// The first cell decides for the whole frame
    PerFrame {
        /// Queue the end-of-frame cell of a dropped frame if space allows
        deliver_end_of_frame: bool,
    },
}

/// Drop curve in use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RedVariant {
    /// Plain RED
    Classic,
    /// Fair buffer allocation; `alpha` weighs unfairness against load
    Dfba {
        /// In `[0, 1]`
        alpha: f64,
    },
}

/// Thresholds and probabilities of the drop curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RedCurve {
    /// Start of the linear region
    pub low_threshold: f64,
    /// Everything at or above drops
    pub high_threshold: f64,
    /// Probability below the low threshold
    pub p_start: f64,
    /// Probability reached at the high threshold
    pub p_max: f64,
}

impl RedCurve {
    /// Classic RED drop probability for occupancy `average`.
    pub fn drop_probability(&self, average: f64) -> f64 {
        if average < self.low_threshold {
            self.p_start
        } else if average >= self.high_threshold {
            1.0
        } else {
            self.p_max * (average - self.low_threshold)
                / (self.high_threshold - self.low_threshold)
        }
    }

    /// DFBA drop probability.
    ///
    /// `total` is the occupancy measure, `connection` the arriving
    /// connection's queued items and `share` its weight over the weight of
    /// all backlogged connections (itself included).
    pub fn dfba_drop_probability(&self, total: f64, connection: f64, share: f64, alpha: f64) -> f64 {
        if total < self.low_threshold {
            return self.p_start;
        }
        if total >= self.high_threshold {
            return 1.0;
        }
        let fair = total * share;
        if connection <= fair {
            return 0.0;
        }
        let spare = total * (1.0 - share);
        let unfairness = if spare > 0.0 {
            alpha * (connection - fair) / spare
        } else {
            0.0
        };
        let load = (1.0 - alpha) * (total - self.low_threshold)
            / (self.high_threshold - self.low_threshold);
        (self.p_max * (unfairness + load)).clamp(0.0, 1.0)
    }
}

/// RED / DFBA parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedConfig {
    /// Buffer size in items
    pub capacity: usize,
    /// Drop curve
    pub curve: RedCurve,
    /// Occupancy measure
    pub averaging: Averaging,
    /// Per item or per frame
    pub scope: DecisionScope,
    /// RED or DFBA
    pub variant: RedVariant,
    /// DFBA weight of connections missing from `weights`
    pub default_weight: f64,
    /// DFBA per-connection weights
    pub weights: BTreeMap<ConnectionId, f64>,
}

impl RedConfig {
    /// Classic per-item RED on the instantaneous queue length.
    pub fn new(capacity: usize, low_threshold: f64, high_threshold: f64, p_max: f64) -> Self {
        Self {
            capacity,
            curve: RedCurve {
                low_threshold,
                high_threshold,
                p_start: 0.0,
                p_max,
            },
            averaging: Averaging::Instantaneous,
            scope: DecisionScope::PerItem,
            variant: RedVariant::Classic,
            default_weight: 1.0,
            weights: BTreeMap::new(),
        }
    }

    /// Switches to DFBA.
    pub fn dfba(mut self, alpha: f64) -> Self {
        self.variant = RedVariant::Dfba { alpha };
        self
    }

    /// Sets the occupancy measure.
    pub fn with_averaging(mut self, averaging: Averaging) -> Self {
        self.averaging = averaging;
        self
    }

    /// Decides once per frame.
    pub fn per_frame(mut self, deliver_end_of_frame: bool) -> Self {
        self.scope = DecisionScope::PerFrame {
            deliver_end_of_frame,
        };
        self
    }

    /// Sets the DFBA weight of a connection.
    pub fn with_weight(mut self, connection: ConnectionId, weight: f64) -> Self {
        self.weights.insert(connection, weight);
        self
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If the capacity is zero
    /// - `ConfigError::ThresholdOrder` - If `low < high <= capacity` does not hold
    /// - `ConfigError::ProbabilityOutOfRange` - If a probability, the averaging weight or alpha is outside `[0, 1]`
    /// - `ConfigError::Invalid` - If a threshold is negative or a weight is not positive
    pub fn validate(&self, object: &str) -> Result<(), ConfigError> {
        require_at_least(object, "capacity", 1, self.capacity as u64)?;
        let curve = &self.curve;
        if curve.low_threshold < 0.0 || curve.low_threshold.is_nan() {
            return Err(ConfigError::Invalid {
                object: object.to_string(),
                reason: format!("low threshold {} is negative", curve.low_threshold),
            });
        }
        if curve.low_threshold >= curve.high_threshold {
            return Err(ConfigError::ThresholdOrder {
                object: object.to_string(),
                lower_name: "low_threshold",
                lower: curve.low_threshold,
                upper_name: "high_threshold",
                upper: curve.high_threshold,
            });
        }
        if curve.high_threshold > self.capacity as f64 {
            return Err(ConfigError::ThresholdOrder {
                object: object.to_string(),
                lower_name: "high_threshold",
                lower: curve.high_threshold,
                upper_name: "capacity",
                upper: self.capacity as f64,
            });
        }
        require_probability(object, "p_start", curve.p_start)?;
        require_probability(object, "p_max", curve.p_max)?;
        if let Averaging::Exponential { weight } = self.averaging {
            require_probability(object, "averaging_weight", weight)?;
            if weight == 0.0 {
                return Err(ConfigError::Invalid {
                    object: object.to_string(),
                    reason: "averaging weight must be positive".to_string(),
                });
            }
        }
        if let RedVariant::Dfba { alpha } = self.variant {
            require_probability(object, "alpha", alpha)?;
        }
        let weights = std::iter::once(&self.default_weight).chain(self.weights.values());
        for weight in weights {
            if *weight <= 0.0 || !weight.is_finite() {
                return Err(ConfigError::Invalid {
                    object: object.to_string(),
                    reason: format!("weight {weight} must be positive"),
                });
            }
        }
        Ok(())
    }
}

/// FIFO buffer with probabilistic early drop.
#[derive(Debug, Clone)]
pub struct Red {
    config: RedConfig,
    queue: Queue<DataItem>,
    average: f64,
    last_probability: f64,
}

impl Red {
    /// Creates the discipline.
    ///
    /// # Errors
    ///
    /// Every error of [`RedConfig::validate`].
    pub fn new(config: RedConfig) -> Result<Self, ConfigError> {
        let object = match config.variant {
            RedVariant::Classic => "red",
            RedVariant::Dfba { .. } => "dfba",
        };
        config.validate(object)?;
        Ok(Self {
            queue: Queue::bounded(config.capacity),
            config,
            average: 0.0,
            last_probability: 0.0,
        })
    }

    /// Current occupancy measure.
    pub fn average(&self) -> f64 {
        self.average
    }

    /// Probability used by the most recent decision.
    pub fn last_probability(&self) -> f64 {
        self.last_probability
    }

    fn update_average(&mut self) -> f64 {
        let occupancy = self.queue.len() as f64;
        self.average = match self.config.averaging {
            Averaging::Instantaneous => occupancy,
            Averaging::Exponential { weight } => {
                self.average * (1.0 - weight) + occupancy * weight
            }
        };
        self.average
    }

    /// Drop probability and the reason charged if the draw drops.
    fn judge(&self, average: f64, state: &ConnectionState, active_weight: f64) -> (f64, DropReason) {
        let curve = &self.config.curve;
        match self.config.variant {
            RedVariant::Classic => (curve.drop_probability(average), DropReason::EarlyDrop),
            RedVariant::Dfba { alpha } => {
                if average < curve.low_threshold || average >= curve.high_threshold {
                    return (curve.drop_probability(average), DropReason::EarlyDrop);
                }
                let total_weight = if state.is_backlogged() {
                    active_weight
                } else {
                    active_weight + state.weight
                };
                let share = state.weight / total_weight;
                let probability = curve.dfba_drop_probability(
                    average,
                    state.queued_items as f64,
                    share,
                    alpha,
                );
                (probability, DropReason::FairShare)
            }
        }
    }
}

impl Discipline for Red {
    fn kind(&self) -> &'static str {
        match self.config.variant {
            RedVariant::Classic => "red",
            RedVariant::Dfba { .. } => "dfba",
        }
    }

    fn configure_connection(&self, id: ConnectionId, state: &mut ConnectionState) {
        state.weight = self
            .config
            .weights
            .get(&id)
            .copied()
            .unwrap_or(self.config.default_weight);
    }

    fn admit(&mut self, ctx: &mut AdmissionContext<'_>, item: DataItem) -> SimResult<Admission> {
        let average = self.update_average();
        let active_weight = ctx.connections.active_weight();
        let connection = item.connection;
        let end_of_frame = item.end_of_frame;

        let state = ctx.connections.state_mut(connection);
        let first_cell = state.first;
        let decides = match self.config.scope {
            DecisionScope::PerItem => true,
            DecisionScope::PerFrame { .. } => first_cell,
        };

        let mut verdict = None;
        if decides {
            let (probability, reason) = self.judge(average, state, active_weight);
            self.last_probability = probability;
            let drop = ctx.rng.random_bool(probability);
            state.admissible = !drop;
            if drop {
                trace!(%connection, average, probability, %reason, "early drop");
                verdict = Some(reason);
            }
        }
        let admissible = state.admissible;
        state.first = end_of_frame;

        let admission = match (verdict, self.config.scope) {
            (Some(reason), _) => Admission::dropped(item, reason),
            (None, _) if admissible => Admission::from_enqueue(self.queue.enqueue(item)),
            (
                None,
                DecisionScope::PerFrame {
                    deliver_end_of_frame: true,
                },
            ) if end_of_frame => Admission::from_enqueue(self.queue.enqueue(item)),
            (None, _) => Admission::dropped(item, DropReason::FrameDiscard),
        };
        Ok(admission)
    }

    fn dequeue(&mut self, _ctx: &mut ServiceContext<'_>) -> SimResult<Option<DataItem>> {
        Ok(self.queue.dequeue())
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn set_capacity(&mut self, capacity: usize) -> Result<(), ConfigError> {
        let resized = RedConfig {
            capacity,
            ..self.config.clone()
        };
        resized.validate(self.kind())?;
        self.queue.set_capacity(Some(capacity));
        self.config = resized;
        Ok(())
    }

    fn value(&self, name: &str) -> Option<f64> {
        match name {
            "average" => Some(self.average),
            "drop_probability" => Some(self.last_probability),
            _ => None,
        }
    }

    fn value_names(&self) -> Vec<String> {
        vec!["average".to_string(), "drop_probability".to_string()]
    }

    fn for_each_item(&mut self, visit: &mut dyn FnMut(&mut DataItem)) {
        self.queue.iter_mut().for_each(visit);
    }

    fn drain(&mut self) -> Vec<DataItem> {
        self.average = 0.0;
        self.last_probability = 0.0;
        self.queue.drain()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::discipline::test_support::Harness;

    fn curve() -> RedCurve {
        RedCurve {
            low_threshold: 4.0,
            high_threshold: 12.0,
            p_start: 0.0,
            p_max: 0.5,
        }
    }

    fn dropped_reason(admission: &Admission) -> Option<DropReason> {
        match admission {
            Admission::Dropped { reason, .. } => Some(*reason),
            Admission::Queued => None,
        }
    }

    #[test]
    fn test_curve_regions() {
        let curve = curve();
        assert_eq!(curve.drop_probability(3.9), 0.0);
        assert_eq!(curve.drop_probability(4.0), 0.0);
        assert_eq!(curve.drop_probability(8.0), 0.25);
        assert_eq!(curve.drop_probability(12.0), 1.0);
        assert_eq!(curve.drop_probability(40.0), 1.0);

        let with_floor = RedCurve {
            p_start: 0.01,
            ..curve
        };
        assert_eq!(with_floor.drop_probability(1.0), 0.01);
    }

    #[test]
    fn test_dfba_spares_fair_share() {
        let curve = curve();
        // Two equal connections, X = 8: fair share is 4.
        assert_eq!(curve.dfba_drop_probability(8.0, 4.0, 0.5, 0.5), 0.0);
        assert_eq!(curve.dfba_drop_probability(8.0, 3.0, 0.5, 0.5), 0.0);
        // Above the share: 0.5 * (0.5 * 2/4 + 0.5 * 4/8) = 0.25
        let probability = curve.dfba_drop_probability(8.0, 6.0, 0.5, 0.5);
        assert!((probability - 0.25).abs() < 1e-12);
        assert_eq!(curve.dfba_drop_probability(2.0, 2.0, 0.5, 0.5), 0.0);
        assert_eq!(curve.dfba_drop_probability(12.0, 0.0, 0.5, 0.5), 1.0);
    }

    #[test]
    fn test_dfba_probability_is_clamped() {
        let curve = RedCurve {
            p_max: 1.0,
            ..curve()
        };
        let probability = curve.dfba_drop_probability(11.0, 11.0, 0.1, 1.0);
        assert!(probability <= 1.0);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(matches!(
            Red::new(RedConfig::new(16, 8.0, 8.0, 0.1)),
            Err(ConfigError::ThresholdOrder { .. })
        ));
        assert!(matches!(
            Red::new(RedConfig::new(16, 4.0, 20.0, 0.1)),
            Err(ConfigError::ThresholdOrder { .. })
        ));
        assert!(matches!(
            Red::new(RedConfig::new(16, 4.0, 8.0, 1.5)),
            Err(ConfigError::ProbabilityOutOfRange { .. })
        ));
        assert!(matches!(
            Red::new(RedConfig::new(16, 4.0, 8.0, 0.1).dfba(2.0)),
            Err(ConfigError::ProbabilityOutOfRange { .. })
        ));
        assert!(matches!(
            Red::new(
                RedConfig::new(16, 4.0, 8.0, 0.1)
                    .with_averaging(Averaging::Exponential { weight: 0.0 })
            ),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            Red::new(RedConfig::new(16, 4.0, 8.0, 0.1).with_weight(ConnectionId(1), 0.0)),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_no_drops_below_low_threshold_and_all_above_high() {
        let mut harness = Harness::new(Red::new(RedConfig::new(16, 4.0, 6.0, 0.5)).unwrap());
        for _ in 0..5 {
            assert_eq!(harness.cell(1, true), Admission::Queued);
        }
        // Queue holds 5; keep offering until the queue reaches the high threshold.
        while harness.discipline.len() < 6 {
            harness.cell(1, true);
        }
        for _ in 0..10 {
            assert_eq!(
                dropped_reason(&harness.cell(1, true)),
                Some(DropReason::EarlyDrop)
            );
        }
        assert_eq!(harness.discipline.value("drop_probability"), Some(1.0));
    }

    #[test]
    fn test_exponential_average_lags_queue() {
        let config =
            RedConfig::new(16, 4.0, 8.0, 0.1).with_averaging(Averaging::Exponential { weight: 0.5 });
        let mut harness = Harness::new(Red::new(config).unwrap());
        harness.cell(1, true);
        harness.cell(1, true);
        harness.cell(1, true);
        // Samples 0, 1, 2: 0 -> 0.5 -> 1.25
        assert_eq!(harness.discipline.average(), 1.25);
        assert_eq!(harness.discipline.len(), 3);
    }

    #[test]
    fn test_per_frame_decision_holds_for_frame() {
        let config = RedConfig::new(32, 1.0, 2.0, 0.5).per_frame(true);
        let mut harness = Harness::new(Red::new(config).unwrap());
        harness.cell(9, true);
        harness.cell(9, true);

        // Occupancy 2 is at the high threshold: the frame is dropped.
        assert_eq!(
            dropped_reason(&harness.cell(1, false)),
            Some(DropReason::EarlyDrop)
        );
        harness.serve();
        harness.serve();
        assert_eq!(
            dropped_reason(&harness.cell(1, false)),
            Some(DropReason::FrameDiscard)
        );
        assert_eq!(harness.cell(1, true), Admission::Queued);
        // Back at the low threshold, where the curve starts at zero.
        assert_eq!(harness.cell(1, false), Admission::Queued);
    }

    #[test]
    fn test_per_frame_end_of_frame_dropped_without_delivery_option() {
        let config = RedConfig::new(32, 1.0, 2.0, 0.5).per_frame(false);
        let mut harness = Harness::new(Red::new(config).unwrap());
        harness.cell(9, true);
        harness.cell(9, true);

        assert!(harness.cell(1, false) != Admission::Queued);
        assert_eq!(
            dropped_reason(&harness.cell(1, true)),
            Some(DropReason::FrameDiscard)
        );
    }

    #[test]
    fn test_dfba_between_thresholds_never_drops_fair_connection() {
        let config = RedConfig::new(64, 2.0, 40.0, 1.0).dfba(1.0);
        let mut harness = Harness::new(Red::new(config).unwrap());
        // Connection 1 hogs the buffer.
        for _ in 0..20 {
            harness.cell(1, true);
        }
        // Connection 2 holds nothing, far under its share.
        for _ in 0..5 {
            assert_eq!(harness.cell(2, true), Admission::Queued);
        }
        assert!(harness.discipline.len() >= 25);
    }

    #[test]
    fn test_dfba_drop_charged_as_fair_share() {
        let config = RedConfig::new(64, 2.0, 40.0, 1.0).dfba(1.0);
        let mut harness = Harness::new(Red::new(config).unwrap());
        harness.cell(2, true);
        let mut reasons = Vec::new();
        for _ in 0..30 {
            if let Some(reason) = dropped_reason(&harness.cell(1, true)) {
                reasons.push(reason);
            }
        }
        assert!(!reasons.is_empty());
        assert!(reasons.iter().all(|reason| *reason == DropReason::FairShare));
    }

    #[test]
    fn test_weights_assigned_on_first_sight() {
        let config = RedConfig::new(8, 2.0, 6.0, 0.1)
            .dfba(0.5)
            .with_weight(ConnectionId(3), 4.0);
        let mut harness = Harness::new(Red::new(config).unwrap());
        harness.cell(3, true);
        harness.cell(4, true);
        assert_eq!(harness.connections.get(ConnectionId(3)).unwrap().weight, 4.0);
        assert_eq!(harness.connections.get(ConnectionId(4)).unwrap().weight, 1.0);
        assert_eq!(harness.discipline.kind(), "dfba");
    }

    proptest! {
        #[test]
        fn prop_curve_is_monotone_probability(
            low in 0.0f64..50.0,
            width in 0.5f64..50.0,
            p_max in 0.0f64..=1.0,
            a in 0.0f64..120.0,
            b in 0.0f64..120.0,
        ) {
            let curve = RedCurve {
                low_threshold: low,
                high_threshold: low + width,
                p_start: 0.0,
                p_max,
            };
            let (lower, upper) = if a <= b { (a, b) } else { (b, a) };
            let (p_lower, p_upper) = (curve.drop_probability(lower), curve.drop_probability(upper));
            prop_assert!((0.0..=1.0).contains(&p_lower));
            prop_assert!(p_lower <= p_upper);
        }

        #[test]
        fn prop_dfba_never_drops_within_share(
            total in 4.0f64..12.0,
            share in 0.01f64..=1.0,
            fraction in 0.0f64..=1.0,
            alpha in 0.0f64..=1.0,
        ) {
            let curve = curve();
            let connection = total * share * fraction;
            prop_assert_eq!(curve.dfba_drop_probability(total, connection, share, alpha), 0.0);
        }
    }

    #[test]
    fn test_resize_below_high_threshold_rejected() {
        let mut red = Red::new(RedConfig::new(16, 4.0, 12.0, 0.5)).unwrap();
        assert!(matches!(
            red.set_capacity(8),
            Err(ConfigError::ThresholdOrder {
                lower_name: "high_threshold",
                ..
            })
        ));
        assert_eq!(red.capacity(), 16);

        red.set_capacity(12).unwrap();
        assert_eq!(red.capacity(), 12);
        assert_eq!(red.value("average"), Some(0.0));
    }
}
