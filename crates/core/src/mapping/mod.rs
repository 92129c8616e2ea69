use crate::{FrequencyFrame, Result, SmoothingParams, VisualiserError};

/// Maps frequency bins onto per-bar heights and eases each bar towards its
/// target. Bar `i` reads bin `i`.
#[derive(Debug, Clone)]
pub struct BandMapper {
    params: SmoothingParams,
    bar_count: usize,
}

impl BandMapper {
    /// Fails when the parameters are out of range or when there are more bars
    /// than the analyser produces bins.
    pub fn new(params: SmoothingParams, bar_count: usize, bin_count: usize) -> Result<Self> {
        params.validate()?;
        if bar_count > bin_count {
            return Err(VisualiserError::config(format!(
                "bar count {bar_count} exceeds the {bin_count} available frequency bins"
            )));
        }
        Ok(Self { params, bar_count })
    }

    pub fn params(&self) -> &SmoothingParams {
        &self.params
    }

    pub fn bar_count(&self) -> usize {
        self.bar_count
    }

    /// Height every bar rests at before any audio arrives.
    pub fn resting_state(&self) -> Vec<f32> {
        vec![self.params.min_scale; self.bar_count]
    }

    /// Clamped height a single magnitude asks for.
    pub fn target(&self, magnitude: u8) -> f32 {
        (magnitude as f32 / self.params.scale_divisor)
            .clamp(self.params.min_scale, self.params.max_scale)
    }

    /// One exponential smoothing step from `previous` towards `target`.
    pub fn step(&self, previous: f32, target: f32) -> f32 {
        // Same as `previous + (target - previous) * alpha`, but exact at alpha = 1.
        let alpha = self.params.alpha;
        let next = target * alpha + previous * (1.0 - alpha);
        // Rounding must never carry a bar past its target.
        let (low, high) = if previous <= target {
            (previous, target)
        } else {
            (target, previous)
        };
        next.clamp(low, high)
            .clamp(self.params.min_scale, self.params.max_scale)
    }

    /// Computes the next smoothed state from a frame and the previous state.
    /// Bins beyond the frame length read as silence.
    pub fn map(&self, frame: &FrequencyFrame, previous: &[f32]) -> Vec<f32> {
        (0..self.bar_count)
            .map(|index| {
                let target = self.target(frame.get(index).unwrap_or(0));
                let previous = previous.get(index).copied().unwrap_or(self.params.min_scale);
                self.step(previous, target)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(alpha: f32) -> SmoothingParams {
        SmoothingParams {
            alpha,
            min_scale: 0.1,
            max_scale: 3.0,
            scale_divisor: 64.0,
        }
    }

    #[test]
    fn rejects_more_bars_than_bins() {
        let err = BandMapper::new(params(0.5), 65, 64).unwrap_err();
        assert!(matches!(err, VisualiserError::Config(_)));
    }

    #[test]
    fn full_scale_frame_clamps_to_max() {
        // 255 / 64 = 3.984, above the 3.0 ceiling.
        let mapper = BandMapper::new(params(1.0), 64, 64).unwrap();
        let frame = FrequencyFrame::new(vec![255; 64]);

        let next = mapper.map(&frame, &mapper.resting_state());

        assert_eq!(next.len(), 64);
        assert!(next.iter().all(|&value| value == 3.0));
    }

    #[test]
    fn unclamped_target_is_the_scaled_magnitude() {
        let mapper = BandMapper::new(params(1.0), 4, 4).unwrap();
        assert_eq!(mapper.target(128), 2.0);
        assert_eq!(mapper.target(0), 0.1);
    }

    #[test]
    fn alpha_controls_the_step_size() {
        let mapper = BandMapper::new(params(0.25), 1, 1).unwrap();
        let frame = FrequencyFrame::new(vec![128]);

        let next = mapper.map(&frame, &[1.0]);

        assert!((next[0] - 1.25).abs() < 1e-6);
    }

    #[test]
    fn output_stays_within_bounds() {
        let mapper = BandMapper::new(params(0.7), 8, 8).unwrap();
        let previous_states = [
            vec![0.0; 8],
            vec![100.0; 8],
            vec![-5.0, 0.1, 0.5, 1.0, 2.0, 3.0, 4.0, f32::MAX],
        ];
        let frames = [
            FrequencyFrame::zeroed(8),
            FrequencyFrame::new(vec![255; 8]),
            FrequencyFrame::new(vec![0, 1, 7, 63, 64, 128, 200, 255]),
        ];

        for previous in &previous_states {
            for frame in &frames {
                for value in mapper.map(frame, previous) {
                    assert!((0.1..=3.0).contains(&value), "{value} escaped the bounds");
                }
            }
        }
    }

    #[test]
    fn converges_towards_a_constant_target_without_overshoot() {
        for alpha in [0.05, 0.3, 0.9, 1.0] {
            let mapper = BandMapper::new(params(alpha), 1, 1).unwrap();
            let frame = FrequencyFrame::new(vec![160]);
            let target = mapper.target(160);

            let mut state = mapper.resting_state();
            let mut distance = (target - state[0]).abs();
            for _ in 0..200 {
                state = mapper.map(&frame, &state);
                assert!(state[0] <= target, "alpha {alpha} overshot");
                let next_distance = (target - state[0]).abs();
                assert!(next_distance <= distance);
                distance = next_distance;
            }
            assert!(distance < 1e-3, "alpha {alpha} stalled at {distance}");
        }
    }

    #[test]
    fn silence_decays_to_the_floor_not_zero() {
        let mapper = BandMapper::new(params(0.2), 2, 2).unwrap();
        let silence = FrequencyFrame::zeroed(2);

        let mut state = vec![3.0, 1.5];
        for _ in 0..500 {
            state = mapper.map(&silence, &state);
        }

        for value in state {
            assert!((value - 0.1).abs() < 1e-4);
        }
    }
}
