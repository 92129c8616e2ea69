use serde::{Deserialize, Serialize};

use crate::{BandMapper, FrequencyFrame};

/// A rendered object whose vertical scale and position the core drives.
pub trait VisualElement {
    fn set_scale_y(&mut self, scale: f32);
    fn set_position_y(&mut self, position: f32);
}

/// Index-addressable collection of visual elements owned by the rendering
/// layer. The core only looks elements up; it never adds, removes or reorders
/// them.
pub trait VisualElementRegistry {
    /// Element at `index`, or `None` if it has not been constructed yet.
    fn element_mut(&mut self, index: usize) -> Option<&mut dyn VisualElement>;
}

/// Smoothed height of one bar and the position derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisualState {
    pub scale: f32,
    pub position: f32,
}

impl VisualState {
    /// The base stays on the reference plane, so the centre sits at half the
    /// height.
    pub fn from_scale(scale: f32) -> Self {
        Self {
            scale,
            position: scale / 2.0,
        }
    }
}

/// Outcome of one bind pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BindReport {
    pub written: usize,
    pub skipped: usize,
}

/// Sole writer of visual state. Keeps the smoothed height of every bar between
/// frames and pushes it into the registry once per frame.
#[derive(Debug, Clone)]
pub struct VisualBinder {
    mapper: BandMapper,
    states: Vec<VisualState>,
}

impl VisualBinder {
    pub fn new(mapper: BandMapper) -> Self {
        let states = resting(&mapper);
        Self { mapper, states }
    }

    pub fn mapper(&self) -> &BandMapper {
        &self.mapper
    }

    pub fn states(&self) -> &[VisualState] {
        &self.states
    }

    pub fn heights(&self) -> Vec<f32> {
        self.states.iter().map(|state| state.scale).collect()
    }

    /// Puts every bar back at its resting height.
    pub fn reset(&mut self) {
        self.states = resting(&self.mapper);
    }

    /// Smooths the bars towards `frame` and writes the result into `registry`.
    pub fn bind(
        &mut self,
        frame: &FrequencyFrame,
        registry: &mut dyn VisualElementRegistry,
    ) -> BindReport {
        let next = self.mapper.map(frame, &self.heights());
        self.states = next.into_iter().map(VisualState::from_scale).collect();
        self.apply(registry)
    }

    /// Writes the current state without advancing it. Missing elements are
    /// skipped.
    pub fn apply(&self, registry: &mut dyn VisualElementRegistry) -> BindReport {
        let mut report = BindReport::default();
        for (index, state) in self.states.iter().enumerate() {
            match registry.element_mut(index) {
                Some(element) => {
                    element.set_scale_y(state.scale);
                    element.set_position_y(state.position);
                    report.written += 1;
                }
                None => report.skipped += 1,
            }
        }
        report
    }
}

fn resting(mapper: &BandMapper) -> Vec<VisualState> {
    mapper
        .resting_state()
        .into_iter()
        .map(VisualState::from_scale)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SmoothingParams;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Probe {
        scale: f32,
        position: f32,
        writes: usize,
    }

    impl VisualElement for Probe {
        fn set_scale_y(&mut self, scale: f32) {
            self.scale = scale;
            self.writes += 1;
        }

        fn set_position_y(&mut self, position: f32) {
            self.position = position;
        }
    }

    struct Sparse(Vec<Option<Probe>>);

    impl VisualElementRegistry for Sparse {
        fn element_mut(&mut self, index: usize) -> Option<&mut dyn VisualElement> {
            self.0
                .get_mut(index)
                .and_then(Option::as_mut)
                .map(|probe| probe as &mut dyn VisualElement)
        }
    }

    fn binder(bars: usize) -> VisualBinder {
        let params = SmoothingParams {
            alpha: 1.0,
            min_scale: 0.1,
            max_scale: 8.0,
            scale_divisor: 32.0,
        };
        VisualBinder::new(BandMapper::new(params, bars, 64).unwrap())
    }

    #[test]
    fn position_follows_half_the_scale() {
        let mut binder = binder(2);
        let mut registry = Sparse(vec![Some(Probe::default()), Some(Probe::default())]);

        let report = binder.bind(&FrequencyFrame::new(vec![64, 96]), &mut registry);

        assert_eq!(report, BindReport { written: 2, skipped: 0 });
        let first = registry.0[0].as_ref().unwrap();
        assert_eq!(first.scale, 2.0);
        assert_eq!(first.position, 1.0);
        let second = registry.0[1].as_ref().unwrap();
        assert_eq!(second.scale, 3.0);
        assert_eq!(second.position, 1.5);
    }

    #[test]
    fn missing_elements_are_skipped() {
        let mut binder = binder(3);
        let mut registry = Sparse(vec![Some(Probe::default()), None]);

        let report = binder.bind(&FrequencyFrame::new(vec![32, 32, 32]), &mut registry);

        assert_eq!(report, BindReport { written: 1, skipped: 2 });
        assert_eq!(registry.0.len(), 2);
        assert_eq!(registry.0[0].as_ref().unwrap().writes, 1);
    }

    #[test]
    fn state_persists_between_frames() {
        let params = SmoothingParams {
            alpha: 0.5,
            ..Default::default()
        };
        let mut binder = VisualBinder::new(BandMapper::new(params, 1, 1).unwrap());
        let mut registry = Sparse(vec![Some(Probe::default())]);
        let loud = FrequencyFrame::new(vec![255]);

        binder.bind(&loud, &mut registry);
        let first = binder.states()[0].scale;
        binder.bind(&loud, &mut registry);
        let second = binder.states()[0].scale;

        assert!(second > first);
        binder.reset();
        assert_eq!(binder.heights(), vec![0.1]);
    }
}
