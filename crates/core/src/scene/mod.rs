use std::f32::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::{BarConfig, VisualElement, VisualElementRegistry};

/// Transform of one bar on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BarTransform {
    pub x: f32,
    pub z: f32,
    /// Rotation about the vertical axis so the bar faces the centre.
    pub yaw: f32,
    pub scale_y: f32,
    pub position_y: f32,
}

impl VisualElement for BarTransform {
    fn set_scale_y(&mut self, scale: f32) {
        self.scale_y = scale;
    }

    fn set_position_y(&mut self, position: f32) {
        self.position_y = position;
    }
}

/// Places `count` bars evenly around a circle of `radius`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadialLayout {
    pub count: usize,
    pub radius: f32,
}

impl RadialLayout {
    pub fn new(count: usize, radius: f32) -> Self {
        Self { count, radius }
    }

    /// Unit-height bar resting on the ground plane at ring slot `index`.
    pub fn transform(&self, index: usize) -> BarTransform {
        let angle = index as f32 / self.count.max(1) as f32 * TAU;
        let x = angle.cos() * self.radius;
        let z = angle.sin() * self.radius;
        BarTransform {
            x,
            z,
            yaw: (-x).atan2(-z),
            scale_y: 1.0,
            position_y: 0.5,
        }
    }
}

impl From<&BarConfig> for RadialLayout {
    fn from(config: &BarConfig) -> Self {
        Self::new(config.count, config.radius)
    }
}

/// Simple registry of bars laid out on a ring. Slots can be left empty to model
/// bars the renderer has not built yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarField {
    bars: Vec<Option<BarTransform>>,
}

impl BarField {
    /// Builds every bar of `layout`.
    pub fn build(layout: &RadialLayout) -> Self {
        Self {
            bars: (0..layout.count)
                .map(|index| Some(layout.transform(index)))
                .collect(),
        }
    }

    /// Reserves `count` slots without building any bar.
    pub fn with_slots(count: usize) -> Self {
        Self {
            bars: vec![None; count],
        }
    }

    /// Builds (or rebuilds) the bar in slot `index`.
    pub fn construct(&mut self, layout: &RadialLayout, index: usize) {
        if let Some(slot) = self.bars.get_mut(index) {
            *slot = Some(layout.transform(index));
        }
    }

    pub fn bar(&self, index: usize) -> Option<&BarTransform> {
        self.bars.get(index).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Heights of every constructed bar, in slot order.
    pub fn heights(&self) -> Vec<f32> {
        self.bars.iter().flatten().map(|bar| bar.scale_y).collect()
    }
}

impl VisualElementRegistry for BarField {
    fn element_mut(&mut self, index: usize) -> Option<&mut dyn VisualElement> {
        self.bars
            .get_mut(index)
            .and_then(Option::as_mut)
            .map(|bar| bar as &mut dyn VisualElement)
    }
}
