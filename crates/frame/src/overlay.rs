use serde::{Deserialize, Serialize};

/// Per-layer placement and blending parameters for compositing.
///
/// Anchors are in normalized device coordinates, so `(-1, -1)` is the
/// bottom-left corner and `(1, 1)` the top-right. The overlay anchor is
/// pinned to the background anchor, then scale and rotation are applied
/// around it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlaySettings {
    /// Multiplier on the layer's alpha channel, in `[0, 1]`.
    pub alpha_scale: f32,
    /// Point in the background the overlay anchor is pinned to.
    pub background_anchor: (f32, f32),
    /// Point in the overlay pinned to the background anchor.
    pub overlay_anchor: (f32, f32),
    /// Per-axis scale applied to the overlay.
    pub scale: (f32, f32),
    /// Counterclockwise rotation, in degrees.
    pub rotation_degrees: f32,
    /// Multiplier on RGB values, for matching SDR overlays to HDR output.
    pub luminance_multiplier: f32,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            alpha_scale: 1.0,
            background_anchor: (0.0, 0.0),
            overlay_anchor: (0.0, 0.0),
            scale: (1.0, 1.0),
            rotation_degrees: 0.0,
            luminance_multiplier: 1.0,
        }
    }
}

impl OverlaySettings {
    pub fn with_alpha_scale(mut self, alpha_scale: f32) -> Self {
        assert!(
            (0.0..=1.0).contains(&alpha_scale),
            "alpha scale must be in [0, 1]"
        );
        self.alpha_scale = alpha_scale;
        self
    }

    pub fn with_background_anchor(mut self, x: f32, y: f32) -> Self {
        assert_anchor(x, y);
        self.background_anchor = (x, y);
        self
    }

    pub fn with_overlay_anchor(mut self, x: f32, y: f32) -> Self {
        assert_anchor(x, y);
        self.overlay_anchor = (x, y);
        self
    }

    pub fn with_scale(mut self, x: f32, y: f32) -> Self {
        self.scale = (x, y);
        self
    }

    pub fn with_rotation_degrees(mut self, degrees: f32) -> Self {
        self.rotation_degrees = degrees;
        self
    }

    pub fn with_luminance_multiplier(mut self, multiplier: f32) -> Self {
        assert!(multiplier > 0.0, "luminance multiplier must be positive");
        self.luminance_multiplier = multiplier;
        self
    }
}

fn assert_anchor(x: f32, y: f32) {
    assert!(
        (-1.0..=1.0).contains(&x) && (-1.0..=1.0).contains(&y),
        "anchor coordinates must be in [-1, 1]"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_identity_placement() {
        let s = OverlaySettings::default();
        assert_eq!(s.alpha_scale, 1.0);
        assert_eq!(s.scale, (1.0, 1.0));
        assert_eq!(s.rotation_degrees, 0.0);
    }

    #[test]
    #[should_panic(expected = "alpha scale")]
    fn alpha_scale_out_of_range_rejected() {
        OverlaySettings::default().with_alpha_scale(1.5);
    }

    #[test]
    #[should_panic(expected = "anchor coordinates")]
    fn anchor_out_of_range_rejected() {
        OverlaySettings::default().with_background_anchor(2.0, 0.0);
    }
}
