//! GPIO / ADC assignments for the TianShan supervisor board.
//!
//! Every adapter references this module rather than hard-coding pin numbers.

// ---------------------------------------------------------------------------
// Protected power rails (high-side load switches, active HIGH)
// ---------------------------------------------------------------------------

/// Enable for the compute node's 5 V buck.
pub const COMPUTE_EN_GPIO: i32 = 38;
/// Enable for the auxiliary 12 V output.
pub const AUX_EN_GPIO: i32 = 39;
/// Cooling fan MOSFET gate.
pub const FAN_EN_GPIO: i32 = 40;

// ---------------------------------------------------------------------------
// Supply voltage sense
// ---------------------------------------------------------------------------

/// ADC1 channel 3 (GPIO 4 on ESP32-S3) behind a 100k / 6.8k divider.
pub const VSUPPLY_ADC_CHANNEL: u32 = 3;

/// `(R_top + R_bottom) / R_bottom` of the sense divider.
pub const VSUPPLY_DIVIDER_RATIO: f32 = (100.0 + 6.8) / 6.8;

/// Full-scale input at 12 dB attenuation, in millivolts.
pub const ADC_FULL_SCALE_MV: f32 = 3100.0;

pub const ADC_MAX_RAW: f32 = 4095.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rails_are_distinct() {
        assert_ne!(COMPUTE_EN_GPIO, AUX_EN_GPIO);
        assert_ne!(AUX_EN_GPIO, FAN_EN_GPIO);
        assert_ne!(COMPUTE_EN_GPIO, FAN_EN_GPIO);
    }

    #[test]
    fn divider_covers_24v_supply() {
        let max_v = ADC_FULL_SCALE_MV / 1000.0 * VSUPPLY_DIVIDER_RATIO;
        assert!(max_v > 26.0, "full scale {max_v} V too low for a 24 V bus");
    }
}
