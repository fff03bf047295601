//! Scalar configuration blocks.
//!
//! Field order is the order the host tool sends and expects items in, and
//! the order the words are laid out in storage. Do not reorder.

use super::ItemKind;

macro_rules! config_block {
    (@ty F) => { f32 };
    (@ty I) => { i32 };
    (@kind F) => { ItemKind::Float };
    (@kind I) => { ItemKind::Int };
    (@encode F, $value:expr) => { ($value).to_bits() };
    (@encode I, $value:expr) => { u32::from_le_bytes(($value).to_le_bytes()) };
    (@decode F, $word:expr) => { f32::from_bits($word) };
    (@decode I, $word:expr) => { i32::from_le_bytes(($word).to_le_bytes()) };
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$field_meta:meta])* $field:ident : $kind:ident = $default:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq)]
        pub struct $name {
            $( $(#[$field_meta])* pub $field: config_block!(@ty $kind), )+
        }

        impl $name {
            /// Storage type of each item, in wire order.
            pub const KINDS: &'static [ItemKind] = &[ $( config_block!(@kind $kind) ),+ ];
            pub const ITEMS: usize = Self::KINDS.len();
            pub const DEFAULT: Self = Self { $( $field: $default, )+ };

            /// Serializes into `out`, which must hold at least [`Self::ITEMS`] words.
            pub fn write_words(&self, out: &mut [u32]) {
                let mut slots = out.iter_mut();
                $(
                    if let Some(slot) = slots.next() {
                        *slot = config_block!(@encode $kind, self.$field);
                    }
                )+
            }

            /// Rebuilds the block from raw words. Missing words read as zero.
            #[must_use]
            pub fn read_words(words: &[u32]) -> Self {
                let mut words = words.iter().copied();
                Self {
                    $( $field: config_block!(@decode $kind, words.next().unwrap_or(0)), )+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::DEFAULT
            }
        }
    };
}

config_block! {
    /// Low-pass filter coefficients for sensor conditioning.
    pub struct Filters {
        map: F = 0.5,
        lambda: F = 0.5,
        coolant_temp: F = 0.01,
        air_temp: F = 0.1,
        tps: F = 0.5,
        voltage: F = 0.01,
        reserved: I = 0,
        /// Shift applied by the crank period IIR filter.
        crank_pulse_shift: I = 3,
    }
}

config_block! {
    /// Compensation, idle, AFR and enrichment tuning.
    pub struct Parameters1 {
        eng_temp_comp_t1: F = 0.0,
        eng_temp_comp_c1: F = 10.0,
        eng_temp_comp_t2: F = 50.0,
        eng_temp_comp_c2: F = -5.0,
        air_temp_comp_t1: F = 0.0,
        air_temp_comp_c1: F = 7.3,
        air_temp_comp_t2: F = 60.0,
        air_temp_comp_c2: F = -11.5,
        vvt_pwm1: F = 0.0,
        vvt_rpm1: F = 1000.0,
        vvt_pwm2: F = 100.0,
        vvt_rpm2: F = 4000.0,
        cranking_threshold: F = 500.0,
        cranking_pw: F = 6000.0,
        accel_comp_limit: F = 7.5,
        accel_comp_amplitude: F = 0.5,
        accel_comp_duration: F = 500.0,
        cooling_fan_on_temp: F = 88.0,
        tps_fast_idle_value: F = 10.0,
        tps_fast_idle_temp: F = 5.0,
        tps_normal_idle_value: F = 0.0,
        tps_normal_idle_temp: F = 50.0,
        idle_actuator_gain: F = 3.0,
        reserved: F = 0.0,
        idle_control_threshold: F = 0.0,
        idle_control_delay: F = 0.0,
        afr_correction_gain_p: F = 0.010,
        afr_correction_gain_i: F = 0.001,
        afr_averaging_filter_tc: F = 0.0005,
        /// Minutes between AFR data saves; zero disables saving.
        afr_data_save_period: F = 10.0,
        /// Post-start enrichment, percent.
        pse_start_value: F = 30.0,
        pse_decay_time: F = 15.0,
        /// Post-start idle throttle, percent.
        psit_start_value: F = 6.0,
        psit_decay_time: F = 15.0,
    }
}

config_block! {
    /// Engine geometry, injector and sensor calibration.
    pub struct Parameters2 {
        ecu_id: I = 32,
        rpm_cells: I = 8,
        load_cells: I = 8,
        rpm_axis_start: F = 750.0,
        rpm_axis_delta: F = 700.0,
        load_axis_start: F = 30.0,
        load_axis_delta: F = 10.0,
        required_fuel: F = 6.10,
        injector_latency: F = 0.5,
        ignition_firing_sense: I = -1,
        ignition_dwell: F = 4.0,
        tw_teeth: I = 36,
        tw_missing_teeth: I = 1,
        tw_tdc_angle: F = 138.0,
        injector_start_angle: F = 15.0,
        injector_index0: I = 1,
        injector_index1: I = 2,
        injector_index2: I = 1,
        injector_index3: I = 2,
        injector_sequence_reset: I = -1,
        thermistor_t1: F = 7.0,
        thermistor_r1: F = 2800.0,
        thermistor_t2: F = 100.0,
        thermistor_r2: F = 180.0,
        tps_closed_mv: F = 3248.0,
        tps_open_mv: F = 628.0,
        idle_actuator_type: I = 2,
    }
}

impl Parameters2 {
    /// Both table axes have a finite start and a finite, positive spacing.
    #[must_use]
    pub fn axes_valid(&self) -> bool {
        axis_valid(self.rpm_axis_start, self.rpm_axis_delta)
            && axis_valid(self.load_axis_start, self.load_axis_delta)
    }
}

fn axis_valid(start: f32, delta: f32) -> bool {
    start.is_finite() && delta.is_finite() && delta > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_counts_match_host_layout() {
        assert_eq!(Filters::ITEMS, 8);
        assert_eq!(Parameters1::ITEMS, 34);
        assert_eq!(Parameters2::ITEMS, 27);
    }

    #[test]
    fn parameters2_kinds_follow_type_string() {
        let expected = "IIIFFFFFFIFIIFFIIIIIFFFFFFI";
        for (kind, code) in Parameters2::KINDS.iter().zip(expected.chars()) {
            let want = if code == 'I' { ItemKind::Int } else { ItemKind::Float };
            assert_eq!(*kind, want);
        }
    }

    #[test]
    fn negative_integers_survive_word_encoding() {
        let mut words = [0u32; Parameters2::ITEMS];
        Parameters2::DEFAULT.write_words(&mut words);
        assert_eq!(words[9], u32::MAX, "firing sense -1 is all ones");

        let back = Parameters2::read_words(&words);
        assert_eq!(back, Parameters2::DEFAULT);
    }
}
