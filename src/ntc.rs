//! NTC thermistor conversion (beta equation).
//!
//! The boards wire each probe as 5V -- NTC -- A0 -- R -- GND with a 10k series
//! resistor, so a hotter probe gives a *higher* ADC count.

const SERIES_RESISTOR: f64 = 10_000.0;
const NOMINAL_RESISTANCE: f64 = 10_000.0;
const NOMINAL_TEMPERATURE_C: f64 = 25.0;
const B_COEFFICIENT: f64 = 3950.0;
const ADC_MAX: f64 = 1023.0;
const KELVIN: f64 = 273.15;

/// thermistor resistance in ohms for a 10-bit adc count
pub fn resistance_from_adc(adc: f64) -> Option<f64> {
    if !adc.is_finite() || adc <= 0.0 || adc >= ADC_MAX {
        return None;
    }
    Some(SERIES_RESISTOR * (ADC_MAX - adc) / adc)
}

/// temperature in celsius for a 10-bit adc count
pub fn temperature_from_adc(adc: f64) -> Option<f64> {
    let resistance = resistance_from_adc(adc)?;
    let mut steinhart = (resistance / NOMINAL_RESISTANCE).ln();
    steinhart /= B_COEFFICIENT;
    steinhart += 1.0 / (NOMINAL_TEMPERATURE_C + KELVIN);
    Some(1.0 / steinhart - KELVIN)
}
