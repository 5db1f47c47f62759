// THEORY:
// The kinetics integrator is the only place the bleaching/regeneration model
// is written down:
//
//     d(opsin)/dt = ca * radiance * (1 - opsin) - cd * opsin
//
// One call to `step` advances every sample by one explicit Euler step of
// length `dt`, using the (ca, cd) pair of the sample's channel. Grayscale,
// RGB and spectral runs all go through this one loop; the channel count only
// decides how many constants are looked up per pixel.
//
// The integrator does not validate numbers, it contains them: every updated
// sample is clamped to [0, 1], and an update that comes out NaN keeps the
// previous value. `step_strict` is the entry point for callers who want bad
// radiance rejected up front instead.

use crate::core_modules::channel_model::ChannelKinetics;
use crate::core_modules::tensor::{OpsinState, RadianceMap, clamp_unit};
use crate::error::{SimulationError, SimulationResult};

/// The value range a radiance map is expected to respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadianceRange {
    /// Display-referred samples in [0, 1].
    Normalized,
    /// Receptor excitations: any finite, non-negative value.
    Excitation,
}

/// Advances `state` by one Euler step without modifying either input.
pub fn step(
    state: &OpsinState,
    radiance: &RadianceMap,
    kinetics: &ChannelKinetics,
) -> SimulationResult<OpsinState> {
    check_compatible(state, radiance, kinetics)?;
    let mut next = state.clone();
    advance(&mut next, radiance, kinetics);
    Ok(next)
}

/// Like `step`, but rejects radiance outside `range` before integrating.
pub fn step_strict(
    state: &OpsinState,
    radiance: &RadianceMap,
    kinetics: &ChannelKinetics,
    range: RadianceRange,
) -> SimulationResult<OpsinState> {
    validate_radiance(radiance, range)?;
    step(state, radiance, kinetics)
}

/// Reports the first sample of `radiance` that falls outside `range`.
pub fn validate_radiance(radiance: &RadianceMap, range: RadianceRange) -> SimulationResult<()> {
    let upper = match range {
        RadianceRange::Normalized => 1.0,
        RadianceRange::Excitation => f32::INFINITY,
    };
    match radiance
        .as_slice()
        .iter()
        .position(|v| !v.is_finite() || *v < 0.0 || *v > upper)
    {
        Some(index) => Err(SimulationError::RadianceOutOfRange {
            index,
            value: radiance.as_slice()[index],
        }),
        None => Ok(()),
    }
}

/// Steady state reached under constant radiance, `ca*R / (ca*R + cd)`.
/// `None` when both rates vanish and every state is stationary.
pub fn fixed_point(ca: f32, cd: f32, radiance: f32) -> Option<f32> {
    let drive = ca * radiance;
    let total = drive + cd;
    if total.abs() <= f32::EPSILON {
        None
    } else {
        Some(drive / total)
    }
}

pub(crate) fn check_compatible(
    state: &OpsinState,
    radiance: &RadianceMap,
    kinetics: &ChannelKinetics,
) -> SimulationResult<()> {
    if state.shape() != radiance.shape() {
        return Err(SimulationError::ShapeMismatch {
            expected: state.shape(),
            found: radiance.shape(),
        });
    }
    if kinetics.channels() != state.channels() {
        return Err(SimulationError::Configuration(format!(
            "kinetics resolved for {} channels applied to a {}-channel state",
            kinetics.channels(),
            state.channels()
        )));
    }
    Ok(())
}

/// Runs the configured number of steps in place. Callers must have checked
/// compatibility first.
pub(crate) fn integrate(state: &mut OpsinState, radiance: &RadianceMap, kinetics: &ChannelKinetics) {
    for _ in 0..kinetics.iterations() {
        advance(state, radiance, kinetics);
    }
}

/// One Euler step in place.
pub(crate) fn advance(state: &mut OpsinState, radiance: &RadianceMap, kinetics: &ChannelKinetics) {
    let channels = kinetics.channels();
    let dt = kinetics.dt();

    for (opsin, light) in state
        .as_mut_slice()
        .chunks_exact_mut(channels)
        .zip(radiance.as_slice().chunks_exact(channels))
    {
        for c in 0..channels {
            let current = opsin[c];
            let rate = kinetics.ca(c) * light[c] * (1.0 - current) - kinetics.cd(c) * current;
            let next = current + dt * rate;
            opsin[c] = if next.is_nan() {
                clamp_unit(current)
            } else {
                next.clamp(0.0, 1.0)
            };
        }
    }
}
