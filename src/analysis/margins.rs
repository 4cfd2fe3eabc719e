//! Gain, phase and stability margins from sampled frequency responses.
//!
//! Crossings are located on the sampled grid first (sign-change brackets
//! plus a few secant steps), then refined against an exact evaluator when
//! the system data supports one.

use num_complex::Complex64;

use crate::diagram::Diagram;
use crate::error::{Result, SimflowError};

use super::diagram::diagram_to_frd;
use super::lti::{eval_transfer, logspace, with_zero, Frd};

/// The system descriptions the margins solver accepts.
#[derive(Debug, Clone)]
pub enum SystemData {
    /// Pre-sampled frequency response.
    Frd(Frd),
    /// Parallel magnitude, phase (degrees) and frequency vectors.
    MagPhaseOmega {
        magnitude: Vec<f64>,
        phase_deg: Vec<f64>,
        omega: Vec<f64>,
    },
    /// Transfer-function coefficients in descending powers of s.
    Coefficients { num: Vec<f64>, den: Vec<f64> },
    /// A diagram with labelled loop input and output.
    Diagram {
        diagram: Diagram,
        input: String,
        output: String,
        omega: Option<Vec<f64>>,
    },
}

/// Scalar margins of a loop response, `INFINITY` where no crossing exists
/// and `NaN` for frequencies that could not be located.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityMargins {
    /// Gain margin (linear, not dB).
    pub gm: f64,
    /// Phase margin in degrees.
    pub pm: f64,
    /// Stability margin: minimum distance of the response from -1.
    pub sm: f64,
    /// Phase-crossover frequency backing `gm`.
    pub wpc: f64,
    /// Gain-crossover frequency backing `pm`.
    pub wgc: f64,
    /// Frequency of the minimum-distance point backing `sm`.
    pub wms: f64,
}

/// Every crossing candidate, before reduction to single margins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarginCandidates {
    pub gm: Vec<f64>,
    pub pm: Vec<f64>,
    pub sm: Vec<f64>,
    pub w180: Vec<f64>,
    pub wc: Vec<f64>,
    pub wstab: Vec<f64>,
}

fn angle_deg(z: Complex64) -> f64 {
    z.arg().to_degrees()
}

fn phase_margin_deg(phase_deg: f64) -> f64 {
    ((phase_deg % 360.0) + 360.0) % 360.0 - 180.0
}

fn make_frd(sysdata: &SystemData) -> Result<Frd> {
    match sysdata {
        SystemData::Frd(frd) => Ok(frd.clone()),
        SystemData::MagPhaseOmega {
            magnitude,
            phase_deg,
            omega,
        } => {
            if magnitude.len() != omega.len() || phase_deg.len() != omega.len() {
                return Err(SimflowError::UnsupportedSystemData);
            }
            let response = magnitude
                .iter()
                .zip(phase_deg)
                .map(|(&mag, &phase)| Complex64::from_polar(mag, phase.to_radians()))
                .collect();
            Ok(Frd {
                omega: omega.clone(),
                response,
            })
        }
        SystemData::Coefficients { num, den } => {
            if den.iter().all(|&c| c == 0.0) {
                return Err(SimflowError::ZeroDenominator);
            }
            let omega = with_zero(logspace(-3.0, 3.0, 400));
            let response = omega
                .iter()
                .map(|&w| eval_transfer(num, den, Complex64::new(0.0, w)))
                .collect();
            Ok(Frd { omega, response })
        }
        SystemData::Diagram {
            diagram,
            input,
            output,
            omega,
        } => {
            let grid = with_zero(match omega {
                Some(given) if !given.is_empty() => given.clone(),
                _ => logspace(-3.0, 3.0, 1200),
            });
            diagram_to_frd(diagram, input, output, Some(&grid))
        }
    }
}

/// Exact response at one frequency where the data allows it; the sampled
/// interpolant otherwise.
fn eval_at(sysdata: &SystemData, frd: &Frd, w: f64) -> Complex64 {
    match sysdata {
        SystemData::Coefficients { num, den } => eval_transfer(num, den, Complex64::new(0.0, w)),
        SystemData::Diagram {
            diagram,
            input,
            output,
            ..
        } => match diagram_to_frd(diagram, input, output, Some(&[w])) {
            Ok(one) => one
                .response
                .last()
                .copied()
                .unwrap_or(Complex64::new(f64::NAN, f64::NAN)),
            Err(_) => Complex64::new(f64::NAN, f64::NAN),
        },
        _ => frd.eval(w),
    }
}

struct RootCandidate {
    w: f64,
    bracket: (f64, f64),
}

/// Sign-change roots of `f(response)` over the sampled grid, polished with
/// up to ten secant steps inside each bracket.
fn find_roots(frd: &Frd, f: impl Fn(Complex64) -> f64, allow_zero: bool) -> Vec<RootCandidate> {
    let mut roots = Vec::new();
    if frd.omega.len() < 2 {
        return roots;
    }
    for i in 0..frd.omega.len() - 1 {
        let w1 = frd.omega[i];
        let w2 = frd.omega[i + 1];
        let f1 = f(frd.eval(w1));
        let f2 = f(frd.eval(w2));
        if !f1.is_finite() || !f2.is_finite() {
            continue;
        }
        if !allow_zero && f1 == 0.0 && f2 == 0.0 {
            continue;
        }
        if allow_zero && f1 == 0.0 {
            roots.push(RootCandidate {
                w: w1,
                bracket: (w1, w2),
            });
            continue;
        }
        if f1 * f2 > 0.0 {
            continue;
        }
        let (mut a, mut b) = (w1, w2);
        let (mut fa, mut fb) = (f1, f2);
        for _ in 0..10 {
            let denom = fb - fa;
            if denom.abs() < 1e-12 {
                break;
            }
            let c = b - fb * (b - a) / denom;
            let fc = f(frd.eval(c));
            a = b;
            fa = fb;
            b = c;
            fb = fc;
        }
        roots.push(RootCandidate {
            w: b,
            bracket: (w1, w2),
        });
    }
    roots.retain(|root| root.w >= 0.0);
    roots
}

/// Bisect a bracketed root of `f` against the exact evaluator.
fn refine_root(
    sysdata: &SystemData,
    frd: &Frd,
    root: &RootCandidate,
    f: impl Fn(Complex64) -> f64,
) -> f64 {
    let (mut a, mut b) = root.bracket;
    let mut fa = f(eval_at(sysdata, frd, a));
    let fb = f(eval_at(sysdata, frd, b));
    if !fa.is_finite() || !fb.is_finite() || fa * fb > 0.0 {
        return root.w;
    }
    for _ in 0..40 {
        let mid = (a + b) / 2.0;
        let fm = f(eval_at(sysdata, frd, mid));
        if !fm.is_finite() {
            break;
        }
        if fa * fm <= 0.0 {
            b = mid;
        } else {
            a = mid;
            fa = fm;
        }
    }
    (a + b) / 2.0
}

/// Golden-section minimization of `f` over a frequency interval.
fn refine_min(
    sysdata: &SystemData,
    frd: &Frd,
    a0: f64,
    b0: f64,
    f: impl Fn(Complex64) -> f64,
) -> f64 {
    let mut a = a0.min(b0);
    let mut b = a0.max(b0);
    if !a.is_finite() || !b.is_finite() || a == b {
        return a;
    }
    let phi = (1.0 + 5f64.sqrt()) / 2.0;
    let mut c = b - (b - a) / phi;
    let mut d = a + (b - a) / phi;
    let mut fc = f(eval_at(sysdata, frd, c));
    let mut fd = f(eval_at(sysdata, frd, d));
    for _ in 0..60 {
        if !fc.is_finite() || !fd.is_finite() {
            break;
        }
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - (b - a) / phi;
            fc = f(eval_at(sysdata, frd, c));
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + (b - a) / phi;
            fd = f(eval_at(sysdata, frd, d));
        }
    }
    (a + b) / 2.0
}

fn distance_to_minus_one(resp: Complex64) -> f64 {
    (resp + Complex64::new(1.0, 0.0)).norm()
}

fn candidates(sysdata: &SystemData) -> Result<(MarginCandidates, Vec<f64>)> {
    let frd = make_frd(sysdata)?;

    let w180_roots = find_roots(&frd, |resp| resp.im, false);
    let wc_roots = find_roots(&frd, |resp| resp.norm() - 1.0, true);
    let w180: Vec<f64> = w180_roots.iter().map(|root| root.w).collect();
    let wc: Vec<f64> = wc_roots
        .iter()
        .map(|root| refine_root(sysdata, &frd, root, |resp| resp.norm() - 1.0))
        .collect();

    let wstab = {
        let dist: Vec<f64> = frd
            .omega
            .iter()
            .map(|&w| {
                let val = distance_to_minus_one(frd.eval(w));
                if val.is_finite() {
                    val
                } else {
                    f64::NAN
                }
            })
            .collect();
        let mut minima = Vec::new();
        for i in 1..dist.len().saturating_sub(1) {
            let (prev, curr, next) = (dist[i - 1], dist[i], dist[i + 1]);
            if !curr.is_finite() || !prev.is_finite() || !next.is_finite() {
                continue;
            }
            // plateau-tolerant on the left so flat minima still register
            if curr <= prev && curr < next {
                minima.push(i);
            }
        }
        if minima.is_empty() {
            Vec::new()
        } else {
            let mut best = minima[0];
            for &idx in &minima {
                if dist[idx] < dist[best] {
                    best = idx;
                }
            }
            let left = frd.omega[best.saturating_sub(1)];
            let right = frd.omega[(best + 1).min(frd.omega.len() - 1)];
            vec![refine_min(sysdata, &frd, left, right, distance_to_minus_one)]
        }
    };

    let w180_pairs: Vec<(f64, Complex64)> = w180
        .iter()
        .map(|&w| (w, eval_at(sysdata, &frd, w)))
        .filter(|(_, resp)| resp.re <= 0.0)
        .collect();
    let wc_pairs: Vec<(f64, Complex64)> = wc
        .iter()
        .map(|&w| (w, eval_at(sysdata, &frd, w)))
        .filter(|(_, resp)| resp.re.is_finite() && resp.im.is_finite())
        .collect();

    let w180_filtered: Vec<f64> = w180_pairs.iter().map(|&(w, _)| w).collect();
    let wc_filtered: Vec<f64> = wc_pairs.iter().map(|&(w, _)| w).collect();
    let gm: Vec<f64> = w180_pairs
        .iter()
        .map(|&(_, resp)| 1.0 / resp.norm())
        .collect();
    let pm: Vec<f64> = wc_pairs
        .iter()
        .map(|&(_, resp)| phase_margin_deg(angle_deg(resp)))
        .collect();
    let sm: Vec<f64> = wstab
        .iter()
        .map(|&w| distance_to_minus_one(eval_at(sysdata, &frd, w)))
        .collect();

    Ok((
        MarginCandidates {
            gm,
            pm,
            sm,
            w180: w180_filtered,
            wc,
            wstab,
        },
        wc_filtered,
    ))
}

/// Every crossing candidate of the loop response, unreduced.
pub fn stability_margins_all(sysdata: &SystemData) -> Result<MarginCandidates> {
    let (all, _) = candidates(sysdata)?;
    Ok(all)
}

/// Reduce the crossing candidates to single margins: the gain margin
/// nearest 0 dB, the phase margin smallest in magnitude, and the overall
/// minimum distance from -1.
pub fn stability_margins(sysdata: &SystemData) -> Result<StabilityMargins> {
    let (all, wc_filtered) = candidates(sysdata)?;

    let mut gm = f64::INFINITY;
    let mut gm_idx = 0;
    if let Some((&first, rest)) = all.gm.split_first() {
        gm = first;
        for (offset, &val) in rest.iter().enumerate() {
            if val.ln().abs() < gm.ln().abs() {
                gm = val;
                gm_idx = offset + 1;
            }
        }
    }

    let mut pm = f64::INFINITY;
    let mut pm_idx = 0;
    if let Some((&first, rest)) = all.pm.split_first() {
        pm = first;
        for (offset, &val) in rest.iter().enumerate() {
            if val.abs() < pm.abs() {
                pm = val;
                pm_idx = offset + 1;
            }
        }
    }

    let mut sm = f64::INFINITY;
    if !all.sm.is_empty() {
        sm = all.sm[0];
        for &val in &all.sm[1..] {
            sm = if val.is_nan() || sm.is_nan() {
                f64::NAN
            } else {
                sm.min(val)
            };
        }
    }

    let wpc = all.w180.get(gm_idx).copied().unwrap_or(f64::NAN);
    let wgc = wc_filtered.get(pm_idx).copied().unwrap_or(f64::NAN);
    let wms = all.wstab.first().copied().unwrap_or(f64::NAN);

    Ok(StabilityMargins {
        gm,
        pm,
        sm,
        wpc,
        wgc,
        wms,
    })
}

/// Gain margin, phase margin, and their crossover frequencies.
pub fn margin(sysdata: &SystemData) -> Result<(f64, f64, f64, f64)> {
    let margins = stability_margins(sysdata)?;
    Ok((margins.gm, margins.pm, margins.wpc, margins.wgc))
}

/// Frequencies where the response phase crosses zero, with the real-axis
/// gain at each.
pub fn phase_crossover_frequencies(sysdata: &SystemData) -> Result<(Vec<f64>, Vec<f64>)> {
    let frd = make_frd(sysdata)?;
    let roots = find_roots(&frd, |resp| resp.arg(), true);
    let w: Vec<f64> = roots.iter().map(|root| root.w).collect();
    let gains: Vec<f64> = w.iter().map(|&omega| frd.eval(omega).re).collect();
    Ok((w, gains))
}
