//! Frequency-response primitives: polynomial evaluation on the imaginary
//! axis, log-spaced grids, and the sampled-response table.

use num_complex::Complex64;

/// Horner evaluation of a real-coefficient polynomial at a complex point
/// (coefficients in descending powers).
pub fn eval_poly(coeffs: &[f64], s: Complex64) -> Complex64 {
    let mut out = Complex64::new(0.0, 0.0);
    for coeff in coeffs {
        out = out * s + Complex64::new(*coeff, 0.0);
    }
    out
}

/// `num(s)/den(s)`. Complex division by a zero-modulus denominator yields
/// NaN components rather than panicking.
pub fn eval_transfer(num: &[f64], den: &[f64], s: Complex64) -> Complex64 {
    eval_poly(num, s) / eval_poly(den, s)
}

/// `points` samples of `10^x` for x evenly spaced over the exponent range.
pub fn logspace(min_exp: f64, max_exp: f64, points: usize) -> Vec<f64> {
    if points == 0 {
        return Vec::new();
    }
    if points == 1 {
        return vec![10f64.powf(min_exp)];
    }
    let step = (max_exp - min_exp) / (points as f64 - 1.0);
    (0..points)
        .map(|i| 10f64.powf(min_exp + step * i as f64))
        .collect()
}

/// Prefix a frequency grid with an ω=0 sample unless it already starts
/// there.
pub fn with_zero(omega: Vec<f64>) -> Vec<f64> {
    if omega.is_empty() {
        return vec![0.0];
    }
    if omega[0] == 0.0 {
        return omega;
    }
    let mut out = Vec::with_capacity(omega.len() + 1);
    out.push(0.0);
    out.extend(omega);
    out
}

/// Frequency-response data: ascending frequencies with parallel complex
/// samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Frd {
    pub omega: Vec<f64>,
    pub response: Vec<Complex64>,
}

impl Frd {
    /// Interpolate the response at an arbitrary frequency: linear per
    /// component between samples, clamped beyond either end.
    pub fn eval(&self, w: f64) -> Complex64 {
        if self.omega.is_empty() {
            return Complex64::new(f64::NAN, f64::NAN);
        }
        let last = self.omega.len() - 1;
        if w <= self.omega[0] {
            return self.response[0];
        }
        if w >= self.omega[last] {
            return self.response[last];
        }
        for i in 0..last {
            let (w1, w2) = (self.omega[i], self.omega[i + 1]);
            if w1 <= w && w <= w2 {
                let t = (w - w1) / (w2 - w1);
                let a = self.response[i];
                let b = self.response[i + 1];
                return Complex64::new(a.re + (b.re - a.re) * t, a.im + (b.im - a.im) * t);
            }
        }
        self.response[last]
    }
}
