//! Akima sub-spline interpolation.
//!
//! Slopes at the ends are extrapolated quadratically (two ghost slopes on each
//! side), so a segment needs at least five knots to be well conditioned.

/// Piecewise cubic Akima interpolant over strictly increasing abscissae.
#[derive(Debug, Clone, PartialEq)]
pub struct AkimaSpline {
    xs: Vec<f64>,
    // Per interval: y_i, b_i, c_i, d_i for y = y_i + b h + c h^2 + d h^3.
    coeffs: Vec<[f64; 4]>,
}

impl AkimaSpline {
    /// Builds the spline. Callers guarantee `xs` is strictly increasing and
    /// `xs.len() == ys.len() >= 2`.
    pub(crate) fn new(xs: &[f64], ys: &[f64]) -> Self {
        let n = xs.len();
        debug_assert!(n >= 2 && n == ys.len());

        // m[k + 2] is the slope of interval k; two ghost slopes on each end.
        let mut m = vec![0.0; n + 3];
        for k in 0..n - 1 {
            m[k + 2] = (ys[k + 1] - ys[k]) / (xs[k + 1] - xs[k]);
        }
        if n == 2 {
            m[1] = m[2];
            m[0] = m[2];
            m[3] = m[2];
            m[4] = m[2];
        } else {
            m[1] = 2.0 * m[2] - m[3];
            m[0] = 2.0 * m[1] - m[2];
            m[n + 1] = 2.0 * m[n] - m[n - 1];
            m[n + 2] = 2.0 * m[n + 1] - m[n];
        }

        let tangents: Vec<f64> = (0..n)
            .map(|i| {
                let w1 = (m[i + 3] - m[i + 2]).abs();
                let w2 = (m[i + 1] - m[i]).abs();
                if w1 + w2 == 0.0 {
                    0.5 * (m[i + 1] + m[i + 2])
                } else {
                    (w1 * m[i + 1] + w2 * m[i + 2]) / (w1 + w2)
                }
            })
            .collect();

        let coeffs = (0..n - 1)
            .map(|i| {
                let h = xs[i + 1] - xs[i];
                let slope = m[i + 2];
                let c = (3.0 * slope - 2.0 * tangents[i] - tangents[i + 1]) / h;
                let d = (tangents[i] + tangents[i + 1] - 2.0 * slope) / (h * h);
                [ys[i], tangents[i], c, d]
            })
            .collect();

        Self {
            xs: xs.to_vec(),
            coeffs,
        }
    }

    pub fn first_x(&self) -> f64 {
        self.xs[0]
    }

    pub fn last_x(&self) -> f64 {
        self.xs[self.xs.len() - 1]
    }

    /// Evaluates at `x`, which must lie in `[first_x, last_x]`.
    pub fn eval(&self, x: f64) -> f64 {
        let idx = match self.xs.partition_point(|&k| k <= x) {
            0 => 0,
            p => (p - 1).min(self.coeffs.len() - 1),
        };
        let h = x - self.xs[idx];
        let [a, b, c, d] = self.coeffs[idx];
        a + h * (b + h * (c + h * d))
    }
}
