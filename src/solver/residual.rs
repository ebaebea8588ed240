//! Convergence diagnostics.

/// Running statistics of constraint residuals (impulse changes) over one iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ErrorAccumulator {
    pub sum_of_squares: f64,
    pub count: u32,
    pub max_error: f64,
}

impl ErrorAccumulator {
    #[inline]
    pub fn accumulate(&mut self, error: f64) {
        self.sum_of_squares += error * error;
        self.count += 1;
        self.max_error = self.max_error.max(error.abs());
    }

    pub fn combine(&mut self, other: &ErrorAccumulator) {
        self.sum_of_squares += other.sum_of_squares;
        self.count += other.count;
        self.max_error = self.max_error.max(other.max_error);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Root mean square of the accumulated errors.
    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_of_squares / self.count as f64).sqrt()
        }
    }
}

/// Residuals of one island's solve, copied back to the host after the island finishes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IslandResidual {
    pub island: u32,
    /// Rigid constraint residuals of each position iteration, in order.
    pub position_iterations: Vec<ErrorAccumulator>,
    /// Rigid constraint residuals of the last velocity iteration.
    pub velocity: ErrorAccumulator,
    /// Internal constraint residuals of each articulation after the last iteration.
    pub articulations: Vec<ErrorAccumulator>,
}

impl IslandResidual {
    /// Residual of the last position iteration.
    pub fn position(&self) -> ErrorAccumulator {
        self.position_iterations.last().copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn accumulate_and_combine() {
        let mut a = ErrorAccumulator::default();
        a.accumulate(3.0);
        a.accumulate(-4.0);
        assert_eq!(a.count, 2);
        assert_abs_diff_eq!(a.sum_of_squares, 25.0);
        assert_abs_diff_eq!(a.max_error, 4.0);
        assert_abs_diff_eq!(a.rms(), (12.5f64).sqrt());

        let mut b = ErrorAccumulator::default();
        b.accumulate(5.0);
        b.combine(&a);
        assert_eq!(b.count, 3);
        assert_abs_diff_eq!(b.max_error, 5.0);

        b.reset();
        assert_eq!(b, ErrorAccumulator::default());
        assert_eq!(b.rms(), 0.0);
    }
}
