//! Conformance comparison
//!
//! Runs the same inputs through two executors, usually a remote device and a
//! host reference, and checks the outputs element-wise with
//! `|a - b| <= atol + rtol * |b|`, where `b` is the reference. NaN compares
//! equal to NaN. Numeric and structural disagreements are reported in the
//! [`ComparisonResult`]; only infrastructure failures are errors.

use std::fmt;
use std::time::Instant;

use tracing::instrument;

use crate::buffer::{Location, TensorBuffer};
use crate::error::Result;
use crate::executor::Executor;
use crate::tensor::HostTensor;

/// Relative and absolute tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Tolerance {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    /// Bit-for-bit equality, for integer outputs.
    pub fn exact() -> Self {
        Self::new(0.0, 0.0)
    }

    fn accepts(&self, actual: f64, expected: f64) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return actual.is_nan() && expected.is_nan();
        }
        if actual == expected {
            return true;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::new(1e-5, 1e-8)
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtol={:e}, atol={:e}", self.rtol, self.atol)
    }
}

/// Verdict for one output position.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputComparison {
    pub index: usize,
    pub passed: bool,
    /// Largest `|a - b| / |b|`. Elements whose reference is zero have no
    /// relative error and only count towards `max_abs_error`.
    pub max_rel_error: f64,
    pub max_abs_error: f64,
    /// Elements outside tolerance.
    pub mismatched: usize,
    pub total: usize,
    pub tolerance: Tolerance,
    /// Set when the outputs could not be compared element-wise at all.
    pub issue: Option<String>,
}

impl OutputComparison {
    fn structural(index: usize, tolerance: Tolerance, total: usize, issue: String) -> Self {
        Self {
            index,
            passed: false,
            max_rel_error: f64::INFINITY,
            max_abs_error: f64::INFINITY,
            mismatched: total,
            total,
            tolerance,
            issue: Some(issue),
        }
    }
}

impl fmt::Display for OutputComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "ok" } else { "FAILED" };
        write!(f, "output {}: {verdict}", self.index)?;
        match &self.issue {
            Some(issue) => write!(f, " ({issue})"),
            None => write!(
                f,
                " ({}/{} mismatched, max abs {:e}, max rel {:e}, {})",
                self.mismatched, self.total, self.max_abs_error, self.max_rel_error, self.tolerance
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonResult {
    pub per_output: Vec<OutputComparison>,
}

impl ComparisonResult {
    pub fn passed(&self) -> bool {
        self.per_output.iter().all(|output| output.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &OutputComparison> {
        self.per_output.iter().filter(|output| !output.passed)
    }
}

impl fmt::Display for ComparisonResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failures().count();
        writeln!(
            f,
            "conformance: {} ({} of {} outputs failed)",
            if failed == 0 { "passed" } else { "FAILED" },
            failed,
            self.per_output.len()
        )?;
        for output in &self.per_output {
            writeln!(f, "  {output}")?;
        }
        Ok(())
    }
}

/// Compare one pair of host tensors. `expected` is the reference.
pub fn allclose(actual: &HostTensor, expected: &HostTensor, tolerance: Tolerance) -> OutputComparison {
    compare_tensors(0, actual, expected, tolerance)
}

fn compare_tensors(index: usize, actual: &HostTensor, expected: &HostTensor, tolerance: Tolerance) -> OutputComparison {
    let total = expected.num_elements();
    if actual.dtype() != expected.dtype() {
        let issue = format!("dtype {} differs from reference {}", actual.dtype(), expected.dtype());
        return OutputComparison::structural(index, tolerance, total, issue);
    }
    if actual.shape() != expected.shape() {
        let issue = format!("shape {:?} differs from reference {:?}", actual.shape(), expected.shape());
        return OutputComparison::structural(index, tolerance, total, issue);
    }

    let mut max_abs_error = 0.0_f64;
    let mut max_rel_error = 0.0_f64;
    let mut mismatched = 0;
    for (a, b) in actual.to_f64_vec().into_iter().zip(expected.to_f64_vec()) {
        if !tolerance.accepts(a, b) {
            mismatched += 1;
        }
        let (abs, rel) = match (a.is_nan(), b.is_nan()) {
            (true, true) => (0.0, 0.0),
            (false, false) if a == b => (0.0, 0.0),
            (false, false) => {
                let abs = (a - b).abs();
                let rel = if b == 0.0 { 0.0 } else { abs / b.abs() };
                (abs, rel)
            }
            _ => (f64::INFINITY, f64::INFINITY),
        };
        max_abs_error = max_abs_error.max(abs);
        max_rel_error = max_rel_error.max(rel);
    }

    OutputComparison {
        index,
        passed: mismatched == 0,
        max_rel_error,
        max_abs_error,
        mismatched,
        total,
        tolerance,
        issue: None,
    }
}

/// Runs two executors on the same inputs and compares their outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Comparator {
    tolerance: Tolerance,
}

impl Comparator {
    pub fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    /// Bind `inputs` positionally to the `main` entry point of both
    /// executors, run each once and compare outputs position by position.
    #[instrument(skip_all, fields(remote = %remote.kind(), reference = %reference.kind(), inputs = inputs.len()))]
    pub fn compare(
        &self,
        remote: &mut Executor,
        reference: &mut Executor,
        inputs: &[HostTensor],
    ) -> Result<ComparisonResult> {
        let start = Instant::now();
        let actual = run_positional(remote, inputs)?;
        let expected = run_positional(reference, inputs)?;
        let result = self.compare_outputs(&actual, &expected);
        tracing::info!(
            passed = result.passed(),
            outputs = result.per_output.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "comparison_finished"
        );
        Ok(result)
    }

    /// Like [`compare`](Self::compare) with inputs bound by name.
    #[instrument(skip_all, fields(remote = %remote.kind(), reference = %reference.kind(), inputs = inputs.len()))]
    pub fn compare_named(
        &self,
        remote: &mut Executor,
        reference: &mut Executor,
        inputs: &[(&str, HostTensor)],
    ) -> Result<ComparisonResult> {
        let actual = run_named(remote, inputs)?;
        let expected = run_named(reference, inputs)?;
        Ok(self.compare_outputs(&actual, &expected))
    }

    /// Align outputs positionally; a missing output on either side is a
    /// failure at that index.
    pub fn compare_outputs(&self, actual: &[HostTensor], expected: &[HostTensor]) -> ComparisonResult {
        let count = actual.len().max(expected.len());
        let per_output = (0..count)
            .map(|index| match (actual.get(index), expected.get(index)) {
                (Some(a), Some(b)) => compare_tensors(index, a, b, self.tolerance),
                (Some(a), None) => OutputComparison::structural(
                    index,
                    self.tolerance,
                    a.num_elements(),
                    format!("reference produced {} outputs", expected.len()),
                ),
                (None, Some(b)) => OutputComparison::structural(
                    index,
                    self.tolerance,
                    b.num_elements(),
                    format!("remote produced {} outputs", actual.len()),
                ),
                (None, None) => OutputComparison::structural(index, self.tolerance, 0, "no output".into()),
            })
            .collect();
        ComparisonResult { per_output }
    }
}

/// `Comparator::new(Tolerance { rtol, atol }).compare(..)`.
pub fn compare(
    remote: &mut Executor,
    reference: &mut Executor,
    inputs: &[HostTensor],
    rtol: f64,
    atol: f64,
) -> Result<ComparisonResult> {
    Comparator::new(Tolerance::new(rtol, atol)).compare(remote, reference, inputs)
}

fn upload(executor: &Executor, tensor: &HostTensor) -> Result<TensorBuffer> {
    executor.session().copy_in_to(tensor, Location::DeviceDefault)
}

fn run_positional(executor: &mut Executor, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
    let buffers = inputs
        .iter()
        .map(|tensor| upload(executor, tensor))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&TensorBuffer> = buffers.iter().collect();
    executor.set_positional(&refs)?;
    executor.run()?;
    fetch_outputs(executor)
}

fn run_named(executor: &mut Executor, inputs: &[(&str, HostTensor)]) -> Result<Vec<HostTensor>> {
    let buffers = inputs
        .iter()
        .map(|(name, tensor)| upload(executor, tensor).map(|buffer| (*name, buffer)))
        .collect::<Result<Vec<_>>>()?;
    executor.set_inputs(buffers.iter().map(|(name, buffer)| (*name, buffer)))?;
    executor.run()?;
    fetch_outputs(executor)
}

fn fetch_outputs(executor: &Executor) -> Result<Vec<HostTensor>> {
    executor.get_outputs()?.iter().map(TensorBuffer::to_host).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_device::DType;

    fn f32s(shape: Vec<usize>, values: &[f32]) -> HostTensor {
        HostTensor::from_slice(shape, values).unwrap()
    }

    #[test]
    fn test_tolerance_formula() {
        let tol = Tolerance::new(1e-3, 1e-6);
        assert!(tol.accepts(1.0005, 1.0));
        assert!(!tol.accepts(1.002, 1.0));
        assert!(tol.accepts(5e-7, 0.0));
        assert!(!tol.accepts(5e-6, 0.0));
        assert!(tol.accepts(f64::NAN, f64::NAN));
        assert!(!tol.accepts(f64::NAN, 1.0));
        assert!(tol.accepts(f64::INFINITY, f64::INFINITY));
    }

    #[test]
    fn test_allclose_reports_errors() {
        let reference = f32s(vec![4], &[1.0, 2.0, 0.0, f32::NAN]);
        let remote = f32s(vec![4], &[1.0, 2.5, 0.0, f32::NAN]);
        let result = allclose(&remote, &reference, Tolerance::default());
        assert!(!result.passed);
        assert_eq!(result.mismatched, 1);
        assert_eq!(result.total, 4);
        assert!((result.max_abs_error - 0.5).abs() < 1e-12);
        assert!((result.max_rel_error - 0.25).abs() < 1e-12);

        // Against a zero reference only the absolute error is meaningful.
        let within_atol = allclose(&f32s(vec![2], &[5e-9, 2.0]), &f32s(vec![2], &[0.0, 2.0]), Tolerance::default());
        assert!(within_atol.passed);
        assert_eq!(within_atol.max_rel_error, 0.0);
        assert!((within_atol.max_abs_error - 5e-9).abs() < 1e-15);

        let beyond_atol = allclose(&f32s(vec![1], &[1e-3]), &f32s(vec![1], &[0.0]), Tolerance::default());
        assert!(!beyond_atol.passed);
        assert_eq!(beyond_atol.mismatched, 1);
        assert_eq!(beyond_atol.max_rel_error, 0.0);
        assert!(beyond_atol.max_abs_error > 9e-4);
    }

    #[test]
    fn test_structural_disagreements_are_failures() {
        let comparator = Comparator::new(Tolerance::default());
        let a = f32s(vec![2, 2], &[1.0; 4]);
        let flat = f32s(vec![4], &[1.0; 4]);
        let ints = HostTensor::from_slice(vec![2, 2], &[1i32; 4]).unwrap();

        let result = comparator.compare_outputs(&[a.clone(), a.clone(), a.clone()], &[flat, ints]);
        assert_eq!(result.per_output.len(), 3);
        assert!(result.per_output.iter().all(|o| !o.passed && o.issue.is_some()));
        assert!(result.per_output[0].issue.as_deref().unwrap().contains("shape"));
        assert!(result.per_output[1].issue.as_deref().unwrap().contains("dtype"));
        assert!(result.per_output[2].issue.as_deref().unwrap().contains("reference produced 2"));

        let report = result.to_string();
        assert!(report.contains("3 of 3 outputs failed"));
        assert_eq!(report.lines().count(), 4);
    }

    #[test]
    fn test_integer_outputs_compare_exactly() {
        let a = HostTensor::from_slice(vec![3], &[1i8, -7, 127]).unwrap();
        let result = allclose(&a, &a.clone(), Tolerance::exact());
        assert!(result.passed);
        assert_eq!(result.max_rel_error, 0.0);
        assert_eq!(a.dtype(), DType::I8);
    }
}
