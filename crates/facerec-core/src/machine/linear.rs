//! Linear projection machine plus PCA and Fisher LDA training.

use super::{check_dim, MachineError};
use crate::archive::{Archive, ArchiveError, Artifact};
use crate::linalg;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};

/// Gram-matrix eigenvalues below this (relative to the largest) carry no variance.
const RANK_TOLERANCE: f64 = 1e-10;

/// `y = ((x - input_sub) / input_div) · weights + biases`
#[derive(Debug, Clone, PartialEq)]
pub struct LinearMachine {
    /// Input × output projection matrix.
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub input_sub: Array1<f64>,
    pub input_div: Array1<f64>,
}

impl LinearMachine {
    pub fn new(weights: Array2<f64>) -> Self {
        let (inputs, outputs) = weights.dim();
        Self {
            weights,
            biases: Array1::zeros(outputs),
            input_sub: Array1::zeros(inputs),
            input_div: Array1::ones(inputs),
        }
    }

    pub fn input_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&self, x: ArrayView1<'_, f64>) -> Result<Array1<f64>, MachineError> {
        check_dim(self.input_size(), x.len())?;
        let normalized = (&x - &self.input_sub) / &self.input_div;
        Ok(normalized.dot(&self.weights) + &self.biases)
    }

    /// Project every row of `x`.
    pub fn forward_rows(&self, x: &Array2<f64>) -> Result<Array2<f64>, MachineError> {
        check_dim(self.input_size(), x.ncols())?;
        let normalized = (x - &self.input_sub.view().insert_axis(Axis(0)))
            / &self.input_div.view().insert_axis(Axis(0));
        Ok(normalized.dot(&self.weights) + &self.biases.view().insert_axis(Axis(0)))
    }

    /// Keep only the first `outputs` projection directions.
    pub fn truncate_outputs(&mut self, outputs: usize) {
        let outputs = outputs.min(self.output_size());
        self.weights = self.weights.slice(s![.., ..outputs]).to_owned();
        self.biases = self.biases.slice(s![..outputs]).to_owned();
    }

    pub fn is_similar_to(&self, other: &LinearMachine, tolerance: f64) -> bool {
        fn close<D: ndarray::Dimension>(
            a: &ndarray::Array<f64, D>,
            b: &ndarray::Array<f64, D>,
            tolerance: f64,
        ) -> bool {
            a.shape() == b.shape() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tolerance)
        }
        close(&self.weights, &other.weights, tolerance)
            && close(&self.biases, &other.biases, tolerance)
            && close(&self.input_sub, &other.input_sub, tolerance)
            && close(&self.input_div, &other.input_div, tolerance)
    }

    /// Principal component analysis of the rows of `data`.
    ///
    /// Returns the machine (centered on the data mean, eigenvectors as
    /// weight columns) and the covariance eigenvalues in descending order.
    /// When there are fewer samples than dimensions the eigenvectors are
    /// recovered from the Gram matrix and only the non-degenerate ones kept.
    pub fn train_pca(data: &Array2<f64>) -> Result<(LinearMachine, Array1<f64>), MachineError> {
        let (n, d) = data.dim();
        if n < 2 || d == 0 {
            return Err(MachineError::EmptyData);
        }
        let mean = data.mean_axis(Axis(0)).ok_or(MachineError::EmptyData)?;
        let centered = data - &mean.view().insert_axis(Axis(0));
        let norm = (n - 1) as f64;

        let (values, vectors) = if d <= n {
            let covariance = centered.t().dot(&centered) / norm;
            linalg::symmetric_eigen(&covariance)?
        } else {
            let gram = centered.dot(&centered.t()) / norm;
            let (values, u) = linalg::symmetric_eigen(&gram)?;
            let largest = values.first().copied().unwrap_or(0.0);
            let rank = values
                .iter()
                .take_while(|&&v| v > largest * RANK_TOLERANCE && v > 0.0)
                .count();
            if rank == 0 {
                return Err(MachineError::Singular);
            }
            let mut vectors = Array2::<f64>::zeros((d, rank));
            for k in 0..rank {
                let v = centered.t().dot(&u.column(k)) / (norm * values[k]).sqrt();
                vectors.column_mut(k).assign(&v);
            }
            linalg::normalize_signs(&mut vectors);
            (values.slice(s![..rank]).to_owned(), vectors)
        };

        let values = values.mapv(|v| v.max(0.0));
        let mut machine = LinearMachine::new(vectors);
        machine.input_sub = mean;

        tracing::debug!(samples = n, inputs = d, outputs = machine.output_size(), "PCA trained");
        Ok((machine, values))
    }

    /// Fisher linear discriminant analysis over per-class sample matrices.
    ///
    /// Solves `Sb v = λ Sw v` and keeps `classes - 1` unit-norm directions.
    /// The machine subtracts the global mean of all samples.
    pub fn train_lda(classes: &[Array2<f64>]) -> Result<(LinearMachine, Array1<f64>), MachineError> {
        if classes.len() < 2 {
            return Err(MachineError::InvalidParameter(format!(
                "LDA needs at least two classes, got {}",
                classes.len()
            )));
        }
        let d = classes[0].ncols();
        let mut total = Array1::<f64>::zeros(d);
        let mut count = 0usize;
        let mut means = Vec::with_capacity(classes.len());
        for (i, class) in classes.iter().enumerate() {
            check_dim(d, class.ncols())?;
            let mean = class.mean_axis(Axis(0)).ok_or(MachineError::EmptyGroup(i))?;
            total += &class.sum_axis(Axis(0));
            count += class.nrows();
            means.push(mean);
        }
        let total = total / count as f64;

        let mut sw = Array2::<f64>::zeros((d, d));
        let mut sb = Array2::<f64>::zeros((d, d));
        for (class, mean) in classes.iter().zip(&means) {
            let centered = class - &mean.view().insert_axis(Axis(0));
            sw += &centered.t().dot(&centered);
            let offset = mean - &total;
            sb += &(linalg::outer(&offset, &offset) * class.nrows() as f64);
        }

        let (values, mut vectors) = linalg::generalized_symmetric_eigen(&sb, &sw)?;
        let outputs = (classes.len() - 1).min(d);
        for mut column in vectors.columns_mut() {
            let norm = column.dot(&column).sqrt();
            if norm > 0.0 {
                column /= norm;
            }
        }

        let mut machine = LinearMachine::new(vectors);
        machine.truncate_outputs(outputs);
        machine.input_sub = total;

        tracing::debug!(classes = classes.len(), samples = count, outputs, "LDA trained");
        Ok((machine, values.slice(s![..outputs]).to_owned()))
    }
}

impl Artifact for LinearMachine {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_array("weights", &self.weights)?;
        archive.set_array("biases", &self.biases)?;
        archive.set_array("input_sub", &self.input_sub)?;
        archive.set_array("input_div", &self.input_div)?;
        archive.set_i64("activation", 0)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let weights = archive.get_array2("weights")?;
        let (inputs, outputs) = weights.dim();
        let machine = Self {
            biases: expect_len(archive, "biases", outputs)?,
            input_sub: expect_len(archive, "input_sub", inputs)?,
            input_div: expect_len(archive, "input_div", inputs)?,
            weights,
        };
        let activation = archive.get_i64("activation")?;
        if activation != 0 {
            return Err(ArchiveError::InvalidValue {
                path: "activation".to_string(),
                reason: format!("unsupported activation {activation}"),
            });
        }
        Ok(machine)
    }
}

pub(crate) fn expect_len(archive: &Archive, path: &str, len: usize) -> Result<Array1<f64>, ArchiveError> {
    let array = archive.get_array1(path)?;
    if array.len() != len {
        return Err(ArchiveError::Shape {
            path: path.to_string(),
            expected: format!("length {len}"),
            found: vec![array.len()],
        });
    }
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_forward_applies_normalization() {
        let mut m = LinearMachine::new(array![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]]);
        m.input_sub = array![1.0, 1.0, 1.0];
        m.input_div = array![1.0, 2.0, 1.0];
        m.biases = array![0.5, -0.5];
        let y = m.forward(array![2.0, 3.0, 1.0].view()).unwrap();
        assert_eq!(y, array![1.5, 1.5]);
        assert!(m.forward(array![1.0].view()).is_err());

        let rows = m.forward_rows(&array![[2.0, 3.0, 1.0], [1.0, 1.0, 1.0]]).unwrap();
        assert_eq!(rows.row(0), y);
        assert_eq!(rows.row(1), array![0.5, -0.5]);
    }

    #[test]
    fn test_pca_eigenvalues_match_projected_variance() {
        let data = array![
            [2.5, 2.4, 0.1],
            [0.5, 0.7, 0.3],
            [2.2, 2.9, 0.2],
            [1.9, 2.2, 0.5],
            [3.1, 3.0, 0.1],
            [2.3, 2.7, 0.4],
        ];
        let (machine, values) = LinearMachine::train_pca(&data).unwrap();
        assert_eq!(machine.output_size(), 3);
        let projected = machine.forward_rows(&data).unwrap();
        let variance = projected.var_axis(Axis(0), 1.0);
        for k in 0..3 {
            assert!((variance[k] - values[k]).abs() < 1e-10);
        }
        let mean_projection = machine.forward(machine.input_sub.view()).unwrap();
        assert!(mean_projection.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_pca_fewer_samples_than_dimensions() {
        let data = array![[1.0, 0.0, 0.0, 2.0], [0.0, 1.0, 0.0, 1.0], [0.0, 0.0, 1.0, 0.0]];
        let (machine, values) = LinearMachine::train_pca(&data).unwrap();
        assert_eq!(machine.output_size(), 2);
        assert_eq!(values.len(), 2);
        let gram = machine.weights.t().dot(&machine.weights);
        assert!((gram[[0, 0]] - 1.0).abs() < 1e-10 && gram[[0, 1]].abs() < 1e-10);
    }

    #[test]
    fn test_lda_separates_classes() {
        let a = array![[0.0, 0.1], [0.2, -0.1], [-0.1, 0.0], [0.1, 0.2]];
        let b = array![[3.0, 0.0], [3.1, 0.2], [2.9, -0.1], [3.2, 0.1]];
        let (machine, values) = LinearMachine::train_lda(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(machine.output_size(), 1);
        assert!(values[0] > 0.0);
        let pa = machine.forward_rows(&a).unwrap();
        let pb = machine.forward_rows(&b).unwrap();
        let max_a = pa.iter().cloned().fold(f64::MIN, f64::max);
        let min_b = pb.iter().cloned().fold(f64::MAX, f64::min);
        let min_a = pa.iter().cloned().fold(f64::MAX, f64::min);
        let max_b = pb.iter().cloned().fold(f64::MIN, f64::max);
        assert!(max_a < min_b || max_b < min_a);
    }

    #[test]
    fn test_lda_rejects_empty_class() {
        let a = array![[0.0, 0.1], [0.2, -0.1]];
        let empty = Array2::<f64>::zeros((0, 2));
        assert_eq!(
            LinearMachine::train_lda(&[a, empty]).unwrap_err(),
            MachineError::EmptyGroup(1)
        );
    }

    #[test]
    fn test_archive_roundtrip() {
        let mut m = LinearMachine::new(array![[1.0, 2.0], [3.0, 4.0]]);
        m.input_sub = array![0.5, 0.25];
        let mut archive = Archive::new();
        m.save(&mut archive).unwrap();
        assert_eq!(archive.get_i64("activation").unwrap(), 0);
        let back = LinearMachine::load(&archive).unwrap();
        assert!(back.is_similar_to(&m, 0.0));
    }
}
