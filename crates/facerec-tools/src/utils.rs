use crate::tool::ToolError;
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};

/// Stack equally long vectors as the rows of a matrix.
pub(crate) fn stack_vectors(tool: &'static str, vectors: &[&Array1<f64>]) -> Result<Array2<f64>, ToolError> {
    let Some(first) = vectors.first() else {
        return Err(ToolError::EmptyTrainingSet(tool));
    };
    let d = first.len();
    let mut out = Array2::zeros((vectors.len(), d));
    for (mut row, v) in out.rows_mut().into_iter().zip(vectors) {
        check_len(tool, d, v.len())?;
        row.assign(v);
    }
    Ok(out)
}

/// Concatenate frame matrices with the same number of columns.
pub(crate) fn stack_frames(tool: &'static str, frames: &[&Array2<f64>]) -> Result<Array2<f64>, ToolError> {
    let Some(first) = frames.first() else {
        return Err(ToolError::EmptyTrainingSet(tool));
    };
    for f in frames {
        check_len(tool, first.ncols(), f.ncols())?;
    }
    let views: Vec<ArrayView2<'_, f64>> = frames.iter().map(|f| f.view()).collect();
    concatenate(Axis(0), &views)
        .map_err(|e| ToolError::InvalidConfig(format!("{tool}: cannot stack frames: {e}")))
}

/// Element-wise mean of equally long vectors.
pub(crate) fn mean_vector(tool: &'static str, vectors: &[Array1<f64>]) -> Result<Array1<f64>, ToolError> {
    let Some(first) = vectors.first() else {
        return Err(ToolError::EmptyEnrollment(tool));
    };
    let mut sum = Array1::<f64>::zeros(first.len());
    for v in vectors {
        check_len(tool, first.len(), v.len())?;
        sum += v;
    }
    Ok(sum / vectors.len() as f64)
}

pub(crate) fn check_len(tool: &'static str, expected: usize, got: usize) -> Result<(), ToolError> {
    if expected == got {
        Ok(())
    } else {
        Err(ToolError::DimensionMismatch { tool, expected, got })
    }
}
