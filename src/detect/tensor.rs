use super::decode::DecodeError;

/// Dense row-major `f32` tensor produced by a model head.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorData {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TensorData {
    /// Wrap `data` with `shape`, checking that the element count matches.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, DecodeError> {
        let expected = shape.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim));
        match expected {
            Some(expected) if expected == data.len() => Ok(Self { shape, data }),
            Some(expected) => Err(DecodeError::BufferLength {
                expected,
                actual: data.len(),
            }),
            None => Err(DecodeError::ShapeOverflow(shape)),
        }
    }

    /// Tensor of `shape` filled with `value`.
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Flat offset of a full multi-index. Callers guarantee the index is in range.
    pub(crate) fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.shape.len());
        index
            .iter()
            .zip(&self.shape)
            .fold(0usize, |acc, (i, dim)| acc * dim + i)
    }

    /// Contiguous block of every element under the index prefix `outer`.
    pub(crate) fn lane(&self, outer: &[usize]) -> &[f32] {
        let len: usize = self.shape[outer.len()..].iter().product();
        let mut index = outer.to_vec();
        index.resize(self.shape.len(), 0);
        let start = self.offset(&index);
        &self.data[start..start + len]
    }
}
