//! Runtime-typed tensor views for callers that pick the element type at run
//! time instead of through generics.

use half::bf16;

use crate::stage::ElementType;

#[derive(Debug, Clone, Copy)]
pub enum TensorSlice<'a> {
    F32(&'a [f32]),
    BF16(&'a [bf16]),
}

#[derive(Debug)]
pub enum TensorSliceMut<'a> {
    F32(&'a mut [f32]),
    BF16(&'a mut [bf16]),
}

impl TensorSlice<'_> {
    pub fn elem_type(&self) -> ElementType {
        match self {
            TensorSlice::F32(_) => ElementType::F32,
            TensorSlice::BF16(_) => ElementType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorSlice::F32(d) => d.len(),
            TensorSlice::BF16(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TensorSliceMut<'_> {
    pub fn elem_type(&self) -> ElementType {
        match self {
            TensorSliceMut::F32(_) => ElementType::F32,
            TensorSliceMut::BF16(_) => ElementType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorSliceMut::F32(d) => d.len(),
            TensorSliceMut::BF16(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> From<&'a [f32]> for TensorSlice<'a> {
    fn from(d: &'a [f32]) -> Self {
        TensorSlice::F32(d)
    }
}

impl<'a> From<&'a [bf16]> for TensorSlice<'a> {
    fn from(d: &'a [bf16]) -> Self {
        TensorSlice::BF16(d)
    }
}

impl<'a> From<&'a mut [f32]> for TensorSliceMut<'a> {
    fn from(d: &'a mut [f32]) -> Self {
        TensorSliceMut::F32(d)
    }
}

impl<'a> From<&'a mut [bf16]> for TensorSliceMut<'a> {
    fn from(d: &'a mut [bf16]) -> Self {
        TensorSliceMut::BF16(d)
    }
}
