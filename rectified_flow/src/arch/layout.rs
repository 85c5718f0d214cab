use std::ops::Range;

use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2};
use rand::Rng;

use super::init::Init;
use crate::{MlErr, Result};

/// A single named tensor inside the flat parameter buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub range: Range<usize>,
    pub init: Init,
}

impl ParamSpec {
    /// Returns the amount of values this tensor holds.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Returns `true` if the tensor holds no values.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Returns `true` if the tensor is a matrix.
    pub fn is_matrix(&self) -> bool {
        self.shape.len() == 2
    }
}

/// Maps a flat parameter buffer into named tensors.
///
/// Layers reserve their ranges at construction and read their slices from the
/// flat buffer on every call, so the same layers can run over the live
/// weights, a shadow copy or a gradient buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamLayout {
    specs: Vec<ParamSpec>,
    len: usize,
}

impl ParamLayout {
    /// Creates a new empty `ParamLayout`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a scope with no name prefix.
    pub fn root(&mut self) -> ParamScope<'_> {
        ParamScope {
            layout: self,
            prefix: String::new(),
        }
    }

    /// Returns the total amount of parameters.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no tensor has been reserved.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns every tensor in reservation order.
    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    /// Looks a tensor up by its fully qualified name.
    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    /// Draws the initial value of every tensor following its `Init`.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// The flat parameter buffer or an error if a distribution is invalid.
    pub fn init_params<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f32>> {
        let mut params = vec![0.0; self.len];

        for spec in &self.specs {
            spec.init.fill(rng, &mut params[spec.range.clone()])?;
        }

        Ok(params)
    }

    /// Checks that a flat buffer has exactly the size of this layout.
    ///
    /// # Arguments
    /// * `what` - The buffer's name, used in the error.
    /// * `len` - The buffer's length.
    pub fn check(&self, what: &'static str, len: usize) -> Result<()> {
        if len != self.len {
            return Err(MlErr::SizeMismatch {
                what,
                got: len,
                expected: self.len,
            });
        }

        Ok(())
    }

    fn push(&mut self, name: String, shape: &[usize], init: Init) -> Range<usize> {
        let size = shape.iter().product::<usize>();
        let range = self.len..self.len + size;
        self.len += size;

        self.specs.push(ParamSpec {
            name,
            shape: shape.to_vec(),
            range: range.clone(),
            init,
        });

        range
    }
}

/// A prefixed view over a `ParamLayout` used while building nested layers.
pub struct ParamScope<'a> {
    layout: &'a mut ParamLayout,
    prefix: String,
}

impl ParamScope<'_> {
    /// Reserves a new tensor named `<prefix>.<name>`.
    ///
    /// # Arguments
    /// * `name` - The local name of the tensor.
    /// * `shape` - The tensor's shape.
    /// * `init` - How to draw its initial values.
    ///
    /// # Returns
    /// The tensor's range inside the flat buffer.
    pub fn alloc(&mut self, name: &str, shape: &[usize], init: Init) -> Range<usize> {
        let name = self.qualify(name);
        self.layout.push(name, shape, init)
    }

    /// Opens a nested scope named `<prefix>.<name>`.
    pub fn scope(&mut self, name: &str) -> ParamScope<'_> {
        ParamScope {
            prefix: self.qualify(name),
            layout: self.layout,
        }
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }
}

/// Views a matrix stored in the flat buffer.
pub fn view2<'a>(
    buf: &'a [f32],
    range: &Range<usize>,
    dim: (usize, usize),
) -> Result<ArrayView2<'a, f32>> {
    Ok(ArrayView2::from_shape(dim, &buf[range.clone()])?)
}

/// Views a vector stored in the flat buffer.
pub fn view1<'a>(buf: &'a [f32], range: &Range<usize>) -> ArrayView1<'a, f32> {
    ArrayView1::from(&buf[range.clone()])
}

/// Mutably views a matrix stored in the flat buffer.
pub fn view2_mut<'a>(
    buf: &'a mut [f32],
    range: &Range<usize>,
    dim: (usize, usize),
) -> Result<ArrayViewMut2<'a, f32>> {
    Ok(ArrayViewMut2::from_shape(dim, &mut buf[range.clone()])?)
}

/// Mutably views a vector stored in the flat buffer.
pub fn view1_mut<'a>(buf: &'a mut [f32], range: &Range<usize>) -> ArrayViewMut1<'a, f32> {
    ArrayViewMut1::from(&mut buf[range.clone()])
}
