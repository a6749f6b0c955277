use super::component::ComponentError;
use serde::Serialize;
use std::fmt;
use std::ops::Range;

/// Shape of a variable: a list of dimensions whose product is the flat size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(vec![1])
    }

    pub fn vector(len: usize) -> Self {
        Self(vec![len])
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of scalar entries; an empty dimension list counts as a scalar.
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }
}

impl From<usize> for Shape {
    fn from(len: usize) -> Self {
        Self::vector(len)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "({})", dims.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    Output,
    Input,
}

/// A component-local view over a set of named variables stored in one flat buffer.
///
/// Components read their inputs and write their outputs through this type. Each entry keeps a
/// `written` flag so the engine can tell which outputs a `compute` call actually produced.
#[derive(Debug, Clone)]
pub struct VarSet<T> {
    names: Vec<String>,
    shapes: Vec<Shape>,
    ranges: Vec<Range<usize>>,
    data: Vec<T>,
    written: Vec<bool>,
}

impl<T: Copy + Default> Default for VarSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default> VarSet<T> {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            shapes: Vec::new(),
            ranges: Vec::new(),
            data: Vec::new(),
            written: Vec::new(),
        }
    }

    /// Appends a variable. `values` shorter than the shape are padded with `T::default()`.
    pub(crate) fn push(&mut self, name: &str, shape: Shape, values: &[T], written: bool) {
        let start = self.data.len();
        let size = shape.size();
        self.data.extend(values.iter().copied().take(size));
        self.data.resize(start + size, T::default());
        self.names.push(name.to_string());
        self.shapes.push(shape);
        self.ranges.push(start..start + size);
        self.written.push(written);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn flat_len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn position(&self, name: &str) -> Result<usize, ComponentError> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| ComponentError::UnknownVariable(name.to_string()))
    }

    pub fn shape(&self, name: &str) -> Result<&Shape, ComponentError> {
        Ok(&self.shapes[self.position(name)?])
    }

    pub fn get(&self, name: &str) -> Result<&[T], ComponentError> {
        let i = self.position(name)?;
        Ok(&self.data[self.ranges[i].clone()])
    }

    /// First entry of the named variable, the usual accessor for scalars.
    pub fn scalar(&self, name: &str) -> Result<T, ComponentError> {
        let values = self.get(name)?;
        values
            .first()
            .copied()
            .ok_or_else(|| ComponentError::SizeMismatch {
                name: name.to_string(),
                expected: 1,
                actual: 0,
            })
    }

    pub fn set(&mut self, name: &str, values: &[T]) -> Result<(), ComponentError> {
        let i = self.position(name)?;
        let range = self.ranges[i].clone();
        if values.len() != range.len() {
            return Err(ComponentError::SizeMismatch {
                name: name.to_string(),
                expected: range.len(),
                actual: values.len(),
            });
        }
        self.data[range].copy_from_slice(values);
        self.written[i] = true;
        Ok(())
    }

    pub fn set_scalar(&mut self, name: &str, value: T) -> Result<(), ComponentError> {
        self.set(name, &[value])
    }

    /// Mutable access to the named variable. Marks it as written.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut [T], ComponentError> {
        let i = self.position(name)?;
        self.written[i] = true;
        Ok(&mut self.data[self.ranges[i].clone()])
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub(crate) fn range_at(&self, index: usize) -> Range<usize> {
        self.ranges[index].clone()
    }

    pub(crate) fn is_written(&self, index: usize) -> bool {
        self.written[index]
    }

    /// Same layout with every entry reset to `T::default()`.
    pub(crate) fn zeroed(&self) -> Self {
        Self {
            names: self.names.clone(),
            shapes: self.shapes.clone(),
            ranges: self.ranges.clone(),
            data: vec![T::default(); self.data.len()],
            written: vec![false; self.names.len()],
        }
    }

    pub(crate) fn map<U: Copy + Default>(&self, f: impl Fn(T) -> U) -> VarSet<U> {
        VarSet {
            names: self.names.clone(),
            shapes: self.shapes.clone(),
            ranges: self.ranges.clone(),
            data: self.data.iter().copied().map(f).collect(),
            written: self.written.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VarSet<f64> {
        let mut vars = VarSet::new();
        vars.push("x", Shape::scalar(), &[2.0], true);
        vars.push("z", Shape::new([2, 2]), &[1.0, 2.0], false);
        vars
    }

    #[test]
    fn shape_size_is_product_of_dimensions() {
        assert_eq!(Shape::new([2, 3]).size(), 6);
        assert_eq!(Shape::new(Vec::new()).size(), 1);
        assert_eq!(Shape::from(4).to_string(), "(4)");
    }

    #[test]
    fn push_pads_missing_values_with_zero() {
        let vars = sample();
        assert_eq!(vars.flat_len(), 5);
        assert_eq!(vars.get("z").unwrap(), &[1.0, 2.0, 0.0, 0.0]);
        assert_eq!(vars.range_at(1), 1..5);
    }

    #[test]
    fn set_rejects_wrong_length_and_marks_written() {
        let mut vars = sample();
        assert!(matches!(
            vars.set("z", &[1.0]),
            Err(ComponentError::SizeMismatch { expected: 4, actual: 1, .. })
        ));
        assert!(!vars.is_written(1));
        vars.set("z", &[4.0, 3.0, 2.0, 1.0]).unwrap();
        assert!(vars.is_written(1));
    }

    #[test]
    fn unknown_name_is_reported() {
        let vars = sample();
        assert!(matches!(
            vars.get("nope"),
            Err(ComponentError::UnknownVariable(name)) if name == "nope"
        ));
    }

    #[test]
    fn zeroed_keeps_layout_and_clears_flags() {
        let vars = sample().zeroed();
        assert_eq!(vars.as_slice(), &[0.0; 5]);
        assert!(!vars.is_written(0));
        assert_eq!(vars.shape("z").unwrap().dims(), &[2, 2]);
    }
}
