//! Rebase engine: split a layer stack at the topmost base layer and put
//! everything above it on top of a different base.

use crate::error::{ImageError, Result};
use crate::layer::{position, HasDiffId};

/// A layer stack cut at a base boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split<'a, T> {
    /// Layers up to and including the split point
    pub base: &'a [T],
    /// Application layers above the split point, bottom to top
    pub retained: &'a [T],
}

impl<'a, T> Split<'a, T> {
    /// Number of layers carried over by a rebase
    pub fn kept(&self) -> usize {
        self.retained.len()
    }
}

/// Cut `layers` right above the first layer whose diff ID is `base_top`
pub fn split_at<'a, T: HasDiffId>(layers: &'a [T], base_top: &str) -> Option<Split<'a, T>> {
    let index = position(layers, base_top)?;
    let (base, retained) = layers.split_at(index + 1);
    Some(Split { base, retained })
}

/// Like [`split_at`], but a missing split point is a rebase failure for `image`
pub fn split_for_rebase<'a, T: HasDiffId>(
    image: &str,
    layers: &'a [T],
    base_top: &str,
) -> Result<Split<'a, T>> {
    split_at(layers, base_top).ok_or_else(|| ImageError::SplitPointNotFound {
        image: image.to_string(),
        diff_id: base_top.to_string(),
    })
}

/// New stack: the new base's layers, then the retained layers unchanged
pub fn compose<T: Clone>(new_base: &[T], retained: &[T]) -> Vec<T> {
    let mut layers = Vec::with_capacity(new_base.len() + retained.len());
    layers.extend_from_slice(new_base);
    layers.extend_from_slice(retained);
    layers
}
