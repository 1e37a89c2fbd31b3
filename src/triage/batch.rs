use std::num::NonZeroUsize;

/// Contiguous chunks of `size` items, the last possibly shorter. Order is
/// preserved and nothing is dropped.
pub fn split<T>(items: &[T], size: NonZeroUsize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.get())
}
