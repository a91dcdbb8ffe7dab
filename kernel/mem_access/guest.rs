//! Guest array access for list-based hypercalls.

use alloc::vec::Vec;

/// Element could not be copied (unmapped, out of bounds, not permitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestCopyError;

/// Guest-supplied array read one element at a time.
pub trait GuestArray<T: Copy> {
    fn copy_from_guest_offset(&self, idx: u32) -> Result<T, GuestCopyError>;
}

impl<T: Copy> GuestArray<T> for [T] {
    fn copy_from_guest_offset(&self, idx: u32) -> Result<T, GuestCopyError> {
        self.get(idx as usize).copied().ok_or(GuestCopyError)
    }
}

impl<T: Copy, const N: usize> GuestArray<T> for [T; N] {
    fn copy_from_guest_offset(&self, idx: u32) -> Result<T, GuestCopyError> {
        self.as_slice().copy_from_guest_offset(idx)
    }
}

impl<T: Copy> GuestArray<T> for Vec<T> {
    fn copy_from_guest_offset(&self, idx: u32) -> Result<T, GuestCopyError> {
        self.as_slice().copy_from_guest_offset(idx)
    }
}
