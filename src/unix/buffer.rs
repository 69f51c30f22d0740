use std::ffi::c_void;

use libgssapi_sys::{gss_buffer_desc, gss_channel_bindings_struct, gss_release_buffer};

use super::error::check;
use crate::{buffer::ProviderAllocation, error::ProviderError};

/// A buffer the GSS-API library allocated, handed back with `gss_release_buffer`.
pub(super) struct GssBuffer(gss_buffer_desc);
// The library does not tie its buffers to the allocating thread
unsafe impl Send for GssBuffer {}
impl GssBuffer {
    pub fn empty() -> Self {
        Self(empty_desc())
    }
    pub fn as_mut_ptr(&mut self) -> *mut gss_buffer_desc {
        &mut self.0
    }
    pub fn boxed(self) -> Box<dyn ProviderAllocation> {
        Box::new(self)
    }
}
impl ProviderAllocation for GssBuffer {
    fn as_slice(&self) -> &[u8] {
        if self.0.value.is_null() || self.0.length == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.0.value as *const u8, self.0.length) }
    }
    fn release(mut self: Box<Self>) -> Result<(), ProviderError> {
        let mut minor = 0;
        let major = unsafe { gss_release_buffer(&mut minor, &mut self.0) };
        self.0 = empty_desc();
        check(major, minor).map(drop)
    }
}
impl Drop for GssBuffer {
    fn drop(&mut self) {
        if !self.0.value.is_null() {
            let mut _min = 0;
            unsafe { gss_release_buffer(&mut _min, &mut self.0) };
        }
    }
}

pub(super) fn empty_desc() -> gss_buffer_desc {
    gss_buffer_desc {
        length: 0,
        value: std::ptr::null_mut(),
    }
}

/// Borrows `data` as an input buffer. The library never writes through input buffers.
pub(super) fn input_desc(data: &[u8]) -> gss_buffer_desc {
    gss_buffer_desc {
        length: data.len(),
        value: data.as_ptr() as *mut c_void,
    }
}

pub(super) fn channel_bindings(application_data: &[u8]) -> gss_channel_bindings_struct {
    gss_channel_bindings_struct {
        initiator_addrtype: 0,
        initiator_address: empty_desc(),
        acceptor_addrtype: 0,
        acceptor_address: empty_desc(),
        application_data: input_desc(application_data),
    }
}
