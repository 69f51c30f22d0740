use libgssapi_sys::{gss_buffer_desc_struct, gss_display_status, gss_release_buffer, GSS_C_GSS_CODE, GSS_C_MECH_CODE};

use crate::error::{MajorStatus, ProviderError};

/// Turns the status pair of a GSS-API call into a `Result`.
///
/// Only routine and calling errors fail. Supplementary bits such as `GSS_S_CONTINUE_NEEDED`
/// come back in the `Ok` value.
pub(super) fn check(major: u32, minor: u32) -> Result<MajorStatus, ProviderError> {
    let status = MajorStatus(major);
    if !status.is_error() {
        return Ok(status);
    }
    let mut message = status_text(major, GSS_C_GSS_CODE as i32);
    if minor != 0 {
        let mechanism = status_text(minor, GSS_C_MECH_CODE as i32);
        if !mechanism.is_empty() {
            message = format!("{message}: {mechanism}");
        }
    }
    if message.is_empty() {
        message = status.to_string();
    }
    Err(ProviderError::new(status, minor, message))
}

/// Every message `gss_display_status` has for `code`, joined with "; ".
fn status_text(code: u32, kind: i32) -> String {
    let mut messages = Vec::new();
    let mut context = 0;
    loop {
        let mut minor = 0;
        let mut string = gss_buffer_desc_struct {
            length: 0,
            value: std::ptr::null_mut(),
        };
        let major = unsafe {
            gss_display_status(&mut minor, code, kind, std::ptr::null_mut(), &mut context, &mut string)
        };
        if MajorStatus(major).is_error() {
            break;
        }
        if !string.value.is_null() {
            let bytes = unsafe { std::slice::from_raw_parts(string.value as *const u8, string.length) };
            messages.push(String::from_utf8_lossy(bytes).into_owned());
        }
        let mut _min = 0;
        unsafe { gss_release_buffer(&mut _min, &mut string) };
        if context == 0 {
            break;
        }
    }
    messages.join("; ")
}
