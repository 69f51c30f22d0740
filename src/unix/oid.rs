use std::{ffi::c_void, marker::PhantomData};

use libgssapi_sys::{gss_OID, gss_OID_desc_struct, gss_OID_set, gss_OID_set_desc_struct, gss_release_oid_set};

use crate::{
    error::{MajorStatus, ProviderError},
    oid::{Oid, OidSet},
};

fn describe(oid: &Oid) -> Result<gss_OID_desc_struct, ProviderError> {
    let length = u32::try_from(oid.as_bytes().len())
        .map_err(|_| ProviderError::new(MajorStatus::BAD_MECH, 0, "object identifier too long"))?;
    Ok(gss_OID_desc_struct {
        length,
        elements: oid.as_bytes().as_ptr() as *mut c_void,
    })
}

/// An [`Oid`] lent to the library for the duration of one call.
pub(super) struct BorrowedOid<'a> {
    desc: gss_OID_desc_struct,
    _oid: PhantomData<&'a Oid>,
}
impl<'a> BorrowedOid<'a> {
    pub fn new(oid: &'a Oid) -> Result<Self, ProviderError> {
        Ok(Self {
            desc: describe(oid)?,
            _oid: PhantomData,
        })
    }
    pub fn as_ptr(&mut self) -> gss_OID {
        &mut self.desc
    }
}

/// An [`OidSet`] lent to the library for the duration of one call.
pub(super) struct BorrowedOidSet<'a> {
    elements: Vec<gss_OID_desc_struct>,
    set: gss_OID_set_desc_struct,
    _set: PhantomData<&'a OidSet>,
}
impl<'a> BorrowedOidSet<'a> {
    pub fn new(set: &'a OidSet) -> Result<Self, ProviderError> {
        let elements = set.iter().map(describe).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            elements,
            set: gss_OID_set_desc_struct {
                count: 0,
                elements: std::ptr::null_mut(),
            },
            _set: PhantomData,
        })
    }
    pub fn as_ptr(&mut self) -> gss_OID_set {
        self.set.count = self.elements.len();
        self.set.elements = self.elements.as_mut_ptr();
        &mut self.set
    }
}

/// Copies an identifier the library owns. Library identifiers are static and never freed.
pub(super) unsafe fn copy_oid(oid: gss_OID) -> Option<Oid> {
    if oid.is_null() {
        return None;
    }
    let desc = unsafe { &*oid };
    if desc.elements.is_null() {
        return None;
    }
    let bytes = unsafe { std::slice::from_raw_parts(desc.elements as *const u8, desc.length as usize) };
    Some(Oid::from_bytes(bytes))
}

/// Copies a set the library allocated and releases it.
pub(super) unsafe fn take_oid_set(mut set: gss_OID_set) -> OidSet {
    if set.is_null() {
        return OidSet::empty();
    }
    let desc = unsafe { &*set };
    let elements = if desc.elements.is_null() {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(desc.elements, desc.count) }
    };
    let copied = elements
        .iter()
        .filter_map(|element| unsafe { copy_oid(std::ptr::from_ref(element).cast_mut()) })
        .collect();
    let mut _min = 0;
    unsafe { gss_release_oid_set(&mut _min, &mut set) };
    copied
}
